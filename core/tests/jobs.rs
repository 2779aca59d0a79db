#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Nested job dispatch through the worker pool.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::approve;
use common::domain_node;
use common::scientist;
use common::single_use_submission;
use fedra_core::job::JobStatus;
use pretty_assertions::assert_eq;
use uuid::Uuid;

fn child_job_id(result_value: &serde_json::Value) -> Uuid {
    result_value
        .get("job_id")
        .and_then(serde_json::Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .expect("launch_job result carries the child job id")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn launch_job_links_parent_and_completes_inner() {
    let node = domain_node("alpha");
    node.start().expect("start workers");
    let sci = scientist();

    let inner = node
        .submit_code(
            sci,
            single_use_submission("test_inner", "def test_inner():\n    return 1\n"),
        )
        .expect("submit inner");
    approve(&node, inner.id, "ok");

    let outer_src = "def h(domain):\n    job = domain.launch_job(test_inner)\n    print(job)\n    return job\n";
    let outer = node
        .submit_code(sci, single_use_submission("h", outer_src))
        .expect("submit outer");
    assert_eq!(
        outer.nested_requests,
        BTreeMap::from([("test_inner".to_string(), "latest".to_string())])
    );
    assert_eq!(outer.nested_codes.get("test_inner"), Some(&inner.id));
    approve(&node, outer.id, "ok");

    let result = node.execute_code(sci, outer.id, BTreeMap::new()).expect("execute outer");
    let value = result.result.expect("outer result");
    let child_id = child_job_id(&value);

    // Parent linkage: the child's parent is the outer execution's job.
    let child = node.job_store.get(child_id).expect("child job");
    let parent_id = child.parent_job_id.expect("child has a parent");
    let parent = node.job_store.get(parent_id).expect("parent job");
    assert!(parent.parent_job_id.is_none());
    assert_eq!(parent.status, JobStatus::Completed);

    // The child was visible before launch_job returned and is rendered
    // as `JOB: <id>` by the outer print.
    let parent_log: Vec<String> = node
        .log_store
        .entries(parent.log_id)
        .into_iter()
        .map(|entry| entry.text)
        .collect();
    assert_eq!(parent_log, vec![format!("JOB: {child_id}\n")]);

    // The inner job eventually produces 1 on the worker pool.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let child = node.job_store.get(child_id).expect("child job");
        match child.status {
            JobStatus::Completed => {
                assert_eq!(child.result, Some(serde_json::json!(1)));
                break;
            }
            JobStatus::Errored => panic!("inner job errored: {child:?}"),
            _ if tokio::time::Instant::now() > deadline => {
                panic!("inner job did not complete: {child:?}")
            }
            _ => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    assert_eq!(child.worker_pool_id, node.default_pool.id);

    node.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nested_dispatches_preserve_program_order() {
    let node = domain_node("alpha");
    node.start().expect("start workers");
    let sci = scientist();

    let inner = node
        .submit_code(sci, single_use_submission("inner", "def inner(n):\n    return n\n"))
        .expect("submit inner");
    approve(&node, inner.id, "ok");

    let outer_src = "def h(domain):\n    first = domain.launch_job(inner, n=1)\n    second = domain.launch_job(inner, n=2)\n    return [first, second]\n";
    let outer = node
        .submit_code(sci, single_use_submission("h", outer_src))
        .expect("submit outer");
    approve(&node, outer.id, "ok");

    let result = node.execute_code(sci, outer.id, BTreeMap::new()).expect("execute");
    let value = result.result.expect("outer result");
    let jobs = value.as_array().expect("two jobs");
    assert_eq!(jobs.len(), 2);
    let first = child_job_id(&jobs[0]);
    let second = child_job_id(&jobs[1]);
    assert_ne!(first, second);

    let parent_of = |id: Uuid| node.job_store.get(id).expect("job").parent_job_id;
    assert_eq!(parent_of(first), parent_of(second));

    node.shutdown();
}

#[test]
fn progress_counters_update_the_job_record() {
    let node = domain_node("alpha");
    let sci = scientist();
    let src = "def f(domain):\n    domain.init_progress(5)\n    domain.increment_progress()\n    domain.increment_progress(2)\n    domain.set_progress(4)\n    return None\n";
    let code = node.submit_code(sci, single_use_submission("f", src)).expect("submit");
    approve(&node, code.id, "ok");

    let result = node.execute_code(sci, code.id, BTreeMap::new()).expect("execute");
    assert!(result.result.is_ok(), "{result:?}");

    let job = node.job_store.all().into_iter().next().expect("job");
    assert_eq!(job.n_iters, Some(5));
    assert_eq!(job.current_iter, 4);
}

#[test]
fn dispatch_failure_is_catchable_inside_the_sandbox() {
    // The broker is closed before execution, so the enqueue fails; user
    // code catches the error and still returns.
    let node = domain_node("alpha");
    let sci = scientist();

    let inner = node
        .submit_code(sci, single_use_submission("inner", "def inner():\n    return 1\n"))
        .expect("submit inner");
    approve(&node, inner.id, "ok");

    let src = "def h(domain):\n    try:\n        job = domain.launch_job(inner)\n        return job\n    except Exception as err:\n        return \"no dispatch\"\n";
    let code = node.submit_code(sci, single_use_submission("h", src)).expect("submit");
    approve(&node, code.id, "ok");

    node.shutdown();
    let result = node.execute_code(sci, code.id, BTreeMap::new()).expect("execute");
    assert_eq!(result.result, Ok(serde_json::json!("no dispatch")));
}
