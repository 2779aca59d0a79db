#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Sandbox runtime: results, capture, policy gating, framed tracebacks.

mod common;

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use common::approve;
use common::domain_node;
use common::scientist;
use common::single_use_submission;
use fedra_core::CodeError;
use fedra_core::action::Asset;
use fedra_core::action::ExecArg;
use fedra_core::error::ExecDenial;
use fedra_core::error::PolicySide;
use pretty_assertions::assert_eq;
use uuid::Uuid;

#[test]
fn approved_code_returns_its_value_with_clean_capture() {
    let node = domain_node("alpha");
    let sci = scientist();
    let code = node
        .submit_code(sci, single_use_submission("f", "def f():\n    return 1\n"))
        .expect("submit");
    approve(&node, code.id, "ok");

    let result = node.execute_code(sci, code.id, BTreeMap::new()).expect("execute");
    assert_eq!(result.result, Ok(serde_json::json!(1)));
    assert_eq!(result.stdout, "");
    assert_eq!(result.stderr, "");
    assert_eq!(result.user_code_id, code.id);

    assert_eq!(node.get_result(code.id).expect("stored result").result, result.result);
}

#[test]
fn second_execution_hits_the_single_use_output_policy() {
    let node = domain_node("alpha");
    let sci = scientist();
    let code = node
        .submit_code(sci, single_use_submission("f", "def f():\n    return 1\n"))
        .expect("submit");
    approve(&node, code.id, "ok");

    let first = node.execute_code(sci, code.id, BTreeMap::new()).expect("first");
    assert!(first.result.is_ok());

    let second = node.execute_code(sci, code.id, BTreeMap::new()).expect("second");
    match second.result {
        Err(ExecDenial::PolicyReject { side, reason }) => {
            assert_eq!(side, PolicySide::Output);
            assert!(reason.contains("single-use"), "{reason}");
        }
        other => panic!("expected output policy reject, got {other:?}"),
    }
}

#[test]
fn unapproved_execution_advances_no_policy_state() {
    let node = domain_node("alpha");
    let sci = scientist();
    let code = node
        .submit_code(sci, single_use_submission("f", "def f():\n    return 1\n"))
        .expect("submit");

    let before = node.code_store.get(code.id).expect("get");
    let err = node.execute_code(sci, code.id, BTreeMap::new()).unwrap_err();
    assert!(matches!(err, CodeError::NotApproved { .. }));

    let after = node.code_store.get(code.id).expect("get");
    assert_eq!(before.input_policy_state, after.input_policy_state);
    assert_eq!(before.output_policy_state, after.output_policy_state);

    // The single-use budget is still intact once approval lands.
    approve(&node, code.id, "ok");
    let result = node.execute_code(sci, code.id, BTreeMap::new()).expect("execute");
    assert_eq!(result.result, Ok(serde_json::json!(1)));
}

#[test]
fn input_reject_leaves_output_policy_state_unchanged() {
    let node = domain_node("alpha");
    let sci = scientist();

    let asset_action_id = Uuid::new_v4();
    node.asset_store
        .register(Asset {
            name: "ages".to_string(),
            action_id: asset_action_id,
            mock: serde_json::json!(10),
            data: serde_json::json!(41),
            data_readers: BTreeSet::new(),
        })
        .expect("register asset");

    let mut submission = single_use_submission("f", "def f(x):\n    return x + 1\n");
    submission.input_policy_init_kwargs.insert(
        "inputs".to_string(),
        serde_json::json!({ "x": asset_action_id.to_string() }),
    );
    let code = node.submit_code(sci, submission).expect("submit");
    approve(&node, code.id, "ok");

    // A plain value cannot stand in for the approved asset.
    let mut bad_kwargs = BTreeMap::new();
    bad_kwargs.insert("x".to_string(), ExecArg::Value { value: serde_json::json!(41) });
    let rejected = node.execute_code(sci, code.id, bad_kwargs).expect("execute");
    match &rejected.result {
        Err(ExecDenial::PolicyReject { side: PolicySide::Input, .. }) => {}
        other => panic!("expected input policy reject, got {other:?}"),
    }

    // The single-use output budget was not consumed by the reject: the
    // matching call still runs, on the mock since the scientist lacks
    // data permission.
    let mut kwargs = BTreeMap::new();
    kwargs.insert("x".to_string(), ExecArg::Asset { action_id: asset_action_id });
    let result = node.execute_code(sci, code.id, kwargs).expect("execute");
    assert_eq!(result.result, Ok(serde_json::json!(11)));
}

#[test]
fn private_data_is_used_when_the_caller_may_read_it() {
    let node = domain_node("alpha");
    let sci = scientist();

    let asset_action_id = Uuid::new_v4();
    node.asset_store
        .register(Asset {
            name: "ages".to_string(),
            action_id: asset_action_id,
            mock: serde_json::json!(10),
            data: serde_json::json!(41),
            data_readers: BTreeSet::from([sci]),
        })
        .expect("register asset");

    let mut submission = single_use_submission("f", "def f(x):\n    return x + 1\n");
    submission.input_policy_init_kwargs.insert(
        "inputs".to_string(),
        serde_json::json!({ "x": asset_action_id.to_string() }),
    );
    let code = node.submit_code(sci, submission).expect("submit");
    approve(&node, code.id, "ok");

    let mut kwargs = BTreeMap::new();
    kwargs.insert("x".to_string(), ExecArg::Asset { action_id: asset_action_id });
    let result = node.execute_code(sci, code.id, kwargs).expect("execute");
    assert_eq!(result.result, Ok(serde_json::json!(42)));
}

#[test]
fn stdout_is_the_prints_in_program_order() {
    let node = domain_node("alpha");
    let sci = scientist();
    let src = "def f():\n    print(\"first\")\n    print(\"second\", 2)\n    print(b\"bytes\")\n    return None\n";
    let code = node.submit_code(sci, single_use_submission("f", src)).expect("submit");
    approve(&node, code.id, "ok");

    let result = node.execute_code(sci, code.id, BTreeMap::new()).expect("execute");
    assert_eq!(result.stdout, "first\nsecond 2\nbytes\n");
    assert_eq!(result.stderr, "");
    assert_eq!(result.result, Ok(serde_json::Value::Null));

    // Every print call is mirrored into the job log, in order.
    let job = node
        .job_store
        .all()
        .into_iter()
        .next()
        .expect("execution job");
    let texts: Vec<String> = node
        .log_store
        .entries(job.log_id)
        .into_iter()
        .map(|entry| entry.text)
        .collect();
    assert_eq!(
        texts,
        vec!["first\n".to_string(), "second 2\n".to_string(), "bytes\n".to_string()]
    );
}

#[test]
fn exception_produces_a_framed_traceback() {
    let node = domain_node("alpha");
    let sci = scientist();
    let src = "def f():\n    x = 1\n    return x // 0\n";
    let code = node.submit_code(sci, single_use_submission("f", src)).expect("submit");
    approve(&node, code.id, "ok");

    let result = node.execute_code(sci, code.id, BTreeMap::new()).expect("execute");
    let Err(ExecDenial::Runtime { framed }) = &result.result else {
        panic!("expected runtime error, got {:?}", result.result);
    };

    // Exactly one marked line, and it points into the rewritten source.
    let marked: Vec<&str> = framed.lines().filter(|line| line.starts_with("-->")).collect();
    assert_eq!(marked.len(), 1);
    let parsed_lines = node.code_store.get(code.id).expect("get").parsed_code;
    let line_count = parsed_lines.lines().count();
    let marked_number: usize = marked[0]
        .trim_start_matches("-->")
        .trim_start()
        .split(' ')
        .next()
        .and_then(|n| n.parse().ok())
        .expect("marker line number");
    assert!(marked_number >= 1 && marked_number <= line_count, "{framed}");
    assert!(framed.contains("zero"), "{framed}");
    assert!(framed.contains(&code.unique_func_name));

    // The framed block is also appended to the job log.
    let job = node.job_store.all().into_iter().next().expect("job");
    let entries = node.log_store.entries(job.log_id);
    assert!(entries.iter().any(|entry| entry.text.contains("-->")));
}

#[test]
fn partial_stdout_survives_a_failure() {
    let node = domain_node("alpha");
    let sci = scientist();
    let src = "def f():\n    print(\"before\")\n    return 1 // 0\n";
    let code = node.submit_code(sci, single_use_submission("f", src)).expect("submit");
    approve(&node, code.id, "ok");

    let result = node.execute_code(sci, code.id, BTreeMap::new()).expect("execute");
    assert!(result.result.is_err());
    assert_eq!(result.stdout, "before\n");
}

#[test]
fn script_errors_are_catchable_in_user_code() {
    let node = domain_node("alpha");
    let sci = scientist();
    let src = "def f():\n    try:\n        return 1 // 0\n    except Exception as err:\n        return \"caught\"\n";
    let code = node.submit_code(sci, single_use_submission("f", src)).expect("submit");
    approve(&node, code.id, "ok");

    let result = node.execute_code(sci, code.id, BTreeMap::new()).expect("execute");
    assert_eq!(result.result, Ok(serde_json::json!("caught")));
}

#[test]
fn execution_failure_marks_the_job_errored() {
    let node = domain_node("alpha");
    let sci = scientist();
    let code = node
        .submit_code(sci, single_use_submission("f", "def f():\n    return 1 // 0\n"))
        .expect("submit");
    approve(&node, code.id, "ok");

    let _ = node.execute_code(sci, code.id, BTreeMap::new()).expect("execute");
    let job = node.job_store.all().into_iter().next().expect("job");
    assert_eq!(job.status, fedra_core::job::JobStatus::Errored);
}
