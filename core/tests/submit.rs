#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Submission pipeline: record creation, duplicates, rejection.

mod common;

use common::approve;
use common::domain_node;
use common::scientist;
use common::single_use_submission;
use fedra_core::CodeError;
use fedra_core::policy::InputPolicyType;
use fedra_core::policy::OutputPolicyType;
use fedra_core::user_code::UserCodeStatus;
use fedra_core::user_code::hash_code;
use pretty_assertions::assert_eq;

#[test]
fn submit_creates_pending_record() {
    let node = domain_node("alpha");
    let sci = scientist();

    let code = node
        .submit_code(sci, single_use_submission("f", "def f():\n    return 1\n"))
        .expect("submit");

    assert_eq!(code.service_func_name, "f");
    assert!(!code.uses_domain);
    assert!(code.nested_requests.is_empty());
    assert!(code.nested_codes.is_empty());
    assert_eq!(code.status.status_map.len(), 1);
    let approval = code
        .status
        .status_map
        .get(&node.identity())
        .expect("approval entry for this node");
    assert_eq!(approval.status, UserCodeStatus::Pending);
    assert_eq!(code.input_policy_type, InputPolicyType::ExactMatch);
    assert_eq!(code.output_policy_type, OutputPolicyType::SingleExecutionExactOutput);
    assert_eq!(code.signature, "()");
    assert_eq!(code.worker_pool_id, node.default_pool.id);
    assert_eq!(code.node_uid, node.id);
}

#[test]
fn code_hash_is_sha256_of_raw_source() {
    let node = domain_node("alpha");
    let raw = "def f():\n    return 1\n";
    let code = node
        .submit_code(scientist(), single_use_submission("f", raw))
        .expect("submit");
    assert_eq!(code.code_hash, hash_code(raw));
    assert_eq!(code.raw_code, raw);
    // SHA-256 renders as 64 hex chars.
    assert_eq!(code.code_hash.len(), 64);
}

#[test]
fn duplicate_submission_is_rejected_without_growth() {
    let node = domain_node("alpha");
    let sci = scientist();
    let submission = single_use_submission("f", "def f():\n    return 1\n");

    let first = node.submit_code(sci, submission.clone()).expect("first submit");
    assert_eq!(node.code_store.len(), 1);

    let err = node.submit_code(sci, submission.clone()).unwrap_err();
    match err {
        CodeError::Duplicate { existing_id } => assert_eq!(existing_id, first.id),
        other => panic!("expected Duplicate, got {other:?}"),
    }
    assert_eq!(node.code_store.len(), 1);

    // Same body under a different function name is a different submission.
    let renamed = single_use_submission("f2", "def f2():\n    return 1\n");
    node.submit_code(sci, renamed).expect("renamed submit");
    assert_eq!(node.code_store.len(), 2);
}

#[test]
fn unique_func_name_depends_only_on_name_key_and_hash() {
    let node = domain_node("alpha");
    let other_node = domain_node("beta");
    let sci = scientist();
    let submission = single_use_submission("f", "def f():\n    return 1\n");

    let a = node.submit_code(sci, submission.clone()).expect("submit");
    let b = other_node.submit_code(sci, submission).expect("submit");
    assert_eq!(a.unique_func_name, b.unique_func_name);

    let c = node
        .submit_code(sci, single_use_submission("f", "def f():\n    return 2\n"))
        .expect("submit");
    assert_ne!(a.unique_func_name, c.unique_func_name);
}

#[test]
fn free_global_reference_rejects_submission_atomically() {
    let node = domain_node("alpha");
    let before = node.code_store.len();

    let err = node
        .submit_code(scientist(), single_use_submission("g", "def g():\n    return X\n"))
        .unwrap_err();
    let CodeError::NormalizerRejected { reason } = err else {
        panic!("expected NormalizerRejected");
    };
    assert!(reason.contains('X'), "{reason}");
    assert_eq!(node.code_store.len(), before);
}

#[test]
fn nested_target_must_be_already_submitted() {
    let node = domain_node("alpha");
    let sci = scientist();
    let outer = "def h(domain):\n    job = domain.launch_job(test_inner)\n    return job\n";

    let err = node.submit_code(sci, single_use_submission("h", outer)).unwrap_err();
    assert!(matches!(err, CodeError::NestedCodeMissing { .. }), "{err:?}");

    node.submit_code(sci, single_use_submission("test_inner", "def test_inner():\n    return 1\n"))
        .expect("inner submit");
    let code = node.submit_code(sci, single_use_submission("h", outer)).expect("outer submit");
    assert!(code.uses_domain);
    assert_eq!(code.nested_requests.get("test_inner").map(String::as_str), Some("latest"));
    assert_eq!(code.nested_codes.len(), 1);
}

#[test]
fn rewritten_source_defines_the_wrapper() {
    let node = domain_node("alpha");
    let code = node
        .submit_code(scientist(), single_use_submission("f", "def f(x):\n    return x + 1\n"))
        .expect("submit");
    assert!(code.parsed_code.starts_with(&format!("def {}(x):", code.unique_func_name)));
    assert!(code.parsed_code.contains("result = f(x=x)"));
    assert!(code.parsed_code.trim_end().ends_with("return result"));
    assert_eq!(code.input_kwargs, vec!["x".to_string()]);
    assert_eq!(code.signature, "(x)");
}

#[test]
fn approval_entry_starts_pending_and_executable_is_false() {
    let node = domain_node("alpha");
    let code = node
        .submit_code(scientist(), single_use_submission("f", "def f():\n    return 1\n"))
        .expect("submit");
    assert!(!code.executable());
    approve(&node, code.id, "ok");
    assert!(node.code_store.get(code.id).expect("get").executable());
}
