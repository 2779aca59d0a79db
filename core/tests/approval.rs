#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Approval state machine: transitions, terminal states, enclave mode.

mod common;

use common::approve;
use common::domain_node;
use common::scientist;
use common::single_use_submission;
use fedra_core::CodeError;
use fedra_core::Node;
use fedra_core::config::NodeConfig;
use fedra_core::config::NodeType;
use fedra_core::identity::NodeIdentity;
use fedra_core::identity::SigningKey;
use fedra_core::user::NewUser;
use fedra_core::user::UserRole;
use fedra_core::user_code::EnclaveMetadata;
use fedra_core::user_code::UserCodeStatus;
use pretty_assertions::assert_eq;
use uuid::Uuid;

#[test]
fn approve_with_reason_reaches_approved_context() {
    let node = domain_node("alpha");
    let code = node
        .submit_code(scientist(), single_use_submission("f", "def f():\n    return 1\n"))
        .expect("submit");

    approve(&node, code.id, "ok");

    let code = node.code_store.get(code.id).expect("get");
    assert_eq!(
        code.status
            .for_user_context(NodeType::Domain, &node.identity())
            .expect("context status"),
        UserCodeStatus::Approved
    );
    let approval = code.status.status_map.get(&node.identity()).expect("entry");
    assert_eq!(approval.reason, "ok");
}

#[test]
fn terminal_states_cannot_retransition() {
    let node = domain_node("alpha");
    let code = node
        .submit_code(scientist(), single_use_submission("f", "def f():\n    return 1\n"))
        .expect("submit");

    node.deny_code(node.verify_key(), code.id, &node.identity(), "not allowed")
        .expect("deny");
    let err = node
        .approve_code(node.verify_key(), code.id, &node.identity(), "changed my mind")
        .unwrap_err();
    assert!(matches!(err, CodeError::TerminalStateViolation));

    let code = node.code_store.get(code.id).expect("get");
    assert!(code.status.denied());
    let approval = code.status.status_map.get(&node.identity()).expect("entry");
    assert_eq!(approval.reason, "not allowed");
}

#[test]
fn unknown_node_identity_is_a_missing_target() {
    let node = domain_node("alpha");
    let code = node
        .submit_code(scientist(), single_use_submission("f", "def f():\n    return 1\n"))
        .expect("submit");

    let stranger = NodeIdentity {
        node_name: "stranger".to_string(),
        node_id: Uuid::new_v4(),
        verify_key: SigningKey::generate().verify_key(),
    };
    let err = node
        .approve_code(node.verify_key(), code.id, &stranger, "ok")
        .unwrap_err();
    assert!(matches!(err, CodeError::ApprovalTargetMissing));

    let code = node.code_store.get(code.id).expect("get");
    assert!(!code.status.approved());
    assert!(!code.status.denied());
}

#[test]
fn non_admins_may_not_decide_approvals() {
    let node = domain_node("alpha");
    let sci = scientist();
    let code = node
        .submit_code(sci, single_use_submission("f", "def f():\n    return 1\n"))
        .expect("submit");

    let err = node.approve_code(sci, code.id, &node.identity(), "self-approval").unwrap_err();
    assert!(matches!(err, CodeError::PermissionDenied(_)));

    // A registered admin other than root may approve.
    let admin_key = SigningKey::generate().verify_key();
    node.user_store
        .create(NewUser {
            verify_key: admin_key,
            email: "owner@alpha".to_string(),
            name: "owner".to_string(),
            role: UserRole::Admin,
        })
        .expect("create admin");
    node.approve_code(admin_key, code.id, &node.identity(), "ok").expect("approve");
}

#[test]
fn enclave_requires_every_input_owner() {
    let node = Node::new(NodeConfig::new("enclave-1").enclave());
    let owner_a = NodeIdentity {
        node_name: "alpha".to_string(),
        node_id: Uuid::new_v4(),
        verify_key: SigningKey::generate().verify_key(),
    };
    let owner_b = NodeIdentity {
        node_name: "beta".to_string(),
        node_id: Uuid::new_v4(),
        verify_key: SigningKey::generate().verify_key(),
    };

    let mut submission = single_use_submission("f", "def f():\n    return 1\n");
    submission.enclave_metadata =
        Some(EnclaveMetadata { input_owners: vec![owner_a.clone(), owner_b.clone()] });
    let code = node.submit_code(scientist(), submission).expect("submit");
    assert_eq!(code.status.status_map.len(), 2);
    assert!(code.is_enclave_code());

    let viewer = node.identity();
    let context = |node: &Node, id| {
        node.code_store
            .get(id)
            .expect("get")
            .status
            .for_user_context(NodeType::Enclave, &viewer)
            .expect("context")
    };

    assert_eq!(context(&node, code.id), UserCodeStatus::Pending);

    node.approve_code(node.verify_key(), code.id, &owner_a, "alpha ok").expect("approve a");
    assert_eq!(context(&node, code.id), UserCodeStatus::Pending);

    node.approve_code(node.verify_key(), code.id, &owner_b, "beta ok").expect("approve b");
    assert_eq!(context(&node, code.id), UserCodeStatus::Approved);
}

#[test]
fn enclave_denial_wins_over_pending() {
    let node = Node::new(NodeConfig::new("enclave-1").enclave());
    let owner_a = NodeIdentity {
        node_name: "alpha".to_string(),
        node_id: Uuid::new_v4(),
        verify_key: SigningKey::generate().verify_key(),
    };
    let owner_b = NodeIdentity {
        node_name: "beta".to_string(),
        node_id: Uuid::new_v4(),
        verify_key: SigningKey::generate().verify_key(),
    };
    let mut submission = single_use_submission("f", "def f():\n    return 1\n");
    submission.enclave_metadata =
        Some(EnclaveMetadata { input_owners: vec![owner_a, owner_b.clone()] });
    let code = node.submit_code(scientist(), submission).expect("submit");

    node.deny_code(node.verify_key(), code.id, &owner_b, "no").expect("deny");
    let status = node
        .code_store
        .get(code.id)
        .expect("get")
        .status
        .for_user_context(NodeType::Enclave, &node.identity())
        .expect("context");
    assert_eq!(status, UserCodeStatus::Denied);
}

#[test]
fn enclave_submission_without_owners_is_rejected() {
    let node = Node::new(NodeConfig::new("enclave-1").enclave());
    let err = node
        .submit_code(scientist(), single_use_submission("f", "def f():\n    return 1\n"))
        .unwrap_err();
    assert!(matches!(err, CodeError::PolicyBindFailed { .. }));
    assert!(node.code_store.is_empty());
}
