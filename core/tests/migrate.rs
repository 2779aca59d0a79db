#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Record migration across persisted versions.

mod common;

use std::collections::BTreeMap;

use chrono::Utc;
use common::domain_node;
use common::scientist;
use common::single_use_submission;
use fedra_core::identity::NodeIdentity;
use fedra_core::identity::SigningKey;
use fedra_core::policy::InputPolicyType;
use fedra_core::policy::OutputPolicyType;
use fedra_core::policy::OutputRunState;
use fedra_core::store::UserCodeStore;
use fedra_core::user_code::Approval;
use fedra_core::user_code::ApprovalCollection;
use fedra_core::user_code::UserCodeStatus;
use fedra_core::user_code::UserCodeV1;
use fedra_core::user_code::VersionedUserCode;
use pretty_assertions::assert_eq;
use uuid::Uuid;

fn v1_record() -> UserCodeV1 {
    let credentials = SigningKey::generate().verify_key();
    let node_identity = NodeIdentity {
        node_name: "alpha".to_string(),
        node_id: Uuid::new_v4(),
        verify_key: SigningKey::generate().verify_key(),
    };
    let mut status = ApprovalCollection::default();
    status.status_map.insert(
        node_identity,
        Approval { status: UserCodeStatus::Approved, reason: "ok".to_string() },
    );
    UserCodeV1 {
        id: Uuid::new_v4(),
        node_uid: Uuid::new_v4(),
        user_verify_key: credentials,
        raw_code: "def f():\n    return 1\n".to_string(),
        parsed_code: "def user_func_f():\n    def f():\n        return 1\n    result = f()\n    return result\n".to_string(),
        service_func_name: "f".to_string(),
        unique_func_name: "user_func_f".to_string(),
        user_unique_func_name: "user_func_f_123".to_string(),
        code_hash: fedra_core::user_code::hash_code("def f():\n    return 1\n"),
        signature: "()".to_string(),
        input_kwargs: Vec::new(),
        input_policy_type: InputPolicyType::AllowAll,
        input_policy_init_kwargs: BTreeMap::new(),
        input_policy_state: Vec::new(),
        output_policy_type: OutputPolicyType::SingleExecutionExactOutput,
        output_policy_init_kwargs: BTreeMap::new(),
        // Legacy sentinel for "not yet materialized".
        output_policy_state: Vec::new(),
        status,
        enclave_metadata: None,
        submit_time: Utc::now(),
    }
}

#[test]
fn v1_to_v3_defaults_added_fields_and_preserves_the_rest() {
    let v1 = v1_record();
    let expected_id = v1.id;
    let expected_hash = v1.code_hash.clone();
    let default_pool = Uuid::new_v4();

    let migrated = VersionedUserCode::V1(v1).migrate(default_pool);
    assert_eq!(migrated.id, expected_id);
    assert_eq!(migrated.code_hash, expected_hash);
    assert!(!migrated.uses_domain);
    assert!(migrated.nested_requests.is_empty());
    assert!(migrated.nested_codes.is_empty());
    assert_eq!(migrated.worker_pool_id, default_pool);
    assert!(migrated.status.approved());
}

#[test]
fn migration_is_idempotent() {
    let default_pool = Uuid::new_v4();
    let migrated = VersionedUserCode::V1(v1_record()).migrate(default_pool);
    let again = VersionedUserCode::V3(migrated.clone()).migrate(Uuid::new_v4());
    assert_eq!(migrated, again);
}

#[test]
fn downgrade_drops_the_worker_pool_binding() {
    let default_pool = Uuid::new_v4();
    let migrated = VersionedUserCode::V1(v1_record()).migrate(default_pool);
    let id = migrated.id;
    let v2 = migrated.downgrade();
    assert_eq!(v2.id, id);
    let line = serde_json::to_string(&VersionedUserCode::V2(v2)).expect("serialize");
    assert!(!line.contains("worker_pool_id"));
    assert!(line.contains("\"version\":\"2\""));
}

#[test]
fn old_records_load_from_disk_and_bind_the_default_pool() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("code.jsonl");
    let v1 = v1_record();
    let id = v1.id;
    let line = serde_json::to_string(&VersionedUserCode::V1(v1)).expect("serialize");
    std::fs::write(&path, format!("{line}\n")).expect("write");

    let store = UserCodeStore::new();
    let default_pool = Uuid::new_v4();
    let loaded = store.load_jsonl(&path, default_pool).expect("load");
    assert_eq!(loaded, 1);
    let code = store.get(id).expect("get");
    assert_eq!(code.worker_pool_id, default_pool);
}

#[test]
fn legacy_empty_policy_state_materializes_on_first_read() {
    let default_pool = Uuid::new_v4();
    let mut migrated = VersionedUserCode::V1(v1_record()).migrate(default_pool);
    assert!(migrated.output_policy_state.is_empty());

    let state = migrated.output_policy_state().expect("materialize");
    assert!(!state.is_empty());
    let run: OutputRunState = serde_json::from_slice(&state).expect("parse");
    assert_eq!(run, OutputRunState { count: 0, limit: 1 });
    // The materialized bytes are written back.
    assert_eq!(migrated.output_policy_state, state);
}

#[test]
fn save_then_load_round_trips_current_records() {
    let node = domain_node("alpha");
    let sci = scientist();
    let code = node
        .submit_code(sci, single_use_submission("f", "def f():\n    return 1\n"))
        .expect("submit");

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("code.jsonl");
    node.code_store.save_jsonl(&path).expect("save");

    let fresh = UserCodeStore::new();
    fresh.load_jsonl(&path, Uuid::new_v4()).expect("load");
    let reloaded = fresh.get(code.id).expect("get");
    assert_eq!(reloaded, code);
}
