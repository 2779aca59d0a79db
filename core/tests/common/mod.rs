//! Shared helpers for the integration suites.
#![allow(dead_code)]
#![allow(clippy::expect_used)]

use std::collections::BTreeMap;
use std::sync::Arc;

use fedra_core::Node;
use fedra_core::config::NodeConfig;
use fedra_core::identity::SigningKey;
use fedra_core::identity::VerifyKey;
use fedra_core::policy::InputPolicyRef;
use fedra_core::policy::OutputPolicyRef;
use fedra_core::user_code::SubmitUserCode;

pub fn domain_node(name: &str) -> Arc<Node> {
    Node::new(NodeConfig::new(name))
}

pub fn scientist() -> VerifyKey {
    SigningKey::generate().verify_key()
}

/// The default decoration: exact-match input, single-use output.
pub fn single_use_submission(func_name: &str, code: &str) -> SubmitUserCode {
    SubmitUserCode {
        code: code.to_string(),
        func_name: func_name.to_string(),
        signature: String::new(),
        input_policy: InputPolicyRef::ExactMatch,
        input_policy_init_kwargs: BTreeMap::new(),
        output_policy: OutputPolicyRef::SingleExecutionExactOutput,
        output_policy_init_kwargs: BTreeMap::new(),
        input_kwargs: Vec::new(),
        enclave_metadata: None,
        worker_pool_id: None,
    }
}

/// Approves `code_id` on the node's own identity with the root key.
pub fn approve(node: &Node, code_id: uuid::Uuid, reason: &str) {
    node.approve_code(node.verify_key(), code_id, &node.identity(), reason)
        .expect("approval should succeed");
}
