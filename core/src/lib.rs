//! Root of the `fedra-core` library: the user-code lifecycle and sandboxed
//! execution engine of a federated compute node.
//!
//! Submitted source is normalized into a deterministic wrapper, bound to
//! input/output policies, approved per node, and executed under a
//! restricted runtime that can spawn nested jobs against a worker pool.

// Prevent accidental direct writes to stdout/stderr in library code. All
// operator-visible output must go through the tracing stack.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod action;
pub mod config;
pub mod error;
pub mod identity;
pub mod job;
pub mod lang;
pub mod node;
pub mod normalizer;
pub mod policy;
pub mod protocol;
pub mod queue;
pub mod runtime;
pub mod store;
pub mod user;
pub mod user_code;

pub use error::CodeError;
pub use error::Result;
pub use node::Node;

#[cfg(test)]
pub(crate) mod test_support {
    #![allow(clippy::expect_used)]

    use std::collections::BTreeMap;

    use chrono::Utc;
    use uuid::Uuid;

    use crate::identity::SigningKey;
    use crate::normalizer;
    use crate::policy::InputPolicyType;
    use crate::policy::OutputPolicyType;
    use crate::policy;
    use crate::user_code::ApprovalCollection;
    use crate::user_code::UserCode;
    use crate::user_code::generate_unique_func_name;
    use crate::user_code::generate_user_unique_func_name;
    use crate::user_code::hash_code;

    /// A well-formed record for store/runtime unit tests, bound to
    /// allow-all input and single-use output policies.
    pub fn sample_user_code(func_name: &str, raw_code: &str) -> UserCode {
        let credentials = SigningKey::generate().verify_key();
        let code_hash = hash_code(raw_code);
        let unique_func_name = generate_unique_func_name(func_name, &credentials, &code_hash);
        let submit_time = Utc::now();
        let normalized = normalizer::parse_and_rewrite(raw_code, func_name, &unique_func_name)
            .expect("sample code must normalize");
        let input_policy_type = InputPolicyType::AllowAll;
        let output_policy_type = OutputPolicyType::SingleExecutionExactOutput;
        UserCode {
            id: Uuid::new_v4(),
            node_uid: Uuid::new_v4(),
            user_verify_key: credentials,
            raw_code: raw_code.to_string(),
            parsed_code: normalized.parsed_code,
            service_func_name: func_name.to_string(),
            unique_func_name,
            user_unique_func_name: generate_user_unique_func_name(
                func_name,
                &credentials,
                submit_time,
            ),
            code_hash,
            signature: normalizer::render_signature(&normalized.params),
            input_kwargs: normalized.params,
            input_policy_type: input_policy_type.clone(),
            input_policy_init_kwargs: BTreeMap::new(),
            input_policy_state: policy::initial_input_state(&input_policy_type)
                .expect("initial input state"),
            output_policy_type: output_policy_type.clone(),
            output_policy_init_kwargs: BTreeMap::new(),
            output_policy_state: policy::initial_output_state(&output_policy_type, &BTreeMap::new())
                .expect("initial output state"),
            status: ApprovalCollection::default(),
            enclave_metadata: None,
            submit_time,
            uses_domain: normalized.uses_domain,
            nested_requests: normalized.nested_requests,
            nested_codes: BTreeMap::new(),
            worker_pool_id: Uuid::new_v4(),
        }
    }
}
