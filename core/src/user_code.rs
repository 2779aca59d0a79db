//! The persistent, content-addressed user-code record: approval state,
//! bound policies, version-tagged persistence and the migration shim.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::config::NodeType;
use crate::error::CodeError;
use crate::error::Result;
use crate::identity::NodeIdentity;
use crate::identity::VerifyKey;
use crate::policy::InputPolicyType;
use crate::policy::OutputPolicyType;
use crate::policy::hex_digest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserCodeStatus {
    Pending,
    Denied,
    Approved,
}

impl std::fmt::Display for UserCodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserCodeStatus::Pending => write!(f, "pending"),
            UserCodeStatus::Denied => write!(f, "denied"),
            UserCodeStatus::Approved => write!(f, "approved"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub status: UserCodeStatus,
    pub reason: String,
}

/// Per-node approval state for one code object. On a domain node the
/// collection holds exactly one entry, keyed by that node's identity; on an
/// enclave node it holds one entry per input owner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalCollection {
    /// Keyed by node identity; persisted as an entry list because the key
    /// is structured.
    #[serde(with = "serde_status_map")]
    pub status_map: BTreeMap<NodeIdentity, Approval>,
}

impl ApprovalCollection {
    pub fn pending_for(identities: impl IntoIterator<Item = NodeIdentity>) -> Self {
        let status_map = identities
            .into_iter()
            .map(|identity| {
                (identity, Approval { status: UserCodeStatus::Pending, reason: String::new() })
            })
            .collect();
        Self { status_map }
    }

    pub fn approved(&self) -> bool {
        !self.status_map.is_empty()
            && self
                .status_map
                .values()
                .all(|approval| approval.status == UserCodeStatus::Approved)
    }

    pub fn denied(&self) -> bool {
        self.status_map
            .values()
            .any(|approval| approval.status == UserCodeStatus::Denied)
    }

    /// Aggregate view for the requesting node. Enclave mode folds every
    /// entry; domain mode reads the entry keyed by this node's identity.
    pub fn for_user_context(
        &self,
        node_type: NodeType,
        identity: &NodeIdentity,
    ) -> Result<UserCodeStatus> {
        match node_type {
            NodeType::Enclave => {
                if self.denied() {
                    Ok(UserCodeStatus::Denied)
                } else if self.approved() {
                    Ok(UserCodeStatus::Approved)
                } else {
                    Ok(UserCodeStatus::Pending)
                }
            }
            NodeType::Domain => self
                .status_map
                .get(identity)
                .map(|approval| approval.status)
                .ok_or(CodeError::ApprovalTargetMissing),
        }
    }

    /// Applies one approval decision. Pending is the only non-terminal
    /// state; approval errors never mutate the collection.
    pub fn transition(
        &mut self,
        identity: &NodeIdentity,
        status: UserCodeStatus,
        reason: impl Into<String>,
    ) -> Result<()> {
        let approval = self
            .status_map
            .get_mut(identity)
            .ok_or(CodeError::ApprovalTargetMissing)?;
        if approval.status != UserCodeStatus::Pending {
            return Err(CodeError::TerminalStateViolation);
        }
        approval.status = status;
        approval.reason = reason.into();
        Ok(())
    }

    /// One human-readable line per node, used in not-approved errors.
    pub fn summary(&self) -> String {
        self.status_map
            .iter()
            .map(|(identity, approval)| {
                format!("code status on node '{}' is '{}'", identity.node_name, approval.status)
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Enclave-mode metadata: which input owners must approve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnclaveMetadata {
    pub input_owners: Vec<NodeIdentity>,
}

/// Client-side pre-record produced by decorating a function. Converted to a
/// [`UserCode`] by the submission pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitUserCode {
    pub code: String,
    pub func_name: String,
    pub signature: String,
    pub input_policy: crate::policy::InputPolicyRef,
    #[serde(default)]
    pub input_policy_init_kwargs: BTreeMap<String, serde_json::Value>,
    pub output_policy: crate::policy::OutputPolicyRef,
    #[serde(default)]
    pub output_policy_init_kwargs: BTreeMap<String, serde_json::Value>,
    pub input_kwargs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enclave_metadata: Option<EnclaveMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_pool_id: Option<Uuid>,
}

/// Current user-code record (version 3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCode {
    pub id: Uuid,
    pub node_uid: Uuid,
    pub user_verify_key: VerifyKey,
    pub raw_code: String,
    pub parsed_code: String,
    pub service_func_name: String,
    pub unique_func_name: String,
    pub user_unique_func_name: String,
    pub code_hash: String,
    pub signature: String,
    pub input_kwargs: Vec<String>,
    pub input_policy_type: InputPolicyType,
    pub input_policy_init_kwargs: BTreeMap<String, serde_json::Value>,
    #[serde(with = "serde_state_bytes")]
    pub input_policy_state: Vec<u8>,
    pub output_policy_type: OutputPolicyType,
    pub output_policy_init_kwargs: BTreeMap<String, serde_json::Value>,
    #[serde(with = "serde_state_bytes")]
    pub output_policy_state: Vec<u8>,
    pub status: ApprovalCollection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enclave_metadata: Option<EnclaveMetadata>,
    pub submit_time: DateTime<Utc>,
    pub uses_domain: bool,
    pub nested_requests: BTreeMap<String, String>,
    /// `{name -> UserCode id}` lookup table; no in-record references.
    pub nested_codes: BTreeMap<String, Uuid>,
    pub worker_pool_id: Uuid,
}

impl UserCode {
    pub fn is_enclave_code(&self) -> bool {
        self.enclave_metadata.is_some()
    }

    /// A record is executable iff every approval entry is `Approved`.
    pub fn executable(&self) -> bool {
        self.status.approved()
    }

    /// Serialized input-policy state, materializing the explicit initial
    /// state for legacy records that carried an empty sentinel.
    pub fn input_policy_state(&mut self) -> Result<Vec<u8>> {
        if self.input_policy_state.is_empty() {
            self.input_policy_state = crate::policy::initial_input_state(&self.input_policy_type)?;
        }
        Ok(self.input_policy_state.clone())
    }

    pub fn output_policy_state(&mut self) -> Result<Vec<u8>> {
        if self.output_policy_state.is_empty() {
            self.output_policy_state = crate::policy::initial_output_state(
                &self.output_policy_type,
                &self.output_policy_init_kwargs,
            )?;
        }
        Ok(self.output_policy_state.clone())
    }
}

/// Deterministic names for the rewritten wrapper. `unique_func_name` is a
/// pure function of the service name, submitter key and code hash;
/// `user_unique_func_name` additionally encodes the submission time for
/// debug disambiguation.
pub fn generate_unique_func_name(
    service_func_name: &str,
    credentials: &VerifyKey,
    code_hash: &str,
) -> String {
    format!("user_func_{service_func_name}_{credentials}_{code_hash}")
}

pub fn generate_user_unique_func_name(
    service_func_name: &str,
    credentials: &VerifyKey,
    submit_time: DateTime<Utc>,
) -> String {
    format!(
        "user_func_{service_func_name}_{credentials}_{}",
        submit_time.timestamp_micros()
    )
}

pub fn hash_code(raw_source: &str) -> String {
    hex_digest(raw_source.as_bytes())
}

// ---------------------------------------------------------------------
// Versioned persistence
// ---------------------------------------------------------------------

/// Version 1 lacked `uses_domain`, `nested_requests`, `nested_codes` and
/// `worker_pool_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCodeV1 {
    pub id: Uuid,
    pub node_uid: Uuid,
    pub user_verify_key: VerifyKey,
    pub raw_code: String,
    pub parsed_code: String,
    pub service_func_name: String,
    pub unique_func_name: String,
    pub user_unique_func_name: String,
    pub code_hash: String,
    pub signature: String,
    pub input_kwargs: Vec<String>,
    pub input_policy_type: InputPolicyType,
    pub input_policy_init_kwargs: BTreeMap<String, serde_json::Value>,
    #[serde(with = "serde_state_bytes")]
    pub input_policy_state: Vec<u8>,
    pub output_policy_type: OutputPolicyType,
    pub output_policy_init_kwargs: BTreeMap<String, serde_json::Value>,
    #[serde(with = "serde_state_bytes")]
    pub output_policy_state: Vec<u8>,
    pub status: ApprovalCollection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enclave_metadata: Option<EnclaveMetadata>,
    pub submit_time: DateTime<Utc>,
}

/// Version 2 lacked `worker_pool_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCodeV2 {
    pub id: Uuid,
    pub node_uid: Uuid,
    pub user_verify_key: VerifyKey,
    pub raw_code: String,
    pub parsed_code: String,
    pub service_func_name: String,
    pub unique_func_name: String,
    pub user_unique_func_name: String,
    pub code_hash: String,
    pub signature: String,
    pub input_kwargs: Vec<String>,
    pub input_policy_type: InputPolicyType,
    pub input_policy_init_kwargs: BTreeMap<String, serde_json::Value>,
    #[serde(with = "serde_state_bytes")]
    pub input_policy_state: Vec<u8>,
    pub output_policy_type: OutputPolicyType,
    pub output_policy_init_kwargs: BTreeMap<String, serde_json::Value>,
    #[serde(with = "serde_state_bytes")]
    pub output_policy_state: Vec<u8>,
    pub status: ApprovalCollection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enclave_metadata: Option<EnclaveMetadata>,
    pub submit_time: DateTime<Utc>,
    pub uses_domain: bool,
    pub nested_requests: BTreeMap<String, String>,
    pub nested_codes: BTreeMap<String, Uuid>,
}

/// Version-tagged on-disk form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "version")]
pub enum VersionedUserCode {
    #[serde(rename = "1")]
    V1(UserCodeV1),
    #[serde(rename = "2")]
    V2(UserCodeV2),
    #[serde(rename = "3")]
    V3(UserCode),
}

impl UserCodeV1 {
    /// v1 -> v2: the added fields default to empty collections / false.
    pub fn upgrade(self) -> UserCodeV2 {
        UserCodeV2 {
            id: self.id,
            node_uid: self.node_uid,
            user_verify_key: self.user_verify_key,
            raw_code: self.raw_code,
            parsed_code: self.parsed_code,
            service_func_name: self.service_func_name,
            unique_func_name: self.unique_func_name,
            user_unique_func_name: self.user_unique_func_name,
            code_hash: self.code_hash,
            signature: self.signature,
            input_kwargs: self.input_kwargs,
            input_policy_type: self.input_policy_type,
            input_policy_init_kwargs: self.input_policy_init_kwargs,
            input_policy_state: self.input_policy_state,
            output_policy_type: self.output_policy_type,
            output_policy_init_kwargs: self.output_policy_init_kwargs,
            output_policy_state: self.output_policy_state,
            status: self.status,
            enclave_metadata: self.enclave_metadata,
            submit_time: self.submit_time,
            uses_domain: false,
            nested_requests: BTreeMap::new(),
            nested_codes: BTreeMap::new(),
        }
    }
}

impl UserCodeV2 {
    /// v2 -> v3: bind the node's default worker pool.
    pub fn upgrade(self, default_pool_id: Uuid) -> UserCode {
        UserCode {
            id: self.id,
            node_uid: self.node_uid,
            user_verify_key: self.user_verify_key,
            raw_code: self.raw_code,
            parsed_code: self.parsed_code,
            service_func_name: self.service_func_name,
            unique_func_name: self.unique_func_name,
            user_unique_func_name: self.user_unique_func_name,
            code_hash: self.code_hash,
            signature: self.signature,
            input_kwargs: self.input_kwargs,
            input_policy_type: self.input_policy_type,
            input_policy_init_kwargs: self.input_policy_init_kwargs,
            input_policy_state: self.input_policy_state,
            output_policy_type: self.output_policy_type,
            output_policy_init_kwargs: self.output_policy_init_kwargs,
            output_policy_state: self.output_policy_state,
            status: self.status,
            enclave_metadata: self.enclave_metadata,
            submit_time: self.submit_time,
            uses_domain: self.uses_domain,
            nested_requests: self.nested_requests,
            nested_codes: self.nested_codes,
            worker_pool_id: default_pool_id,
        }
    }
}

impl UserCode {
    /// v3 -> v2 downgrade drops `worker_pool_id`.
    pub fn downgrade(self) -> UserCodeV2 {
        UserCodeV2 {
            id: self.id,
            node_uid: self.node_uid,
            user_verify_key: self.user_verify_key,
            raw_code: self.raw_code,
            parsed_code: self.parsed_code,
            service_func_name: self.service_func_name,
            unique_func_name: self.unique_func_name,
            user_unique_func_name: self.user_unique_func_name,
            code_hash: self.code_hash,
            signature: self.signature,
            input_kwargs: self.input_kwargs,
            input_policy_type: self.input_policy_type,
            input_policy_init_kwargs: self.input_policy_init_kwargs,
            input_policy_state: self.input_policy_state,
            output_policy_type: self.output_policy_type,
            output_policy_init_kwargs: self.output_policy_init_kwargs,
            output_policy_state: self.output_policy_state,
            status: self.status,
            enclave_metadata: self.enclave_metadata,
            submit_time: self.submit_time,
            uses_domain: self.uses_domain,
            nested_requests: self.nested_requests,
            nested_codes: self.nested_codes,
        }
    }
}

impl VersionedUserCode {
    /// Migrates any known version forward to the current record.
    pub fn migrate(self, default_pool_id: Uuid) -> UserCode {
        match self {
            VersionedUserCode::V1(v1) => v1.upgrade().upgrade(default_pool_id),
            VersionedUserCode::V2(v2) => v2.upgrade(default_pool_id),
            VersionedUserCode::V3(v3) => v3,
        }
    }
}

mod serde_status_map {
    use std::collections::BTreeMap;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    use crate::identity::NodeIdentity;

    use super::Approval;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<NodeIdentity, Approval>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<NodeIdentity, Approval>, D::Error> {
        let entries = Vec::<(NodeIdentity, Approval)>::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}

/// Policy state is small and is stored as a plain byte array in JSON.
/// Kept behind a module so the representation can change in one place.
mod serde_state_bytes {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Vec::<u8>::deserialize(deserializer)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn identity(name: &str) -> NodeIdentity {
        NodeIdentity {
            node_name: name.to_string(),
            node_id: Uuid::new_v4(),
            verify_key: crate::identity::SigningKey::generate().verify_key(),
        }
    }

    #[test]
    fn approval_lifecycle_on_domain_node() {
        let node = identity("alpha");
        let mut collection = ApprovalCollection::pending_for([node.clone()]);
        assert_eq!(
            collection.for_user_context(NodeType::Domain, &node).expect("status"),
            UserCodeStatus::Pending
        );

        collection
            .transition(&node, UserCodeStatus::Approved, "ok")
            .expect("approve");
        assert!(collection.approved());
        assert_eq!(
            collection.for_user_context(NodeType::Domain, &node).expect("status"),
            UserCodeStatus::Approved
        );
    }

    #[test]
    fn terminal_states_reject_retransition() {
        let node = identity("alpha");
        let mut collection = ApprovalCollection::pending_for([node.clone()]);
        collection
            .transition(&node, UserCodeStatus::Denied, "not allowed")
            .expect("deny");
        let before = collection.clone();
        let err = collection
            .transition(&node, UserCodeStatus::Approved, "changed my mind")
            .unwrap_err();
        assert!(matches!(err, CodeError::TerminalStateViolation));
        assert_eq!(collection, before);
    }

    #[test]
    fn missing_target_rejects_without_mutation() {
        let node = identity("alpha");
        let stranger = identity("beta");
        let mut collection = ApprovalCollection::pending_for([node]);
        let before = collection.clone();
        let err = collection
            .transition(&stranger, UserCodeStatus::Approved, "")
            .unwrap_err();
        assert!(matches!(err, CodeError::ApprovalTargetMissing));
        assert_eq!(collection, before);
    }

    #[test]
    fn enclave_aggregate_view() {
        let alpha = identity("alpha");
        let beta = identity("beta");
        let mut collection = ApprovalCollection::pending_for([alpha.clone(), beta.clone()]);
        let viewer = identity("enclave");

        assert_eq!(
            collection.for_user_context(NodeType::Enclave, &viewer).expect("status"),
            UserCodeStatus::Pending
        );

        collection.transition(&alpha, UserCodeStatus::Approved, "ok").expect("approve");
        assert_eq!(
            collection.for_user_context(NodeType::Enclave, &viewer).expect("status"),
            UserCodeStatus::Pending
        );

        collection.transition(&beta, UserCodeStatus::Denied, "no").expect("deny");
        assert_eq!(
            collection.for_user_context(NodeType::Enclave, &viewer).expect("status"),
            UserCodeStatus::Denied
        );
    }

    #[test]
    fn unique_func_name_is_pure() {
        let key = crate::identity::SigningKey::from_seed([3u8; 32]).verify_key();
        let hash = hash_code("def f():\n    return 1\n");
        let a = generate_unique_func_name("f", &key, &hash);
        let b = generate_unique_func_name("f", &key, &hash);
        assert_eq!(a, b);
        assert!(a.starts_with("user_func_f_"));

        let other_hash = hash_code("def f():\n    return 2\n");
        assert_ne!(a, generate_unique_func_name("f", &key, &other_hash));
    }

    #[test]
    fn empty_reason_is_accepted() {
        let node = identity("alpha");
        let mut collection = ApprovalCollection::pending_for([node.clone()]);
        collection.transition(&node, UserCodeStatus::Approved, "").expect("approve");
        assert_eq!(collection.status_map[&node].reason, "");
    }
}
