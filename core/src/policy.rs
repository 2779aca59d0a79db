//! Input/output policies and the policy binder.
//!
//! A policy reference resolves to a concrete type tag plus init kwargs;
//! binding filters the submitted kwargs against an explicit per-type
//! schema (never against reflective signatures) and serializes an initial
//! state. The binder never executes user policy code; that happens under
//! the same sandbox as user code.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::RwLock;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use uuid::Uuid;

use crate::action::ExecArg;
use crate::error::CodeError;
use crate::error::Result;
use crate::identity::VerifyKey;
use crate::normalizer;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputPolicyRef {
    AllowAll,
    ExactMatch,
    Stored { policy_id: Uuid },
    Submitted { policy: SubmitUserPolicy },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputPolicyRef {
    SingleExecutionExactOutput,
    ExecuteCount,
    Stored { policy_id: Uuid },
    Submitted { policy: SubmitUserPolicy },
}

/// Type tag persisted on the user-code record once an input policy is bound.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputPolicyType {
    AllowAll,
    ExactMatch,
    User { policy_id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputPolicyType {
    SingleExecutionExactOutput,
    ExecuteCount,
    User { policy_id: Uuid },
}

/// Inline policy submission: normalized and stored like user code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitUserPolicy {
    pub code: String,
    pub func_name: String,
    /// Declared init-kwarg names; the binder filters against this schema.
    pub init_kwargs_schema: Vec<String>,
}

/// Stored policy whose implementation is itself submitted source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserPolicy {
    pub id: Uuid,
    pub user_verify_key: VerifyKey,
    pub raw_code: String,
    pub parsed_code: String,
    pub code_hash: String,
    pub service_func_name: String,
    pub unique_func_name: String,
    pub init_kwargs_schema: Vec<String>,
    pub submit_time: DateTime<Utc>,
}

/// Counter state shared by the built-in run-limited output policies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputRunState {
    pub count: u64,
    pub limit: u64,
}

/// State carried by the built-in input policies.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InputRunState {
    pub calls: u64,
}

/// A resolved policy ready to be attached to a user-code record.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundPolicy<T> {
    pub kind: T,
    pub init_kwargs: BTreeMap<String, serde_json::Value>,
    pub state: Vec<u8>,
}

#[derive(Default)]
pub struct PolicyStore {
    policies: RwLock<HashMap<Uuid, UserPolicy>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, policy: UserPolicy) -> Result<Uuid> {
        let id = policy.id;
        let mut policies = self
            .policies
            .write()
            .map_err(|_| CodeError::QueueClosed("policy store lock poisoned".to_string()))?;
        policies.insert(id, policy);
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Result<UserPolicy> {
        self.policies
            .read()
            .ok()
            .and_then(|policies| policies.get(&id).cloned())
            .ok_or(CodeError::PolicyNotFound(id))
    }
}

/// Normalizes an inline policy submission into a stored [`UserPolicy`].
pub fn submit_user_policy(
    submission: &SubmitUserPolicy,
    credentials: VerifyKey,
    store: &PolicyStore,
) -> Result<Uuid> {
    let code_hash = hex_digest(submission.code.as_bytes());
    let unique_func_name =
        format!("user_policy_{}_{credentials}_{code_hash}", submission.func_name);
    let normalized =
        normalizer::parse_and_rewrite(&submission.code, &submission.func_name, &unique_func_name)
            .map_err(|e| CodeError::PolicyBindFailed { reason: e.to_string() })?;
    if normalized.uses_domain {
        return Err(CodeError::PolicyBindFailed {
            reason: "policy code must not use the domain handle".to_string(),
        });
    }
    store.insert(UserPolicy {
        id: Uuid::new_v4(),
        user_verify_key: credentials,
        raw_code: submission.code.clone(),
        parsed_code: normalized.parsed_code,
        code_hash,
        service_func_name: submission.func_name.clone(),
        unique_func_name,
        init_kwargs_schema: submission.init_kwargs_schema.clone(),
        submit_time: Utc::now(),
    })
}

pub fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn builtin_input_schema(kind: &InputPolicyType) -> &'static [&'static str] {
    match kind {
        InputPolicyType::AllowAll => &[],
        InputPolicyType::ExactMatch => &["inputs"],
        InputPolicyType::User { .. } => &[],
    }
}

fn builtin_output_schema(kind: &OutputPolicyType) -> &'static [&'static str] {
    match kind {
        OutputPolicyType::SingleExecutionExactOutput => &[],
        OutputPolicyType::ExecuteCount => &["limit"],
        OutputPolicyType::User { .. } => &[],
    }
}

fn filter_kwargs(
    kwargs: &BTreeMap<String, serde_json::Value>,
    schema: &[String],
) -> BTreeMap<String, serde_json::Value> {
    kwargs
        .iter()
        .filter(|(name, _)| schema.iter().any(|s| s == *name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Resolves an input policy reference, filters its init kwargs against the
/// schema descriptor and serializes the explicit initial state.
pub fn bind_input(
    reference: &InputPolicyRef,
    init_kwargs: &BTreeMap<String, serde_json::Value>,
    credentials: VerifyKey,
    store: &PolicyStore,
) -> Result<BoundPolicy<InputPolicyType>> {
    let kind = match reference {
        InputPolicyRef::AllowAll => InputPolicyType::AllowAll,
        InputPolicyRef::ExactMatch => InputPolicyType::ExactMatch,
        InputPolicyRef::Stored { policy_id } => {
            store.get(*policy_id)?;
            InputPolicyType::User { policy_id: *policy_id }
        }
        InputPolicyRef::Submitted { policy } => {
            let policy_id = submit_user_policy(policy, credentials, store)?;
            InputPolicyType::User { policy_id }
        }
    };
    let schema: Vec<String> = match &kind {
        InputPolicyType::User { policy_id } => store.get(*policy_id)?.init_kwargs_schema,
        other => builtin_input_schema(other).iter().map(|s| s.to_string()).collect(),
    };
    let init_kwargs = filter_kwargs(init_kwargs, &schema);
    if matches!(kind, InputPolicyType::ExactMatch) {
        // Validate the approved-input map up front so execution never sees
        // a malformed policy.
        expected_inputs(&init_kwargs)
            .map_err(|reason| CodeError::PolicyBindFailed { reason })?;
    }
    let state = initial_input_state(&kind)?;
    Ok(BoundPolicy { kind, init_kwargs, state })
}

pub fn bind_output(
    reference: &OutputPolicyRef,
    init_kwargs: &BTreeMap<String, serde_json::Value>,
    credentials: VerifyKey,
    store: &PolicyStore,
) -> Result<BoundPolicy<OutputPolicyType>> {
    let kind = match reference {
        OutputPolicyRef::SingleExecutionExactOutput => OutputPolicyType::SingleExecutionExactOutput,
        OutputPolicyRef::ExecuteCount => OutputPolicyType::ExecuteCount,
        OutputPolicyRef::Stored { policy_id } => {
            store.get(*policy_id)?;
            OutputPolicyType::User { policy_id: *policy_id }
        }
        OutputPolicyRef::Submitted { policy } => {
            let policy_id = submit_user_policy(policy, credentials, store)?;
            OutputPolicyType::User { policy_id }
        }
    };
    let schema: Vec<String> = match &kind {
        OutputPolicyType::User { policy_id } => store.get(*policy_id)?.init_kwargs_schema,
        other => builtin_output_schema(other).iter().map(|s| s.to_string()).collect(),
    };
    let init_kwargs = filter_kwargs(init_kwargs, &schema);
    let state = initial_output_state(&kind, &init_kwargs)?;
    Ok(BoundPolicy { kind, init_kwargs, state })
}

/// Serializes the explicit initial state for an input policy. Also used to
/// materialize state for legacy records that carried the empty sentinel.
pub fn initial_input_state(kind: &InputPolicyType) -> Result<Vec<u8>> {
    match kind {
        InputPolicyType::AllowAll | InputPolicyType::ExactMatch => {
            Ok(serde_json::to_vec(&InputRunState::default())?)
        }
        InputPolicyType::User { .. } => Ok(serde_json::to_vec(&empty_state_dict())?),
    }
}

pub fn initial_output_state(
    kind: &OutputPolicyType,
    init_kwargs: &BTreeMap<String, serde_json::Value>,
) -> Result<Vec<u8>> {
    match kind {
        OutputPolicyType::SingleExecutionExactOutput => {
            Ok(serde_json::to_vec(&OutputRunState { count: 0, limit: 1 })?)
        }
        OutputPolicyType::ExecuteCount => {
            let limit = init_kwargs
                .get("limit")
                .and_then(serde_json::Value::as_u64)
                .filter(|limit| *limit >= 1)
                .ok_or_else(|| CodeError::PolicyBindFailed {
                    reason: "execute_count requires an integer 'limit' of at least 1".to_string(),
                })?;
            Ok(serde_json::to_vec(&OutputRunState { count: 0, limit })?)
        }
        OutputPolicyType::User { .. } => Ok(serde_json::to_vec(&empty_state_dict())?),
    }
}

fn empty_state_dict() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Parses the `{name -> action id}` map approved at submission time.
pub fn expected_inputs(
    init_kwargs: &BTreeMap<String, serde_json::Value>,
) -> std::result::Result<BTreeMap<String, Uuid>, String> {
    let Some(inputs) = init_kwargs.get("inputs") else {
        return Ok(BTreeMap::new());
    };
    let Some(map) = inputs.as_object() else {
        return Err("exact_match 'inputs' must be a map of argument names to action ids".to_string());
    };
    let mut expected = BTreeMap::new();
    for (name, value) in map {
        let id = value
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| format!("exact_match input '{name}' is not an action id"))?;
        expected.insert(name.clone(), id);
    }
    Ok(expected)
}

/// Built-in input admission. `Ok(())` admits the call; `Err(reason)` is the
/// policy's rejection reason.
pub fn check_builtin_input(
    kind: &InputPolicyType,
    init_kwargs: &BTreeMap<String, serde_json::Value>,
    args: &BTreeMap<String, ExecArg>,
) -> std::result::Result<(), String> {
    match kind {
        InputPolicyType::AllowAll => Ok(()),
        InputPolicyType::ExactMatch => {
            let expected = expected_inputs(init_kwargs)?;
            for name in args.keys() {
                if !expected.contains_key(name) {
                    return Err(format!("unexpected argument '{name}'"));
                }
            }
            for (name, expected_id) in &expected {
                let Some(arg) = args.get(name) else {
                    return Err(format!("missing argument '{name}'"));
                };
                match arg.action_id() {
                    Some(id) if id == *expected_id => {}
                    Some(id) => {
                        return Err(format!(
                            "argument '{name}' does not match the approved input (got {id})"
                        ));
                    }
                    None => {
                        return Err(format!(
                            "argument '{name}' must reference the approved action object"
                        ));
                    }
                }
            }
            Ok(())
        }
        InputPolicyType::User { .. } => Ok(()),
    }
}

/// Records a successful admission on a built-in input policy state.
pub fn advance_builtin_input(state: &[u8]) -> Result<Vec<u8>> {
    let mut run: InputRunState = serde_json::from_slice(state)?;
    run.calls += 1;
    Ok(serde_json::to_vec(&run)?)
}

/// Built-in output admission over the serialized state. Returns the parsed
/// state so an accepted call can be advanced without re-parsing.
pub fn check_builtin_output(
    kind: &OutputPolicyType,
    state: &[u8],
) -> Result<std::result::Result<OutputRunState, String>> {
    match kind {
        OutputPolicyType::SingleExecutionExactOutput | OutputPolicyType::ExecuteCount => {
            let run: OutputRunState = serde_json::from_slice(state)?;
            if run.count < run.limit {
                Ok(Ok(run))
            } else if run.limit == 1 {
                Ok(Err("single-use execution already consumed".to_string()))
            } else {
                Ok(Err(format!("execution limit of {} reached", run.limit)))
            }
        }
        OutputPolicyType::User { .. } => Ok(Ok(OutputRunState { count: 0, limit: u64::MAX })),
    }
}

pub fn advance_builtin_output(mut run: OutputRunState) -> Result<Vec<u8>> {
    run.count += 1;
    Ok(serde_json::to_vec(&run)?)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn key() -> VerifyKey {
        crate::identity::SigningKey::generate().verify_key()
    }

    #[test]
    fn binds_allow_all_with_filtered_kwargs() {
        let store = PolicyStore::new();
        let mut kwargs = BTreeMap::new();
        kwargs.insert("unrelated".to_string(), serde_json::json!(1));
        let bound =
            bind_input(&InputPolicyRef::AllowAll, &kwargs, key(), &store).expect("bind");
        assert_eq!(bound.kind, InputPolicyType::AllowAll);
        assert!(bound.init_kwargs.is_empty());
        let state: InputRunState = serde_json::from_slice(&bound.state).expect("state");
        assert_eq!(state, InputRunState::default());
    }

    #[test]
    fn execute_count_requires_limit() {
        let store = PolicyStore::new();
        let err = bind_output(&OutputPolicyRef::ExecuteCount, &BTreeMap::new(), key(), &store)
            .unwrap_err();
        assert!(matches!(err, CodeError::PolicyBindFailed { .. }));

        let mut kwargs = BTreeMap::new();
        kwargs.insert("limit".to_string(), serde_json::json!(3));
        let bound =
            bind_output(&OutputPolicyRef::ExecuteCount, &kwargs, key(), &store).expect("bind");
        let state: OutputRunState = serde_json::from_slice(&bound.state).expect("state");
        assert_eq!(state, OutputRunState { count: 0, limit: 3 });
    }

    #[test]
    fn single_use_admits_once() {
        let kind = OutputPolicyType::SingleExecutionExactOutput;
        let state = initial_output_state(&kind, &BTreeMap::new()).expect("state");
        let run = check_builtin_output(&kind, &state)
            .expect("check")
            .expect("admit");
        let state = advance_builtin_output(run).expect("advance");
        let verdict = check_builtin_output(&kind, &state).expect("check");
        assert_eq!(verdict, Err("single-use execution already consumed".to_string()));
    }

    #[test]
    fn exact_match_compares_action_ids() {
        let approved = Uuid::new_v4();
        let mut init_kwargs = BTreeMap::new();
        init_kwargs.insert(
            "inputs".to_string(),
            serde_json::json!({ "x": approved.to_string() }),
        );
        let kind = InputPolicyType::ExactMatch;

        let mut args = BTreeMap::new();
        args.insert("x".to_string(), ExecArg::Asset { action_id: approved });
        assert_eq!(check_builtin_input(&kind, &init_kwargs, &args), Ok(()));

        let mut wrong = BTreeMap::new();
        wrong.insert("x".to_string(), ExecArg::Asset { action_id: Uuid::new_v4() });
        assert!(check_builtin_input(&kind, &init_kwargs, &wrong).is_err());

        let mut extra = args.clone();
        extra.insert("y".to_string(), ExecArg::Value { value: serde_json::json!(1) });
        assert!(check_builtin_input(&kind, &init_kwargs, &extra).is_err());

        assert!(check_builtin_input(&kind, &init_kwargs, &BTreeMap::new()).is_err());
    }

    #[test]
    fn inline_policy_submission_is_normalized_and_stored() {
        let store = PolicyStore::new();
        let submission = SubmitUserPolicy {
            code: "def check(state, inputs):\n    return {\"allowed\": True, \"reason\": \"\", \"state\": state}\n".to_string(),
            func_name: "check".to_string(),
            init_kwargs_schema: vec!["threshold".to_string()],
        };
        let mut kwargs = BTreeMap::new();
        kwargs.insert("threshold".to_string(), serde_json::json!(5));
        kwargs.insert("dropped".to_string(), serde_json::json!(true));
        let bound =
            bind_input(&InputPolicyRef::Submitted { policy: submission }, &kwargs, key(), &store)
                .expect("bind");
        let InputPolicyType::User { policy_id } = bound.kind else {
            panic!("expected user policy");
        };
        let stored = store.get(policy_id).expect("stored");
        assert_eq!(stored.service_func_name, "check");
        assert!(stored.parsed_code.starts_with("def user_policy_check_"));
        assert_eq!(bound.init_kwargs.keys().collect::<Vec<_>>(), vec!["threshold"]);
    }

    #[test]
    fn policy_code_rejecting_domain_use() {
        let store = PolicyStore::new();
        let submission = SubmitUserPolicy {
            code: "def check(domain):\n    return domain.launch_job(check)\n".to_string(),
            func_name: "check".to_string(),
            init_kwargs_schema: vec![],
        };
        let err = submit_user_policy(&submission, key(), &store).unwrap_err();
        assert!(matches!(err, CodeError::PolicyBindFailed { .. }));
    }
}
