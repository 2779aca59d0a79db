//! Sandbox runtime: executes an approved user-code record against a
//! keyword argument map and captures the outcome.
//!
//! Isolation is authority-based, not resource-based: the only handles
//! sandboxed code holds are the values placed into its scope, and the only
//! observable side effects are appended log lines, enqueued nested jobs,
//! advanced policy state and the returned result.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;
use tracing::error;
use tracing::info;
use uuid::Uuid;

use crate::action::Action;
use crate::action::ActionObject;
use crate::action::ActionStore;
use crate::action::AssetStore;
use crate::action::ExecArg;
use crate::error::CodeError;
use crate::error::ExecDenial;
use crate::error::PolicySide;
use crate::error::Result;
use crate::identity::VerifyKey;
use crate::job::ExecutionResult;
use crate::job::Job;
use crate::job::JobStore;
use crate::job::LogStore;
use crate::lang;
use crate::lang::CodeHandle;
use crate::lang::DomainHooks;
use crate::lang::Interp;
use crate::lang::JobHandle;
use crate::lang::PrintSink;
use crate::lang::ScriptError;
use crate::lang::Value;
use crate::normalizer::DOMAIN_PARAM;
use crate::policy;
use crate::policy::InputPolicyType;
use crate::policy::OutputPolicyType;
use crate::policy::PolicyStore;
use crate::protocol::ApiCall;
use crate::queue::API_CALL_QUEUE;
use crate::queue::QueuePublisher;
use crate::queue::publish_task;
use crate::store::UserCodeStore;
use crate::user_code::UserCode;

/// Everything the runtime may touch while an execution is in flight.
pub struct RuntimeEnv {
    pub code_store: Arc<UserCodeStore>,
    pub policy_store: Arc<PolicyStore>,
    pub action_store: Arc<ActionStore>,
    pub asset_store: Arc<AssetStore>,
    pub job_store: Arc<JobStore>,
    pub log_store: Arc<LogStore>,
    pub publisher: Arc<dyn QueuePublisher>,
}

/// One execution request, resolved against the caller's credentials and
/// bound to an existing job for progress and log routing.
pub struct ExecutionRequest {
    pub code_id: Uuid,
    pub kwargs: BTreeMap<String, ExecArg>,
    pub credentials: VerifyKey,
    pub job_id: Uuid,
    pub log_id: Uuid,
    /// Set on nested dispatches; skips the approval gate the way the
    /// dispatcher grants it.
    pub has_execute_permissions: bool,
}

/// How each argument was resolved by `debox_asset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentKind {
    Real,
    Mock,
    Private,
}

/// Phases of a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecPhase {
    Prepared,
    ArgsResolved,
    Compiled,
    Executing,
    Succeeded,
    Failed,
}

/// Executes the wrapper and returns the captured outcome. Policy rejects,
/// compile failures and user exceptions all yield a complete
/// [`ExecutionResult`]; only infrastructure failures surface as `Err`.
pub fn execute_user_code(env: &RuntimeEnv, request: &ExecutionRequest) -> Result<ExecutionResult> {
    let record = env.code_store.checkout(request.code_id)?;
    // The record lock is held for the whole execution: policy-state
    // writeback must not interleave with another run of the same code.
    let mut code = record
        .lock()
        .map_err(|_| CodeError::QueueClosed("user code record lock poisoned".to_string()))?;

    if !request.has_execute_permissions && !code.executable() {
        return Err(CodeError::NotApproved { reason: code.status.summary() });
    }

    let mut phase = ExecPhase::Prepared;
    debug!(code_id = %code.id, ?phase, "execution prepared");

    // Input policy admission. A reject terminates before anything runs and
    // leaves both policy states untouched.
    let input_state = code.input_policy_state()?;
    let next_input_state = match &code.input_policy_type {
        InputPolicyType::User { policy_id } => {
            let inputs = args_as_json(&request.kwargs);
            match eval_user_policy(env, *policy_id, &input_state, inputs, PolicySide::Input)? {
                PolicyVerdict::Allowed { state } => state,
                PolicyVerdict::Rejected { reason } => {
                    return Ok(denial_result(&code, PolicySide::Input, reason));
                }
            }
        }
        builtin => {
            if let Err(reason) =
                policy::check_builtin_input(builtin, &code.input_policy_init_kwargs, &request.kwargs)
            {
                return Ok(denial_result(&code, PolicySide::Input, reason));
            }
            policy::advance_builtin_input(&input_state)?
        }
    };

    let (mut scope_kwargs, kinds) = resolve_args(env, &request.kwargs, &request.credentials)?;
    if code.uses_domain {
        scope_kwargs.insert(DOMAIN_PARAM.to_string(), Value::Domain);
    }
    phase = ExecPhase::ArgsResolved;
    debug!(code_id = %code.id, ?phase, ?kinds, "arguments resolved");

    // Compile the rewritten source. Failure here is fatal and logged.
    let module = match lang::parse_module(&code.parsed_code) {
        Ok(module) => module,
        Err(e) => {
            let message = e.to_string();
            error!(code_id = %code.id, "failed to compile user code: {message}");
            let _ = env.log_store.append(
                request.log_id,
                request.job_id,
                format!("failed to compile user code: {message}\n"),
            );
            return Ok(ExecutionResult {
                id: Uuid::new_v4(),
                user_code_id: code.id,
                stdout: String::new(),
                stderr: String::new(),
                result: Err(ExecDenial::Compile { message }),
            });
        }
    };
    phase = ExecPhase::Compiled;
    debug!(code_id = %code.id, ?phase, "compiled");

    // Execution scope: nested user-code handles by name, the print shim
    // and the sandbox builtins. Nothing else.
    let mut globals = lang::base_globals();
    for (name, nested_id) in &code.nested_codes {
        let nested = env.code_store.get(*nested_id)?;
        globals.insert(
            name.clone(),
            Value::Code(CodeHandle { id: nested.id, name: nested.service_func_name.clone() }),
        );
    }

    let sink = ExecutionSink {
        stdout: RefCell::new(String::new()),
        log_store: env.log_store.as_ref(),
        log_id: request.log_id,
        job_id: request.job_id,
    };
    let client = LocalDomainClient {
        env,
        credentials: request.credentials,
        job_id: request.job_id,
    };
    let hooks: Option<&dyn DomainHooks> = if code.uses_domain { Some(&client) } else { None };

    phase = ExecPhase::Executing;
    debug!(code_id = %code.id, ?phase, job_id = %request.job_id, "executing");

    let mut interp = Interp::new(globals, &sink, hooks);
    let outcome = interp
        .exec_module(&module)
        .and_then(|()| interp.call_by_name(&code.unique_func_name, scope_kwargs));
    let stdout = sink.stdout.into_inner();

    let value = match outcome {
        Ok(value) => value,
        Err(script_err) => {
            phase = ExecPhase::Failed;
            debug!(code_id = %code.id, ?phase, "user code raised");
            let framed = framed_traceback(&code, &script_err);
            let _ = env.log_store.append(request.log_id, request.job_id, framed.clone());
            info!(target: "function_log", job_id = %request.job_id, "exception:\n{framed}");
            return Ok(ExecutionResult {
                id: Uuid::new_v4(),
                user_code_id: code.id,
                stdout,
                stderr: String::new(),
                result: Err(ExecDenial::Runtime { framed }),
            });
        }
    };
    phase = ExecPhase::Succeeded;
    debug!(code_id = %code.id, ?phase, "succeeded");

    // Output policy admission. A reject discards the call without
    // committing any policy state.
    let output_state = code.output_policy_state()?;
    let next_output_state = match &code.output_policy_type {
        OutputPolicyType::User { policy_id } => {
            let pending = serde_json::json!({ "result": value.to_json() });
            match eval_user_policy(env, *policy_id, &output_state, pending, PolicySide::Output)? {
                PolicyVerdict::Allowed { state } => state,
                PolicyVerdict::Rejected { reason } => {
                    let mut result = denial_result(&code, PolicySide::Output, reason);
                    result.stdout = stdout;
                    return Ok(result);
                }
            }
        }
        builtin => match policy::check_builtin_output(builtin, &output_state)? {
            Ok(run) => policy::advance_builtin_output(run)?,
            Err(reason) => {
                let mut result = denial_result(&code, PolicySide::Output, reason);
                result.stdout = stdout;
                return Ok(result);
            }
        },
    };

    // Commit both policy states under the record lock.
    code.input_policy_state = next_input_state;
    code.output_policy_state = next_output_state;

    Ok(ExecutionResult {
        id: Uuid::new_v4(),
        user_code_id: code.id,
        stdout,
        stderr: String::new(),
        result: Ok(value.to_json()),
    })
}

fn denial_result(code: &UserCode, side: PolicySide, reason: String) -> ExecutionResult {
    ExecutionResult {
        id: Uuid::new_v4(),
        user_code_id: code.id,
        stdout: String::new(),
        stderr: String::new(),
        result: Err(ExecDenial::PolicyReject { side, reason }),
    }
}

/// Resolves every argument through the asset/action stores. Assets the
/// caller may read resolve to private data; assets without permission
/// resolve to the mock.
fn resolve_args(
    env: &RuntimeEnv,
    kwargs: &BTreeMap<String, ExecArg>,
    credentials: &VerifyKey,
) -> Result<(BTreeMap<String, Value>, Vec<ArgumentKind>)> {
    let mut resolved = BTreeMap::new();
    let mut kinds = Vec::with_capacity(kwargs.len());
    for (name, arg) in kwargs {
        let (value, kind) = debox_asset(env, arg, credentials)?;
        kinds.push(kind);
        resolved.insert(name.clone(), value);
    }
    Ok((resolved, kinds))
}

fn debox_asset(
    env: &RuntimeEnv,
    arg: &ExecArg,
    credentials: &VerifyKey,
) -> Result<(Value, ArgumentKind)> {
    match arg {
        ExecArg::Asset { action_id } => {
            let asset = env.asset_store.get_by_action_id(*action_id)?;
            if asset.has_data_permission(credentials) {
                Ok((Value::from_json(&asset.data), ArgumentKind::Private))
            } else {
                Ok((Value::from_json(&asset.mock), ArgumentKind::Mock))
            }
        }
        ExecArg::Action { id } => {
            let object = env.action_store.get(*id)?;
            Ok((Value::from_json(&object.payload), ArgumentKind::Real))
        }
        ExecArg::Value { value } => Ok((Value::from_json(value), ArgumentKind::Real)),
    }
}

fn args_as_json(kwargs: &BTreeMap<String, ExecArg>) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = kwargs
        .iter()
        .map(|(name, arg)| {
            let value = match arg {
                ExecArg::Value { value } => value.clone(),
                ExecArg::Action { id } => serde_json::json!({ "action_id": id.to_string() }),
                ExecArg::Asset { action_id } => {
                    serde_json::json!({ "action_id": action_id.to_string() })
                }
            };
            (name.clone(), value)
        })
        .collect();
    serde_json::Value::Object(map)
}

enum PolicyVerdict {
    Allowed { state: Vec<u8> },
    Rejected { reason: String },
}

/// Runs a user policy under the same sandbox as user code. The policy
/// function receives `state` and `inputs` keywords and must return
/// `{"allowed": bool, "reason": str, "state": dict}`.
fn eval_user_policy(
    env: &RuntimeEnv,
    policy_id: Uuid,
    state: &[u8],
    inputs: serde_json::Value,
    side: PolicySide,
) -> Result<PolicyVerdict> {
    let stored = env.policy_store.get(policy_id)?;
    let module = lang::parse_module(&stored.parsed_code).map_err(|e| CodeError::PolicyReject {
        side,
        reason: format!("policy failed to compile: {e}"),
    })?;
    let state_json: serde_json::Value = if state.is_empty() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_slice(state)?
    };

    let sink = PolicySink { policy_id };
    let mut interp = Interp::new(lang::base_globals(), &sink, None);
    let mut kwargs = BTreeMap::new();
    kwargs.insert("state".to_string(), Value::from_json(&state_json));
    kwargs.insert("inputs".to_string(), Value::from_json(&inputs));
    let verdict = interp
        .exec_module(&module)
        .and_then(|()| interp.call_by_name(&stored.unique_func_name, kwargs))
        .map_err(|e| CodeError::PolicyReject { side, reason: format!("policy raised: {e}") })?;

    let Value::Dict(map) = verdict else {
        return Err(CodeError::PolicyReject {
            side,
            reason: "policy must return a dict with 'allowed', 'reason' and 'state'".to_string(),
        });
    };
    let allowed = map.get("allowed").map(Value::truthy).unwrap_or(false);
    if allowed {
        let new_state = map
            .get("state")
            .map(Value::to_json)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
        Ok(PolicyVerdict::Allowed { state: serde_json::to_vec(&new_state)? })
    } else {
        let reason = match map.get("reason") {
            Some(Value::Str(reason)) => reason.clone(),
            _ => "rejected by policy".to_string(),
        };
        Ok(PolicyVerdict::Rejected { reason })
    }
}

/// Per-execution print shim: owns the stdout capture, appends one log
/// entry per call and mirrors the line for operator visibility.
struct ExecutionSink<'a> {
    stdout: RefCell<String>,
    log_store: &'a LogStore,
    log_id: Uuid,
    job_id: Uuid,
}

impl PrintSink for ExecutionSink<'_> {
    fn write(&self, text: &str) {
        self.stdout.borrow_mut().push_str(text);
        if let Err(e) = self.log_store.append(self.log_id, self.job_id, text) {
            error!("failed to append function log: {e}");
        }
        info!(target: "function_log", job_id = %self.job_id, "{}", text.trim_end_matches('\n'));
    }
}

/// Print shim for policy evaluations; policy output is operator-only.
struct PolicySink {
    policy_id: Uuid,
}

impl PrintSink for PolicySink {
    fn write(&self, text: &str) {
        debug!(target: "function_log", policy_id = %self.policy_id, "{}", text.trim_end_matches('\n'));
    }
}

/// The read-only handle injected as `domain`. The capability set is
/// closed: progress counters and nested job dispatch, nothing else.
struct LocalDomainClient<'a> {
    env: &'a RuntimeEnv,
    credentials: VerifyKey,
    job_id: Uuid,
}

impl DomainHooks for LocalDomainClient<'_> {
    fn init_progress(&self, n_iters: i64) -> std::result::Result<(), String> {
        self.env
            .job_store
            .update(self.job_id, |job| {
                job.n_iters = Some(n_iters);
                job.current_iter = 0;
            })
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn set_progress(&self, to: i64) -> std::result::Result<(), String> {
        self.env
            .job_store
            .update(self.job_id, |job| job.current_iter = to)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn increment_progress(&self, by: i64) -> std::result::Result<(), String> {
        self.env
            .job_store
            .update(self.job_id, |job| job.current_iter += by)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    /// The nested job dispatcher. Argument values become action objects,
    /// the action is enqueued against the callee's worker pool, and the
    /// child job is visible before this call returns.
    fn launch_job(
        &self,
        func: &CodeHandle,
        kwargs: BTreeMap<String, Value>,
    ) -> std::result::Result<JobHandle, String> {
        let dispatch = || -> Result<JobHandle> {
            let callee = self.env.code_store.get(func.id)?;

            let mut kwarg_ids = BTreeMap::new();
            for (name, value) in kwargs {
                let object = ActionObject::from_value(value.to_json());
                let id = self.env.action_store.set(object)?;
                kwarg_ids.insert(name, id);
            }
            let action = Action::function_action(kwarg_ids, callee.id);

            let job = Job::new(Some(self.job_id), callee.worker_pool_id);
            self.env.log_store.create(job.log_id)?;
            self.env.job_store.insert(job.clone())?;

            publish_task(
                self.env.publisher.as_ref(),
                API_CALL_QUEUE,
                Uuid::new_v4(),
                ApiCall::ExecuteAction {
                    credentials: self.credentials,
                    action,
                    job_id: job.id,
                    has_execute_permissions: true,
                },
            )?;
            debug!(job_id = %job.id, parent_job_id = %self.job_id, "nested job enqueued");
            Ok(JobHandle { id: job.id, parent_id: job.parent_job_id })
        };
        dispatch().map_err(|e| CodeError::Dispatch(e.to_string()).to_string())
    }
}

/// Maps the deepest frame into the rewritten source: a 5-line window with
/// a `-->` marker on the faulty line, followed by the error rendering.
pub fn framed_traceback(code: &UserCode, err: &ScriptError) -> String {
    let lines: Vec<&str> = code.parsed_code.lines().collect();
    let line_nr = err.line().clamp(1, lines.len().max(1));
    let start = line_nr.saturating_sub(2).max(1);
    let end = (line_nr + 2).min(lines.len());

    let mut window = String::new();
    for number in start..=end {
        let marker = if number == line_nr { "-->" } else { "   " };
        let text = lines.get(number - 1).unwrap_or(&"");
        window.push_str(&format!("{marker} {number:>3} | {text}\n"));
    }

    format!(
        "Encountered while executing {}:\n{window}Traceback (most recent call last):\n  line {line_nr}, in {}\nScriptError: {}\n",
        code.service_func_name,
        code.unique_func_name,
        err.message(),
    )
}
