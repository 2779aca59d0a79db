//! The data node: submission pipeline, approval surface, execution entry
//! and the worker pool drawing nested actions from the queue.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::Weak;

use chrono::DateTime;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::action::ActionStore;
use crate::action::AssetStore;
use crate::action::ExecArg;
use crate::action::FUNCTION_ACTION_KIND;
use crate::config::NodeConfig;
use crate::config::NodeType;
use crate::error::CodeError;
use crate::error::Result;
use crate::identity::NodeIdentity;
use crate::identity::SigningKey;
use crate::identity::VerifyKey;
use crate::job::ExecutionResult;
use crate::job::Job;
use crate::job::JobStatus;
use crate::job::JobStore;
use crate::job::LogStore;
use crate::normalizer;
use crate::policy;
use crate::policy::PolicyStore;
use crate::protocol::ApiCall;
use crate::protocol::ApiResponse;
use crate::queue::API_CALL_QUEUE;
use crate::queue::InMemoryBroker;
use crate::queue::QueuedTask;
use crate::queue::SeenTasks;
use crate::queue::WorkerPool;
use crate::queue::decode_task;
use crate::runtime::ExecutionRequest;
use crate::runtime::RuntimeEnv;
use crate::runtime::execute_user_code;
use crate::store::UserCodeStore;
use crate::user::NewUser;
use crate::user::UserRole;
use crate::user::UserStore;
use crate::user_code::ApprovalCollection;
use crate::user_code::SubmitUserCode;
use crate::user_code::UserCode;
use crate::user_code::UserCodeStatus;
use crate::user_code::generate_unique_func_name;
use crate::user_code::generate_user_unique_func_name;
use crate::user_code::hash_code;

/// Handle registered on login, keyed by `(node uid, user verify key)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiHandle {
    pub node_uid: Uuid,
    pub verify_key: VerifyKey,
    pub registered_at: DateTime<Utc>,
}

/// Explicit registry of live api handles. Initialized on login, torn down
/// on logout; read through a typed accessor. Sandboxed code never sees it.
#[derive(Default)]
pub struct ApiRegistry {
    entries: RwLock<HashMap<(Uuid, VerifyKey), ApiHandle>>,
}

impl ApiRegistry {
    pub fn register(&self, node_uid: Uuid, verify_key: VerifyKey) -> ApiHandle {
        let handle = ApiHandle { node_uid, verify_key, registered_at: Utc::now() };
        if let Ok(mut entries) = self.entries.write() {
            entries.insert((node_uid, verify_key), handle.clone());
        }
        handle
    }

    pub fn remove(&self, node_uid: Uuid, verify_key: &VerifyKey) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(&(node_uid, *verify_key));
        }
    }

    pub fn api_for(&self, node_uid: Uuid, verify_key: &VerifyKey) -> Option<ApiHandle> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(&(node_uid, *verify_key)).cloned())
    }
}

pub struct Node {
    pub id: Uuid,
    pub name: String,
    pub node_type: NodeType,
    pub config: NodeConfig,
    signing_key: SigningKey,

    pub code_store: Arc<UserCodeStore>,
    pub policy_store: Arc<PolicyStore>,
    pub user_store: Arc<UserStore>,
    pub job_store: Arc<JobStore>,
    pub log_store: Arc<LogStore>,
    pub action_store: Arc<ActionStore>,
    pub asset_store: Arc<AssetStore>,
    pub registry: ApiRegistry,

    broker: Arc<InMemoryBroker>,
    pub default_pool: WorkerPool,
    results: RwLock<HashMap<Uuid, ExecutionResult>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Back-reference handed to spawned worker slots.
    me: Weak<Node>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let signing_key = SigningKey::generate();
        let default_pool = WorkerPool::new(&config.default_pool_name, config.default_pool_workers);
        let node = Arc::new_cyclic(|me| Self {
            id: Uuid::new_v4(),
            name: config.name.clone(),
            node_type: config.node_type,
            signing_key,
            code_store: Arc::new(UserCodeStore::new()),
            policy_store: Arc::new(PolicyStore::new()),
            user_store: Arc::new(UserStore::new()),
            job_store: Arc::new(JobStore::new()),
            log_store: Arc::new(LogStore::new()),
            action_store: Arc::new(ActionStore::new()),
            asset_store: Arc::new(AssetStore::new()),
            registry: ApiRegistry::default(),
            broker: Arc::new(InMemoryBroker::new()),
            default_pool,
            results: RwLock::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            me: me.clone(),
            config,
        });
        // The node itself is the root admin.
        let root = NewUser {
            verify_key: node.verify_key(),
            email: format!("root@{}", node.name),
            name: "root".to_string(),
            role: UserRole::Admin,
        };
        if let Err(e) = node.user_store.create(root) {
            warn!("failed to register root user: {e}");
        }
        info!(node = %node.name, id = %node.id, node_type = %node.node_type, "node created");
        node
    }

    pub fn verify_key(&self) -> VerifyKey {
        self.signing_key.verify_key()
    }

    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            node_name: self.name.clone(),
            node_id: self.id,
            verify_key: self.verify_key(),
        }
    }

    fn runtime_env(&self) -> RuntimeEnv {
        RuntimeEnv {
            code_store: Arc::clone(&self.code_store),
            policy_store: Arc::clone(&self.policy_store),
            action_store: Arc::clone(&self.action_store),
            asset_store: Arc::clone(&self.asset_store),
            job_store: Arc::clone(&self.job_store),
            log_store: Arc::clone(&self.log_store),
            publisher: self.broker.clone(),
        }
    }

    /// Registers a client session and returns its api handle.
    pub fn login(&self, verify_key: VerifyKey) -> ApiHandle {
        self.registry.register(self.id, verify_key)
    }

    pub fn logout(&self, verify_key: &VerifyKey) {
        self.registry.remove(self.id, verify_key);
    }

    // -----------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------

    /// The submission pipeline. Any failure aborts the submission with no
    /// record created.
    pub fn submit_code(&self, credentials: VerifyKey, submit: SubmitUserCode) -> Result<UserCode> {
        // Stable id and content hash first: the duplicate check guards the
        // rest of the pipeline.
        let id = Uuid::new_v4();
        let code_hash = hash_code(&submit.code);
        if let Some(existing_id) = self.code_store.find_by_owner_hash(&credentials, &code_hash) {
            return Err(CodeError::Duplicate { existing_id });
        }

        let submit_time = Utc::now();
        let service_func_name = submit.func_name.clone();
        let unique_func_name =
            generate_unique_func_name(&service_func_name, &credentials, &code_hash);
        let user_unique_func_name =
            generate_user_unique_func_name(&service_func_name, &credentials, submit_time);

        let input_policy = policy::bind_input(
            &submit.input_policy,
            &submit.input_policy_init_kwargs,
            credentials,
            &self.policy_store,
        )?;
        let output_policy = policy::bind_output(
            &submit.output_policy,
            &submit.output_policy_init_kwargs,
            credentials,
            &self.policy_store,
        )?;

        let normalized =
            normalizer::parse_and_rewrite(&submit.code, &service_func_name, &unique_func_name)?;
        let signature = if submit.signature.is_empty() {
            normalizer::render_signature(&normalized.params)
        } else {
            submit.signature.clone()
        };

        let nested_codes = self.resolve_nested_codes(id, &credentials, &normalized.nested_requests)?;

        let status = self.initial_approvals(&submit)?;

        let worker_pool_id = submit.worker_pool_id.unwrap_or(self.default_pool.id);

        let code = UserCode {
            id,
            node_uid: self.id,
            user_verify_key: credentials,
            raw_code: submit.code.clone(),
            parsed_code: normalized.parsed_code,
            service_func_name,
            unique_func_name,
            user_unique_func_name,
            code_hash,
            signature,
            input_kwargs: normalized.params,
            input_policy_type: input_policy.kind,
            input_policy_init_kwargs: input_policy.init_kwargs,
            input_policy_state: input_policy.state,
            output_policy_type: output_policy.kind,
            output_policy_init_kwargs: output_policy.init_kwargs,
            output_policy_state: output_policy.state,
            status,
            enclave_metadata: submit.enclave_metadata.clone(),
            submit_time,
            uses_domain: normalized.uses_domain,
            nested_requests: normalized.nested_requests,
            nested_codes,
            worker_pool_id,
        };

        self.code_store.insert(code.clone())?;
        info!(code_id = %code.id, func = %code.service_func_name, "code submitted");
        Ok(code)
    }

    fn initial_approvals(&self, submit: &SubmitUserCode) -> Result<ApprovalCollection> {
        match self.node_type {
            NodeType::Domain => Ok(ApprovalCollection::pending_for([self.identity()])),
            NodeType::Enclave => {
                let owners = submit
                    .enclave_metadata
                    .as_ref()
                    .map(|metadata| metadata.input_owners.clone())
                    .unwrap_or_default();
                if owners.is_empty() {
                    return Err(CodeError::PolicyBindFailed {
                        reason: "enclave submissions must declare their input owners".to_string(),
                    });
                }
                Ok(ApprovalCollection::pending_for(owners))
            }
        }
    }

    /// Resolves each launch-job callee to the submitter's latest record of
    /// that name, refusing cycles by id.
    fn resolve_nested_codes(
        &self,
        root_id: Uuid,
        credentials: &VerifyKey,
        nested_requests: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, Uuid>> {
        let mut nested_codes = BTreeMap::new();
        for name in nested_requests.keys() {
            let target = self
                .code_store
                .find_latest_by_service_name(credentials, name)
                .ok_or_else(|| CodeError::NestedCodeMissing { name: name.clone() })?;
            nested_codes.insert(name.clone(), target);
        }
        let ids: Vec<Uuid> = nested_codes.values().copied().collect();
        self.code_store.check_nested_acyclic(root_id, &ids)?;
        Ok(nested_codes)
    }

    // -----------------------------------------------------------------
    // Approval
    // -----------------------------------------------------------------

    pub fn approve_code(
        &self,
        credentials: VerifyKey,
        code_id: Uuid,
        node_identity: &NodeIdentity,
        reason: impl Into<String>,
    ) -> Result<()> {
        self.apply_approval(credentials, code_id, node_identity, UserCodeStatus::Approved, reason)
    }

    pub fn deny_code(
        &self,
        credentials: VerifyKey,
        code_id: Uuid,
        node_identity: &NodeIdentity,
        reason: impl Into<String>,
    ) -> Result<()> {
        self.apply_approval(credentials, code_id, node_identity, UserCodeStatus::Denied, reason)
    }

    fn apply_approval(
        &self,
        credentials: VerifyKey,
        code_id: Uuid,
        node_identity: &NodeIdentity,
        status: UserCodeStatus,
        reason: impl Into<String>,
    ) -> Result<()> {
        if !self.user_store.is_admin(&credentials) {
            return Err(CodeError::PermissionDenied(
                "only admins may decide code approvals".to_string(),
            ));
        }
        let reason = reason.into();
        self.code_store.update(code_id, |code| {
            code.status.transition(node_identity, status, reason.clone())
        })?;
        info!(%code_id, %status, node = %node_identity.node_name, "approval recorded");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------

    /// Creates a job for the invocation and runs it to completion in the
    /// caller's slot.
    pub fn execute_code(
        &self,
        credentials: VerifyKey,
        code_id: Uuid,
        kwargs: BTreeMap<String, ExecArg>,
    ) -> Result<ExecutionResult> {
        let code = self.code_store.get(code_id)?;
        let job = Job::new(None, code.worker_pool_id);
        self.log_store.create(job.log_id)?;
        self.job_store.insert(job.clone())?;
        self.job_store.update(job.id, |job| job.status = JobStatus::Processing)?;

        let request = ExecutionRequest {
            code_id,
            kwargs,
            credentials,
            job_id: job.id,
            log_id: job.log_id,
            has_execute_permissions: false,
        };
        let env = self.runtime_env();
        let outcome = execute_user_code(&env, &request);
        self.finish_job(job.id, code_id, &outcome);
        outcome
    }

    fn finish_job(&self, job_id: Uuid, code_id: Uuid, outcome: &Result<ExecutionResult>) {
        let update = match outcome {
            Ok(result) => {
                if let Ok(mut results) = self.results.write() {
                    results.insert(code_id, result.clone());
                }
                match &result.result {
                    Ok(value) => (JobStatus::Completed, Some(value.clone())),
                    Err(_) => (JobStatus::Errored, None),
                }
            }
            Err(_) => (JobStatus::Errored, None),
        };
        if let Err(e) = self.job_store.update(job_id, |job| {
            job.status = update.0;
            job.result = update.1.clone();
        }) {
            warn!(%job_id, "failed to record job completion: {e}");
        }
    }

    pub fn get_result(&self, code_id: Uuid) -> Result<ExecutionResult> {
        self.results
            .read()
            .ok()
            .and_then(|results| results.get(&code_id).cloned())
            .ok_or(CodeError::ResultNotReady(code_id))
    }

    // -----------------------------------------------------------------
    // Worker pool
    // -----------------------------------------------------------------

    /// Subscribes the default worker pool and spawns its execution slots.
    pub fn start(&self) -> Result<()> {
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| CodeError::QueueClosed("node handle dropped".to_string()))?;
        let receiver = self.broker.subscribe(API_CALL_QUEUE)?;
        let seen = SeenTasks::new();
        let mut workers = self
            .workers
            .lock()
            .map_err(|_| CodeError::QueueClosed("worker registry lock poisoned".to_string()))?;
        for slot in 0..self.default_pool.workers {
            let node = Arc::clone(&me);
            let rx = receiver.clone();
            let seen = seen.clone();
            workers.push(tokio::spawn(async move {
                debug!(pool = %node.default_pool.name, slot, "worker slot started");
                while let Ok(message) = rx.recv().await {
                    let task = match decode_task(&message) {
                        Ok((_, task)) => task,
                        Err(e) => {
                            warn!("dropping malformed queue message: {e}");
                            continue;
                        }
                    };
                    if !seen.first_sighting(task.task_uid) {
                        continue;
                    }
                    node.handle_queued_task(task).await;
                }
                debug!(pool = %node.default_pool.name, slot, "worker slot stopped");
            }));
        }
        Ok(())
    }

    async fn handle_queued_task(&self, task: QueuedTask) {
        let ApiCall::ExecuteAction { credentials, action, job_id, has_execute_permissions } =
            task.api_call
        else {
            warn!(task_uid = %task.task_uid, "unsupported queued call");
            return;
        };
        if action.kind != FUNCTION_ACTION_KIND {
            warn!(kind = %action.kind, "unsupported action kind");
            return;
        }
        let job = match self.job_store.get(job_id) {
            Ok(job) => job,
            Err(e) => {
                warn!(%job_id, "queued action without a job: {e}");
                return;
            }
        };
        if job.worker_pool_id != self.default_pool.id {
            // Another pool's work; this subscription only serves the
            // default pool.
            return;
        }
        if let Err(e) = self.job_store.update(job_id, |job| job.status = JobStatus::Processing) {
            warn!(%job_id, "failed to mark job processing: {e}");
            return;
        }

        let kwargs: BTreeMap<String, ExecArg> = action
            .kwarg_ids
            .iter()
            .map(|(name, id)| (name.clone(), ExecArg::Action { id: *id }))
            .collect();
        let request = ExecutionRequest {
            code_id: action.user_code_id,
            kwargs,
            credentials,
            job_id,
            log_id: job.log_id,
            has_execute_permissions,
        };
        let env = self.runtime_env();
        let code_id = action.user_code_id;
        let outcome = tokio::task::spawn_blocking(move || execute_user_code(&env, &request))
            .await
            .unwrap_or_else(|e| {
                Err(CodeError::QueueClosed(format!("execution task panicked: {e}")))
            });
        self.finish_job(job_id, code_id, &outcome);
    }

    /// Closes the queue and stops the worker slots.
    pub fn shutdown(&self) {
        self.broker.close();
        if let Ok(mut workers) = self.workers.lock() {
            for worker in workers.drain(..) {
                worker.abort();
            }
        }
    }

    // -----------------------------------------------------------------
    // Message surface
    // -----------------------------------------------------------------

    pub fn handle_api_call(&self, call: ApiCall) -> Result<ApiResponse> {
        match call {
            ApiCall::SubmitCode { credentials, code } => {
                self.submit_code(credentials, code).map(ApiResponse::Code)
            }
            ApiCall::ApproveCode { credentials, code_id, node_identity, reason } => self
                .approve_code(credentials, code_id, &node_identity, reason)
                .map(|()| ApiResponse::Empty),
            ApiCall::DenyCode { credentials, code_id, node_identity, reason } => self
                .deny_code(credentials, code_id, &node_identity, reason)
                .map(|()| ApiResponse::Empty),
            ApiCall::ExecuteCode { credentials, code_id, kwargs } => self
                .execute_code(credentials, code_id, kwargs)
                .map(ApiResponse::Result),
            ApiCall::GetResult { credentials: _, code_id } => {
                self.get_result(code_id).map(ApiResponse::Result)
            }
            ApiCall::ExecuteAction { .. } => Err(CodeError::PermissionDenied(
                "queued actions are not accepted on the client surface".to_string(),
            )),
            ApiCall::CreateUser { credentials, new_user } => {
                self.require_admin(&credentials)?;
                self.user_store.create(new_user).map(ApiResponse::User)
            }
            ApiCall::GetUser { credentials, user_id } => {
                self.require_admin(&credentials)?;
                self.user_store.get(user_id).map(ApiResponse::User)
            }
            ApiCall::GetUsers { credentials } => {
                self.require_admin(&credentials)?;
                Ok(ApiResponse::Users(self.user_store.get_all()))
            }
            ApiCall::UpdateUser { credentials, user_id, update } => {
                self.require_admin(&credentials)?;
                self.user_store.update(user_id, update).map(ApiResponse::User)
            }
            ApiCall::DeleteUser { credentials, user_id } => {
                self.require_admin(&credentials)?;
                self.user_store.delete(user_id).map(|()| ApiResponse::Empty)
            }
        }
    }

    fn require_admin(&self, credentials: &VerifyKey) -> Result<()> {
        if self.user_store.is_admin(credentials) {
            Ok(())
        } else {
            Err(CodeError::PermissionDenied("admin role required".to_string()))
        }
    }
}
