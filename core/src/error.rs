use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, CodeError>;

/// Which of the two bound policies produced a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySide {
    Input,
    Output,
}

impl std::fmt::Display for PolicySide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicySide::Input => write!(f, "input"),
            PolicySide::Output => write!(f, "output"),
        }
    }
}

#[derive(Error, Debug)]
pub enum CodeError {
    /// The submitted source referenced disallowed globals or failed to parse.
    #[error("submission rejected: {reason}")]
    NormalizerRejected { reason: String },

    /// A record with the same (verify key, code hash) already exists.
    #[error("duplicate submission; existing code id: {existing_id}")]
    Duplicate { existing_id: Uuid },

    /// A policy reference could not be resolved or initialized.
    #[error("policy binding failed: {reason}")]
    PolicyBindFailed { reason: String },

    /// The node identity being mutated is not part of the approval collection.
    #[error("node identity is not part of this code's approval collection")]
    ApprovalTargetMissing,

    /// Approved and Denied are terminal; no transitions out of them.
    #[error("approval status is terminal and cannot be changed")]
    TerminalStateViolation,

    /// Execution was requested while at least one approval is outstanding.
    #[error("code is not approved: {reason}")]
    NotApproved { reason: String },

    /// The bound input or output policy rejected the call.
    #[error("{side} policy rejected the call: {reason}")]
    PolicyReject { side: PolicySide, reason: String },

    /// The rewritten source no longer compiles. Fatal for the execution.
    #[error("failed to compile user code: {message}")]
    Compile { message: String },

    /// User code raised; the framed traceback is scoped to the rewritten source.
    #[error("execution failed:\n{framed}")]
    Execution { framed: String },

    /// A nested job could not be enqueued. Catchable by user code.
    #[error("could not dispatch nested job: {0}")]
    Dispatch(String),

    #[error("no user code with id {0}")]
    CodeNotFound(Uuid),

    #[error("no user policy with id {0}")]
    PolicyNotFound(Uuid),

    #[error("no job with id {0}")]
    JobNotFound(Uuid),

    #[error("no action object with id {0}")]
    ActionNotFound(Uuid),

    #[error("no asset bound to action id {0}")]
    AssetNotFound(Uuid),

    #[error("no user with id {0}")]
    UserNotFound(Uuid),

    #[error("no result recorded for code {0}")]
    ResultNotReady(Uuid),

    /// `nested_codes` must form a DAG; the store refuses to instantiate cycles.
    #[error("nested code cycle involving {0}")]
    NestedCodeCycle(Uuid),

    #[error("nested function '{name}' has not been submitted to this node")]
    NestedCodeMissing { name: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("queue is closed: {0}")]
    QueueClosed(String),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Error marker persisted inside an [`ExecutionResult`] when an invocation
/// does not produce a value.
///
/// [`ExecutionResult`]: crate::job::ExecutionResult
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecDenial {
    PolicyReject { side: PolicySide, reason: String },
    Compile { message: String },
    Runtime { framed: String },
}

impl std::fmt::Display for ExecDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecDenial::PolicyReject { side, reason } => {
                write!(f, "{side} policy rejected the call: {reason}")
            }
            ExecDenial::Compile { message } => write!(f, "failed to compile user code: {message}"),
            ExecDenial::Runtime { framed } => write!(f, "{framed}"),
        }
    }
}
