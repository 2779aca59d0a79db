//! Client-facing operations and their responses.
//!
//! The same tagged enum doubles as the queue payload format: a queued
//! action is an `ApiCall` carried inside a `(task_uid, api_call)` tuple.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::action::Action;
use crate::action::ExecArg;
use crate::identity::NodeIdentity;
use crate::identity::VerifyKey;
use crate::job::ExecutionResult;
use crate::job::Job;
use crate::user::NewUser;
use crate::user::User;
use crate::user::UserUpdate;
use crate::user_code::SubmitUserCode;
use crate::user_code::UserCode;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(clippy::large_enum_variant)]
pub enum ApiCall {
    /// Submit code for approval.
    SubmitCode {
        credentials: VerifyKey,
        code: SubmitUserCode,
    },

    /// Approve a pending code object for one node identity.
    ApproveCode {
        credentials: VerifyKey,
        code_id: Uuid,
        node_identity: NodeIdentity,
        reason: String,
    },

    /// Deny a pending code object for one node identity.
    DenyCode {
        credentials: VerifyKey,
        code_id: Uuid,
        node_identity: NodeIdentity,
        reason: String,
    },

    /// Execute an approved code object.
    ExecuteCode {
        credentials: VerifyKey,
        code_id: Uuid,
        kwargs: BTreeMap<String, ExecArg>,
    },

    /// Fetch the latest execution result for a code object.
    GetResult {
        credentials: VerifyKey,
        code_id: Uuid,
    },

    /// Queued invocation produced by `domain.launch_job`. Carries the
    /// submitter's credentials; the dispatcher grants execute permission.
    ExecuteAction {
        credentials: VerifyKey,
        action: Action,
        job_id: Uuid,
        has_execute_permissions: bool,
    },

    // User directory; these gate who may approve.
    CreateUser {
        credentials: VerifyKey,
        new_user: NewUser,
    },
    GetUser {
        credentials: VerifyKey,
        user_id: Uuid,
    },
    GetUsers {
        credentials: VerifyKey,
    },
    UpdateUser {
        credentials: VerifyKey,
        user_id: Uuid,
        update: UserUpdate,
    },
    DeleteUser {
        credentials: VerifyKey,
        user_id: Uuid,
    },
}

impl ApiCall {
    pub fn credentials(&self) -> &VerifyKey {
        match self {
            ApiCall::SubmitCode { credentials, .. }
            | ApiCall::ApproveCode { credentials, .. }
            | ApiCall::DenyCode { credentials, .. }
            | ApiCall::ExecuteCode { credentials, .. }
            | ApiCall::GetResult { credentials, .. }
            | ApiCall::ExecuteAction { credentials, .. }
            | ApiCall::CreateUser { credentials, .. }
            | ApiCall::GetUser { credentials, .. }
            | ApiCall::GetUsers { credentials }
            | ApiCall::UpdateUser { credentials, .. }
            | ApiCall::DeleteUser { credentials, .. } => credentials,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(clippy::large_enum_variant)]
pub enum ApiResponse {
    Code(UserCode),
    CodeId(Uuid),
    Result(ExecutionResult),
    Job(Job),
    User(User),
    Users(Vec<User>),
    Empty,
}
