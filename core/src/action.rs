//! Minimal action-object and asset contract.
//!
//! Action objects are opaque typed values referenced by id in the queue
//! system; assets carry a private payload and a mock, gated per requester.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::RwLock;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::error::CodeError;
use crate::error::Result;
use crate::identity::VerifyKey;

/// Wire kind of the action produced by `domain.launch_job`. Serialized
/// compatibility point.
pub const FUNCTION_ACTION_KIND: &str = "syft_function_action";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionObject {
    pub id: Uuid,
    pub lineage_id: Uuid,
    pub payload: serde_json::Value,
}

impl ActionObject {
    pub fn from_value(payload: serde_json::Value) -> Self {
        Self { id: Uuid::new_v4(), lineage_id: Uuid::new_v4(), payload }
    }
}

/// Queued invocation of a submitted function: `{name -> action id}` kwargs
/// plus the target user-code id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub kind: String,
    pub kwarg_ids: BTreeMap<String, Uuid>,
    pub user_code_id: Uuid,
}

impl Action {
    pub fn function_action(kwarg_ids: BTreeMap<String, Uuid>, user_code_id: Uuid) -> Self {
        Self { kind: FUNCTION_ACTION_KIND.to_string(), kwarg_ids, user_code_id }
    }
}

/// Dataset asset: separate private and mock payloads, with per-requester
/// data permission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Asset {
    pub name: String,
    pub action_id: Uuid,
    pub mock: serde_json::Value,
    pub data: serde_json::Value,
    pub data_readers: BTreeSet<VerifyKey>,
}

impl Asset {
    pub fn has_data_permission(&self, requester: &VerifyKey) -> bool {
        self.data_readers.contains(requester)
    }
}

/// An argument supplied to `ExecuteCode`: a plain value, a reference into
/// the action store, or an asset reference by action id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecArg {
    Value { value: serde_json::Value },
    Action { id: Uuid },
    Asset { action_id: Uuid },
}

impl ExecArg {
    /// Id the input policy matches on, if the argument carries one.
    pub fn action_id(&self) -> Option<Uuid> {
        match self {
            ExecArg::Value { .. } => None,
            ExecArg::Action { id } => Some(*id),
            ExecArg::Asset { action_id } => Some(*action_id),
        }
    }
}

#[derive(Default)]
pub struct ActionStore {
    objects: RwLock<HashMap<Uuid, ActionObject>>,
}

impl ActionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, object: ActionObject) -> Result<Uuid> {
        let id = object.id;
        match self.objects.write() {
            Ok(mut objects) => {
                objects.insert(id, object);
                Ok(id)
            }
            Err(_) => Err(CodeError::QueueClosed("action store lock poisoned".to_string())),
        }
    }

    pub fn get(&self, id: Uuid) -> Result<ActionObject> {
        self.objects
            .read()
            .ok()
            .and_then(|objects| objects.get(&id).cloned())
            .ok_or(CodeError::ActionNotFound(id))
    }
}

#[derive(Default)]
pub struct AssetStore {
    by_action_id: Mutex<HashMap<Uuid, Asset>>,
}

impl AssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, asset: Asset) -> Result<()> {
        match self.by_action_id.lock() {
            Ok(mut assets) => {
                assets.insert(asset.action_id, asset);
                Ok(())
            }
            Err(_) => Err(CodeError::QueueClosed("asset store lock poisoned".to_string())),
        }
    }

    pub fn get_by_action_id(&self, action_id: Uuid) -> Result<Asset> {
        self.by_action_id
            .lock()
            .ok()
            .and_then(|assets| assets.get(&action_id).cloned())
            .ok_or(CodeError::AssetNotFound(action_id))
    }
}
