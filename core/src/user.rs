//! User directory. Approval decisions are gated on the admin role.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::error::CodeError;
use crate::error::Result;
use crate::identity::VerifyKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    DataScientist,
    Guest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub verify_key: VerifyKey,
    pub email: String,
    pub name: String,
    pub role: UserRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUser {
    pub verify_key: VerifyKey,
    pub email: String,
    pub name: String,
    pub role: UserRole,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<UserRole>,
}

#[derive(Default)]
pub struct UserStore {
    users: RwLock<HashMap<Uuid, User>>,
}

impl UserStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_err() -> CodeError {
        CodeError::QueueClosed("user store lock poisoned".to_string())
    }

    pub fn create(&self, new_user: NewUser) -> Result<User> {
        let user = User {
            id: Uuid::new_v4(),
            verify_key: new_user.verify_key,
            email: new_user.email,
            name: new_user.name,
            role: new_user.role,
        };
        let mut users = self.users.write().map_err(|_| Self::lock_err())?;
        users.insert(user.id, user.clone());
        Ok(user)
    }

    pub fn get(&self, user_id: Uuid) -> Result<User> {
        self.users
            .read()
            .ok()
            .and_then(|users| users.get(&user_id).cloned())
            .ok_or(CodeError::UserNotFound(user_id))
    }

    pub fn get_all(&self) -> Vec<User> {
        let mut users: Vec<User> = self
            .users
            .read()
            .map(|users| users.values().cloned().collect())
            .unwrap_or_default();
        users.sort_by(|a, b| a.email.cmp(&b.email));
        users
    }

    pub fn by_verify_key(&self, verify_key: &VerifyKey) -> Option<User> {
        self.users
            .read()
            .ok()
            .and_then(|users| users.values().find(|u| &u.verify_key == verify_key).cloned())
    }

    pub fn update(&self, user_id: Uuid, update: UserUpdate) -> Result<User> {
        let mut users = self.users.write().map_err(|_| Self::lock_err())?;
        let user = users.get_mut(&user_id).ok_or(CodeError::UserNotFound(user_id))?;
        if let Some(email) = update.email {
            user.email = email;
        }
        if let Some(name) = update.name {
            user.name = name;
        }
        if let Some(role) = update.role {
            user.role = role;
        }
        Ok(user.clone())
    }

    pub fn delete(&self, user_id: Uuid) -> Result<()> {
        let mut users = self.users.write().map_err(|_| Self::lock_err())?;
        users
            .remove(&user_id)
            .map(|_| ())
            .ok_or(CodeError::UserNotFound(user_id))
    }

    /// True iff the key belongs to a registered admin.
    pub fn is_admin(&self, verify_key: &VerifyKey) -> bool {
        self.by_verify_key(verify_key)
            .map(|user| user.role == UserRole::Admin)
            .unwrap_or(false)
    }
}
