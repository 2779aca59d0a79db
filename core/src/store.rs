//! Document store for user-code records.
//!
//! Keyed by `(user verify key, code hash)`: a second submission with the
//! same pair is a duplicate and leaves the store untouched. Records are
//! held behind per-record locks; the runtime checks a record out and holds
//! its lock for the duration of an execution so policy-state writeback is
//! never torn.

use std::collections::HashMap;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use uuid::Uuid;

use crate::error::CodeError;
use crate::error::Result;
use crate::identity::VerifyKey;
use crate::user_code::UserCode;
use crate::user_code::VersionedUserCode;

#[derive(Default)]
pub struct UserCodeStore {
    records: RwLock<HashMap<Uuid, Arc<Mutex<UserCode>>>>,
    by_owner_hash: RwLock<HashMap<(VerifyKey, String), Uuid>>,
}

impl UserCodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_err() -> CodeError {
        CodeError::QueueClosed("user code store lock poisoned".to_string())
    }

    /// Inserts a new record. Duplicate `(verify key, code hash)` pairs are
    /// rejected with the existing record's id and no state change.
    pub fn insert(&self, code: UserCode) -> Result<Uuid> {
        let key = (code.user_verify_key, code.code_hash.clone());
        let mut by_owner_hash = self.by_owner_hash.write().map_err(|_| Self::lock_err())?;
        if let Some(existing_id) = by_owner_hash.get(&key) {
            return Err(CodeError::Duplicate { existing_id: *existing_id });
        }
        let id = code.id;
        let mut records = self.records.write().map_err(|_| Self::lock_err())?;
        by_owner_hash.insert(key, id);
        records.insert(id, Arc::new(Mutex::new(code)));
        Ok(id)
    }

    /// Snapshot of a record.
    pub fn get(&self, id: Uuid) -> Result<UserCode> {
        let handle = self.checkout(id)?;
        let guard = handle.lock().map_err(|_| Self::lock_err())?;
        Ok(guard.clone())
    }

    /// Hands out the record's lock handle. The runtime holds the lock
    /// across an execution; everyone else should prefer [`get`].
    ///
    /// [`get`]: UserCodeStore::get
    pub fn checkout(&self, id: Uuid) -> Result<Arc<Mutex<UserCode>>> {
        self.records
            .read()
            .ok()
            .and_then(|records| records.get(&id).cloned())
            .ok_or(CodeError::CodeNotFound(id))
    }

    /// Applies `mutate` under the record lock.
    pub fn update<F, T>(&self, id: Uuid, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut UserCode) -> Result<T>,
    {
        let handle = self.checkout(id)?;
        let mut guard = handle.lock().map_err(|_| Self::lock_err())?;
        mutate(&mut guard)
    }

    /// Duplicate lookup for the submission pipeline.
    pub fn find_by_owner_hash(&self, verify_key: &VerifyKey, code_hash: &str) -> Option<Uuid> {
        self.by_owner_hash
            .read()
            .ok()
            .and_then(|index| index.get(&(*verify_key, code_hash.to_string())).copied())
    }

    /// The submitter's most recent record with the given service function
    /// name, used to resolve nested launch-job targets.
    pub fn find_latest_by_service_name(
        &self,
        verify_key: &VerifyKey,
        service_func_name: &str,
    ) -> Option<Uuid> {
        self.all()
            .into_iter()
            .filter(|code| {
                &code.user_verify_key == verify_key && code.service_func_name == service_func_name
            })
            .max_by_key(|code| code.submit_time)
            .map(|code| code.id)
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<UserCode> {
        let handles: Vec<Arc<Mutex<UserCode>>> = self
            .records
            .read()
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default();
        handles
            .into_iter()
            .filter_map(|handle| handle.lock().ok().map(|guard| guard.clone()))
            .collect()
    }

    /// Transitive nested-code reachability check. The store refuses to
    /// instantiate a cycle.
    pub fn check_nested_acyclic(&self, root: Uuid, nested: &[Uuid]) -> Result<()> {
        let mut stack: Vec<Uuid> = nested.to_vec();
        let mut visited: Vec<Uuid> = Vec::new();
        while let Some(id) = stack.pop() {
            if id == root {
                return Err(CodeError::NestedCodeCycle(root));
            }
            if visited.contains(&id) {
                continue;
            }
            visited.push(id);
            let code = self.get(id)?;
            stack.extend(code.nested_codes.values().copied());
        }
        Ok(())
    }

    /// Writes every record as one version-tagged JSON line.
    pub fn save_jsonl(&self, path: &Path) -> Result<()> {
        let mut file = std::fs::File::create(path)?;
        for code in self.all() {
            let line = serde_json::to_string(&VersionedUserCode::V3(code))?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        Ok(())
    }

    /// Loads records from disk, migrating older versions forward. Records
    /// missing a worker pool binding get `default_pool_id`.
    pub fn load_jsonl(&self, path: &Path, default_pool_id: Uuid) -> Result<usize> {
        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut loaded = 0;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let versioned: VersionedUserCode = serde_json::from_str(&line)?;
            let code = versioned.migrate(default_pool_id);
            match self.insert(code) {
                Ok(_) => loaded += 1,
                // Replaying a file over a warm store is not an error.
                Err(CodeError::Duplicate { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use crate::test_support::sample_user_code;

    #[test]
    fn duplicate_insert_returns_existing_id() {
        let store = UserCodeStore::new();
        let code = sample_user_code("f", "def f():\n    return 1\n");
        let duplicate = UserCode { id: Uuid::new_v4(), ..code.clone() };
        let id = store.insert(code).expect("insert");
        let err = store.insert(duplicate).unwrap_err();
        match err {
            CodeError::Duplicate { existing_id } => assert_eq!(existing_id, id),
            other => panic!("expected Duplicate, got {other:?}"),
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn same_source_different_submitter_is_not_a_duplicate() {
        let store = UserCodeStore::new();
        let code = sample_user_code("f", "def f():\n    return 1\n");
        let mut other = sample_user_code("f", "def f():\n    return 1\n");
        other.user_verify_key = crate::identity::SigningKey::generate().verify_key();
        store.insert(code).expect("insert");
        store.insert(other).expect("insert other");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn nested_cycle_is_refused() {
        let store = UserCodeStore::new();
        let mut outer = sample_user_code("outer", "def outer():\n    return 1\n");
        let inner = sample_user_code("inner", "def inner():\n    return 1\n");
        let inner_id = inner.id;
        let outer_id = outer.id;
        outer.nested_codes.insert("inner".to_string(), inner_id);
        store.insert(inner).expect("insert inner");
        store.insert(outer).expect("insert outer");

        assert!(store.check_nested_acyclic(Uuid::new_v4(), &[inner_id]).is_ok());
        assert!(matches!(
            store.check_nested_acyclic(outer_id, &[outer_id]),
            Err(CodeError::NestedCodeCycle(_))
        ));
    }

    #[test]
    fn jsonl_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("code.jsonl");
        let store = UserCodeStore::new();
        let code = sample_user_code("f", "def f():\n    return 1\n");
        let id = code.id;
        store.insert(code).expect("insert");
        store.save_jsonl(&path).expect("save");

        let fresh = UserCodeStore::new();
        let loaded = fresh.load_jsonl(&path, Uuid::new_v4()).expect("load");
        assert_eq!(loaded, 1);
        assert_eq!(fresh.get(id).expect("get").id, id);
    }
}
