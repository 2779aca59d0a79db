//! Jobs, execution results and the append-only log surface.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::error::CodeError;
use crate::error::ExecDenial;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Processing,
    Completed,
    Errored,
}

/// Execution handle. Mutated by the runtime while user code runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub parent_job_id: Option<Uuid>,
    pub log_id: Uuid,
    pub status: JobStatus,
    pub n_iters: Option<i64>,
    pub current_iter: i64,
    pub worker_pool_id: Uuid,
    pub result: Option<serde_json::Value>,
}

impl Job {
    pub fn new(parent_job_id: Option<Uuid>, worker_pool_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_job_id,
            log_id: Uuid::new_v4(),
            status: JobStatus::Created,
            n_iters: None,
            current_iter: 0,
            worker_pool_id,
            result: None,
        }
    }
}

/// Captured outcome of a single invocation. The error side is a marker,
/// not a transport error: stdout/stderr up to the failure are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub id: Uuid,
    pub user_code_id: Uuid,
    pub stdout: String,
    pub stderr: String,
    pub result: std::result::Result<serde_json::Value, ExecDenial>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub job_id: Uuid,
    pub text: String,
}

#[derive(Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) -> Result<()> {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| CodeError::QueueClosed("job store lock poisoned".to_string()))?;
        jobs.insert(job.id, job);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Job> {
        self.jobs
            .read()
            .ok()
            .and_then(|jobs| jobs.get(&id).cloned())
            .ok_or(CodeError::JobNotFound(id))
    }

    pub fn all(&self) -> Vec<Job> {
        self.jobs
            .read()
            .map(|jobs| jobs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Applies `mutate` to the job under the store lock.
    pub fn update<F>(&self, id: Uuid, mutate: F) -> Result<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self
            .jobs
            .write()
            .map_err(|_| CodeError::QueueClosed("job store lock poisoned".to_string()))?;
        let job = jobs.get_mut(&id).ok_or(CodeError::JobNotFound(id))?;
        mutate(job);
        Ok(job.clone())
    }
}

/// Append-only log store keyed by log id. Appends are atomic: each entry
/// is pushed under the store lock and entries are never rewritten.
#[derive(Default)]
pub struct LogStore {
    logs: RwLock<HashMap<Uuid, Vec<LogEntry>>>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, log_id: Uuid) -> Result<()> {
        let mut logs = self
            .logs
            .write()
            .map_err(|_| CodeError::QueueClosed("log store lock poisoned".to_string()))?;
        logs.entry(log_id).or_default();
        Ok(())
    }

    pub fn append(&self, log_id: Uuid, job_id: Uuid, text: impl Into<String>) -> Result<()> {
        let entry = LogEntry { timestamp: Utc::now(), job_id, text: text.into() };
        let mut logs = self
            .logs
            .write()
            .map_err(|_| CodeError::QueueClosed("log store lock poisoned".to_string()))?;
        logs.entry(log_id).or_default().push(entry);
        Ok(())
    }

    pub fn entries(&self, log_id: Uuid) -> Vec<LogEntry> {
        self.logs
            .read()
            .ok()
            .and_then(|logs| logs.get(&log_id).cloned())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;

    #[test]
    fn job_update_mutates_in_place() {
        let store = JobStore::new();
        let job = Job::new(None, Uuid::new_v4());
        let id = job.id;
        store.insert(job).expect("insert");
        let updated = store
            .update(id, |job| {
                job.status = JobStatus::Processing;
                job.n_iters = Some(10);
            })
            .expect("update");
        assert_eq!(updated.status, JobStatus::Processing);
        assert_eq!(store.get(id).expect("get").n_iters, Some(10));
    }

    #[test]
    fn log_appends_preserve_order() {
        let store = LogStore::new();
        let log_id = Uuid::new_v4();
        let job_id = Uuid::new_v4();
        store.create(log_id).expect("create");
        store.append(log_id, job_id, "first\n").expect("append");
        store.append(log_id, job_id, "second\n").expect("append");
        let texts: Vec<String> = store.entries(log_id).into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["first\n".to_string(), "second\n".to_string()]);
    }

    #[test]
    fn missing_job_is_an_error() {
        let store = JobStore::new();
        assert!(matches!(store.get(Uuid::new_v4()), Err(CodeError::JobNotFound(_))));
    }
}
