//! In-memory progress tracking for running sync jobs.
//!
//! Updated on every line the transfer tool prints and NOT persisted: only
//! job state transitions reach the database. The control server reads this
//! to answer `progress.active`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::models::TriggerOrigin;

/// Live view of one running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: String,
    pub target: String,
    pub origin: TriggerOrigin,
    pub started_at: DateTime<Utc>,
    pub pid: Option<u32>,
    pub lines_seen: u64,
    pub last_line: Option<String>,
}

impl JobProgress {
    pub fn new(job_id: &str, target: &str, origin: TriggerOrigin) -> Self {
        Self {
            job_id: job_id.to_string(),
            target: target.to_string(),
            origin,
            started_at: Utc::now(),
            pid: None,
            lines_seen: 0,
            last_line: None,
        }
    }
}

/// Thread-safe store for the progress of every running job, keyed by job id.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<RwLock<HashMap<String, JobProgress>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start(&self, progress: JobProgress) {
        let mut map = self.inner.write().await;
        map.insert(progress.job_id.clone(), progress);
    }

    pub async fn set_pid(&self, job_id: &str, pid: u32) {
        let mut map = self.inner.write().await;
        if let Some(entry) = map.get_mut(job_id) {
            entry.pid = Some(pid);
        }
    }

    /// Record one line of transfer output.
    pub async fn observe_line(&self, job_id: &str, line: &str) {
        let mut map = self.inner.write().await;
        if let Some(entry) = map.get_mut(job_id) {
            entry.lines_seen += 1;
            entry.last_line = Some(line.to_string());
        }
    }

    pub async fn get(&self, job_id: &str) -> Option<JobProgress> {
        let map = self.inner.read().await;
        map.get(job_id).cloned()
    }

    /// Stop tracking a job (called when it reaches a terminal state).
    pub async fn remove(&self, job_id: &str) {
        let mut map = self.inner.write().await;
        map.remove(job_id);
    }

    /// All running jobs, oldest first.
    pub async fn get_all(&self) -> Vec<JobProgress> {
        let map = self.inner.read().await;
        let mut all: Vec<JobProgress> = map.values().cloned().collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.job_id.cmp(&b.job_id)));
        all
    }

    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        map.len()
    }
}
