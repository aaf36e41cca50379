//! Cancellation registry: job id → abortable token.
//!
//! Constructed once and shared as `Arc<CancellationRegistry>`. Every request
//! cycle registers a job; whoever holds the registry (a Ctrl-C handler, an
//! HTTP endpoint) can fire its token by id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct JobEntry {
    token: CancellationToken,
    started_at: DateTime<Utc>,
    meta: Value,
    generation: u64,
}

/// A registered job, returned by [`CancellationRegistry::create`].
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_id: String,
    pub token: CancellationToken,
    generation: u64,
}

impl JobHandle {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Read-only view of a registered job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub meta: Value,
    pub cancelled: bool,
}

/// Map from job id to cancellation token.
#[derive(Default)]
pub struct CancellationRegistry {
    jobs: Mutex<HashMap<String, JobEntry>>,
    next_generation: AtomicU64,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a job. An existing entry for the same id is cancelled first.
    pub fn create(&self, job_id: impl Into<String>, meta: Value) -> JobHandle {
        let job_id = job_id.into();
        let token = CancellationToken::new();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let entry = JobEntry {
            token: token.clone(),
            started_at: Utc::now(),
            meta,
            generation,
        };
        if let Some(previous) = self.lock().insert(job_id.clone(), entry) {
            debug!(job_id = %job_id, "Replacing existing job, cancelling its token");
            previous.token.cancel();
        }

        JobHandle {
            job_id,
            token,
            generation,
        }
    }

    /// Register a job and get a guard that finishes it on drop.
    pub fn create_guarded(self: &Arc<Self>, job_id: impl Into<String>, meta: Value) -> JobGuard {
        let handle = self.create(job_id, meta);
        JobGuard {
            registry: Arc::clone(self),
            handle,
        }
    }

    /// Fire and remove a job's token. Returns false for unknown ids.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.lock().remove(job_id) {
            Some(entry) => {
                entry.token.cancel();
                info!(job_id = %job_id, "Job cancelled");
                true
            }
            None => false,
        }
    }

    /// Fire and remove every token. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        for (_, entry) in &drained {
            entry.token.cancel();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "Cancelled all jobs");
        }
        drained.len()
    }

    pub fn has(&self, job_id: &str) -> bool {
        self.lock().contains_key(job_id)
    }

    pub fn get_token(&self, job_id: &str) -> Option<CancellationToken> {
        self.lock().get(job_id).map(|e| e.token.clone())
    }

    /// Snapshot of registered jobs, oldest first.
    pub fn jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<(u64, JobInfo)> = self
            .lock()
            .iter()
            .map(|(id, e)| {
                (
                    e.generation,
                    JobInfo {
                        job_id: id.clone(),
                        started_at: e.started_at,
                        meta: e.meta.clone(),
                        cancelled: e.token.is_cancelled(),
                    },
                )
            })
            .collect();
        jobs.sort_by_key(|(generation, _)| *generation);
        jobs.into_iter().map(|(_, info)| info).collect()
    }

    /// Remove a finished job, unless a newer job has taken its id.
    pub fn finish(&self, handle: &JobHandle) -> bool {
        let mut jobs = self.lock();
        match jobs.get(&handle.job_id) {
            Some(entry) if entry.generation == handle.generation => {
                jobs.remove(&handle.job_id);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Finishes its job when dropped.
pub struct JobGuard {
    registry: Arc<CancellationRegistry>,
    handle: JobHandle,
}

impl JobGuard {
    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    pub fn token(&self) -> CancellationToken {
        self.handle.token.clone()
    }

    pub fn job_id(&self) -> &str {
        &self.handle.job_id
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.registry.finish(&self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_and_cancel() {
        let registry = CancellationRegistry::new();
        let job = registry.create("job-1", json!({"session": "s"}));
        assert!(registry.has("job-1"));
        assert!(!job.is_cancelled());

        assert!(registry.cancel("job-1"));
        assert!(job.is_cancelled());
        assert!(!registry.has("job-1"));
    }

    #[test]
    fn cancel_unknown_is_false() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel("nope"));
    }

    #[test]
    fn double_create_cancels_first() {
        let registry = CancellationRegistry::new();
        let first = registry.create("job", Value::Null);
        let second = registry.create("job", Value::Null);

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(registry.len(), 1);

        // The stale handle must not remove the newer job
        assert!(!registry.finish(&first));
        assert!(registry.has("job"));
        assert!(registry.finish(&second));
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_all_counts_and_clears() {
        let registry = CancellationRegistry::new();
        let a = registry.create("a", Value::Null);
        let b = registry.create("b", Value::Null);
        assert_eq!(registry.cancel_all(), 2);
        assert!(a.is_cancelled() && b.is_cancelled());
        assert!(registry.is_empty());
        assert_eq!(registry.cancel_all(), 0);
    }

    #[test]
    fn lookups_are_read_only() {
        let registry = CancellationRegistry::new();
        registry.create("a", json!({"n": 1}));
        registry.create("b", json!({"n": 2}));

        let token = registry.get_token("a").unwrap();
        assert!(!token.is_cancelled());
        assert!(registry.get_token("zzz").is_none());

        let jobs = registry.jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].job_id, "a");
        assert_eq!(jobs[1].meta, json!({"n": 2}));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn guard_finishes_on_drop() {
        let registry = Arc::new(CancellationRegistry::new());
        {
            let guard = registry.create_guarded("job", Value::Null);
            assert_eq!(guard.job_id(), "job");
            assert!(registry.has("job"));
        }
        assert!(!registry.has("job"));
    }

    #[test]
    fn guard_leaves_replacement_alone() {
        let registry = Arc::new(CancellationRegistry::new());
        let guard = registry.create_guarded("job", Value::Null);
        let newer = registry.create("job", Value::Null);
        drop(guard);
        assert!(registry.has("job"));
        assert!(!newer.is_cancelled());
    }
}
