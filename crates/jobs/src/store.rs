// crates/jobs/src/store.rs
//! In-memory registry of job records.
//!
//! Owns every record for the process lifetime, indexed by id and by owner.
//! Retention is bounded: once the store exceeds its configured capacity the
//! oldest terminal records are evicted. A Pending or Running job is never
//! evicted, so a burst of live jobs can overshoot the cap — callers must
//! tolerate that.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::JobsConfig;
use crate::error::StoreError;
use crate::record::{Job, JobId, JobStatus, OwnerId};

/// Counts reported by [`JobStore::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStoreStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    by_owner: HashMap<OwnerId, Vec<JobId>>,
}

impl Inner {
    fn remove(&mut self, id: JobId) -> Option<Job> {
        let job = self.jobs.remove(&id)?;
        if let Some(ids) = self.by_owner.get_mut(&job.owner) {
            ids.retain(|&other| other != id);
            if ids.is_empty() {
                self.by_owner.remove(&job.owner);
            }
        }
        Some(job)
    }

    /// Drop the oldest terminal records until back under `max`. Non-terminal
    /// records are untouchable, so this may leave the store over the limit.
    fn evict_terminal(&mut self, max: usize) {
        while self.jobs.len() > max {
            let oldest = self
                .jobs
                .values()
                .filter(|job| job.status.is_terminal())
                .min_by_key(|job| (job.finished_or_created_at(), job.id))
                .map(|job| job.id);
            match oldest {
                Some(id) => {
                    tracing::debug!(job_id = id, "evicting terminal job record");
                    self.remove(id);
                }
                None => break,
            }
        }
    }
}

/// Thread-safe store of all job records, shared between the processor,
/// progress forwarding, and the public query entry points.
pub struct JobStore {
    next_id: AtomicU64,
    inner: RwLock<Inner>,
    config: JobsConfig,
}

impl JobStore {
    pub fn new(config: JobsConfig) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: RwLock::new(Inner::default()),
            config,
        }
    }

    /// Allocate a fresh id and store a Pending record. May evict old
    /// terminal records if the store is over capacity.
    pub fn create(
        &self,
        job_type: impl Into<String>,
        owner: OwnerId,
        metadata: Map<String, Value>,
    ) -> Job {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job = Job::new(id, job_type, owner, metadata);
        match self.inner.write() {
            Ok(mut inner) => {
                inner.by_owner.entry(owner).or_default().push(id);
                inner.jobs.insert(id, job.clone());
                inner.evict_terminal(self.config.max_tracked_jobs);
            }
            Err(e) => tracing::error!("RwLock poisoned creating job: {e}"),
        }
        job
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        match self.inner.read() {
            Ok(inner) => inner.jobs.get(&id).cloned(),
            Err(e) => {
                tracing::error!("RwLock poisoned reading job: {e}");
                None
            }
        }
    }

    /// Jobs belonging to `owner`, newest first, optionally filtered by
    /// status.
    pub fn list_by_owner(&self, owner: OwnerId, status: Option<JobStatus>) -> Vec<Job> {
        match self.inner.read() {
            Ok(inner) => {
                let mut jobs: Vec<Job> = inner
                    .by_owner
                    .get(&owner)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| inner.jobs.get(id))
                    .filter(|job| status.is_none_or(|s| job.status == s))
                    .cloned()
                    .collect();
                // Ids are allocated monotonically, so descending id order is
                // newest-first even when created_at timestamps collide.
                jobs.sort_by(|a, b| b.id.cmp(&a.id));
                jobs
            }
            Err(e) => {
                tracing::error!("RwLock poisoned listing jobs: {e}");
                Vec::new()
            }
        }
    }

    /// Remove a record from both indices. Returns false for an unknown id.
    pub fn delete(&self, id: JobId) -> bool {
        match self.inner.write() {
            Ok(mut inner) => inner.remove(id).is_some(),
            Err(e) => {
                tracing::error!("RwLock poisoned deleting job: {e}");
                false
            }
        }
    }

    /// Pending -> Running. Returns the updated snapshot.
    pub fn mark_running(&self, id: JobId) -> Result<Job, StoreError> {
        self.mutate(id, |job| job.mark_running())
    }

    /// Apply a progress report. `Some(snapshot)` only when the record
    /// actually changed (job exists and is Running) — the caller uses that
    /// to decide whether a progress notification goes out.
    pub fn apply_progress(&self, id: JobId, progress: u8, message: Option<String>) -> Option<Job> {
        match self.inner.write() {
            Ok(mut inner) => {
                let job = inner.jobs.get_mut(&id)?;
                job.apply_progress(progress, message).then(|| job.clone())
            }
            Err(e) => {
                tracing::error!("RwLock poisoned applying progress: {e}");
                None
            }
        }
    }

    /// Running -> Completed with the handler's result.
    pub fn complete(&self, id: JobId, result: Value) -> Result<Job, StoreError> {
        self.mutate(id, |job| job.complete(result))
    }

    /// {Pending, Running} -> Failed with a bounded error message.
    pub fn fail(&self, id: JobId, error: impl Into<String>) -> Result<Job, StoreError> {
        let limit = self.config.error_message_limit;
        let error = error.into();
        self.mutate(id, move |job| job.fail(error, limit))
    }

    /// {Pending, Running} -> Cancelled.
    pub fn cancel(&self, id: JobId) -> Result<Job, StoreError> {
        self.mutate(id, |job| job.cancel())
    }

    pub fn stats(&self) -> JobStoreStats {
        let mut stats = JobStoreStats {
            total: 0,
            pending: 0,
            running: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
        };
        match self.inner.read() {
            Ok(inner) => {
                stats.total = inner.jobs.len();
                for job in inner.jobs.values() {
                    match job.status {
                        JobStatus::Pending => stats.pending += 1,
                        JobStatus::Running => stats.running += 1,
                        JobStatus::Completed => stats.completed += 1,
                        JobStatus::Failed => stats.failed += 1,
                        JobStatus::Cancelled => stats.cancelled += 1,
                    }
                }
            }
            Err(e) => tracing::error!("RwLock poisoned reading stats: {e}"),
        }
        stats
    }

    fn mutate(
        &self,
        id: JobId,
        f: impl FnOnce(&mut Job) -> Result<(), crate::error::TransitionError>,
    ) -> Result<Job, StoreError> {
        match self.inner.write() {
            Ok(mut inner) => {
                let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
                f(job)?;
                Ok(job.clone())
            }
            Err(e) => {
                tracing::error!("RwLock poisoned mutating job: {e}");
                Err(StoreError::NotFound(id))
            }
        }
    }
}
