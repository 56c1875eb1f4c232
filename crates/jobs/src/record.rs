// crates/jobs/src/record.rs
//! The job record and its lifecycle state machine.
//!
//! Pending -> Running -> {Completed | Failed | Cancelled}. Cancellation is
//! also legal straight from Pending (the job never started), and a
//! submission with no registered handler fails from Pending without ever
//! running. Terminal states are final; every other transition is rejected
//! with [`TransitionError`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::TransitionError;

/// Unique identifier for a job. Allocated from a process-wide counter and
/// never reused within a process lifetime.
pub type JobId = u64;

/// Identifier of the user a job belongs to.
pub type OwnerId = beacon_notify::OwnerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One unit of background work: immutable identity plus mutable lifecycle
/// state. `Clone + Serialize`, so a clone doubles as the poll snapshot
/// handed to API callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub owner: OwnerId,
    pub status: JobStatus,
    /// 0..=100, non-decreasing while Running.
    pub progress: u8,
    pub message: Option<String>,
    /// Present only in Completed; mutually exclusive with `error`.
    pub result: Option<Value>,
    /// Present only in Failed; mutually exclusive with `result`.
    pub error: Option<String>,
    /// Caller-supplied parameters, read-only after creation.
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: JobId, job_type: impl Into<String>, owner: OwnerId, metadata: Map<String, Value>) -> Self {
        Self {
            id,
            job_type: job_type.into(),
            owner,
            status: JobStatus::Pending,
            progress: 0,
            message: None,
            result: None,
            error: None,
            metadata,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn transition(&self, to: JobStatus) -> Result<(), TransitionError> {
        use JobStatus::*;
        let legal = matches!(
            (self.status, to),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Cancelled)
        );
        if legal {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.status,
                to,
            })
        }
    }

    /// Pending -> Running. Performed exactly once, by the processor, when
    /// execution begins.
    pub fn mark_running(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Running)?;
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Clamp and apply a progress report. Effective only while Running, and
    /// never decreases. Returns whether the record changed.
    pub fn apply_progress(&mut self, progress: u8, message: Option<String>) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        self.progress = self.progress.max(progress.min(100));
        if let Some(message) = message {
            self.message = Some(message);
        }
        true
    }

    /// Running -> Completed. Stores the result and forces progress to 100.
    pub fn complete(&mut self, result: Value) -> Result<(), TransitionError> {
        self.transition(JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// {Pending, Running} -> Failed. The error message is truncated to
    /// `limit` bytes; progress is left at the last reported value.
    pub fn fail(&mut self, error: impl Into<String>, limit: usize) -> Result<(), TransitionError> {
        self.transition(JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.error = Some(truncate_utf8(error.into(), limit));
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// {Pending, Running} -> Cancelled. Any partial result is discarded.
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Cancelled)?;
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Eviction ordering key: completion time, falling back to creation
    /// time for records that never recorded one.
    pub(crate) fn finished_or_created_at(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.created_at)
    }
}

/// Truncate to at most `limit` bytes without splitting a code point.
fn truncate_utf8(mut s: String, limit: usize) -> String {
    if s.len() > limit {
        let mut end = limit;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}
