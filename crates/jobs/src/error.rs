// crates/jobs/src/error.rs
use thiserror::Error;

use crate::record::{JobId, JobStatus};

/// A lifecycle transition the state machine forbids. The record is left
/// untouched when this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal job transition: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Errors surfaced by job store mutations. Lookups against an unknown id are
/// an explicit signal, not a panic: callers routinely poll for jobs that may
/// already have been evicted.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}
