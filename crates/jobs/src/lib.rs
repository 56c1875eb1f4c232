// crates/jobs/src/lib.rs
//! Background job execution: records, bounded retention, handler dispatch,
//! and lifecycle notifications.
//!
//! Submissions return an id immediately; execution happens on detached tasks
//! coordinated by one tokio scheduler. Callers observe jobs two ways, by
//! polling [`JobStore`] snapshots or by the push notifications
//! [`beacon_notify`] fans out for every lifecycle edge.

pub mod config;
pub mod error;
pub mod processor;
pub mod record;
pub mod registry;
pub mod store;

pub use config::JobsConfig;
pub use error::{StoreError, TransitionError};
pub use processor::{JobContext, JobProcessor, ProgressReporter};
pub use record::{Job, JobId, JobStatus, OwnerId};
pub use registry::{Handler, HandlerOutcome, HandlerRegistry};
pub use store::{JobStore, JobStoreStats};
