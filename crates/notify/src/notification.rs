// crates/notify/src/notification.rs
//! Notification values pushed over live channels.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::registry::ConnectionId;

/// Kind of a pushed notification.
///
/// Closed set: a new lifecycle event gets a variant here, not a free-form
/// string, so receivers can match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    Connected,
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    JobCancelled,
    Info,
    Alert,
}

/// An immutable event delivered to live sinks.
///
/// Notifications are never load-bearing for job correctness; the job record
/// is always queryable without them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub kind: NotificationKind,
    pub payload: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, payload: Map<String, Value>) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Acknowledgment sent directly to a sink right after it registers.
    pub fn connected(connection_id: ConnectionId) -> Self {
        Self::new(
            NotificationKind::Connected,
            object(json!({ "connectionId": connection_id.to_string() })),
        )
    }

    pub fn job_started(job_id: u64, job_type: &str) -> Self {
        Self::new(
            NotificationKind::JobStarted,
            object(json!({ "jobId": job_id, "jobType": job_type })),
        )
    }

    pub fn job_progress(job_id: u64, progress: u8, message: Option<&str>) -> Self {
        Self::new(
            NotificationKind::JobProgress,
            object(json!({ "jobId": job_id, "progress": progress, "message": message })),
        )
    }

    pub fn job_completed(job_id: u64, result: &Value) -> Self {
        Self::new(
            NotificationKind::JobCompleted,
            object(json!({ "jobId": job_id, "result": result })),
        )
    }

    pub fn job_failed(job_id: u64, error: &str) -> Self {
        Self::new(
            NotificationKind::JobFailed,
            object(json!({ "jobId": job_id, "error": error })),
        )
    }

    pub fn job_cancelled(job_id: u64) -> Self {
        Self::new(
            NotificationKind::JobCancelled,
            object(json!({ "jobId": job_id })),
        )
    }

    pub fn info(message: &str) -> Self {
        Self::new(NotificationKind::Info, object(json!({ "message": message })))
    }

    pub fn alert(message: &str) -> Self {
        Self::new(NotificationKind::Alert, object(json!({ "message": message })))
    }
}

/// Unwrap a `json!({...})` literal into its map. Non-object input yields an
/// empty payload.
fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
