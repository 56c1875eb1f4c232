// crates/notify/src/fanout.rs
//! Fan-out helpers for the standard job lifecycle events.
//!
//! Stateless apart from the registry handle. Delivery counts are logged and
//! otherwise discarded: a dead or missing channel is the registry's problem,
//! never the caller's.

use std::sync::Arc;

use serde_json::Value;

use crate::notification::Notification;
use crate::registry::{ConnectionRegistry, OwnerId};

/// Formats lifecycle events and routes them through the connection registry.
#[derive(Clone)]
pub struct Notifier {
    registry: Arc<ConnectionRegistry>,
}

impl Notifier {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn job_started(&self, owner: OwnerId, job_id: u64, job_type: &str) {
        let n = self
            .registry
            .send_to_user(owner, &Notification::job_started(job_id, job_type));
        tracing::debug!(job_id, owner, delivered = n, "job-started");
    }

    pub fn job_progress(&self, owner: OwnerId, job_id: u64, progress: u8, message: Option<&str>) {
        let n = self
            .registry
            .send_to_user(owner, &Notification::job_progress(job_id, progress, message));
        tracing::debug!(job_id, owner, progress, delivered = n, "job-progress");
    }

    pub fn job_completed(&self, owner: OwnerId, job_id: u64, result: &Value) {
        let n = self
            .registry
            .send_to_user(owner, &Notification::job_completed(job_id, result));
        tracing::debug!(job_id, owner, delivered = n, "job-completed");
    }

    pub fn job_failed(&self, owner: OwnerId, job_id: u64, error: &str) {
        let n = self
            .registry
            .send_to_user(owner, &Notification::job_failed(job_id, error));
        tracing::debug!(job_id, owner, delivered = n, "job-failed");
    }

    pub fn job_cancelled(&self, owner: OwnerId, job_id: u64) {
        let n = self
            .registry
            .send_to_user(owner, &Notification::job_cancelled(job_id));
        tracing::debug!(job_id, owner, delivered = n, "job-cancelled");
    }

    /// Ad hoc informational message for one user.
    pub fn info_user(&self, owner: OwnerId, message: &str) {
        self.registry.send_to_user(owner, &Notification::info(message));
    }

    /// Ad hoc informational message for a room.
    pub fn info_room(&self, room: &str, message: &str) {
        self.registry.send_to_room(room, &Notification::info(message));
    }

    /// Alert every connected sink.
    pub fn alert_all(&self, message: &str) {
        self.registry.broadcast(&Notification::alert(message));
    }
}
