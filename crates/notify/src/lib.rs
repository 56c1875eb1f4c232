// crates/notify/src/lib.rs
//! Live-channel notification layer for the beacon job system.
//!
//! This crate tracks open push channels (`ConnectionRegistry`), formats the
//! standard lifecycle events (`Notification`), and routes them to the right
//! audience (`Notifier`). Delivery is best-effort: a notification that is
//! lost or dropped never affects job state, which remains independently
//! queryable from the job store.

pub mod fanout;
pub mod notification;
pub mod registry;

pub use fanout::Notifier;
pub use notification::{Notification, NotificationKind};
pub use registry::{
    Audience, ConnectionId, ConnectionRegistry, ConnectionStats, NotifyConfig, OwnerId, Sink,
};
