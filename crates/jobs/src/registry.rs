// crates/jobs/src/registry.rs
//! Maps a job-type tag to the executable logic for that type.
//!
//! Populated once at startup, then wrapped in an `Arc` and read without
//! locking. Handlers come in two shapes: cooperative (async, runs directly
//! on the scheduler) and blocking (native computation, offloaded to the
//! bounded worker pool by the processor).

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::processor::JobContext;

/// What a handler produces: an opaque result payload, or an error the
/// processor converts into a Failed record.
pub type HandlerOutcome = Result<serde_json::Value, anyhow::Error>;

pub type AsyncHandlerFn = Arc<dyn Fn(JobContext) -> BoxFuture<'static, HandlerOutcome> + Send + Sync>;
pub type BlockingHandlerFn = Arc<dyn Fn(JobContext) -> HandlerOutcome + Send + Sync>;

#[derive(Clone)]
pub enum Handler {
    /// Cooperative handler; suspension points are wherever it awaits.
    Async(AsyncHandlerFn),
    /// Blocking handler; occupies one worker-pool slot while it runs.
    Blocking(BlockingHandlerFn),
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cooperative handler. The last registration for a type
    /// wins; intended for startup wiring only.
    pub fn register_async<F, Fut>(&mut self, job_type: impl Into<String>, f: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerOutcome> + Send + 'static,
    {
        self.handlers.insert(
            job_type.into(),
            Handler::Async(Arc::new(move |ctx| f(ctx).boxed())),
        );
    }

    /// Register a blocking handler. Same last-wins semantics.
    pub fn register_blocking<F>(&mut self, job_type: impl Into<String>, f: F)
    where
        F: Fn(JobContext) -> HandlerOutcome + Send + Sync + 'static,
    {
        self.handlers
            .insert(job_type.into(), Handler::Blocking(Arc::new(f)));
    }

    pub fn get(&self, job_type: &str) -> Option<Handler> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
