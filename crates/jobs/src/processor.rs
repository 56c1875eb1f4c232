// crates/jobs/src/processor.rs
//! Accepts submissions, runs each job as an independent task, and applies
//! terminal transitions.
//!
//! One tokio scheduler coordinates all lifecycle transitions. Blocking
//! handlers are offloaded to `spawn_blocking` behind a semaphore sized at
//! construction, so slow native computation cannot stall the scheduler or
//! starve unrelated jobs. Progress reports from any execution context are
//! marshaled over a channel back onto the scheduler before they touch the
//! record.
//!
//! Handler errors and panics are contained at the handler/processor
//! boundary: they become a Failed record with a bounded message and are
//! never re-raised to the submitter.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use beacon_notify::Notifier;

use crate::config::JobsConfig;
use crate::record::{Job, JobId, OwnerId};
use crate::registry::{BlockingHandlerFn, Handler, HandlerOutcome, HandlerRegistry};
use crate::store::JobStore;

/// Capability handed to handlers for reporting progress.
///
/// Safe to call from the scheduler or from a worker thread; updates travel
/// over an unbounded channel and are applied in order by a forwarder task.
/// Reports arriving after the job finished are dropped silently. Clones that
/// outlive the handler (e.g. moved into a detached task) keep the forwarder
/// alive and delay the terminal notification; don't leak them.
#[derive(Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

struct ProgressUpdate {
    progress: u8,
    message: Option<String>,
}

impl ProgressReporter {
    /// Report a percentage (clamped into [0, 100]) with a status message.
    pub fn report(&self, progress: u8, message: impl Into<String>) {
        self.send(progress, Some(message.into()));
    }

    /// Report a bare percentage, leaving the previous message in place.
    pub fn report_percent(&self, progress: u8) {
        self.send(progress, None);
    }

    fn send(&self, progress: u8, message: Option<String>) {
        let _ = self.tx.send(ProgressUpdate {
            progress: progress.min(100),
            message,
        });
    }
}

/// Everything a handler gets to see about its job.
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: String,
    pub owner: OwnerId,
    /// Caller-supplied parameters, read-only.
    pub metadata: Map<String, Value>,
    pub progress: ProgressReporter,
    /// Cooperative cancellation signal; long handlers should check it
    /// between steps.
    pub cancel: CancellationToken,
}

impl JobContext {
    #[cfg(test)]
    pub(crate) fn for_tests(job_id: JobId, job_type: &str, owner: OwnerId) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self {
            job_id,
            job_type: job_type.to_string(),
            owner,
            metadata: Map::new(),
            progress: ProgressReporter { tx },
            cancel: CancellationToken::new(),
        }
    }
}

enum Outcome {
    Completed(Value),
    Failed(String),
    Cancelled {
        /// True when a non-preemptible blocking step still owns the
        /// reporter; the forwarder then drains on its own schedule instead
        /// of being awaited before the terminal transition.
        reporter_live: bool,
    },
}

/// Runs submitted jobs and owns the set of active execution units.
///
/// Constructed once at startup and injected wherever submissions, queries,
/// or cancellations originate.
pub struct JobProcessor {
    store: Arc<JobStore>,
    registry: Arc<HandlerRegistry>,
    notifier: Notifier,
    active: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
    blocking_slots: Arc<Semaphore>,
}

impl JobProcessor {
    pub fn new(
        store: Arc<JobStore>,
        registry: Arc<HandlerRegistry>,
        notifier: Notifier,
        config: &JobsConfig,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
            active: Arc::new(Mutex::new(HashMap::new())),
            blocking_slots: Arc::new(Semaphore::new(config.blocking_workers.max(1))),
        }
    }

    /// Create a record for `(job_type, owner, metadata)` and start executing
    /// it. Returns immediately with the job id.
    ///
    /// An unknown job type fails the record on the spot with a "no handler"
    /// error; nothing is spawned and no worker slot is taken.
    pub fn submit(&self, job_type: &str, owner: OwnerId, metadata: Map<String, Value>) -> JobId {
        match self.registry.get(job_type) {
            Some(handler) => self.submit_with(job_type, owner, metadata, handler),
            None => {
                let job = self.store.create(job_type, owner, metadata);
                let error = format!("no handler registered for job type: {job_type}");
                tracing::warn!(job_id = job.id, job_type, "unroutable submission");
                match self.store.fail(job.id, error) {
                    Ok(failed) => self.notifier.job_failed(
                        owner,
                        failed.id,
                        failed.error.as_deref().unwrap_or_default(),
                    ),
                    Err(e) => tracing::error!(job_id = job.id, "could not fail job: {e}"),
                }
                job.id
            }
        }
    }

    /// Submit with an explicit handler, bypassing the registry lookup.
    pub fn submit_with(
        &self,
        job_type: &str,
        owner: OwnerId,
        metadata: Map<String, Value>,
        handler: Handler,
    ) -> JobId {
        let job = self.store.create(job_type, owner, metadata);
        let id = job.id;
        let token = CancellationToken::new();
        match self.active.lock() {
            Ok(mut active) => {
                active.insert(id, token.clone());
            }
            Err(e) => tracing::error!("Mutex poisoned tracking job: {e}"),
        }

        let exec = Execution {
            store: Arc::clone(&self.store),
            notifier: self.notifier.clone(),
            active: Arc::clone(&self.active),
            blocking_slots: Arc::clone(&self.blocking_slots),
        };
        tokio::spawn(exec.run(job, handler, token));
        id
    }

    /// Request cooperative cancellation of an active job. True iff an
    /// execution unit was still tracked and has been signalled; a job that
    /// already finished (or never started) returns false and is untouched.
    pub fn cancel(&self, id: JobId) -> bool {
        match self.active.lock() {
            Ok(active) => match active.get(&id) {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(e) => {
                tracing::error!("Mutex poisoned cancelling job: {e}");
                false
            }
        }
    }

    /// Number of currently-tracked execution units.
    pub fn active_count(&self) -> usize {
        match self.active.lock() {
            Ok(active) => active.len(),
            Err(e) => {
                tracing::error!("Mutex poisoned counting jobs: {e}");
                0
            }
        }
    }
}

/// Per-job execution state, moved into the spawned task.
struct Execution {
    store: Arc<JobStore>,
    notifier: Notifier,
    active: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
    blocking_slots: Arc<Semaphore>,
}

impl Execution {
    async fn run(self, job: Job, handler: Handler, token: CancellationToken) {
        let id = job.id;
        let owner = job.owner;

        // Cancelled between submit and first poll: the handler never runs.
        if token.is_cancelled() {
            self.finish(id, owner, Outcome::Cancelled { reporter_live: false }, None)
                .await;
            return;
        }

        match self.store.mark_running(id) {
            Ok(running) => self.notifier.job_started(owner, id, &running.job_type),
            Err(e) => {
                tracing::warn!(job_id = id, "could not start job: {e}");
                self.untrack(id);
                return;
            }
        }

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let reporter = ProgressReporter { tx: progress_tx };
        let forwarder = tokio::spawn(forward_progress(
            progress_rx,
            Arc::clone(&self.store),
            self.notifier.clone(),
            id,
            owner,
        ));

        let ctx = JobContext {
            job_id: id,
            job_type: job.job_type.clone(),
            owner,
            metadata: job.metadata.clone(),
            progress: reporter,
            cancel: token.clone(),
        };

        let outcome = match handler {
            Handler::Async(f) => {
                let work = AssertUnwindSafe(f(ctx)).catch_unwind();
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Outcome::Cancelled { reporter_live: false },
                    result = work => outcome_from_unwind(result),
                }
            }
            Handler::Blocking(f) => self.run_blocking(f, ctx, &token).await,
        };

        self.finish(id, owner, outcome, Some(forwarder)).await;
    }

    /// Run a blocking handler on the bounded pool. Cancellation is honored
    /// while queued for a slot; once the closure is on a worker thread it
    /// runs to the end of its current step regardless.
    async fn run_blocking(
        &self,
        f: BlockingHandlerFn,
        ctx: JobContext,
        token: &CancellationToken,
    ) -> Outcome {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => return Outcome::Cancelled { reporter_live: false },
            permit = Arc::clone(&self.blocking_slots).acquire_owned() => permit,
        };
        let Ok(permit) = permit else {
            return Outcome::Failed("worker pool closed".to_string());
        };

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            std::panic::catch_unwind(AssertUnwindSafe(|| f(ctx)))
        });
        tokio::select! {
            biased;
            _ = token.cancelled() => Outcome::Cancelled { reporter_live: true },
            joined = handle => match joined {
                Ok(result) => outcome_from_unwind(result),
                Err(e) => Outcome::Failed(format!("worker task failed: {e}")),
            },
        }
    }

    async fn finish(
        &self,
        id: JobId,
        owner: OwnerId,
        outcome: Outcome,
        forwarder: Option<JoinHandle<()>>,
    ) {
        // Drain queued progress before the terminal transition so per-job
        // notification order stays started -> progress* -> terminal. When an
        // abandoned blocking step still owns the reporter the forwarder is
        // left to exit on its own; the store ignores reports against a
        // terminal record, so none of them can surface after this point.
        let abandoned = matches!(outcome, Outcome::Cancelled { reporter_live: true });
        if let Some(handle) = forwarder {
            if abandoned {
                drop(handle);
            } else if let Err(e) = handle.await {
                tracing::error!(job_id = id, "progress forwarder failed: {e}");
            }
        }

        match outcome {
            Outcome::Completed(result) => match self.store.complete(id, result) {
                Ok(job) => self.notifier.job_completed(
                    owner,
                    id,
                    job.result.as_ref().unwrap_or(&Value::Null),
                ),
                Err(e) => tracing::warn!(job_id = id, "could not complete job: {e}"),
            },
            Outcome::Failed(error) => match self.store.fail(id, error) {
                Ok(job) => {
                    self.notifier
                        .job_failed(owner, id, job.error.as_deref().unwrap_or_default())
                }
                Err(e) => tracing::warn!(job_id = id, "could not fail job: {e}"),
            },
            Outcome::Cancelled { .. } => match self.store.cancel(id) {
                Ok(_) => self.notifier.job_cancelled(owner, id),
                Err(e) => tracing::warn!(job_id = id, "could not cancel job: {e}"),
            },
        }

        self.untrack(id);
    }

    fn untrack(&self, id: JobId) {
        match self.active.lock() {
            Ok(mut active) => {
                active.remove(&id);
            }
            Err(e) => tracing::error!("Mutex poisoned untracking job: {e}"),
        }
    }
}

/// Applies marshaled progress updates to the record on the scheduler and
/// emits the matching notifications. Exits when every reporter handle is
/// gone.
async fn forward_progress(
    mut rx: mpsc::UnboundedReceiver<ProgressUpdate>,
    store: Arc<JobStore>,
    notifier: Notifier,
    id: JobId,
    owner: OwnerId,
) {
    while let Some(update) = rx.recv().await {
        if let Some(job) = store.apply_progress(id, update.progress, update.message) {
            notifier.job_progress(owner, id, job.progress, job.message.as_deref());
        }
    }
}

fn outcome_from_unwind(
    result: Result<HandlerOutcome, Box<dyn std::any::Any + Send>>,
) -> Outcome {
    match result {
        Ok(Ok(value)) => Outcome::Completed(value),
        Ok(Err(error)) => Outcome::Failed(format!("{error:#}")),
        Err(panic) => Outcome::Failed(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
