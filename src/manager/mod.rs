//! Lane submission, the workload registry, and shutdown.
//!
//! Every submitted workload becomes one lane: an independent tokio task
//! running the retry loop in [`lane`]. Lanes never block one another; the
//! only state they share is the (optional) admission limiter inside their
//! continuation and this manager's append-only registry.
//!
//! # Execution substrate
//! Lanes are spawned on a [`TaskTracker`]. With `concurrency_limit == 0`
//! every lane runs as soon as it is submitted; otherwise at most
//! `concurrency_limit` lanes execute at a time and the rest queue for a slot,
//! like a fixed-size thread pool would.
//!
//! # Shutdown
//! [`WorkloadManager::shutdown_and_wait`] closes the tracker so no further
//! lanes are accepted, then joins every registered lane in submission order:
//! - clean exit: the task's teardown runs and the workload is COMPLETED,
//! - fatal error or panic: the workload is FAILED with the matching problem,
//! - forced abort: the workload is CANCELLED.
//!
//! A lane blocked inside a call cannot be preempted. It is joined with a
//! timeout instead: once one call has outlived the grace period after
//! shutdown (or after [`WorkloadManager::cancel`]), its task is aborted.
//!
//! # Aggregation
//! [`WorkloadManager::get_metrics_aggregate`] sums counters and rates across
//! lanes and averages latencies. That is not a statistically sound merge of
//! percentile distributions and is not meant to be one.
mod lane;

#[cfg(feature = "internals")]
pub use lane::backoff_delay;
pub use lane::MAX_BACKOFF;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use typed_builder::TypedBuilder;

use crate::aggregate::{Aggregate, LaneAggregate};
use crate::classifier::{ErrorClassifier, SqlStateClassifier};
use crate::continuation::Continuation;
use crate::error::{DrainError, ManagerError};
use crate::metrics::MetricsSnapshot;
use crate::task::TaskRegistration;
use crate::workload::{LaneState, Problem, Workload, WorkloadStatus};
use lane::Lane;

/// How long a single call may stay in flight after shutdown or cancellation
/// before its lane is aborted.
pub const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Tuning knobs of a [`WorkloadManager`].
#[derive(Clone, TypedBuilder)]
pub struct ManagerOptions {
    /// Maximum number of lanes executing at once. `0` means unbounded.
    #[builder(default)]
    pub concurrency_limit: usize,
    #[builder(default = DRAIN_GRACE)]
    pub grace: Duration,
    #[builder(default = Arc::new(SqlStateClassifier) as Arc<dyn ErrorClassifier>)]
    pub classifier: Arc<dyn ErrorClassifier>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Clone)]
struct Entry {
    workload: Arc<Workload>,
    task: TaskRegistration,
}

pub struct WorkloadManager {
    classifier: Arc<dyn ErrorClassifier>,
    tracker: TaskTracker,
    token: CancellationToken,
    cancelled_at: OnceLock<Instant>,
    slots: Option<Arc<Semaphore>>,
    grace: Duration,
    next_id: AtomicU64,
    registry: Mutex<Vec<Entry>>,
}

impl Default for WorkloadManager {
    fn default() -> Self {
        Self::new(ManagerOptions::default())
    }
}

impl WorkloadManager {
    pub fn new(options: ManagerOptions) -> Self {
        let slots = (options.concurrency_limit > 0)
            .then(|| Arc::new(Semaphore::new(options.concurrency_limit)));
        Self {
            classifier: options.classifier,
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
            cancelled_at: OnceLock::new(),
            slots,
            grace: options.grace,
            next_id: AtomicU64::new(0),
            registry: Mutex::new(Vec::new()),
        }
    }

    /// Start a lane running `task` until `continuation` says stop.
    ///
    /// The returned workload is also kept in the registry.
    pub fn submit_workload<C>(
        &self,
        task: &TaskRegistration,
        batch_size: usize,
        continuation: C,
        name: impl Into<String>,
    ) -> Result<Arc<Workload>, ManagerError>
    where
        C: Continuation + 'static,
    {
        if batch_size == 0 {
            return Err(ManagerError::InvalidBatchSize);
        }
        // Closing happens under the same lock, so every accepted lane is drained.
        let mut registry = self.registry.lock();
        if self.tracker.is_closed() {
            return Err(ManagerError::ShutDown);
        }

        let name = name.into();
        let state = Arc::new(LaneState::default());
        let lane = Lane {
            name: name.clone(),
            task: Arc::clone(task.task()),
            batch_size,
            continuation,
            classifier: Arc::clone(&self.classifier),
            token: self.token.child_token(),
            state: Arc::clone(&state),
        };
        let slots = self.slots.clone();
        let token = self.token.clone();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = self.tracker.spawn(async move {
            let _slot = match slots {
                Some(slots) => tokio::select! {
                    slot = slots.acquire_owned() => slot.ok(),
                    _ = token.cancelled() => return Ok(()),
                },
                None => None,
            };
            lane.run().await
        });
        tracing::debug!(workload = %name, id, "workload submitted");

        let workload = Arc::new(Workload::new(id, name, handle, state));
        registry.push(Entry {
            workload: Arc::clone(&workload),
            task: task.clone(),
        });
        Ok(workload)
    }

    /// Ask every lane to stop before its next call.
    pub fn cancel(&self) {
        let _ = self.cancelled_at.set(Instant::now());
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop accepting lanes and drain every registered one.
    ///
    /// A lane whose current call is still in flight `grace` after shutdown
    /// began (or after [`cancel`](Self::cancel), whichever applies) is aborted
    /// and ends CANCELLED.
    pub async fn shutdown_and_wait(&self) {
        let entries = {
            let registry = self.registry.lock();
            self.tracker.close();
            registry.clone()
        };
        let shutdown_started = Instant::now();

        for entry in &entries {
            self.drain(entry, shutdown_started).await;
        }
        self.tracker.wait().await;
    }

    async fn drain(&self, entry: &Entry, shutdown_started: Instant) {
        let workload = &entry.workload;
        let Some(mut handle) = workload.take_handle() else {
            return;
        };

        let joined = tokio::select! {
            res = &mut handle => res,
            _ = self.force_deadline(workload.lane(), shutdown_started) => {
                tracing::warn!(workload = %workload.name(), grace = ?self.grace, "Lane stuck past grace period - aborting");
                handle.abort();
                handle.await
            }
        };

        match joined {
            Ok(Ok(())) => {
                if let Err(e) = entry.task.teardown().await {
                    tracing::warn!(workload = %workload.name(), error = %e, "Teardown failed");
                }
                workload.set_completion(None);
                tracing::info!(workload = %workload.name(), "Finished successfully");
            }
            Ok(Err(e)) => self.fail(workload, DrainError::Fatal(e)),
            Err(e) if e.is_cancelled() => {
                let err = DrainError::Cancelled(workload.name().to_owned());
                workload.record_problem(Problem::from_error(&err));
                workload.note_cancelled();
                workload.set_completion(None);
                tracing::warn!(workload = %workload.name(), "Finished prematurely due to cancellation");
            }
            Err(e) => {
                let err = DrainError::Panicked {
                    workload: workload.name().to_owned(),
                    message: panic_message(e),
                };
                self.fail(workload, err);
            }
        }
    }

    fn fail(&self, workload: &Workload, err: DrainError) {
        tracing::warn!(workload = %workload.name(), error = %err, "Finished prematurely due to error");
        workload.set_completion(Some(err.problem()));
    }

    /// Resolves once the lane is considered stuck:
    /// - `grace` after cancellation was requested, or
    /// - when a single call has been in flight for `grace` since shutdown
    ///   began (or since the call started, if later).
    ///
    /// A lane that keeps completing calls is never considered stuck.
    async fn force_deadline(&self, lane: &LaneState, shutdown_started: Instant) {
        loop {
            let in_flight = lane.call_started();
            let deadline = match (self.cancelled_at.get(), in_flight) {
                (Some(&at), _) => at + self.grace,
                (None, Some(started)) => started.max(shutdown_started) + self.grace,
                (None, None) => Instant::now() + self.grace,
            };

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = self.token.cancelled(), if self.cancelled_at.get().is_none() => continue,
            }

            let stuck = match self.cancelled_at.get() {
                Some(&at) => Instant::now() >= at + self.grace,
                None => in_flight.is_some() && lane.call_started() == in_flight,
            };
            if stuck {
                return;
            }
        }
    }

    /// Every registered workload, in submission order.
    pub fn workloads(&self) -> Vec<Arc<Workload>> {
        self.registry
            .lock()
            .iter()
            .map(|e| Arc::clone(&e.workload))
            .collect()
    }

    /// Registered workloads whose status currently equals `status`.
    pub fn get_workloads(&self, status: WorkloadStatus) -> Vec<Arc<Workload>> {
        self.workloads()
            .into_iter()
            .filter(|w| w.status() == status)
            .collect()
    }

    /// One synthesized snapshot over every workload with `status`.
    ///
    /// Counts and rates are summed, latencies and percentiles averaged.
    pub fn get_metrics_aggregate(&self, status: WorkloadStatus) -> MetricsSnapshot {
        let metrics: Vec<MetricsSnapshot> = self
            .get_workloads(status)
            .iter()
            .map(|w| w.metrics())
            .collect();
        let mut agg = LaneAggregate::new();
        agg.aggregate(&metrics);
        agg.into()
    }
}

fn panic_message(err: JoinError) -> String {
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
