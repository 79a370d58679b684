//! The per-lane execution loop.
//!
//! A lane issues calls strictly sequentially. Before each call it asks its
//! [`Continuation`] whether to go on and checks the cooperative cancellation
//! token; that is the only point where cancellation is observed, so a call
//! already in flight is never preempted.
//!
//! Failures are classified as follows:
//! - a backend error (anywhere in the cause chain, innermost wins) that the
//!   [`ErrorClassifier`] deems transient is retried,
//! - [`TaskError::Recoverable`] is always retried,
//! - anything else is fatal and terminates this lane only.
//!
//! Retries back off exponentially with jitter:
//!
//! ```text
//! delay = min(2^k + uniform(0, 1000), 5000) milliseconds
//! ```
//!
//! where `k` is the number of consecutive failures, reset by every success.
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::classifier::ErrorClassifier;
use crate::continuation::Continuation;
use crate::error::{LaneError, TaskError};
use crate::task::Task;
use crate::workload::{LaneState, Problem};

/// Upper bound of a single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_millis(5000);

/// Upper bound of the random jitter added to each backoff, in milliseconds.
const MAX_JITTER_MS: u64 = 1000;

/// Backoff delay after `consecutive_failures` failures in a row.
pub fn backoff_delay(consecutive_failures: u32) -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..=MAX_JITTER_MS);
    backoff_delay_with_jitter(consecutive_failures, jitter_ms)
}

fn backoff_delay_with_jitter(consecutive_failures: u32, jitter_ms: u64) -> Duration {
    let base = 2u64.saturating_pow(consecutive_failures);
    let delay = base.saturating_add(jitter_ms);
    Duration::from_millis(delay).min(MAX_BACKOFF)
}

pub(crate) struct Lane<C> {
    pub(crate) name: String,
    pub(crate) task: Arc<dyn Task>,
    pub(crate) batch_size: usize,
    pub(crate) continuation: C,
    pub(crate) classifier: Arc<dyn ErrorClassifier>,
    pub(crate) token: CancellationToken,
    pub(crate) state: Arc<LaneState>,
}

impl<C: Continuation> Lane<C> {
    pub(crate) async fn run(self) -> Result<(), LaneError> {
        let mut calls: u64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            calls += 1;
            if !self.continuation.proceed(calls).await {
                break;
            }
            if self.token.is_cancelled() {
                tracing::warn!(workload = %self.name, "Cancellation requested - bailing out");
                break;
            }

            let started = Instant::now();
            *self.state.in_flight.lock() = Some(started);
            let outcome = self.task.execute_one(self.batch_size).await;
            *self.state.in_flight.lock() = None;
            let err = match outcome {
                Ok(()) => {
                    self.state.metrics.write().mark_success(started.elapsed());
                    consecutive_failures = 0;
                    continue;
                }
                Err(err) => err,
            };
            let elapsed = started.elapsed();

            let problem = Problem::from_error(&err);
            self.state.problems.lock().push(problem.clone());

            if !self.is_transient(&err) {
                self.state.metrics.write().mark_fail(elapsed, false);
                return Err(LaneError {
                    workload: self.name,
                    problem,
                    source: err,
                });
            }

            self.state.metrics.write().mark_fail(elapsed, true);
            consecutive_failures = consecutive_failures.saturating_add(1);

            let delay = backoff_delay(consecutive_failures);
            tracing::debug!(
                workload = %self.name,
                consecutive_failures,
                delay_ms = delay.as_millis() as u64,
                "backing off"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.token.cancelled() => {}
            }
        }

        tracing::debug!(workload = %self.name, calls = calls - 1, "lane finished");
        Ok(())
    }

    fn is_transient(&self, err: &TaskError) -> bool {
        match err.backend_cause() {
            Some(cause) if self.classifier.is_transient(cause) => {
                tracing::warn!(
                    workload = %self.name,
                    code = %cause.code,
                    error = %cause,
                    "Transient backend error"
                );
                true
            }
            Some(cause) => {
                tracing::error!(
                    workload = %self.name,
                    code = %cause.code,
                    error = %cause,
                    "Non-transient backend error"
                );
                false
            }
            None if matches!(err, TaskError::Recoverable(_)) => {
                tracing::warn!(workload = %self.name, error = %err, "Recoverable error");
                true
            }
            None => {
                tracing::error!(workload = %self.name, error = %err, "Fatal error");
                false
            }
        }
    }
}
