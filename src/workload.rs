//! Runtime handle of one lane.
//!
//! A [`Workload`] binds a lane's tokio task, its [`Metrics`] and its bounded
//! [`Problem`] log. Its [`WorkloadStatus`] is derived at query time: RUNNING
//! until the drain pass records completion, then exactly one terminal status
//! that never changes again.
use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{LaneError, root_cause};
use crate::metrics::{Metrics, MetricsSnapshot};

/// Number of problems retained per lane.
pub const PROBLEM_LOG_CAPACITY: usize = 20;

/// A recorded failure. Diagnostic only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub timestamp: SystemTime,
    pub message: String,
    /// Description of the innermost cause.
    pub cause: String,
}

impl Problem {
    pub fn from_error(error: &(dyn StdError + 'static)) -> Self {
        Self {
            timestamp: SystemTime::now(),
            message: error.to_string(),
            cause: root_cause(error),
        }
    }
}

/// Fixed-capacity, most-recent-first problem log.
#[derive(Debug, Clone, Default)]
pub struct ProblemLog {
    entries: VecDeque<Problem>,
}

impl ProblemLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend `problem`, dropping the oldest entry past capacity.
    pub fn push(&mut self, problem: Problem) {
        if self.entries.len() >= PROBLEM_LOG_CAPACITY {
            self.entries.pop_back();
        }
        self.entries.push_front(problem);
    }

    pub fn latest(&self) -> Option<&Problem> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Problem> {
        self.entries.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkloadStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkloadStatus::Running => "RUNNING",
            WorkloadStatus::Completed => "COMPLETED",
            WorkloadStatus::Cancelled => "CANCELLED",
            WorkloadStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// State written by the lane and read by everyone else.
#[derive(Debug, Default)]
pub(crate) struct LaneState {
    pub(crate) metrics: RwLock<Metrics>,
    pub(crate) problems: Mutex<ProblemLog>,
    /// Start of the call currently in flight, if any.
    pub(crate) in_flight: Mutex<Option<Instant>>,
}

impl LaneState {
    pub(crate) fn call_started(&self) -> Option<Instant> {
        *self.in_flight.lock()
    }
}

pub(crate) type LaneHandle = JoinHandle<Result<(), LaneError>>;

#[derive(Debug)]
struct Completion {
    failed: bool,
    metrics: MetricsSnapshot,
}

/// One lane as seen by the manager and by reporters.
#[derive(Debug)]
pub struct Workload {
    id: u64,
    name: String,
    handle: Mutex<Option<LaneHandle>>,
    lane: Arc<LaneState>,
    cancelled: AtomicBool,
    completion: OnceLock<Completion>,
}

impl Workload {
    pub(crate) fn new(
        id: u64,
        name: String,
        handle: LaneHandle,
        lane: Arc<LaneState>,
    ) -> Self {
        Self {
            id,
            name,
            handle: Mutex::new(Some(handle)),
            lane,
            cancelled: AtomicBool::new(false),
            completion: OnceLock::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> WorkloadStatus {
        match self.completion.get() {
            None => WorkloadStatus::Running,
            Some(c) if c.failed => WorkloadStatus::Failed,
            Some(_) if self.cancelled.load(Ordering::Acquire) => WorkloadStatus::Cancelled,
            Some(_) => WorkloadStatus::Completed,
        }
    }

    pub fn is_running(&self) -> bool {
        self.completion.get().is_none()
    }

    /// Whether the lane's task has exited, drained or not.
    pub fn is_finished(&self) -> bool {
        if self.completion.get().is_some() {
            return true;
        }
        self.handle.lock().as_ref().is_none_or(|h| h.is_finished())
    }

    /// Live statistics while running, the frozen copy afterwards.
    pub fn metrics(&self) -> MetricsSnapshot {
        match self.completion.get() {
            Some(c) => c.metrics.clone(),
            None => self.lane.metrics.read().snapshot(),
        }
    }

    /// Recorded problems, most recent first.
    pub fn problems(&self) -> Vec<Problem> {
        self.lane.problems.lock().to_vec()
    }

    pub fn report(&self) -> WorkloadReport {
        WorkloadReport {
            id: self.id,
            name: self.name.clone(),
            status: self.status(),
            metrics: self.metrics(),
            problems: self.problems(),
        }
    }

    pub(crate) fn take_handle(&self) -> Option<LaneHandle> {
        self.handle.lock().take()
    }

    pub(crate) fn lane(&self) -> &LaneState {
        &self.lane
    }

    pub(crate) fn note_cancelled(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn record_problem(&self, problem: Problem) {
        self.lane.problems.lock().push(problem);
    }

    /// Finalize the workload. Only the first call has any effect.
    ///
    /// A `Some` problem marks the workload FAILED and is prepended to the log
    /// unless the lane already recorded it.
    pub fn set_completion(&self, problem: Option<Problem>) {
        if self.completion.get().is_some() {
            tracing::debug!(workload = %self.name, "completion already recorded");
            return;
        }
        let failed = problem.is_some();
        if let Some(problem) = problem {
            let mut problems = self.lane.problems.lock();
            if problems.latest() != Some(&problem) {
                problems.push(problem);
            }
        }
        let metrics = self.lane.metrics.read().snapshot();
        let _ = self.completion.set(Completion { failed, metrics });
    }
}

impl PartialEq for Workload {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Workload {}

/// Value copy of a workload for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadReport {
    pub id: u64,
    pub name: String,
    pub status: WorkloadStatus,
    pub metrics: MetricsSnapshot,
    pub problems: Vec<Problem>,
}
