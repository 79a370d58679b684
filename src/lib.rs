//! Barrage is a concurrent load-generation harness.
//!
//! It runs many independent *lanes*, each repeatedly invoking a pluggable
//! [`Task`] against some backend. Failures are classified as transient
//! (recorded, backed off, retried) or fatal (recorded once, ending only that
//! lane), and every lane keeps sliding-window latency and throughput
//! statistics that can be read while it runs.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Task`]: the unit of work. Registered with a name and its declared
//!   [`Capabilities`] as a [`TaskRegistration`].
//! - [`WorkloadManager`]: submits lanes, keeps the append-only registry of
//!   [`Workload`]s, drains them at shutdown and aggregates their metrics.
//! - [`Continuation`]: decides before each call whether a lane goes on.
//!   [`RunWindow`] stops at a deadline and gates warmup calls through the
//!   [`AdmissionLimiter`].
//! - [`ErrorClassifier`]: maps a [`BackendError`] to transient or fatal.
//!   [`SqlStateClassifier`] knows the PostgreSQL/CockroachDB codes.
//! - [`Metrics`]: the per-lane sliding-window statistics engine, read as
//!   [`MetricsSnapshot`]s.
//! - [`Reporter`]: the I/O boundary. Receives workload snapshots
//!   periodically and the final summary.
//! - [`Scenario`]: glues everything together for one run, configured by a
//!   [`RunConfig`].
//!
//! # Feature flags
//! - `builtins` (default): the fake task, console and JSON reporters.
//! - `internals`: access to internal (and unstable) helpers such as the
//!   limiter's governor math and the backoff computation.
//!
//! # Where to start
//!
//! Implement [`Task`] for your backend call, register it, and hand it to a
//! [`Scenario`]. Use [`WorkloadManager`] directly when you need your own
//! stopping rules or reporting loop.

/// Cross-lane metric aggregation
pub mod aggregate;
/// Transient vs. fatal backend errors
pub mod classifier;
/// Run options
pub mod config;
/// Per-lane stopping rules
pub mod continuation;
/// Error types
pub mod error;
/// Warmup-ramped admission control
pub mod limiter;
/// Lane orchestration
pub mod manager;
/// Sliding-window statistics
pub mod metrics;
/// Reports and reporters
pub mod report;
/// Main entry point that glues everything together
pub mod scenario;
/// Units of work
pub mod task;
/// Lane handles and their status
pub mod workload;

pub use aggregate::{Aggregate, LaneAggregate};
pub use classifier::{ErrorClassifier, SqlStateClassifier};
pub use config::RunConfig;
pub use continuation::{CallLimit, Continuation, RunWindow};
pub use error::{BackendError, TaskError};
pub use limiter::{AdmissionLimiter, LimiterConfig};
pub use manager::{ManagerOptions, WorkloadManager};
pub use metrics::{Metrics, MetricsSnapshot};
pub use report::{Reporter, RunSummary};
pub use scenario::Scenario;
pub use task::{Capabilities, Params, Task, TaskRegistration, TaskRegistry};
pub use workload::{Problem, Workload, WorkloadStatus};
