use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::manager::WorkloadManager;
use crate::metrics::MetricsSnapshot;
use crate::workload::{WorkloadReport, WorkloadStatus};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),
}

/// Final outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub batch_size: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Aggregate over COMPLETED workloads only.
    pub aggregate: MetricsSnapshot,
}

impl RunSummary {
    /// Summarize a drained manager.
    pub fn collect(manager: &WorkloadManager, batch_size: usize) -> Self {
        Self {
            batch_size,
            completed: manager.get_workloads(WorkloadStatus::Completed).len(),
            failed: manager.get_workloads(WorkloadStatus::Failed).len(),
            cancelled: manager.get_workloads(WorkloadStatus::Cancelled).len(),
            aggregate: manager.get_metrics_aggregate(WorkloadStatus::Completed),
        }
    }

    /// Rows written, assuming every successful call wrote a full batch.
    pub fn total_rows(&self) -> u64 {
        self.aggregate.success.saturating_mul(self.batch_size as u64)
    }

    /// Mean latency divided over the rows of one batch.
    pub fn per_row_ms(&self) -> f64 {
        self.aggregate.mean_ms / self.batch_size.max(1) as f64
    }
}

/// A [`Reporter`] takes workload snapshots and performs side effects with
/// them: printing them, writing them to a file, shipping them somewhere.
///
/// Reporters are the I/O boundary of the harness. They only ever see value
/// copies, so a slow reporter never holds up a lane.
///
/// # Example
/// ```rust
/// use async_trait::async_trait;
/// use barrage::{MetricsSnapshot, Reporter};
/// use barrage::report::{ReportError, RunSummary};
/// use barrage::workload::WorkloadReport;
///
/// struct Quiet;
///
/// #[async_trait]
/// impl Reporter for Quiet {
///     async fn report_progress(
///         &self,
///         _workloads: &[WorkloadReport],
///         _aggregate: Option<&MetricsSnapshot>,
///     ) -> Result<(), ReportError> {
///         Ok(())
///     }
///
///     async fn report_summary(&self, summary: &RunSummary) -> Result<(), ReportError> {
///         println!("{} batches", summary.aggregate.success);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Live view of the running workloads. `aggregate` is present when more
    /// than one workload is running.
    async fn report_progress(
        &self,
        workloads: &[WorkloadReport],
        aggregate: Option<&MetricsSnapshot>,
    ) -> Result<(), ReportError>;

    async fn report_summary(&self, summary: &RunSummary) -> Result<(), ReportError>;
}

/// Report the RUNNING workloads of `manager` every `interval` until `token`
/// is cancelled. The first report is emitted one interval after the start.
pub fn spawn_periodic(
    manager: Arc<WorkloadManager>,
    reporter: Arc<dyn Reporter>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let running: Vec<WorkloadReport> = manager
                .get_workloads(WorkloadStatus::Running)
                .iter()
                .map(|w| w.report())
                .collect();
            let aggregate = (running.len() > 1)
                .then(|| manager.get_metrics_aggregate(WorkloadStatus::Running));

            if let Err(e) = reporter.report_progress(&running, aggregate.as_ref()).await {
                tracing::warn!(error = %e, "Progress report failed");
            }
        }
        tracing::debug!("periodic reporter stopped");
    })
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::io::{self, Stdout, Write};

    use parking_lot::Mutex;

    use super::*;

    const HEADER_EVERY: usize = 10;
    const RULE_WIDTH: usize = 125;

    /// Fixed-width table on stdout.
    #[derive(Debug, Clone)]
    pub struct ConsoleReporter {
        /// Maximum workload rows per progress report.
        pub max_rows: usize,
    }

    impl Default for ConsoleReporter {
        fn default() -> Self {
            Self { max_rows: 25 }
        }
    }

    impl ConsoleReporter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn format_progress(
            &self,
            workloads: &[WorkloadReport],
            aggregate: Option<&MetricsSnapshot>,
        ) -> String {
            let mut out = String::new();
            for (i, w) in workloads.iter().take(self.max_rows).enumerate() {
                if i % HEADER_EVERY == 0 {
                    out.push_str(&header());
                }
                out.push_str(&row(&w.id.to_string(), &w.name, &w.metrics));
                out.push_str(&format!(" {}\n", w.status));
            }
            if let Some(m) = aggregate {
                out.push_str(&row("Σ", "", m));
                out.push('\n');
            }
            out
        }

        pub fn format_summary(&self, summary: &RunSummary) -> String {
            let m = &summary.aggregate;
            let mut out = String::from("=== Summary ===\n");
            out.push_str(&format!("Total batches: {}\n", group_thousands(m.success)));
            out.push_str(&format!("Total rows inserted: {}\n", group_thousands(summary.total_rows())));
            out.push_str(&format!("Total failed batches: {}\n", group_thousands(m.non_transient_fail)));
            out.push_str(&format!("Total retried batches: {}\n", group_thousands(m.transient_fail)));
            out.push_str(&format!("Avg batch latency: {:5.2} ms\n", m.mean_ms));
            out.push_str(&format!("Avg per-row latency: {:5.4} ms\n", summary.per_row_ms()));
            out.push_str(&format!("Min batch time: {:.2} ms\n", m.min_ms));
            out.push_str(&format!("Max batch time: {:.2} ms\n", m.max_ms));
            out.push_str(&format!(
                "Workloads: {} completed, {} failed, {} cancelled\n",
                summary.completed, summary.failed, summary.cancelled
            ));
            out
        }
    }

    #[async_trait]
    impl Reporter for ConsoleReporter {
        async fn report_progress(
            &self,
            workloads: &[WorkloadReport],
            aggregate: Option<&MetricsSnapshot>,
        ) -> Result<(), ReportError> {
            let text = self.format_progress(workloads, aggregate);
            io::stdout().lock().write_all(text.as_bytes())?;
            Ok(())
        }

        async fn report_summary(&self, summary: &RunSummary) -> Result<(), ReportError> {
            let text = self.format_summary(summary);
            io::stdout().lock().write_all(text.as_bytes())?;
            Ok(())
        }
    }

    fn header() -> String {
        format!(
            "{:>4} {:<25} {:>9} {:>9} {:>7} {:>7} | {:>5} {:>5} {:>5} {:>5} | {:>7} {:>7} {:>7} {}\n{}\n",
            "id", "name", "op/s", "op/m", "time", "mean", "p50", "p95", "p99", "p999",
            "success", "retry", "error", "status",
            "-".repeat(RULE_WIDTH)
        )
    }

    fn row(id: &str, name: &str, m: &MetricsSnapshot) -> String {
        format!(
            "{:>4} {:<25} {:>9.1} {:>9.1} {:>7.1} {:>7.1} | {:>5.0} {:>5.0} {:>5.0} {:>5.0} | {:>7} {:>7} {:>7}",
            id,
            name,
            m.ops_per_sec,
            m.ops_per_min,
            m.execution_time_secs,
            m.mean_ms,
            m.p50,
            m.p95,
            m.p99,
            m.p999,
            m.success,
            m.transient_fail,
            m.non_transient_fail,
        )
    }

    fn group_thousands(n: u64) -> String {
        let digits = n.to_string();
        let mut out = String::with_capacity(digits.len() + digits.len() / 3);
        for (i, c) in digits.chars().enumerate() {
            if i > 0 && (digits.len() - i) % 3 == 0 {
                out.push(',');
            }
            out.push(c);
        }
        out
    }

    #[derive(Serialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    enum Line<'a> {
        Progress {
            workloads: &'a [WorkloadReport],
            aggregate: Option<&'a MetricsSnapshot>,
        },
        Summary {
            #[serde(flatten)]
            summary: &'a RunSummary,
        },
    }

    /// One JSON object per line.
    #[derive(Debug)]
    pub struct JsonReporter<W = Stdout> {
        out: Mutex<W>,
    }

    impl JsonReporter<Stdout> {
        pub fn stdout() -> Self {
            Self::new(io::stdout())
        }
    }

    impl<W: Write + Send> JsonReporter<W> {
        pub fn new(out: W) -> Self {
            Self { out: Mutex::new(out) }
        }

        pub fn into_inner(self) -> W {
            self.out.into_inner()
        }

        fn write_line(&self, line: &Line<'_>) -> Result<(), ReportError> {
            let mut out = self.out.lock();
            serde_json::to_writer(&mut *out, line)?;
            out.write_all(b"\n")?;
            out.flush()?;
            Ok(())
        }
    }

    #[async_trait]
    impl<W: Write + Send> Reporter for JsonReporter<W> {
        async fn report_progress(
            &self,
            workloads: &[WorkloadReport],
            aggregate: Option<&MetricsSnapshot>,
        ) -> Result<(), ReportError> {
            self.write_line(&Line::Progress { workloads, aggregate })
        }

        async fn report_summary(&self, summary: &RunSummary) -> Result<(), ReportError> {
            self.write_line(&Line::Summary { summary })
        }
    }

}
