use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::classifier::{ErrorClassifier, SqlStateClassifier};
use crate::config::{ConfigError, RunConfig};
use crate::continuation::RunWindow;
use crate::error::{ManagerError, TaskError};
use crate::limiter::{AdmissionLimiter, LimiterConfig};
use crate::manager::{DRAIN_GRACE, ManagerOptions, WorkloadManager};
use crate::report::{Reporter, RunSummary, spawn_periodic};
use crate::task::{Params, RegistryError, TaskRegistration, TaskRegistry};

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("scenario '{0}' has no tasks")]
    Empty(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to prepare task '{task}': {source}")]
    Prepare {
        task: String,
        #[source]
        source: TaskError,
    },
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

/// A complete run: which tasks, how many lanes each, for how long.
///
/// # Example
/// ```rust,no_run
/// use barrage::{RunConfig, Scenario};
/// use barrage::task::FakeTask;
///
/// # async fn run() -> Result<(), barrage::scenario::ScenarioError> {
/// let summary = Scenario::builder()
///     .name("smoke")
///     .tasks(vec![FakeTask::registration()])
///     .config(RunConfig::builder().concurrency(4).build())
///     .build()
///     .run()
///     .await?;
/// println!("{} batches", summary.aggregate.success);
/// # Ok(())
/// # }
/// ```
#[derive(TypedBuilder)]
pub struct Scenario {
    #[builder(setter(into))]
    pub name: String,
    pub tasks: Vec<TaskRegistration>,
    /// Handed unmodified to every configurable task.
    #[builder(default)]
    pub params: Params,
    #[builder(default)]
    pub config: RunConfig,
    /// Defaults to the console reporter when built-ins are enabled.
    #[builder(default, setter(strip_option))]
    pub reporter: Option<Arc<dyn Reporter>>,
    #[builder(default = Arc::new(SqlStateClassifier) as Arc<dyn ErrorClassifier>)]
    pub classifier: Arc<dyn ErrorClassifier>,
    #[builder(default = DRAIN_GRACE)]
    pub grace: Duration,
    /// Cancel cooperatively on Ctrl-C.
    #[builder(default = true)]
    pub handle_ctrl_c: bool,
}

impl Scenario {
    /// Select `names` from `registry` and read the run options from `params`.
    pub fn from_registry<I, S>(
        name: impl Into<String>,
        registry: &TaskRegistry,
        names: I,
        params: Params,
    ) -> Result<Self, ScenarioError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tasks = registry.select(names)?;
        let config = RunConfig::from_params(&params)?;
        Ok(Scenario::builder()
            .name(name)
            .tasks(tasks)
            .params(params)
            .config(config)
            .build())
    }

    /// Prepare every configurable task. The first failure aborts.
    pub async fn prepare(&self) -> Result<(), ScenarioError> {
        try_join_all(self.tasks.iter().map(|task| async move {
            task.prepare(&self.params)
                .await
                .map_err(|source| ScenarioError::Prepare {
                    task: task.name().to_owned(),
                    source,
                })
        }))
        .await?;
        Ok(())
    }

    /// Prepare, run every lane to its deadline, drain, and summarize.
    pub async fn run(&self) -> Result<RunSummary, ScenarioError> {
        if self.tasks.is_empty() {
            return Err(ScenarioError::Empty(self.name.clone()));
        }
        self.prepare().await?;

        let config = &self.config;
        let manager = Arc::new(WorkloadManager::new(
            ManagerOptions::builder()
                .concurrency_limit(config.concurrency_limit)
                .grace(self.grace)
                .classifier(Arc::clone(&self.classifier))
                .build(),
        ));
        let limiter = AdmissionLimiter::start(
            LimiterConfig::builder()
                .target_rate(config.permits as f64)
                .ramp(config.warmup)
                .build(),
        );

        let reporter = self.reporter.clone().or_else(default_reporter);
        let stop_reporting = CancellationToken::new();
        let periodic = match &reporter {
            Some(reporter) if !config.disable_metrics => Some(spawn_periodic(
                Arc::clone(&manager),
                Arc::clone(reporter),
                config.report_interval,
                stop_reporting.clone(),
            )),
            _ => None,
        };

        let interrupt = self.handle_ctrl_c.then(|| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted - cancelling all workloads");
                    manager.cancel();
                }
            })
        });

        tracing::info!(
            scenario = %self.name,
            tasks = self.tasks.len(),
            duration = ?config.duration,
            concurrency = config.concurrency,
            warmup = ?config.warmup,
            "Scheduling tasks - let it rip!"
        );

        let start = Instant::now();
        for task in &self.tasks {
            for n in 1..=config.concurrency {
                let title = format!("{} #{n}", task.name());
                tracing::info!(workload = %title, "Scheduling workload");
                let window = RunWindow::starting_at(
                    start,
                    config.duration,
                    config.warmup,
                    Some(Arc::clone(&limiter)),
                );
                if let Err(e) = manager.submit_workload(task, config.batch_size, window, title) {
                    manager.cancel();
                    manager.shutdown_and_wait().await;
                    return Err(e.into());
                }
            }
        }
        tracing::info!("All tasks scheduled - pending completion");

        manager.shutdown_and_wait().await;

        if let Some(interrupt) = interrupt {
            interrupt.abort();
        }
        stop_reporting.cancel();
        if let Some(periodic) = periodic {
            if let Err(e) = periodic.await {
                tracing::warn!(error = %e, "Periodic reporter terminated abnormally");
            }
        }
        limiter.close();

        let summary = RunSummary::collect(&manager, config.batch_size);
        if let Some(reporter) = &reporter {
            if let Err(e) = reporter.report_summary(&summary).await {
                tracing::warn!(error = %e, "Summary report failed");
            }
        }
        tracing::info!(scenario = %self.name, "All done");
        Ok(summary)
    }
}

#[cfg(feature = "builtins")]
fn default_reporter() -> Option<Arc<dyn Reporter>> {
    Some(Arc::new(crate::report::ConsoleReporter::new()))
}

#[cfg(not(feature = "builtins"))]
fn default_reporter() -> Option<Arc<dyn Reporter>> {
    None
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::metrics::MetricsSnapshot;
    use crate::task::Task;
    use crate::workload::WorkloadReport;

    #[derive(Default)]
    struct Counting {
        prepared: AtomicUsize,
        calls: AtomicUsize,
        batch: AtomicUsize,
    }

    #[async_trait]
    impl Task for Counting {
        async fn prepare(&self, params: &Params) -> Result<(), TaskError> {
            if params.contains_key("broken") {
                return Err(TaskError::recoverable("refusing broken config"));
            }
            self.prepared.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn execute_one(&self, batch_size: usize) -> Result<(), TaskError> {
            self.batch.store(batch_size, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recording {
        progress: AtomicUsize,
        summary: Mutex<Option<RunSummary>>,
    }

    #[async_trait]
    impl Reporter for Recording {
        async fn report_progress(
            &self,
            _: &[WorkloadReport],
            _: Option<&MetricsSnapshot>,
        ) -> Result<(), crate::report::ReportError> {
            self.progress.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn report_summary(&self, summary: &RunSummary) -> Result<(), crate::report::ReportError> {
            *self.summary.lock() = Some(summary.clone());
            Ok(())
        }
    }

    fn scenario(task: Arc<Counting>, reporter: Arc<Recording>, params: Params) -> Scenario {
        Scenario::builder()
            .name("test")
            .tasks(vec![TaskRegistration::from_arc("counting", task).configurable()])
            .params(params)
            .config(
                RunConfig::builder()
                    .batch_size(16)
                    .duration(Duration::from_secs(2))
                    .concurrency(3)
                    .report_interval(Duration::from_millis(500))
                    .build(),
            )
            .reporter(reporter as Arc<dyn Reporter>)
            .handle_ctrl_c(false)
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn runs_lanes_until_deadline() {
        let task = Arc::new(Counting::default());
        let reporter = Arc::new(Recording::default());
        let summary = scenario(task.clone(), reporter.clone(), Params::new())
            .run()
            .await
            .unwrap();

        assert_eq!(task.prepared.load(Ordering::SeqCst), 1);
        assert_eq!(task.batch.load(Ordering::SeqCst), 16);
        assert_eq!(summary.completed, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.aggregate.success, task.calls.load(Ordering::SeqCst) as u64);
        assert_eq!(summary.total_rows(), summary.aggregate.success * 16);
        assert!(reporter.progress.load(Ordering::SeqCst) >= 3);
        assert_eq!(reporter.summary.lock().as_ref(), Some(&summary));
    }

    #[tokio::test(start_paused = true)]
    async fn prepare_failure_aborts_before_any_lane() {
        let task = Arc::new(Counting::default());
        let reporter = Arc::new(Recording::default());
        let params = Params::from([("broken".to_string(), "yes".to_string())]);
        let err = scenario(task.clone(), reporter, params).run().await.unwrap_err();

        assert!(matches!(err, ScenarioError::Prepare { ref task, .. } if task == "counting"));
        assert_eq!(task.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_metrics_skip_progress() {
        let task = Arc::new(Counting::default());
        let reporter = Arc::new(Recording::default());
        let mut scenario = scenario(task, reporter.clone(), Params::new());
        scenario.config.disable_metrics = true;
        scenario.run().await.unwrap();

        assert_eq!(reporter.progress.load(Ordering::SeqCst), 0);
        assert!(reporter.summary.lock().is_some());
    }

    #[test]
    fn from_registry_selects_and_configures() {
        let mut registry = TaskRegistry::new();
        registry.register(TaskRegistration::new("counting", Counting::default()));
        let params = Params::from([("concurrency".to_string(), "4".to_string())]);

        let scenario = Scenario::from_registry("cli", &registry, ["counting"], params).unwrap();
        assert_eq!(scenario.tasks.len(), 1);
        assert_eq!(scenario.config.concurrency, 4);

        assert!(matches!(
            Scenario::from_registry("cli", &registry, ["missing"], Params::new()),
            Err(ScenarioError::Registry(_))
        ));
    }

    #[tokio::test]
    async fn empty_scenario_is_rejected() {
        let scenario = Scenario::builder().name("empty").tasks(vec![]).build();
        assert!(matches!(scenario.run().await, Err(ScenarioError::Empty(_))));
    }
}
