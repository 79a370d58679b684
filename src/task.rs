//! The unit of work driven by every lane.
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::TaskError;

/// Flat option map handed unmodified to [`Task::prepare`].
pub type Params = HashMap<String, String>;

/// A pluggable unit of work executed repeatedly by a lane.
///
/// One instance is shared by every lane running it, so implementations keep
/// per-call state local and use interior mutability for anything set up in
/// [`prepare`](Task::prepare).
///
/// `execute_one` signals a retryable failure with [`TaskError::Recoverable`] or
/// a classified [`TaskError::Backend`]; anything else aborts the lane.
///
/// # Example
/// ```rust
/// use async_trait::async_trait;
/// use barrage::{Task, TaskError};
///
/// struct Noop;
///
/// #[async_trait]
/// impl Task for Noop {
///     async fn execute_one(&self, _batch_size: usize) -> Result<(), TaskError> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Send + Sync {
    /// One-time setup before any lane starts. Must fail fast on invalid params.
    ///
    /// Only invoked for tasks registered with [`Capabilities::configure`].
    async fn prepare(&self, _params: &Params) -> Result<(), TaskError> {
        Ok(())
    }

    /// Perform one unit of work. `batch_size` is always greater than zero.
    async fn execute_one(&self, batch_size: usize) -> Result<(), TaskError>;

    /// Cleanup after a lane finished cleanly.
    ///
    /// Only invoked for tasks registered with [`Capabilities::teardown`].
    async fn teardown(&self) -> Result<(), TaskError> {
        Ok(())
    }
}

/// Optional capabilities a task declares once, at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Receives the option map through [`Task::prepare`].
    pub configure: bool,
    /// Needs [`Task::teardown`] after a clean finish.
    pub teardown: bool,
}

impl Capabilities {
    pub const NONE: Self = Self {
        configure: false,
        teardown: false,
    };

    pub const ALL: Self = Self {
        configure: true,
        teardown: true,
    };
}

/// A named task together with its declared capabilities.
#[derive(Clone)]
pub struct TaskRegistration {
    name: String,
    task: Arc<dyn Task>,
    capabilities: Capabilities,
}

impl TaskRegistration {
    pub fn new(name: impl Into<String>, task: impl Task + 'static) -> Self {
        Self::from_arc(name, Arc::new(task))
    }

    pub fn from_arc(name: impl Into<String>, task: Arc<dyn Task>) -> Self {
        Self {
            name: name.into(),
            task,
            capabilities: Capabilities::NONE,
        }
    }

    pub fn configurable(mut self) -> Self {
        self.capabilities.configure = true;
        self
    }

    pub fn with_teardown(mut self) -> Self {
        self.capabilities.teardown = true;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Run [`Task::prepare`] if the task declared it wants configuration.
    pub async fn prepare(&self, params: &Params) -> Result<(), TaskError> {
        if self.capabilities.configure {
            tracing::debug!(task = %self.name, "preparing task");
            self.task.prepare(params).await?;
        }
        Ok(())
    }

    /// Run [`Task::teardown`] if the task declared it needs one.
    pub async fn teardown(&self) -> Result<(), TaskError> {
        if self.capabilities.teardown {
            self.task.teardown().await?;
        }
        Ok(())
    }
}

impl fmt::Debug for TaskRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistration")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no tasks matching names: {requested} (available: {available})")]
    NoMatchingTasks { requested: String, available: String },
}

/// Available tasks, looked up by their unique alias.
#[derive(Debug, Default, Clone)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, TaskRegistration>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task, replacing any previous one with the same name.
    pub fn register(&mut self, registration: TaskRegistration) -> &mut Self {
        self.tasks.insert(registration.name.clone(), registration);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&TaskRegistration> {
        self.tasks.get(name)
    }

    /// The registrations whose names appear in `names`, in registry order.
    pub fn select<I, S>(&self, names: I) -> Result<Vec<TaskRegistration>, RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let requested: Vec<String> = names.into_iter().map(|n| n.as_ref().to_owned()).collect();
        let selected: Vec<TaskRegistration> = self
            .tasks
            .values()
            .filter(|r| requested.iter().any(|n| *n == r.name))
            .cloned()
            .collect();

        if selected.is_empty() {
            return Err(RegistryError::NoMatchingTasks {
                requested: requested.join(","),
                available: self.names().collect::<Vec<_>>().join(", "),
            });
        }
        Ok(selected)
    }
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::time::Duration;

    use parking_lot::RwLock;
    use rand::Rng;

    use super::*;

    #[derive(Debug, Error)]
    pub enum FakeTaskError {
        #[error("invalid value '{value}' for fake task parameter '{key}'")]
        InvalidParam { key: &'static str, value: String },
        #[error("fake non-recoverable failure")]
        Fatal,
    }

    /// Knobs of a [`FakeTask`].
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct FakeSettings {
        pub min_wait_ms: u64,
        pub max_wait_ms: u64,
        pub recoverable_probability: f64,
        pub fatal_probability: f64,
    }

    impl Default for FakeSettings {
        fn default() -> Self {
            Self {
                min_wait_ms: 1,
                max_wait_ms: 5,
                recoverable_probability: 0.0,
                fatal_probability: 0.0,
            }
        }
    }

    /// Sleeps to simulate I/O wait and fails with configurable probabilities.
    ///
    /// Recognized params: `minWait` and `maxWait` (milliseconds, defaults 1
    /// and 5), `recoverable-probability` and `fatal-probability` (0 to 1,
    /// default 0).
    #[derive(Debug, Default)]
    pub struct FakeTask {
        settings: RwLock<FakeSettings>,
    }

    impl FakeTask {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_settings(settings: FakeSettings) -> Self {
            Self {
                settings: RwLock::new(settings),
            }
        }

        /// The built-in fake task, registered as `fake` with configuration.
        pub fn registration() -> TaskRegistration {
            TaskRegistration::new("fake", Self::new()).configurable()
        }

        pub fn settings(&self) -> FakeSettings {
            *self.settings.read()
        }
    }

    fn param<T: std::str::FromStr>(
        params: &Params,
        key: &'static str,
        default: T,
    ) -> Result<T, FakeTaskError> {
        match params.get(key) {
            None => Ok(default),
            Some(v) => v.trim().parse().map_err(|_| FakeTaskError::InvalidParam {
                key,
                value: v.clone(),
            }),
        }
    }

    fn probability(params: &Params, key: &'static str) -> Result<f64, FakeTaskError> {
        let p = param(params, key, 0.0)?;
        if !(0.0..=1.0).contains(&p) {
            return Err(FakeTaskError::InvalidParam {
                key,
                value: p.to_string(),
            });
        }
        Ok(p)
    }

    #[async_trait]
    impl Task for FakeTask {
        async fn prepare(&self, params: &Params) -> Result<(), TaskError> {
            let defaults = FakeSettings::default();
            let settings = FakeSettings {
                min_wait_ms: param(params, "minWait", defaults.min_wait_ms).map_err(TaskError::other)?,
                max_wait_ms: param(params, "maxWait", defaults.max_wait_ms).map_err(TaskError::other)?,
                recoverable_probability: probability(params, "recoverable-probability")
                    .map_err(TaskError::other)?,
                fatal_probability: probability(params, "fatal-probability").map_err(TaskError::other)?,
            };
            if settings.max_wait_ms < settings.min_wait_ms {
                return Err(TaskError::other(FakeTaskError::InvalidParam {
                    key: "maxWait",
                    value: settings.max_wait_ms.to_string(),
                }));
            }
            *self.settings.write() = settings;
            Ok(())
        }

        async fn execute_one(&self, batch_size: usize) -> Result<(), TaskError> {
            let s = self.settings();
            let (recoverable_roll, fatal_roll, wait_ms) = {
                let mut rng = rand::thread_rng();
                let wait_ms = if s.max_wait_ms > s.min_wait_ms {
                    rng.gen_range(s.min_wait_ms..s.max_wait_ms)
                } else {
                    s.min_wait_ms
                };
                (rng.r#gen::<f64>(), rng.r#gen::<f64>(), wait_ms)
            };

            if recoverable_roll < s.recoverable_probability {
                return Err(TaskError::recoverable(format!(
                    "fake recoverable failure (batch of {batch_size})"
                )));
            }
            if fatal_roll < s.fatal_probability {
                return Err(TaskError::other(FakeTaskError::Fatal));
            }
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use tokio::time::Instant;

        use super::*;

        fn params(pairs: &[(&str, &str)]) -> Params {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        }

        #[tokio::test]
        async fn prepare_reads_params() {
            let task = FakeTask::new();
            task.prepare(&params(&[("minWait", "10"), ("maxWait", "20"), ("fatal-probability", "0.5")]))
                .await
                .unwrap();
            let s = task.settings();
            assert_eq!((s.min_wait_ms, s.max_wait_ms), (10, 20));
            assert_eq!(s.fatal_probability, 0.5);
            assert_eq!(s.recoverable_probability, 0.0);
        }

        #[tokio::test]
        async fn prepare_fails_fast_on_bad_params() {
            let task = FakeTask::new();
            assert!(task.prepare(&params(&[("minWait", "soon")])).await.is_err());
            assert!(task.prepare(&params(&[("minWait", "9"), ("maxWait", "3")])).await.is_err());
            assert!(task.prepare(&params(&[("fatal-probability", "2")])).await.is_err());
            assert_eq!(task.settings(), FakeSettings::default());
        }

        #[tokio::test(start_paused = true)]
        async fn sleeps_within_bounds() {
            let task = FakeTask::with_settings(FakeSettings {
                min_wait_ms: 3,
                max_wait_ms: 7,
                ..FakeSettings::default()
            });
            for _ in 0..20 {
                let start = Instant::now();
                task.execute_one(1).await.unwrap();
                let waited = start.elapsed();
                assert!(waited >= Duration::from_millis(3), "{waited:?}");
                assert!(waited < Duration::from_millis(7), "{waited:?}");
            }
        }

        #[tokio::test]
        async fn certain_failures() {
            let recoverable = FakeTask::with_settings(FakeSettings {
                recoverable_probability: 1.0,
                ..FakeSettings::default()
            });
            assert!(matches!(
                recoverable.execute_one(1).await,
                Err(TaskError::Recoverable(_))
            ));

            let fatal = FakeTask::with_settings(FakeSettings {
                fatal_probability: 1.0,
                ..FakeSettings::default()
            });
            assert!(matches!(fatal.execute_one(1).await, Err(TaskError::Other(_))));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counting {
        prepared: AtomicUsize,
        torn_down: AtomicUsize,
    }

    #[async_trait]
    impl Task for Counting {
        async fn prepare(&self, _: &Params) -> Result<(), TaskError> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn execute_one(&self, _: usize) -> Result<(), TaskError> {
            Ok(())
        }

        async fn teardown(&self) -> Result<(), TaskError> {
            self.torn_down.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn undeclared_capabilities_are_skipped() {
        let task = Arc::new(Counting::default());
        let reg = TaskRegistration::from_arc("counting", task.clone());
        reg.prepare(&Params::new()).await.unwrap();
        reg.teardown().await.unwrap();
        assert_eq!(task.prepared.load(Ordering::SeqCst), 0);
        assert_eq!(task.torn_down.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn declared_capabilities_are_invoked() {
        let task = Arc::new(Counting::default());
        let reg = TaskRegistration::from_arc("counting", task.clone())
            .configurable()
            .with_teardown();
        assert_eq!(reg.capabilities(), Capabilities::ALL);
        reg.prepare(&Params::new()).await.unwrap();
        reg.teardown().await.unwrap();
        assert_eq!(task.prepared.load(Ordering::SeqCst), 1);
        assert_eq!(task.torn_down.load(Ordering::SeqCst), 1);
    }

    mod select {
        use super::*;

        fn registry() -> TaskRegistry {
            let mut registry = TaskRegistry::new();
            registry
                .register(TaskRegistration::new("fake", Counting::default()))
                .register(TaskRegistration::new("batch-insert", Counting::default()));
            registry
        }

        #[test]
        fn matching_names() {
            let selected = registry().select(["fake", "unknown"]).unwrap();
            assert_eq!(selected.len(), 1);
            assert_eq!(selected[0].name(), "fake");
        }

        #[test]
        fn no_match_is_an_error() {
            let err = registry().select(["nope"]).unwrap_err();
            assert_eq!(
                err,
                RegistryError::NoMatchingTasks {
                    requested: "nope".into(),
                    available: "batch-insert, fake".into(),
                }
            );
        }
    }
}
