use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use barrage::aggregate::{Aggregate, LaneAggregate};
use barrage::{
    BackendError, CallLimit, ManagerOptions, MetricsSnapshot, Task, TaskError, TaskRegistration,
    WorkloadManager, WorkloadStatus,
};
use parking_lot::Mutex;

struct AlwaysFatal;

#[async_trait]
impl Task for AlwaysFatal {
    async fn execute_one(&self, _: usize) -> Result<(), TaskError> {
        Err(BackendError::new("23505", "duplicate key value violates unique constraint").into())
    }
}

struct AlwaysOk;

#[async_trait]
impl Task for AlwaysOk {
    async fn execute_one(&self, _: usize) -> Result<(), TaskError> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        Ok(())
    }
}

/// Fails with the queued errors first, then succeeds.
struct Scripted(Mutex<VecDeque<TaskError>>);

#[async_trait]
impl Task for Scripted {
    async fn execute_one(&self, _: usize) -> Result<(), TaskError> {
        match self.0.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct Counted {
    teardowns: AtomicU64,
}

#[async_trait]
impl Task for Counted {
    async fn execute_one(&self, _: usize) -> Result<(), TaskError> {
        Ok(())
    }

    async fn teardown(&self) -> Result<(), TaskError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Stuck;

#[async_trait]
impl Task for Stuck {
    async fn execute_one(&self, _: usize) -> Result<(), TaskError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn fatal_abort_is_isolated_to_its_lane() {
    let manager = WorkloadManager::default();
    let a = manager
        .submit_workload(&TaskRegistration::new("a", AlwaysFatal), 64, CallLimit(1_000), "a #1")
        .unwrap();
    let b = manager
        .submit_workload(&TaskRegistration::new("b", AlwaysOk), 64, CallLimit(50), "b #1")
        .unwrap();
    manager.shutdown_and_wait().await;

    assert_eq!(a.status(), WorkloadStatus::Failed);
    assert_eq!(a.problems().len(), 1);
    assert_eq!(a.metrics().non_transient_fail, 1);

    assert_eq!(b.status(), WorkloadStatus::Completed);
    assert_eq!(b.metrics().success, 50);
    assert!(b.problems().is_empty());
}

#[tokio::test(start_paused = true)]
async fn two_transient_failures_then_success() {
    let manager = WorkloadManager::default();
    let task = TaskRegistration::new(
        "flaky",
        Scripted(Mutex::new(VecDeque::from([
            BackendError::new("40001", "first conflict").into(),
            BackendError::new("40P01", "second conflict").into(),
        ]))),
    );
    let w = manager.submit_workload(&task, 8, CallLimit(3), "flaky #1").unwrap();
    manager.shutdown_and_wait().await;

    assert_eq!(w.status(), WorkloadStatus::Completed);
    let m = w.metrics();
    assert_eq!(m.success, 1);
    assert_eq!(m.transient_fail, 2);
    assert_eq!(m.non_transient_fail, 0);

    let problems = w.problems();
    assert_eq!(problems.len(), 2);
    assert!(problems[0].message.contains("second conflict"));
    assert!(problems[1].message.contains("first conflict"));
}

#[tokio::test(start_paused = true)]
async fn completed_workloads_are_stable_snapshots() {
    let manager = WorkloadManager::default();
    let task = TaskRegistration::new("ok", AlwaysOk);
    for n in 1..=4 {
        manager.submit_workload(&task, 1, CallLimit(n * 3), format!("ok #{n}")).unwrap();
    }
    manager.shutdown_and_wait().await;

    let snapshot = |m: &WorkloadManager| -> Vec<_> {
        m.get_workloads(WorkloadStatus::Completed)
            .iter()
            .map(|w| w.report())
            .collect()
    };
    let first = snapshot(&manager);
    tokio::time::sleep(Duration::from_secs(30)).await;
    let second = snapshot(&manager);

    assert_eq!(first.len(), 4);
    assert_eq!(first, second);
    let ids: Vec<u64> = first.iter().map(|r| r.id).collect();
    assert_eq!(ids, [1, 2, 3, 4]);
}

#[test]
fn aggregate_sums_counts_and_averages_latency() {
    let lanes = [
        MetricsSnapshot::builder().success(10).ops_per_sec(5.0).p50(4.0).build(),
        MetricsSnapshot::builder().success(20).ops_per_sec(7.0).p50(6.0).build(),
    ];
    let mut agg = LaneAggregate::new();
    agg.aggregate(&lanes);
    let merged = MetricsSnapshot::from(agg);

    assert_eq!(merged.success, 30);
    assert_eq!(merged.ops_per_sec, 12.0);
    assert_eq!(merged.p50, 5.0);
}

#[tokio::test(start_paused = true)]
async fn teardown_runs_only_after_clean_finish() {
    let counted = Arc::new(Counted::default());
    let manager = WorkloadManager::default();
    let with_teardown = TaskRegistration::from_arc("counted", counted.clone()).with_teardown();
    let without = TaskRegistration::from_arc("plain", counted.clone());

    manager.submit_workload(&with_teardown, 1, CallLimit(2), "counted #1").unwrap();
    manager.submit_workload(&with_teardown, 1, CallLimit(2), "counted #2").unwrap();
    manager.submit_workload(&without, 1, CallLimit(2), "plain #1").unwrap();
    manager.shutdown_and_wait().await;

    assert_eq!(counted.teardowns.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn stuck_lane_is_cancelled_after_grace() {
    let manager = WorkloadManager::new(
        ManagerOptions::builder()
            .grace(Duration::from_secs(5))
            .build(),
    );
    let stuck = manager
        .submit_workload(&TaskRegistration::new("stuck", Stuck), 1, CallLimit(1), "stuck #1")
        .unwrap();
    let quick = manager
        .submit_workload(&TaskRegistration::new("ok", AlwaysOk), 1, CallLimit(3), "ok #1")
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.cancel();
    manager.shutdown_and_wait().await;

    assert_eq!(stuck.status(), WorkloadStatus::Cancelled);
    assert_eq!(quick.status(), WorkloadStatus::Completed);
    assert_eq!(manager.get_workloads(WorkloadStatus::Cancelled).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stuck_lane_is_cancelled_on_plain_shutdown() {
    let manager = WorkloadManager::new(
        ManagerOptions::builder()
            .grace(Duration::from_secs(5))
            .build(),
    );
    let stuck = manager
        .submit_workload(&TaskRegistration::new("stuck", Stuck), 1, CallLimit(1), "stuck #1")
        .unwrap();
    let quick = manager
        .submit_workload(&TaskRegistration::new("ok", AlwaysOk), 1, CallLimit(3), "ok #1")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(60), manager.shutdown_and_wait())
        .await
        .expect("shutdown should return once the grace period lapses");

    assert_eq!(stuck.status(), WorkloadStatus::Cancelled);
    assert_eq!(quick.status(), WorkloadStatus::Completed);
    assert!(!manager.is_cancelled());
}

#[tokio::test]
async fn submission_after_shutdown_is_rejected() {
    let manager = WorkloadManager::default();
    manager.shutdown_and_wait().await;
    let err = manager
        .submit_workload(&TaskRegistration::new("ok", AlwaysOk), 1, CallLimit(1), "late #1")
        .unwrap_err();
    assert_eq!(err.to_string(), "workload manager is shut down and accepts no further workloads");
    assert!(manager.workloads().is_empty());
}
