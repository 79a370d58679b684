use std::fmt::Debug;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::metrics::MetricsSnapshot;

/// Combines per-lane [`MetricsSnapshot`]s into one cross-lane view.
///
/// An aggregate keeps the raw sums it needs and leaves the final derivation
/// to its conversion into a snapshot, so that partial aggregates (one per
/// task, say) can be merged before anything is averaged.
///
/// # Implementor notes
/// - `merge` should be associative and commutative so merge order does not
///   affect the result.
/// - `consume` is called once per lane snapshot.
pub trait Aggregate
where
    Self: Serialize + DeserializeOwned + PartialEq + Send + Sync + Debug + Clone,
{
    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Consume every snapshot in `snapshots`.
    fn aggregate(&mut self, snapshots: &[MetricsSnapshot]) {
        snapshots.iter().for_each(|s| self.consume(s));
    }

    /// Incorporate a single lane's snapshot.
    fn consume(&mut self, snapshot: &MetricsSnapshot);

    /// Combine two aggregates into one.
    fn merge(&mut self, other: Self);
}

/// Summed counters and rates, summed latencies for later averaging.
///
/// Averaging percentiles across lanes is not a correct merge of their
/// distributions: a lane with ten samples weighs as much as one with ten
/// thousand. The cross-lane view is meant as a quick progress indicator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaneAggregate {
    pub lanes: u64,
    pub success: u64,
    pub transient_fail: u64,
    pub non_transient_fail: u64,
    pub ops_per_sec: f64,
    pub ops_per_min: f64,
    /// Longest-running lane.
    pub execution_time_secs: f64,
    pub mean_ms_sum: f64,
    pub min_ms_sum: f64,
    pub max_ms_sum: f64,
    pub p50_sum: f64,
    pub p90_sum: f64,
    pub p95_sum: f64,
    pub p99_sum: f64,
    pub p999_sum: f64,
}

impl Aggregate for LaneAggregate {
    fn new() -> Self {
        LaneAggregate::default()
    }

    fn consume(&mut self, s: &MetricsSnapshot) {
        self.lanes += 1;
        self.success += s.success;
        self.transient_fail += s.transient_fail;
        self.non_transient_fail += s.non_transient_fail;
        self.ops_per_sec += s.ops_per_sec;
        self.ops_per_min += s.ops_per_min;
        self.execution_time_secs = self.execution_time_secs.max(s.execution_time_secs);
        self.mean_ms_sum += s.mean_ms;
        self.min_ms_sum += s.min_ms;
        self.max_ms_sum += s.max_ms;
        self.p50_sum += s.p50;
        self.p90_sum += s.p90;
        self.p95_sum += s.p95;
        self.p99_sum += s.p99;
        self.p999_sum += s.p999;
    }

    fn merge(&mut self, other: Self) {
        self.lanes += other.lanes;
        self.success += other.success;
        self.transient_fail += other.transient_fail;
        self.non_transient_fail += other.non_transient_fail;
        self.ops_per_sec += other.ops_per_sec;
        self.ops_per_min += other.ops_per_min;
        self.execution_time_secs = self.execution_time_secs.max(other.execution_time_secs);
        self.mean_ms_sum += other.mean_ms_sum;
        self.min_ms_sum += other.min_ms_sum;
        self.max_ms_sum += other.max_ms_sum;
        self.p50_sum += other.p50_sum;
        self.p90_sum += other.p90_sum;
        self.p95_sum += other.p95_sum;
        self.p99_sum += other.p99_sum;
        self.p999_sum += other.p999_sum;
    }
}

impl From<LaneAggregate> for MetricsSnapshot {
    fn from(a: LaneAggregate) -> Self {
        if a.lanes == 0 {
            return MetricsSnapshot::default();
        }
        let n = a.lanes as f64;
        MetricsSnapshot::builder()
            .success(a.success)
            .transient_fail(a.transient_fail)
            .non_transient_fail(a.non_transient_fail)
            .execution_time_secs(a.execution_time_secs)
            .ops_per_sec(a.ops_per_sec)
            .ops_per_min(a.ops_per_min)
            .mean_ms(a.mean_ms_sum / n)
            .min_ms(a.min_ms_sum / n)
            .max_ms(a.max_ms_sum / n)
            .p50(a.p50_sum / n)
            .p90(a.p90_sum / n)
            .p95(a.p95_sum / n)
            .p99(a.p99_sum / n)
            .p999(a.p999_sum / n)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lane(success: u64, ops_per_sec: f64, p50: f64) -> MetricsSnapshot {
        MetricsSnapshot::builder()
            .success(success)
            .ops_per_sec(ops_per_sec)
            .ops_per_min(ops_per_sec * 60.0)
            .p50(p50)
            .build()
    }

    #[test]
    fn sums_counts_and_averages_latencies() {
        let mut agg = LaneAggregate::new();
        agg.aggregate(&[lane(10, 5.0, 4.0), lane(20, 7.0, 6.0)]);
        let snapshot = MetricsSnapshot::from(agg);

        assert_eq!(snapshot.success, 30);
        assert_eq!(snapshot.ops_per_sec, 12.0);
        assert_eq!(snapshot.ops_per_min, 720.0);
        assert_eq!(snapshot.p50, 5.0);
    }

    #[test]
    fn execution_time_is_longest_lane() {
        let mut agg = LaneAggregate::new();
        agg.aggregate(&[
            MetricsSnapshot::builder().execution_time_secs(3.0).build(),
            MetricsSnapshot::builder().execution_time_secs(9.5).build(),
        ]);
        assert_eq!(MetricsSnapshot::from(agg).execution_time_secs, 9.5);
    }

    #[test]
    fn merge_matches_single_pass() {
        let lanes = [lane(1, 1.0, 2.0), lane(2, 2.0, 4.0), lane(3, 3.0, 9.0)];

        let mut whole = LaneAggregate::new();
        whole.aggregate(&lanes);

        let mut left = LaneAggregate::new();
        left.aggregate(&lanes[..1]);
        let mut right = LaneAggregate::new();
        right.aggregate(&lanes[1..]);
        left.merge(right);

        assert_eq!(left, whole);
    }

    #[test]
    fn empty_is_default_snapshot() {
        assert_eq!(
            MetricsSnapshot::from(LaneAggregate::new()),
            MetricsSnapshot::default()
        );
    }
}
