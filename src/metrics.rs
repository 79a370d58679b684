//! Sliding-window call statistics for a single lane.
//!
//! A [`Metrics`] is written by exactly one lane. Every recorded call purges the
//! samples that fell out of the trailing [`WINDOW`], appends the new sample and
//! eagerly recomputes the derived statistics, so readers only ever copy plain
//! numbers out of it.
//!
//! The derived values are exposed as a [`MetricsSnapshot`], a serializable,
//! independent copy. A finished lane's snapshot is frozen once and never
//! changes afterwards.
use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use typed_builder::TypedBuilder;

/// Trailing interval the latency and throughput statistics are computed over.
pub const WINDOW: Duration = Duration::from_secs(120);

/// Nearest-rank percentile over an ascending-sorted slice.
///
/// Returns the element at index `ceil(p * n) - 1` (clamped to the first
/// element), or `0.0` when `sorted` is empty.
///
/// # Panics
///
/// Panics if `p` is not within `[0, 1]`.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    assert!((0.0..=1.0).contains(&p), "percentile must be within [0, 1], got {p}");
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.max(1) - 1]
}

/// A frozen view of a lane's (or several lanes') statistics.
///
/// Latencies are fractional milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(default))]
pub struct MetricsSnapshot {
    pub success: u64,
    pub transient_fail: u64,
    pub non_transient_fail: u64,
    /// Wall time since the metrics were created, in seconds.
    pub execution_time_secs: f64,
    pub ops_per_sec: f64,
    pub ops_per_min: f64,
    pub mean_ms: f64,
    pub min_ms: f64,
    /// Worst latency ever observed, not only within the window.
    pub max_ms: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    at: Instant,
    latency_ms: f64,
    /// Success count at the time the sample was taken.
    success: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    TransientFail,
    NonTransientFail,
}

/// Per-lane outcome counters and windowed latency statistics.
#[derive(Debug, Clone)]
pub struct Metrics {
    start_time: Instant,
    update_time: Instant,
    time_series: VecDeque<Sample>,
    stats: MetricsSnapshot,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            update_time: now,
            time_series: VecDeque::new(),
            stats: MetricsSnapshot::default(),
        }
    }

    /// Record a successful call that took `latency`.
    pub fn mark_success(&mut self, latency: Duration) {
        self.record(Instant::now(), latency, Outcome::Success);
    }

    /// Record a failed call that took `latency`.
    pub fn mark_fail(&mut self, latency: Duration, is_transient: bool) {
        let outcome = if is_transient {
            Outcome::TransientFail
        } else {
            Outcome::NonTransientFail
        };
        self.record(Instant::now(), latency, outcome);
    }

    fn record(&mut self, now: Instant, latency: Duration, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.stats.success += 1,
            Outcome::TransientFail => self.stats.transient_fail += 1,
            Outcome::NonTransientFail => self.stats.non_transient_fail += 1,
        }
        self.update_time = now;

        if let Some(cutoff) = now.checked_sub(WINDOW) {
            while self.time_series.front().is_some_and(|s| s.at < cutoff) {
                self.time_series.pop_front();
            }
        }
        self.time_series.push_back(Sample {
            at: now,
            latency_ms: latency.as_secs_f64() * 1000.0,
            success: self.stats.success,
        });

        self.recompute(now);
    }

    fn recompute(&mut self, now: Instant) {
        let mut sorted: Vec<f64> = self.time_series.iter().map(|s| s.latency_ms).collect();
        sorted.sort_by(f64::total_cmp);

        let stats = &mut self.stats;
        stats.p50 = percentile(&sorted, 0.5);
        stats.p90 = percentile(&sorted, 0.9);
        stats.p95 = percentile(&sorted, 0.95);
        stats.p99 = percentile(&sorted, 0.99);
        stats.p999 = percentile(&sorted, 0.999);

        if sorted.is_empty() {
            stats.mean_ms = 0.0;
            stats.min_ms = 0.0;
        } else {
            stats.mean_ms = sorted.iter().sum::<f64>() / sorted.len() as f64;
            stats.min_ms = sorted[0];
            stats.max_ms = stats.max_ms.max(sorted[sorted.len() - 1]);
        }

        let oldest = self.time_series.front().map_or(now, |s| s.at);
        let span = now.saturating_duration_since(oldest).as_secs_f64();
        stats.ops_per_sec = self.time_series.len() as f64 / span.max(1.0);
        stats.ops_per_min = stats.ops_per_sec * 60.0;
    }

    /// An independent copy of the current statistics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            execution_time_secs: self.execution_time_secs(),
            ..self.stats.clone()
        }
    }

    /// Seconds elapsed since these metrics were created.
    pub fn execution_time_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn update_time(&self) -> Instant {
        self.update_time
    }

    pub fn success(&self) -> u64 {
        self.stats.success
    }

    pub fn transient_fail(&self) -> u64 {
        self.stats.transient_fail
    }

    pub fn non_transient_fail(&self) -> u64 {
        self.stats.non_transient_fail
    }

    /// Number of samples currently inside the window.
    pub fn window_len(&self) -> usize {
        self.time_series.len()
    }

    /// Success count carried by the most recent sample.
    pub fn last_sample_success(&self) -> Option<u64> {
        self.time_series.back().map(|s| s.success)
    }
}
