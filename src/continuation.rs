//! Stopping rules for lanes.
//!
//! A lane asks its [`Continuation`] before every call whether to go on. This
//! is where duration or call-count limits live, and where warmup admission is
//! driven from: [`RunWindow`] acquires an [`AdmissionLimiter`] permit before
//! each call while the warmup window is open.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::limiter::AdmissionLimiter;

#[async_trait]
pub trait Continuation: Send + Sync {
    /// Whether the lane should issue call number `call` (1-based).
    async fn proceed(&self, call: u64) -> bool;
}

#[async_trait]
impl<F> Continuation for F
where
    F: Fn(u64) -> bool + Send + Sync,
{
    async fn proceed(&self, call: u64) -> bool {
        self(call)
    }
}

/// Allows exactly `n` calls.
#[derive(Debug, Clone, Copy)]
pub struct CallLimit(pub u64);

#[async_trait]
impl Continuation for CallLimit {
    async fn proceed(&self, call: u64) -> bool {
        call <= self.0
    }
}

/// Runs until a deadline, throttled by an admission limiter during warmup.
#[derive(Debug, Clone)]
pub struct RunWindow {
    stop_at: Instant,
    warmup_until: Instant,
    limiter: Option<Arc<AdmissionLimiter>>,
}

impl RunWindow {
    /// A window starting now, lasting `duration`, whose first `warmup` is
    /// gated by `limiter`.
    pub fn new(duration: Duration, warmup: Duration, limiter: Option<Arc<AdmissionLimiter>>) -> Self {
        Self::starting_at(Instant::now(), duration, warmup, limiter)
    }

    /// A window anchored at `start`, so lanes submitted one after another
    /// still share a single deadline.
    pub fn starting_at(
        start: Instant,
        duration: Duration,
        warmup: Duration,
        limiter: Option<Arc<AdmissionLimiter>>,
    ) -> Self {
        Self {
            stop_at: start + duration,
            warmup_until: start + warmup,
            limiter,
        }
    }

    pub fn stop_at(&self) -> Instant {
        self.stop_at
    }

    pub fn in_warmup(&self) -> bool {
        Instant::now() < self.warmup_until
    }
}

#[async_trait]
impl Continuation for RunWindow {
    async fn proceed(&self, _call: u64) -> bool {
        if let Some(limiter) = &self.limiter {
            if self.in_warmup() && limiter.acquire().await.is_err() {
                tracing::debug!("admission limiter closed during warmup");
            }
        }
        Instant::now() < self.stop_at
    }
}
