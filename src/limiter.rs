//! Global admission limiter with a warmup ramp.
//!
//! The [`AdmissionLimiter`] is a token bucket backed by a
//! [`tokio::sync::Semaphore`]. A background governor task adds permits every
//! `tick`, at a rate that rises linearly from zero at ramp start to
//! `target_rate` once `ramp` has elapsed, and then holds at `target_rate` until
//! the limiter is dropped.
//!
//! Lanes call [`AdmissionLimiter::acquire`] only while the warmup window is
//! open. Once warmup is over they stop asking and run unthrottled, so a cold
//! backend is never hit by every lane at once.
//!
//! # Mathematical behavior of the governor
//! At time `elapsed` since ramp start the instantaneous rate is
//!
//! ```text
//! t = min(elapsed / ramp, 1)
//! r(t) = target_rate * t
//! ```
//!
//! Each tick adds `floor(r(t) * tick_seconds + fractional)` permits and carries
//! the remainder in `fractional`, preserving the long-term average.
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::sync::watch::{self, Receiver, Sender};
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use internals::*;

/// The semaphore implementation uses 3 bits of usize for flags.
/// Any value greater than this is capped.
const MAX_TOKENS: usize = usize::MAX >> 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimiterError {
    #[error("admission limiter is closed")]
    Closed,
}

/// Configuration of an [`AdmissionLimiter`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct LimiterConfig {
    /// Permits per second once the ramp is over.
    pub target_rate: f64,
    /// How long it takes to ramp from zero to `target_rate`.
    #[builder(default)]
    pub ramp: Duration,
    /// Granularity of the governor.
    #[builder(default = Duration::from_millis(100))]
    pub tick: Duration,
    /// Maximum stored permits. Defaults to one tick's worth at `target_rate`.
    #[builder(default, setter(strip_option))]
    pub bucket_capacity: Option<usize>,
}

impl LimiterConfig {
    fn capacity(&self) -> usize {
        self.bucket_capacity.unwrap_or_else(|| {
            let per_tick = (self.target_rate * self.tick.as_secs_f64()).ceil();
            if per_tick >= MAX_TOKENS as f64 {
                MAX_TOKENS
            } else {
                (per_tick as usize).max(1)
            }
        })
    }
}

/// Process-wide rate gate shared by every lane of a run.
#[derive(Debug)]
pub struct AdmissionLimiter {
    tokens: Arc<Semaphore>,
    shutdown: Sender<bool>,
    config: LimiterConfig,
    started_at: Instant,
}

impl AdmissionLimiter {
    /// Start the limiter and its governor task. The ramp starts now.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: LimiterConfig) -> Arc<Self> {
        let tokens = Arc::new(Semaphore::new(0));
        let (shutdown, rx) = watch::channel(false);
        tracing::debug!(
            target_rate = config.target_rate,
            ramp_ms = config.ramp.as_millis() as u64,
            "starting admission limiter"
        );
        tokio::spawn(token_governor_task(
            Arc::clone(&tokens),
            rx,
            config.clone(),
        ));
        Arc::new(Self {
            tokens,
            shutdown,
            config,
            started_at: Instant::now(),
        })
    }

    /// Wait until a permit is available and consume it.
    pub async fn acquire(&self) -> Result<(), LimiterError> {
        let permit = self
            .tokens
            .acquire()
            .await
            .map_err(|_| LimiterError::Closed)?;
        // The governor is solely responsible for adding permits.
        permit.forget();
        Ok(())
    }

    /// The rate the governor is currently issuing permits at.
    pub fn current_rate(&self) -> f64 {
        effective_rate(self.started_at.elapsed(), self.config.ramp, self.config.target_rate)
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Stop the governor and fail every pending and future acquisition.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
        self.tokens.close();
    }
}

impl Drop for AdmissionLimiter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

/// Internal components of the limiter.
/// Encapsulated in a module to allow conditional exposure via `#[cfg(feature = "internals")]`.
mod internals {
    use super::*;

    /// Rate at `elapsed` since ramp start: linear from zero to `target`, then flat.
    pub fn effective_rate(elapsed: Duration, ramp: Duration, target: f64) -> f64 {
        if ramp.is_zero() {
            return target;
        }
        let t = (elapsed.as_secs_f64() / ramp.as_secs_f64()).min(1.0);
        target * t
    }

    /// Pure function to calculate the number of permits to add this tick.
    ///
    /// Returns `(permits_to_add, next_fractional_part)`.
    pub fn calc_token_limit(rate: f64, fractional: f64, tick: Duration) -> (usize, f64) {
        let add_f = rate * tick.as_secs_f64();
        let add_total_f = (add_f + fractional).floor();
        let fractional = (add_f + fractional) - add_total_f;

        let add_total = if add_total_f >= (MAX_TOKENS as f64) {
            MAX_TOKENS
        } else if add_total_f < 0.0 {
            0
        } else {
            add_total_f as usize
        };

        (add_total, fractional)
    }

    /// Governor task adding permits to `tokens` until shutdown.
    pub async fn token_governor_task(
        tokens: Arc<Semaphore>,
        mut shutdown: Receiver<bool>,
        config: LimiterConfig,
    ) {
        let capacity = config.capacity();
        let main_task = async {
            let start = Instant::now();
            let mut next_tick = start;
            let mut fractional = 0.0;
            let mut ramped = config.ramp.is_zero();

            loop {
                next_tick += config.tick;
                let elapsed = Instant::now().duration_since(start);
                if !ramped && elapsed >= config.ramp {
                    ramped = true;
                    tracing::debug!(rate = config.target_rate, "admission ramp complete");
                }

                let rate = effective_rate(elapsed, config.ramp, config.target_rate);
                let (add_total, f) = calc_token_limit(rate, fractional, config.tick);
                fractional = f;

                if add_total > 0 {
                    let avail = tokens.available_permits();
                    if avail < capacity {
                        let add = add_total.min(capacity - avail);
                        tokens.add_permits(add);
                    }
                }
                tokio::time::sleep_until(next_tick).await;
            }
        };

        tokio::select! {
            _ = main_task => {}
            _ = shutdown.wait_for(|b| *b) => {
                tracing::debug!("Governor received shutdown signal.");
            }
        };
    }
}
