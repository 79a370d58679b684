//! Run options parsed from the flat option map.
use std::time::Duration;

use thiserror::Error;
use typed_builder::TypedBuilder;

use crate::task::Params;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for option '{key}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key,
            value: value.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Scheduling options consumed by [`crate::Scenario`].
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct RunConfig {
    /// Passed to every `execute_one` call.
    #[builder(default = 64)]
    pub batch_size: usize,
    #[builder(default = Duration::from_secs(60))]
    pub duration: Duration,
    /// Lanes per task.
    #[builder(default = 1)]
    pub concurrency: usize,
    #[builder(default)]
    pub warmup: Duration,
    /// Admission rate reached at the end of warmup, in permits per second.
    #[builder(default = 5_000)]
    pub permits: u64,
    #[builder(default)]
    pub disable_metrics: bool,
    /// Lanes executing at once; `0` is unbounded.
    #[builder(default)]
    pub concurrency_limit: usize,
    #[builder(default = Duration::from_secs(5))]
    pub report_interval: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RunConfig {
    /// Read the recognized keys from `params`, defaulting the rest.
    ///
    /// Unknown keys are ignored; they belong to the tasks.
    pub fn from_params(params: &Params) -> Result<Self, ConfigError> {
        let mut config = RunConfig::default();

        if let Some(v) = params.get("batch-size") {
            config.batch_size = parse_positive("batch-size", v)?;
        }
        if let Some(v) = params.get("duration") {
            config.duration = parse_duration(v).map_err(|r| ConfigError::invalid("duration", v, r))?;
        }
        if let Some(v) = params.get("concurrency") {
            config.concurrency = parse_positive("concurrency", v)?;
        }
        if let Some(v) = params.get("warmup") {
            config.warmup = parse_duration(v).map_err(|r| ConfigError::invalid("warmup", v, r))?;
        }
        if let Some(v) = params.get("permits") {
            config.permits = parse_multiplier(v).map_err(|r| ConfigError::invalid("permits", v, r))?;
            if config.permits == 0 {
                return Err(ConfigError::invalid("permits", v, "must be greater than zero"));
            }
        }
        if let Some(v) = params.get("disable-metrics").or_else(|| params.get("disableMetrics")) {
            config.disable_metrics = v
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid("disable-metrics", v, "expected true or false"))?;
        }
        if let Some(v) = params.get("concurrency-limit") {
            config.concurrency_limit = v
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid("concurrency-limit", v, "expected an integer"))?;
        }
        if let Some(v) = params.get("report-interval") {
            config.report_interval =
                parse_duration(v).map_err(|r| ConfigError::invalid("report-interval", v, r))?;
            if config.report_interval.is_zero() {
                return Err(ConfigError::invalid("report-interval", v, "must be greater than zero"));
            }
        }

        Ok(config)
    }
}

fn parse_positive(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(0) => Err(ConfigError::invalid(key, value, "must be greater than zero")),
        Ok(n) => Ok(n),
        Err(_) => Err(ConfigError::invalid(key, value, "expected a positive integer")),
    }
}

/// Parse `90`, `1500ms`, `30s`, `5m`, `2h` or compound forms like `1m30s`.
///
/// A bare number is seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".into());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("expected a number at '{rest}'"));
        }
        let n: u64 = rest[..digits].parse().map_err(|e| format!("{e}"))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(n),
            "s" => Duration::from_secs(n),
            "m" => Duration::from_secs(n.saturating_mul(60)),
            "h" => Duration::from_secs(n.saturating_mul(3600)),
            "" => return Err(format!("missing unit after {n}")),
            unit => return Err(format!("unknown unit '{unit}'")),
        };
        total = total.saturating_add(part);
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// Parse an integer with an optional `k` (thousand) or `m` (million) suffix.
pub fn parse_multiplier(input: &str) -> Result<u64, String> {
    let s = input.trim().to_ascii_lowercase();
    let (digits, factor) = match s.as_bytes().last() {
        Some(b'k') => (&s[..s.len() - 1], 1_000),
        Some(b'm') => (&s[..s.len() - 1], 1_000_000),
        _ => (s.as_str(), 1),
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("expected a number with optional k/m suffix, got '{input}'"))?;
    n.checked_mul(factor)
        .ok_or_else(|| format!("'{input}' is out of range"))
}
