//! Transient vs. fatal classification of backend errors.
use crate::error::BackendError;

/// Decides whether a backend error is worth retrying.
///
/// Implement this for backends whose error codes differ from the SQLSTATE
/// conventions understood by [`SqlStateClassifier`].
///
/// # Example
/// ```rust
/// use barrage::{BackendError, ErrorClassifier};
///
/// struct RetryEverything;
///
/// impl ErrorClassifier for RetryEverything {
///     fn is_transient(&self, _: &BackendError) -> bool {
///         true
///     }
/// }
///
/// assert!(RetryEverything.is_transient(&BackendError::new("23505", "duplicate key")));
/// ```
pub trait ErrorClassifier: Send + Sync {
    fn is_transient(&self, error: &BackendError) -> bool;
}

/// Default classifier for PostgreSQL-compatible databases such as CockroachDB.
///
/// Serialization conflicts, deadlocks, ambiguous commits and connection
/// failures are transient. Constraint violations, syntax errors and every
/// unknown code are fatal.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlStateClassifier;

impl SqlStateClassifier {
    const TRANSIENT_CODES: &'static [&'static str] = &[
        // serialization_failure
        "40001",
        // statement_completion_unknown
        "40003",
        // deadlock_detected
        "40P01",
        // admin_shutdown, crash_shutdown, cannot_connect_now
        "57P01",
        "57P02",
        "57P03",
    ];

    /// Class 08: connection exception.
    const TRANSIENT_CLASSES: &'static [&'static str] = &["08"];
}

impl ErrorClassifier for SqlStateClassifier {
    fn is_transient(&self, error: &BackendError) -> bool {
        let code = error.code.to_ascii_uppercase();
        if code.len() != 5 {
            return false;
        }
        Self::TRANSIENT_CODES.contains(&code.as_str())
            || Self::TRANSIENT_CLASSES
                .iter()
                .any(|class| code.starts_with(class))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient(code: &str) -> bool {
        SqlStateClassifier.is_transient(&BackendError::new(code, "boom"))
    }

    #[test]
    fn conflicts_are_transient() {
        assert!(transient("40001"));
        assert!(transient("40003"));
        assert!(transient("40P01"));
        assert!(transient("40p01"));
    }

    #[test]
    fn connection_loss_is_transient() {
        for code in ["08000", "08001", "08003", "08006", "08S01", "57P01"] {
            assert!(transient(code), "{code}");
        }
    }

    #[test]
    fn everything_else_is_fatal() {
        for code in ["23505", "23503", "42601", "42P01", "XX000", "", "08", "400011"] {
            assert!(!transient(code), "{code}");
        }
    }
}
