//! Error taxonomy for the enrollment core.
//!
//! Every fallible operation in the crate returns [`Result<T>`], whose error
//! variant carries a stable [`ErrorCategory`] so callers (saga engine, task
//! queue, dispatcher) can decide whether to retry, compensate, or fail
//! terminally without matching on the specific variant.

use thiserror::Error;

/// Abstract failure category, independent of the specific error variant.
///
/// Mirrors the taxonomy in the design: domain failures are permanent and
/// drive compensation; transient failures are retried with backoff;
/// compensation failures are terminal for the saga but don't stop the
/// reverse walk; programmer errors skip retry entirely and go straight to
/// the dead letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Not-found, inactive, blocked, duplicate, schedule-conflict,
    /// capacity-exhausted, invalid-argument. Reported immediately.
    Domain,
    /// Timeout, connection, deadlock, breaker-open. Retried with backoff.
    Transient,
    /// A compensation step itself failed; saga ends in `failed`.
    Compensation,
    /// Invariant violation or payload serialization failure. Not retried.
    Programmer,
}

impl ErrorCategory {
    /// Whether a failure in this category should be retried at the step or
    /// task level.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Error type for every core operation.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    /// Requested student, period, group, task, or saga does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing entity.
        what: String,
    },

    /// Student is blocked from enrolling.
    #[error("student blocked: {reason}")]
    StudentBlocked {
        /// Reason the student is blocked.
        reason: String,
    },

    /// Target academic period is not active.
    #[error("period inactive: {period_id}")]
    PeriodInactive {
        /// Period identifier.
        period_id: String,
    },

    /// Group has no remaining capacity.
    #[error("capacity exhausted for group {group_code}")]
    CapacityExhausted {
        /// Group code that is full.
        group_code: String,
    },

    /// Two requested groups conflict on day/time.
    #[error("schedule conflict between {group_a} and {group_b}")]
    ScheduleConflict {
        /// First conflicting group code.
        group_a: String,
        /// Second conflicting group code.
        group_b: String,
    },

    /// Student already holds a group for this subject in this period.
    #[error("duplicate materia {materia} for student {student_id}")]
    DuplicateMateria {
        /// Subject code.
        materia: String,
        /// Student identifier.
        student_id: String,
    },

    /// A group-reservation lock is already held by another holder.
    #[error("group reservation conflict on {group_code}")]
    ReservationConflict {
        /// Group code whose lock is held.
        group_code: String,
    },

    /// The named circuit breaker is open; the call was rejected without
    /// invoking the guarded operation.
    #[error("circuit breaker '{name}' is open")]
    BreakerOpen {
        /// Breaker name.
        name: String,
    },

    /// A network or store operation timed out, dropped the connection, or
    /// hit a lock conflict. Transient, retried with backoff.
    #[error("transient failure: {reason}")]
    Transient {
        /// Description of the transient condition.
        reason: String,
    },

    /// The underlying store rejected an operation for a reason not covered
    /// by a more specific variant.
    #[error("store error: {reason}")]
    Store {
        /// Description of the store failure.
        reason: String,
    },

    /// A saga's compensation step failed; logged and surfaced, does not
    /// stop the reverse compensation walk.
    #[error("compensation failed for step '{step}': {reason}")]
    CompensationFailed {
        /// Name of the step whose compensation failed.
        step: String,
        /// Underlying reason.
        reason: String,
    },

    /// A step or task exhausted its configured retry budget.
    #[error("retries exhausted: {reason}")]
    RetriesExhausted {
        /// Description of the final failure.
        reason: String,
    },

    /// Payload failed to serialize or deserialize.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An internal invariant was violated; indicates a bug, not operator
    /// error. Not retried.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// The request itself is malformed (empty group list, unknown route).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CoreError {
    /// Classify this error for retry/compensation decisions.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. }
            | Self::StudentBlocked { .. }
            | Self::PeriodInactive { .. }
            | Self::CapacityExhausted { .. }
            | Self::ScheduleConflict { .. }
            | Self::DuplicateMateria { .. }
            | Self::ReservationConflict { .. }
            | Self::InvalidArgument(_) => ErrorCategory::Domain,
            Self::BreakerOpen { .. } | Self::Transient { .. } | Self::Store { .. } => {
                ErrorCategory::Transient
            }
            Self::CompensationFailed { .. } => ErrorCategory::Compensation,
            Self::RetriesExhausted { .. } | Self::Serialization(_) | Self::Invariant(_) => {
                ErrorCategory::Programmer
            }
        }
    }

    /// Whether this error should be retried (step-level or task-level).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.category().is_retryable()
    }
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Transient {
            reason: format!("redis error: {err}"),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_are_not_retryable() {
        let err = CoreError::CapacityExhausted {
            group_code: "G-MAT101-A".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Domain);
        assert!(!err.is_transient());
    }

    #[test]
    fn transient_errors_are_retryable() {
        let err = CoreError::Transient {
            reason: "connection reset".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.is_transient());
    }

    #[test]
    fn breaker_open_counts_as_transient() {
        let err = CoreError::BreakerOpen {
            name: "database".to_string(),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn programmer_errors_are_not_retryable() {
        let err = CoreError::Invariant("partial commit detected".to_string());
        assert_eq!(err.category(), ErrorCategory::Programmer);
        assert!(!err.is_transient());
    }
}
