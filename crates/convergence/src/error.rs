//! Error types for convergence operations.
//!
//! Every failure that leaves the engine falls into one of three categories:
//! the remote service refused an operation, the remote service never became
//! consistent within the allotted time, or the caller asked for a
//! reconciliation that cannot be expressed.

use crate::consistency::FieldMismatch;
use crate::remote::RemoteError;
use std::time::Duration;
use thiserror::Error;

/// Categories of convergence errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A remote call failed with a classified error
    ApiFailure,
    /// The remote service did not become consistent in time
    ConvergenceTimeout,
    /// The desired collection violates a reconciliation precondition
    ReconciliationInconsistency,
}

impl ErrorCategory {
    /// Whether running the whole operation again later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConvergenceTimeout)
    }

    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::ApiFailure => "Remote API call failed",
            Self::ConvergenceTimeout => "Remote state did not converge in time",
            Self::ReconciliationInconsistency => "Invalid desired collection",
        }
    }

    /// Get actionable advice for resolving this error category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::ApiFailure => "Check permissions and the error details, then re-run",
            Self::ConvergenceTimeout => {
                "The service may still be propagating or another actor is editing the resource; re-run, or raise the timeouts in config"
            }
            Self::ReconciliationInconsistency => "Fix the manifest entry named in the error",
        }
    }
}

/// Errors that can occur while converging remote state.
#[derive(Debug, Error)]
pub enum Error {
    /// A remote call failed and the failure was not retryable
    #[error("failed to {action} {key}")]
    Api {
        /// Operation that was attempted
        action: String,
        /// Resource the operation targeted
        key: String,
        /// Classified remote failure
        #[source]
        source: RemoteError,
    },

    /// The remote service did not converge before the deadline
    #[error(
        "timed out after {:.1}s ({attempts} attempts) waiting to {action} {key}. Last error: {last_reason}",
        .waited.as_secs_f64()
    )]
    Timeout {
        /// Operation that was attempted
        action: String,
        /// Resource the operation targeted
        key: String,
        /// Wall time spent before giving up
        waited: Duration,
        /// Number of attempts made
        attempts: u32,
        /// Reason the last attempt was not accepted
        last_reason: String,
    },

    /// Remote state stayed different from what was written
    #[error(
        "{key} ({id}) did not converge after {:.1}s: {}",
        .waited.as_secs_f64(),
        render_mismatches(.mismatches)
    )]
    Diverged {
        /// Resource that diverged
        key: String,
        /// Remote id of the resource
        id: String,
        /// Wall time spent verifying
        waited: Duration,
        /// Fields that did not match on the last read
        mismatches: Vec<FieldMismatch>,
    },

    /// A desired collection violates a reconciliation precondition
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
}

impl Error {
    /// Wrap a remote failure with the operation it belongs to.
    pub fn api(action: impl Into<String>, key: impl Into<String>, source: RemoteError) -> Self {
        Self::Api {
            action: action.into(),
            key: key.into(),
            source,
        }
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Api { .. } => ErrorCategory::ApiFailure,
            Self::Timeout { .. } | Self::Diverged { .. } => ErrorCategory::ConvergenceTimeout,
            Self::InvalidPlan(_) => ErrorCategory::ReconciliationInconsistency,
        }
    }

    /// The underlying remote error, if this is an API failure.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Api { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Whether the underlying remote error is `NotFound`.
    pub fn is_not_found(&self) -> bool {
        self.remote().is_some_and(RemoteError::is_not_found)
    }
}

fn render_mismatches(mismatches: &[FieldMismatch]) -> String {
    if mismatches.is_empty() {
        return "no field-level detail".to_string();
    }
    mismatches
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for convergence operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consistency::FieldValue;

    #[test]
    fn test_categories() {
        let api = Error::api("create", "user jane", RemoteError::not_found("jane"));
        assert_eq!(api.category(), ErrorCategory::ApiFailure);
        assert!(api.is_not_found());
        assert!(!api.category().is_retryable());
        // The remote error is the source, not part of the message
        assert_eq!(api.to_string(), "failed to create user jane");
        let source = std::error::Error::source(&api).unwrap();
        assert_eq!(source.to_string(), RemoteError::not_found("jane").to_string());

        let timeout = Error::Timeout {
            action: "read".to_string(),
            key: "team t".to_string(),
            waited: Duration::from_secs(30),
            attempts: 7,
            last_reason: "not found".to_string(),
        };
        assert_eq!(timeout.category(), ErrorCategory::ConvergenceTimeout);
        assert!(timeout.category().is_retryable());
        assert!(timeout.to_string().contains("Last error: not found"));
    }

    #[test]
    fn test_diverged_lists_fields() {
        let err = Error::Diverged {
            key: "user jane".to_string(),
            id: "u-1".to_string(),
            waited: Duration::from_secs(30),
            mismatches: vec![FieldMismatch {
                field: "title".to_string(),
                expected: FieldValue::from("Agent"),
                actual: FieldValue::Absent,
            }],
        };
        let msg = err.to_string();
        assert!(msg.contains("u-1"));
        assert!(msg.contains("title"));
        assert_eq!(err.category(), ErrorCategory::ConvergenceTimeout);

        let invalid = Error::InvalidPlan("wildcard mixed with ids".to_string());
        assert_eq!(invalid.category(), ErrorCategory::ReconciliationInconsistency);
        assert!(!invalid.category().is_retryable());
    }
}
