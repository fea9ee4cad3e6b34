use serde::{Deserialize, Serialize};

use crate::Watermark;

/// How a caller should react to a [`KernelError`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The same request may succeed later.
    Retryable,
    /// Retrying the same request cannot help.
    Permanent,
    /// Resolved inside the kernel; never returned to external callers.
    Internal,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("upstream source unavailable: {0}")]
    TransientSource(String),
    #[error(
        "artifact {fingerprint} was built at watermark {found} but watermark {required} is required"
    )]
    StaleWatermark { fingerprint: String, found: Watermark, required: Watermark },
    #[error("fingerprint {fingerprint} is claimed by {owner} until {expires_at_ms}")]
    ClaimConflict { fingerprint: String, owner: String, expires_at_ms: i64 },
    #[error("identity for {raw} is ambiguous: closest candidate {candidate} scored {score:.3}")]
    IdentityAmbiguous { raw: String, candidate: String, score: f64 },
    #[error("codec key {0} is unavailable")]
    KeyUnavailable(String),
    #[error("computation for {fingerprint} exceeded its {timeout_ms}ms deadline")]
    ComputationTimeout { fingerprint: String, timeout_ms: u64 },
    #[error("fact ({subject_id}, {kind}, {timestamp}) already exists with a different payload")]
    FactConflict { subject_id: String, kind: String, timestamp: String },
    #[error("computation for {fingerprint} failed: {message}")]
    ComputationFailed { fingerprint: String, message: String },
    #[error("{limit} computations already in flight")]
    Backpressure { limit: usize },
    #[error("no result for {fingerprint} after waiting {waited_ms}ms")]
    WaiterTimeout { fingerprint: String, waited_ms: u64 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl KernelError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TransientSource(_)
            | Self::ComputationTimeout { .. }
            | Self::Backpressure { .. }
            | Self::WaiterTimeout { .. }
            | Self::KeyUnavailable(_)
            | Self::Storage(_) => ErrorClass::Retryable,
            Self::StaleWatermark { .. } | Self::ClaimConflict { .. } => ErrorClass::Internal,
            Self::Validation(_)
            | Self::IdentityAmbiguous { .. }
            | Self::FactConflict { .. }
            | Self::ComputationFailed { .. }
            | Self::NotFound(_) => ErrorClass::Permanent,
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Stable machine-readable code for the error, used in logs and CLI output.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::TransientSource(_) => "transient_source",
            Self::StaleWatermark { .. } => "stale_watermark",
            Self::ClaimConflict { .. } => "claim_conflict",
            Self::IdentityAmbiguous { .. } => "identity_ambiguous",
            Self::KeyUnavailable(_) => "key_unavailable",
            Self::ComputationTimeout { .. } => "computation_timeout",
            Self::FactConflict { .. } => "fact_conflict",
            Self::ComputationFailed { .. } => "computation_failed",
            Self::Backpressure { .. } => "backpressure",
            Self::WaiterTimeout { .. } => "waiter_timeout",
            Self::NotFound(_) => "not_found",
            Self::Storage(_) => "storage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_are_not_retryable_for_callers() {
        let stale = KernelError::StaleWatermark {
            fingerprint: "ab".to_string(),
            found: Watermark(1),
            required: Watermark(2),
        };
        assert_eq!(stale.class(), ErrorClass::Internal);
        assert!(!stale.is_retryable());
    }

    #[test]
    fn timeouts_are_retryable_and_conflicts_are_permanent() {
        let timeout =
            KernelError::ComputationTimeout { fingerprint: "ab".to_string(), timeout_ms: 10 };
        assert!(timeout.is_retryable());

        let conflict = KernelError::FactConflict {
            subject_id: "repo/1".to_string(),
            kind: "release".to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
        };
        assert_eq!(conflict.class(), ErrorClass::Permanent);
        assert_eq!(conflict.code(), "fact_conflict");
    }
}
