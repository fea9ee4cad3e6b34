use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::{Fingerprint, KernelError, Watermark};

// 9999-12-31T23:59:59Z
const MAX_EXPIRY_UNIX_SECS: i64 = 253_402_300_799;

/// A computed result, valid while fresh with respect to watermark and TTL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedArtifact {
    pub fingerprint: Fingerprint,
    pub query_kind: String,
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub source_watermark: Watermark,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    /// Built from data older than the caller requires.
    Stale,
    Expired,
}

impl CachedArtifact {
    #[must_use]
    pub fn expires_at(&self) -> OffsetDateTime {
        let ttl = Duration::seconds(i64::try_from(self.ttl_secs).unwrap_or(i64::MAX));
        let ceiling =
            OffsetDateTime::from_unix_timestamp(MAX_EXPIRY_UNIX_SECS).unwrap_or(self.created_at);
        self.created_at.checked_add(ttl).map_or(ceiling, |expiry| expiry.min(ceiling))
    }

    #[must_use]
    pub fn freshness(&self, required: Watermark, now: OffsetDateTime) -> Freshness {
        if now >= self.expires_at() {
            Freshness::Expired
        } else if self.source_watermark < required {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    /// Time left before expiry, `None` once expired.
    #[must_use]
    pub fn remaining_ttl(&self, now: OffsetDateTime) -> Option<std::time::Duration> {
        let left = self.expires_at() - now;
        if left.is_positive() {
            std::time::Duration::try_from(left).ok()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    Claimed,
    Computing,
}

impl ClaimState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::Computing => "computing",
        }
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] for unknown states.
    pub fn parse(value: &str) -> Result<Self, KernelError> {
        match value {
            "claimed" => Ok(Self::Claimed),
            "computing" => Ok(Self::Computing),
            other => Err(KernelError::Validation(format!("unknown claim state: {other}"))),
        }
    }
}

/// Durable, expiring right to compute one fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ComputationClaim {
    pub fingerprint: Fingerprint,
    pub owner: String,
    pub state: ClaimState,
    #[serde(with = "time::serde::rfc3339")]
    pub claimed_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub attempt: u32,
}

impl ComputationClaim {
    #[must_use]
    pub fn is_live(&self, now: OffsetDateTime) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClaimOutcome {
    /// The caller now owns the claim. `recovered_from` names the owner of an
    /// expired claim that was taken over.
    Acquired { claim: ComputationClaim, recovered_from: Option<String> },
    /// Another owner holds a live claim.
    Held { claim: ComputationClaim },
}

/// Short-lived record of a permanent failure, shared with waiters in other processes.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FailureMemo {
    pub fingerprint: Fingerprint,
    pub owner: String,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub failed_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl FailureMemo {
    #[must_use]
    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        now < self.expires_at
    }
}

/// Which artifacts an explicit invalidation removes.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "scope", content = "value", rename_all = "snake_case")]
pub enum InvalidationScope {
    Fingerprint(Fingerprint),
    QueryKind(String),
    /// Every artifact built from a watermark strictly below the given one.
    WatermarkBefore(Watermark),
    All,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn artifact(watermark: u64, ttl_secs: u64) -> CachedArtifact {
        CachedArtifact {
            fingerprint: Fingerprint::from_bytes([7; 32]),
            query_kind: "pr-lead-time".to_string(),
            payload: json!({"median_hours": 12}),
            created_at: OffsetDateTime::UNIX_EPOCH,
            source_watermark: Watermark(watermark),
            ttl_secs,
        }
    }

    #[test]
    fn freshness_checks_expiry_before_watermark() {
        let now = OffsetDateTime::UNIX_EPOCH + Duration::seconds(30);
        assert_eq!(artifact(5, 60).freshness(Watermark(5), now), Freshness::Fresh);
        assert_eq!(artifact(5, 60).freshness(Watermark(6), now), Freshness::Stale);
        assert_eq!(artifact(5, 30).freshness(Watermark(6), now), Freshness::Expired);
    }

    #[test]
    fn remaining_ttl_counts_down_to_none() {
        let artifact = artifact(1, 60);
        let now = OffsetDateTime::UNIX_EPOCH + Duration::seconds(45);
        assert_eq!(artifact.remaining_ttl(now), Some(std::time::Duration::from_secs(15)));
        assert_eq!(artifact.remaining_ttl(now + Duration::seconds(15)), None);
    }

    #[test]
    fn huge_ttl_does_not_overflow() {
        let artifact = artifact(1, u64::MAX);
        assert!(artifact.expires_at() > OffsetDateTime::UNIX_EPOCH);
    }

    #[test]
    fn claim_state_round_trips_through_text() -> Result<(), KernelError> {
        assert_eq!(ClaimState::parse(ClaimState::Computing.as_str())?, ClaimState::Computing);
        assert!(ClaimState::parse("published").is_err());
        Ok(())
    }
}
