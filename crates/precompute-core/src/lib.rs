//! Domain model for the metric precomputation kernel.
//!
//! Everything in this crate is pure: fingerprints, identity scoring, the
//! identifier codec and fact validation never touch storage or the clock
//! except through values passed in by the caller.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod artifact;
pub mod codec;
pub mod config;
pub mod error;
pub mod facts;
pub mod fingerprint;
pub mod identity;

pub use artifact::{
    CachedArtifact, ClaimOutcome, ClaimState, ComputationClaim, FailureMemo, Freshness,
    InvalidationScope,
};
pub use codec::{
    decode_with_key, encode_with_key, CodecKey, IdentifierCodec, KeyProvider, StaticKeyProvider,
};
pub use config::{
    CacheConfig, CodecConfig, CoordinatorConfig, FingerprintConfig, PrecomputeConfig,
    ResolverConfig, StoreConfig,
};
pub use error::{ErrorClass, KernelError};
pub use facts::{PersistentFact, TimeRange};
pub use fingerprint::{Fingerprint, FingerprintComputer, MetricQuery, ParamValue, QueryParams};
pub use identity::{
    CanonicalId, Identity, IdentityCommit, IdentityEvent, IdentityIndex, MergePlan, RawIdentifier,
    RecordedEvent, ResolutionPlan, ResolverPolicy, ScoringWeights, SourceSystem,
};

/// Version marker of the read-only upstream source.
///
/// Advances only through external ingestion; the kernel reads it and compares
/// it, nothing more.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(transparent)]
pub struct Watermark(pub u64);

impl Watermark {
    /// Coarse bucket used when fingerprinting. A bucket size of zero or one
    /// keeps every watermark in its own bucket.
    #[must_use]
    pub fn bucket(self, bucket_size: u64) -> u64 {
        if bucket_size <= 1 {
            self.0
        } else {
            self.0 / bucket_size
        }
    }

    /// Lowest watermark sharing this watermark's bucket.
    #[must_use]
    pub fn bucket_floor(self, bucket_size: u64) -> Self {
        if bucket_size <= 1 {
            self
        } else {
            Self(self.bucket(bucket_size) * bucket_size)
        }
    }
}

impl Display for Watermark {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Watermark {
    type Err = KernelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|err| KernelError::Validation(format!("invalid watermark {value:?}: {err}")))
    }
}

/// Convert a timestamp into unix milliseconds, saturating outside the `i64` range.
#[must_use]
pub fn unix_millis(value: time::OffsetDateTime) -> i64 {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

/// Inverse of [`unix_millis`].
///
/// # Errors
/// Returns [`KernelError::Validation`] when the value is outside the supported range.
pub fn from_unix_millis(value: i64) -> Result<time::OffsetDateTime, KernelError> {
    time::OffsetDateTime::from_unix_timestamp_nanos(i128::from(value) * 1_000_000)
        .map_err(|err| KernelError::Validation(format!("timestamp {value}ms out of range: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_bucket_groups_consecutive_versions() {
        assert_eq!(Watermark(0).bucket(10), 0);
        assert_eq!(Watermark(9).bucket(10), 0);
        assert_eq!(Watermark(10).bucket(10), 1);
        assert_eq!(Watermark(42).bucket(1), 42);
        assert_eq!(Watermark(42).bucket(0), 42);
        assert_eq!(Watermark(19).bucket_floor(10), Watermark(10));
        assert_eq!(Watermark(19).bucket_floor(1), Watermark(19));
    }

    #[test]
    fn watermark_parses_and_rejects_garbage() {
        assert_eq!("17".parse::<Watermark>(), Ok(Watermark(17)));
        assert!(matches!("x17".parse::<Watermark>(), Err(KernelError::Validation(_))));
    }

    #[test]
    fn unix_millis_round_trip_truncates_to_millis() -> Result<(), KernelError> {
        let value = time::OffsetDateTime::UNIX_EPOCH + time::Duration::milliseconds(1_700_000_000_123);
        assert_eq!(from_unix_millis(unix_millis(value))?, value);
        Ok(())
    }
}
