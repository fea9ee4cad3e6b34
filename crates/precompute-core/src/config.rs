use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{KernelError, ResolverPolicy, ScoringWeights};

/// Longest lifetime any cached artifact may be given (30 days).
pub const MAX_TTL_CEILING_SECS: u64 = 30 * 24 * 60 * 60;

/// Top-level runtime configuration. Only `resolver` has no defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PrecomputeConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub codec: CodecConfig,
}

impl PrecomputeConfig {
    /// # Errors
    /// Returns [`KernelError::Validation`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), KernelError> {
        self.store.validate()?;
        self.cache.validate()?;
        self.coordinator.validate()?;
        self.resolver.policy().validate()?;
        if self.codec.key_id.trim().is_empty() {
            return Err(KernelError::Validation("codec.key_id must not be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Connections serving store requests, one per worker thread.
    pub workers: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("precompute.sqlite3"), workers: 2 }
    }
}

impl StoreConfig {
    fn validate(&self) -> Result<(), KernelError> {
        if self.workers == 0 {
            return Err(KernelError::Validation("store.workers must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Maximum entries held by the in-process tier-1 cache.
    pub capacity: usize,
    pub default_ttl_secs: u64,
    pub max_ttl_secs: u64,
    pub key_prefix: String,
    /// Re-arm the tier-1 TTL on every hit.
    pub refresh_on_access: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            default_ttl_secs: 60 * 60,
            max_ttl_secs: MAX_TTL_CEILING_SECS,
            key_prefix: "precompute:".to_string(),
            refresh_on_access: false,
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> Result<(), KernelError> {
        if self.default_ttl_secs == 0 {
            return Err(KernelError::Validation("cache.default_ttl_secs must be positive".to_string()));
        }
        if self.max_ttl_secs == 0 || self.max_ttl_secs > MAX_TTL_CEILING_SECS {
            return Err(KernelError::Validation(format!(
                "cache.max_ttl_secs must be in 1..={MAX_TTL_CEILING_SECS}"
            )));
        }
        if self.default_ttl_secs > self.max_ttl_secs {
            return Err(KernelError::Validation(format!(
                "cache.default_ttl_secs ({}) exceeds cache.max_ttl_secs ({})",
                self.default_ttl_secs, self.max_ttl_secs
            )));
        }
        if self.key_prefix.len() > 64
            || self.key_prefix.chars().any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(KernelError::Validation(
                "cache.key_prefix must be at most 64 printable non-space chars".to_string(),
            ));
        }
        Ok(())
    }

    /// TTL to store an artifact with, and whether an explicit request had to be clamped.
    #[must_use]
    pub fn effective_ttl(&self, requested: Option<u64>) -> (u64, bool) {
        let ceiling = self.max_ttl_secs.min(MAX_TTL_CEILING_SECS);
        match requested {
            Some(requested) if requested > ceiling => (ceiling, true),
            Some(requested) => (requested.max(1), false),
            None => (self.default_ttl_secs.clamp(1, ceiling.max(1)), false),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FingerprintConfig {
    /// Bump to invalidate every previously computed fingerprint.
    pub schema_version: u32,
    /// Watermarks in the same bucket share fingerprints.
    pub watermark_bucket: u64,
    /// Parameters that never influence computed output.
    pub ignored_params: Vec<String>,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self { schema_version: 1, watermark_bucket: 1, ignored_params: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Claim owner name; a fresh ULID per process when unset.
    pub owner_id: Option<String>,
    pub claim_ttl_ms: u64,
    pub compute_timeout_ms: u64,
    pub source_timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub waiter_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Distinct computations allowed in flight per process.
    pub max_inflight: usize,
    /// How long a new computation may queue for admission before backpressure.
    pub admission_wait_ms: u64,
    pub failure_memo_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            owner_id: None,
            claim_ttl_ms: 120_000,
            compute_timeout_ms: 60_000,
            source_timeout_ms: 5_000,
            max_attempts: 3,
            backoff_initial_ms: 200,
            backoff_max_ms: 5_000,
            backoff_multiplier: 2.0,
            waiter_timeout_ms: 90_000,
            poll_interval_ms: 100,
            max_inflight: 16,
            admission_wait_ms: 1_000,
            failure_memo_ms: 10_000,
        }
    }
}

impl CoordinatorConfig {
    fn validate(&self) -> Result<(), KernelError> {
        let positive = [
            ("claim_ttl_ms", self.claim_ttl_ms),
            ("compute_timeout_ms", self.compute_timeout_ms),
            ("source_timeout_ms", self.source_timeout_ms),
            ("waiter_timeout_ms", self.waiter_timeout_ms),
            ("poll_interval_ms", self.poll_interval_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(KernelError::Validation(format!("coordinator.{name} must be positive")));
            }
        }
        if self.compute_timeout_ms >= self.claim_ttl_ms {
            return Err(KernelError::Validation(
                "coordinator.compute_timeout_ms must be shorter than claim_ttl_ms".to_string(),
            ));
        }
        if self.max_attempts == 0 || self.max_inflight == 0 {
            return Err(KernelError::Validation(
                "coordinator.max_attempts and max_inflight must be at least 1".to_string(),
            ));
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(KernelError::Validation(
                "coordinator.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.owner_id.as_deref().is_some_and(|owner| owner.trim().is_empty()) {
            return Err(KernelError::Validation("coordinator.owner_id must not be blank".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn claim_ttl(&self) -> Duration {
        Duration::from_millis(self.claim_ttl_ms)
    }

    #[must_use]
    pub fn compute_timeout(&self) -> Duration {
        Duration::from_millis(self.compute_timeout_ms)
    }

    #[must_use]
    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    #[must_use]
    pub fn waiter_timeout(&self) -> Duration {
        Duration::from_millis(self.waiter_timeout_ms)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn admission_wait(&self) -> Duration {
        Duration::from_millis(self.admission_wait_ms)
    }

    #[must_use]
    pub fn failure_memo(&self) -> Duration {
        Duration::from_millis(self.failure_memo_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResolverConfig {
    pub acceptance_threshold: f64,
    pub ambiguity_band: f64,
    pub weights: ScoringWeights,
    #[serde(default = "default_max_merge_retries")]
    pub max_merge_retries: u32,
}

fn default_max_merge_retries() -> u32 {
    5
}

impl ResolverConfig {
    #[must_use]
    pub fn policy(&self) -> ResolverPolicy {
        ResolverPolicy {
            acceptance_threshold: self.acceptance_threshold,
            ambiguity_band: self.ambiguity_band,
            weights: self.weights,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CodecConfig {
    pub key_id: String,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self { key_id: "primary".to_string() }
    }
}
