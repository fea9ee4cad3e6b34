//! Async service layer of the precomputation kernel.
//!
//! [`PrecomputeKernel`] wires the pure domain from `precompute-core` to the
//! `SQLite` store and to the host's collaborators: the upstream metadata
//! source, the metric computation, the tier-1 cache and the codec key provider.

use std::sync::Arc;

use precompute_core::{
    CanonicalId, FingerprintComputer, IdentifierCodec, InvalidationScope, KernelError, KeyProvider,
    MetricQuery, PersistentFact, PrecomputeConfig, RawIdentifier, TimeRange,
};
use serde::Serialize;
use tracing::info;

pub mod artifacts;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod executor;
pub mod facts;
pub mod identity;
pub mod keys;
pub mod metrics;
pub mod source;
pub mod warmer;

pub use artifacts::{ArtifactStore, InvalidationReport, Lookup, Tier};
pub use cache::{cache_key, ArtifactCache, CacheError, MemoryCache, NullCache};
pub use config::load_config;
pub use coordinator::{ArtifactOrigin, ComputationCoordinator, ComputedArtifact};
pub use executor::{ExecutorError, StoreExecutor};
pub use facts::{FactAppend, FactLog};
pub use identity::{IdentityService, IdentityView, MergeResult, Resolution, ResolutionOutcome};
pub use keys::EnvKeyProvider;
pub use metrics::CacheMetricsSnapshot;
pub use source::{ActivityRecord, ComputeError, MetadataSource, MetricComputer, SourceError};
pub use warmer::{CacheWarmer, WarmReport};

pub const API_CONTRACT_VERSION: &str = "precompute.api.v1";

/// Host-provided dependencies of the kernel.
pub struct Collaborators {
    pub source: Arc<dyn MetadataSource>,
    pub computer: Arc<dyn MetricComputer>,
    pub cache: Arc<dyn ArtifactCache>,
    pub keys: Arc<dyn KeyProvider>,
}

/// Outcome of resolving one activity record's author.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ContributorStatus {
    Resolved { canonical_id: CanonicalId },
    /// Queued for review; the record is not attributed yet.
    NeedsReview { code: String, message: String },
    Rejected { code: String, message: String },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ContributorResolution {
    pub record: ActivityRecord,
    #[serde(flatten)]
    pub status: ContributorStatus,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub purged_artifacts: usize,
    pub reaped_claims: usize,
    pub purged_failures: usize,
}

pub struct PrecomputeKernel {
    config: PrecomputeConfig,
    executor: Arc<StoreExecutor>,
    artifacts: ArtifactStore,
    coordinator: ComputationCoordinator,
    identities: IdentityService,
    codec: IdentifierCodec,
    facts: FactLog,
    source: Arc<dyn MetadataSource>,
}

impl std::fmt::Debug for PrecomputeKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrecomputeKernel")
            .field("db_path", &self.executor.db_path())
            .field("owner", &self.coordinator.owner())
            .finish_non_exhaustive()
    }
}

impl PrecomputeKernel {
    /// Validate `config`, open and migrate the store, and load the identity ledger.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for invalid configuration and
    /// [`KernelError::Storage`] when the store cannot be opened.
    pub async fn open(
        config: PrecomputeConfig,
        collaborators: Collaborators,
    ) -> Result<Self, KernelError> {
        config.validate()?;
        let store_config = config.store.clone();
        let executor = tokio::task::spawn_blocking(move || StoreExecutor::start(&store_config))
            .await
            .map_err(|err| KernelError::Storage(format!("store startup task failed: {err}")))?
            .map_err(|err| KernelError::Storage(format!("{err:#}")))?;
        let executor = Arc::new(executor);

        let artifacts =
            ArtifactStore::new(Arc::clone(&executor), collaborators.cache, config.cache.clone());
        let coordinator = ComputationCoordinator::new(
            artifacts.clone(),
            FingerprintComputer::from_config(&config.fingerprint),
            Arc::clone(&collaborators.source),
            collaborators.computer,
            config.coordinator.clone(),
        );
        let identities = IdentityService::new(Arc::clone(&executor), &config.resolver)?;
        let loaded = identities.sync().await?;
        let codec = IdentifierCodec::new(collaborators.keys, config.codec.key_id.clone());
        let facts = FactLog::new(Arc::clone(&executor));

        info!(
            db_path = %config.store.path.display(),
            owner = coordinator.owner(),
            identity_events = loaded,
            "precompute kernel opened"
        );
        Ok(Self {
            config,
            executor,
            artifacts,
            coordinator,
            identities,
            codec,
            facts,
            source: collaborators.source,
        })
    }

    #[must_use]
    pub fn config(&self) -> &PrecomputeConfig {
        &self.config
    }

    #[must_use]
    pub fn coordinator(&self) -> &ComputationCoordinator {
        &self.coordinator
    }

    #[must_use]
    pub fn identities(&self) -> &IdentityService {
        &self.identities
    }

    #[must_use]
    pub fn codec(&self) -> &IdentifierCodec {
        &self.codec
    }

    #[must_use]
    pub fn facts(&self) -> &FactLog {
        &self.facts
    }

    #[must_use]
    pub fn cache_metrics(&self) -> CacheMetricsSnapshot {
        self.artifacts.metrics()
    }

    /// # Errors
    /// See [`ComputationCoordinator::get_or_compute`].
    pub async fn get_or_compute(&self, query: MetricQuery) -> Result<ComputedArtifact, KernelError> {
        self.coordinator.get_or_compute(query).await
    }

    /// # Errors
    /// Returns [`KernelError::Storage`] when tier-2 cannot be updated.
    pub async fn invalidate(
        &self,
        scope: InvalidationScope,
    ) -> Result<InvalidationReport, KernelError> {
        self.artifacts.invalidate(scope).await
    }

    pub async fn warm(&self, queries: Vec<MetricQuery>, concurrency: usize) -> WarmReport {
        CacheWarmer::new(self.coordinator.clone(), concurrency).warm(queries).await
    }

    /// # Errors
    /// See [`IdentityService::resolve`].
    pub async fn resolve_identity(&self, raw: &RawIdentifier) -> Result<Resolution, KernelError> {
        self.identities.resolve(raw).await
    }

    /// # Errors
    /// See [`IdentityService::merge`].
    pub async fn merge_identities(
        &self,
        a: CanonicalId,
        b: CanonicalId,
        writer: &str,
        reason: &str,
    ) -> Result<MergeResult, KernelError> {
        self.identities.merge(a, b, writer, reason).await
    }

    /// # Errors
    /// Returns [`KernelError::KeyUnavailable`] or [`KernelError::Validation`].
    pub fn encode_identifier(&self, identifier: &str) -> Result<String, KernelError> {
        self.codec.encode(identifier)
    }

    /// # Errors
    /// Returns [`KernelError::KeyUnavailable`] or [`KernelError::Validation`].
    pub fn decode_identifier(&self, token: &str) -> Result<String, KernelError> {
        self.codec.decode(token)
    }

    /// # Errors
    /// See [`FactLog::append`].
    pub async fn append_fact(&self, fact: PersistentFact) -> Result<FactAppend, KernelError> {
        self.facts.append(fact).await
    }

    /// # Errors
    /// See [`FactLog::query`].
    pub async fn query_facts(
        &self,
        subject_id: &str,
        range: TimeRange,
    ) -> Result<Vec<PersistentFact>, KernelError> {
        self.facts.query(subject_id, range, None).await
    }

    /// Pull raw activity for `range` from the source and resolve every author.
    ///
    /// # Errors
    /// Returns [`KernelError::TransientSource`] when the source cannot be read.
    /// Per-record resolution failures are reported in the result instead.
    pub async fn resolve_activity_contributors(
        &self,
        range: TimeRange,
    ) -> Result<Vec<ContributorResolution>, KernelError> {
        let coordinator = &self.config.coordinator;
        let records = source::call_source(
            &self.source,
            coordinator.source_timeout(),
            &backoff::BackoffPolicy::from_config(coordinator),
            coordinator.max_attempts,
            "activity",
            move |source| source.activity(&range),
        )
        .await?;

        let mut resolved = Vec::with_capacity(records.len());
        for record in records {
            let status = match RawIdentifier::new(record.source, record.author.clone()) {
                Err(err) => ContributorStatus::Rejected {
                    code: err.code().to_string(),
                    message: err.to_string(),
                },
                Ok(raw) => match self.identities.resolve(&raw).await {
                    Ok(resolution) => {
                        ContributorStatus::Resolved { canonical_id: resolution.canonical_id }
                    }
                    Err(err @ KernelError::IdentityAmbiguous { .. }) => {
                        ContributorStatus::NeedsReview {
                            code: err.code().to_string(),
                            message: err.to_string(),
                        }
                    }
                    Err(err) if err.is_retryable() => return Err(err),
                    Err(err) => ContributorStatus::Rejected {
                        code: err.code().to_string(),
                        message: err.to_string(),
                    },
                },
            };
            resolved.push(ContributorResolution { record, status });
        }
        Ok(resolved)
    }

    /// Drop expired artifacts, expired claims and stale failure memos.
    ///
    /// # Errors
    /// Returns [`KernelError::Storage`] when tier-2 cannot be updated.
    pub async fn housekeeping(&self) -> Result<HousekeepingReport, KernelError> {
        let purged_artifacts = self.artifacts.purge_expired().await?.len();
        let now = time::OffsetDateTime::now_utc();
        let (reaped_claims, purged_failures) = self
            .executor
            .run(move |store| {
                Ok((store.reap_expired_claims(now)?, store.purge_expired_failures(now)?))
            })
            .await?;
        info!(purged_artifacts, reaped_claims, purged_failures, "housekeeping finished");
        Ok(HousekeepingReport { purged_artifacts, reaped_claims, purged_failures })
    }

    /// Stop the store workers after queued operations drain.
    ///
    /// Computations still in flight fail with [`KernelError::Storage`] from here on.
    pub async fn shutdown(self) {
        let executor = Arc::clone(&self.executor);
        drop(self);
        if let Err(err) = tokio::task::spawn_blocking(move || executor.shutdown()).await {
            tracing::error!(error = %err, "store shutdown task failed");
        }
    }
}
