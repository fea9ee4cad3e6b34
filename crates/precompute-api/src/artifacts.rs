//! Two-tier artifact store: tier-1 [`ArtifactCache`] over the durable tier-2 table.
//!
//! Tier-2 is authoritative. Writes go to tier-2 first and invalidations remove
//! from tier-2 first, so tier-1 never holds anything tier-2 has not seen.

use std::sync::Arc;
use std::time::{Duration, Instant};

use precompute_core::{
    CacheConfig, CachedArtifact, Fingerprint, Freshness, InvalidationScope, KernelError, Watermark,
};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::cache::{cache_key, ArtifactCache};
use crate::executor::StoreExecutor;
use crate::metrics::{CacheMetrics, CacheMetricsSnapshot};

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Memory,
    Durable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit { artifact: CachedArtifact, tier: Tier },
    /// Tier-2 held an artifact that was stale or expired; it has been evicted.
    Invalid { artifact: CachedArtifact, freshness: Freshness },
    Miss,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InvalidationReport {
    pub scope: InvalidationScope,
    pub removed: Vec<Fingerprint>,
    pub tier1_errors: usize,
}

#[derive(Clone)]
pub struct ArtifactStore {
    executor: Arc<StoreExecutor>,
    cache: Arc<dyn ArtifactCache>,
    config: CacheConfig,
    metrics: Arc<CacheMetrics>,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore").field("config", &self.config).finish_non_exhaustive()
    }
}

impl ArtifactStore {
    #[must_use]
    pub fn new(
        executor: Arc<StoreExecutor>,
        cache: Arc<dyn ArtifactCache>,
        config: CacheConfig,
    ) -> Self {
        Self { executor, cache, config, metrics: Arc::new(CacheMetrics::default()) }
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<StoreExecutor> {
        &self.executor
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn key(&self, fingerprint: Fingerprint) -> Option<String> {
        match cache_key(&self.config.key_prefix, fingerprint) {
            Ok(key) => Some(key),
            Err(err) => {
                self.metrics.record_tier1_error();
                warn!(%fingerprint, error = %err, "skipping tier-1 cache");
                None
            }
        }
    }

    fn memory_lookup(
        &self,
        key: &str,
        fingerprint: Fingerprint,
        required: Watermark,
        now: OffsetDateTime,
    ) -> Option<CachedArtifact> {
        let artifact = match self.cache.get(key) {
            Ok(found) => found?,
            Err(err) => {
                self.metrics.record_tier1_error();
                warn!(%fingerprint, error = %err, "tier-1 read failed");
                return None;
            }
        };

        match artifact.freshness(required, now) {
            Freshness::Fresh => {
                if self.config.refresh_on_access {
                    if let Some(ttl) = artifact.remaining_ttl(now) {
                        if let Err(err) = self.cache.touch(key, ttl) {
                            self.metrics.record_tier1_error();
                            warn!(%fingerprint, error = %err, "tier-1 touch failed");
                        }
                    }
                }
                Some(artifact)
            }
            freshness => {
                debug!(%fingerprint, ?freshness, "dropping invalid tier-1 entry");
                self.delete_memory(key, fingerprint);
                None
            }
        }
    }

    fn delete_memory(&self, key: &str, fingerprint: Fingerprint) -> bool {
        match self.cache.delete(key) {
            Ok(()) => true,
            Err(err) => {
                self.metrics.record_tier1_error();
                warn!(%fingerprint, error = %err, "tier-1 delete failed");
                false
            }
        }
    }

    fn fill_memory(&self, key: &str, artifact: &CachedArtifact, ttl: Duration) {
        if let Err(err) = self.cache.set(key, artifact, ttl) {
            self.metrics.record_tier1_error();
            warn!(fingerprint = %artifact.fingerprint, error = %err, "tier-1 write failed");
        }
    }

    /// Find a fresh artifact, trying tier-1 then tier-2.
    ///
    /// A stale or expired tier-2 artifact is evicted and reported as
    /// [`Lookup::Invalid`]; it is never returned as a hit.
    ///
    /// # Errors
    /// Returns [`KernelError::Storage`] when tier-2 cannot be read.
    pub async fn lookup(
        &self,
        fingerprint: Fingerprint,
        required: Watermark,
    ) -> Result<Lookup, KernelError> {
        let started = Instant::now();
        let now = OffsetDateTime::now_utc();
        let key = self.key(fingerprint);

        if let Some(key) = key.as_deref() {
            if let Some(artifact) = self.memory_lookup(key, fingerprint, required, now) {
                self.metrics.record_hit(Tier::Memory, started.elapsed());
                return Ok(Lookup::Hit { artifact, tier: Tier::Memory });
            }
        }

        let Some(artifact) =
            self.executor.run(move |store| store.get_artifact(fingerprint)).await?
        else {
            self.metrics.record_miss(started.elapsed(), false);
            return Ok(Lookup::Miss);
        };

        match artifact.freshness(required, now) {
            Freshness::Fresh => {
                if let (Some(key), Some(ttl)) = (key.as_deref(), artifact.remaining_ttl(now)) {
                    self.fill_memory(key, &artifact, ttl);
                }
                self.metrics.record_hit(Tier::Durable, started.elapsed());
                Ok(Lookup::Hit { artifact, tier: Tier::Durable })
            }
            freshness => {
                let evicted = self
                    .executor
                    .run(move |store| store.evict_artifact_if_invalid(fingerprint, required, now))
                    .await?;
                debug!(
                    %fingerprint,
                    ?freshness,
                    found = %artifact.source_watermark,
                    %required,
                    evicted,
                    "tier-2 artifact is no longer valid"
                );
                self.metrics.record_miss(started.elapsed(), freshness == Freshness::Stale);
                Ok(Lookup::Invalid { artifact, freshness })
            }
        }
    }

    /// Write through: tier-2 must succeed, tier-1 is best effort.
    ///
    /// Returns the artifact tier-2 holds afterwards. That is `artifact` itself
    /// unless tier-2 already had a live artifact built at a newer watermark,
    /// which is kept and returned instead.
    ///
    /// # Errors
    /// Returns [`KernelError::Storage`] when tier-2 rejects the write.
    pub async fn publish(&self, artifact: CachedArtifact) -> Result<CachedArtifact, KernelError> {
        let payload_bytes = artifact.payload.to_string().len();
        let fingerprint = artifact.fingerprint;
        let stored = artifact.clone();
        let written = self.executor.run(move |store| store.upsert_artifact(&stored)).await?;
        let now = OffsetDateTime::now_utc();

        let kept = if written {
            self.metrics.record_publish(payload_bytes);
            artifact
        } else {
            match self.executor.run(move |store| store.get_artifact(fingerprint)).await? {
                Some(newer) if newer.remaining_ttl(now).is_some() => {
                    debug!(
                        %fingerprint,
                        offered = %artifact.source_watermark,
                        kept = %newer.source_watermark,
                        "tier-2 already holds a newer artifact; keeping it"
                    );
                    newer
                }
                _ => artifact,
            }
        };

        if let (Some(key), Some(ttl)) = (self.key(fingerprint), kept.remaining_ttl(now)) {
            self.fill_memory(&key, &kept, ttl);
        }
        Ok(kept)
    }

    /// Remove every artifact in `scope` from tier-2, then from tier-1.
    ///
    /// # Errors
    /// Returns [`KernelError::Storage`] when tier-2 cannot be updated.
    pub async fn invalidate(
        &self,
        scope: InvalidationScope,
    ) -> Result<InvalidationReport, KernelError> {
        let selected = scope.clone();
        let removed = self.executor.run(move |store| store.invalidate(&selected)).await?;
        let tier1_errors = self.drop_from_memory(&removed);
        debug!(?scope, removed = removed.len(), tier1_errors, "invalidated artifacts");
        Ok(InvalidationReport { scope, removed, tier1_errors })
    }

    /// Delete expired tier-2 artifacts and their tier-1 copies.
    ///
    /// # Errors
    /// Returns [`KernelError::Storage`] when tier-2 cannot be updated.
    pub async fn purge_expired(&self) -> Result<Vec<Fingerprint>, KernelError> {
        let now = OffsetDateTime::now_utc();
        let removed = self.executor.run(move |store| store.purge_expired_artifacts(now)).await?;
        self.drop_from_memory(&removed);
        Ok(removed)
    }

    fn drop_from_memory(&self, fingerprints: &[Fingerprint]) -> usize {
        fingerprints
            .iter()
            .filter(|fingerprint| match self.key(**fingerprint) {
                Some(key) => !self.delete_memory(&key, **fingerprint),
                None => true,
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, PoisonError};

    use precompute_core::StoreConfig;
    use serde_json::json;

    use super::*;
    use crate::cache::{CacheError, MemoryCache};

    struct BrokenCache;

    impl ArtifactCache for BrokenCache {
        fn get(&self, _key: &str) -> Result<Option<CachedArtifact>, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }

        fn set(&self, _: &str, _: &CachedArtifact, _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }

        fn touch(&self, _key: &str, _ttl: Duration) -> Result<bool, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }

        fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
    }

    /// Memory cache that records every TTL it is asked to re-arm.
    struct TouchRecorder {
        inner: MemoryCache,
        touched: Mutex<Vec<Duration>>,
    }

    impl TouchRecorder {
        fn new() -> Self {
            Self { inner: MemoryCache::new(8), touched: Mutex::new(Vec::new()) }
        }

        fn touched(&self) -> Vec<Duration> {
            self.touched.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    impl ArtifactCache for TouchRecorder {
        fn get(&self, key: &str) -> Result<Option<CachedArtifact>, CacheError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, artifact: &CachedArtifact, ttl: Duration) -> Result<(), CacheError> {
            self.inner.set(key, artifact, ttl)
        }

        fn touch(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
            self.touched.lock().unwrap_or_else(PoisonError::into_inner).push(ttl);
            self.inner.touch(key, ttl)
        }

        fn delete(&self, key: &str) -> Result<(), CacheError> {
            self.inner.delete(key)
        }
    }

    fn artifact(byte: u8, watermark: u64) -> CachedArtifact {
        CachedArtifact {
            fingerprint: Fingerprint::from_bytes([byte; 32]),
            query_kind: "pr-throughput".to_string(),
            payload: json!({"merged": u64::from(byte) * 10}),
            created_at: OffsetDateTime::now_utc(),
            source_watermark: Watermark(watermark),
            ttl_secs: 600,
        }
    }

    fn store_with(
        dir: &tempfile::TempDir,
        cache: Arc<dyn ArtifactCache>,
    ) -> anyhow::Result<ArtifactStore> {
        let executor = StoreExecutor::start(&StoreConfig {
            path: dir.path().join("artifacts.sqlite3"),
            workers: 1,
        })?;
        Ok(ArtifactStore::new(Arc::new(executor), cache, CacheConfig::default()))
    }

    #[tokio::test]
    async fn durable_hit_repopulates_memory_tier() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let memory = Arc::new(MemoryCache::new(8));
        let store = store_with(&dir, memory.clone())?;
        let artifact = artifact(1, 5);

        store.publish(artifact.clone()).await?;
        memory.delete(&cache_key("precompute:", artifact.fingerprint)?)?;

        let first = store.lookup(artifact.fingerprint, Watermark(5)).await?;
        assert!(matches!(first, Lookup::Hit { tier: Tier::Durable, .. }));
        let second = store.lookup(artifact.fingerprint, Watermark(5)).await?;
        assert!(matches!(second, Lookup::Hit { tier: Tier::Memory, .. }));

        let metrics = store.metrics();
        assert_eq!((metrics.memory_hits, metrics.durable_hits), (1, 1));
        Ok(())
    }

    #[tokio::test]
    async fn stale_artifacts_are_evicted_not_served() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_with(&dir, Arc::new(MemoryCache::new(8)))?;
        let artifact = artifact(2, 5);
        store.publish(artifact.clone()).await?;

        let lookup = store.lookup(artifact.fingerprint, Watermark(6)).await?;
        assert!(matches!(lookup, Lookup::Invalid { freshness: Freshness::Stale, .. }));
        assert_eq!(store.lookup(artifact.fingerprint, Watermark(5)).await?, Lookup::Miss);
        Ok(())
    }

    #[tokio::test]
    async fn tier1_outage_degrades_to_tier2() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_with(&dir, Arc::new(BrokenCache))?;
        let artifact = artifact(3, 1);

        store.publish(artifact.clone()).await?;
        let lookup = store.lookup(artifact.fingerprint, Watermark(1)).await?;
        assert!(matches!(lookup, Lookup::Hit { tier: Tier::Durable, .. }));

        let report = store.invalidate(InvalidationScope::Fingerprint(artifact.fingerprint)).await?;
        assert_eq!(report.removed, vec![artifact.fingerprint]);
        assert_eq!(report.tier1_errors, 1);
        assert_eq!(store.lookup(artifact.fingerprint, Watermark(1)).await?, Lookup::Miss);
        assert!(store.metrics().tier1_errors >= 3);
        Ok(())
    }

    #[tokio::test]
    async fn invalidation_clears_both_tiers() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let memory = Arc::new(MemoryCache::new(8));
        let store = store_with(&dir, memory.clone())?;
        store.publish(artifact(4, 1)).await?;
        store.publish(artifact(5, 9)).await?;
        assert_eq!(memory.len(), 2);

        let report = store.invalidate(InvalidationScope::WatermarkBefore(Watermark(5))).await?;
        assert_eq!(report.removed, vec![Fingerprint::from_bytes([4; 32])]);
        assert_eq!(memory.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn older_publish_does_not_replace_newer_artifact() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let memory = Arc::new(MemoryCache::new(8));
        let store = store_with(&dir, memory.clone())?;

        // Another process wrote the newer artifact straight to tier-2.
        let newer = artifact(6, 9);
        let written = newer.clone();
        assert!(store.executor().run(move |db| db.upsert_artifact(&written)).await?);

        let kept = store.publish(artifact(6, 3)).await?;
        assert_eq!(kept.source_watermark, Watermark(9));
        assert_eq!(kept.payload, newer.payload);
        assert_eq!(store.metrics().publishes, 0);

        match store.lookup(newer.fingerprint, Watermark(0)).await? {
            Lookup::Hit { artifact, tier } => {
                assert_eq!(tier, Tier::Memory);
                assert_eq!(artifact.source_watermark, Watermark(9));
            }
            other => panic!("expected a hit, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn memory_hits_rearm_ttl_only_when_refresh_is_enabled() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let recorder = Arc::new(TouchRecorder::new());
        let executor = Arc::new(StoreExecutor::start(&StoreConfig {
            path: dir.path().join("refresh.sqlite3"),
            workers: 1,
        })?);
        let refreshing = ArtifactStore::new(
            Arc::clone(&executor),
            recorder.clone(),
            CacheConfig { refresh_on_access: true, ..CacheConfig::default() },
        );
        let artifact = artifact(7, 2);
        refreshing.publish(artifact.clone()).await?;
        assert!(recorder.touched().is_empty());

        let before = OffsetDateTime::now_utc();
        let remaining = artifact.remaining_ttl(before).ok_or_else(|| anyhow::anyhow!("expired"))?;
        let hit = refreshing.lookup(artifact.fingerprint, Watermark(2)).await?;
        assert!(matches!(hit, Lookup::Hit { tier: Tier::Memory, .. }));
        let touched = recorder.touched();
        assert_eq!(touched.len(), 1);
        assert!(touched[0] <= remaining, "{:?} > {remaining:?}", touched[0]);
        assert!(touched[0] > remaining.saturating_sub(Duration::from_secs(5)));

        let plain = ArtifactStore::new(executor, recorder.clone(), CacheConfig::default());
        let hit = plain.lookup(artifact.fingerprint, Watermark(2)).await?;
        assert!(matches!(hit, Lookup::Hit { tier: Tier::Memory, .. }));
        assert_eq!(recorder.touched().len(), 1);
        Ok(())
    }
}
