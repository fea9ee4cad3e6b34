//! Stampede-safe get-or-compute.
//!
//! Concurrent requests for one fingerprint are collapsed twice: inside the
//! process through a shared in-flight table, and across processes through a
//! durable claim in tier-2. Exactly one owner computes; everyone else waits
//! for its artifact, its failure memo, or the claim to lapse.
//!
//! Each computation is driven by its own spawned task, so a caller that stops
//! waiting never strands the claim or the other waiters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use precompute_core::{
    CachedArtifact, ClaimOutcome, ComputationClaim, CoordinatorConfig, FailureMemo, Fingerprint,
    FingerprintComputer, KernelError, MetricQuery, Watermark,
};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactStore, Lookup};
use crate::backoff::BackoffPolicy;
use crate::executor::StoreExecutor;
use crate::source::{
    blocking_with_deadline, call_source, ComputeError, Deadline, MetadataSource, MetricComputer,
};

/// How a request was satisfied.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactOrigin {
    /// A fresh artifact was already stored.
    Hit,
    /// This process computed and published it.
    Computed,
    /// Another request or process computed it while this one waited.
    Joined,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ComputedArtifact {
    pub artifact: CachedArtifact,
    pub origin: ArtifactOrigin,
}

type SharedResult = Result<(CachedArtifact, ArtifactOrigin), KernelError>;
type InflightSlot = watch::Receiver<Option<SharedResult>>;
/// Requests only share a computation when they also need the same freshness.
type InflightKey = (Fingerprint, Watermark);

/// Keeps a computation's in-flight slot registered for as long as its driver lives.
///
/// Dropping it, whether the driver finished, panicked or was cancelled, frees
/// the slot so later requests start a new computation instead of joining a dead one.
struct InflightEntry {
    inner: Arc<Inner>,
    key: InflightKey,
}

impl Drop for InflightEntry {
    fn drop(&mut self) {
        self.inner.inflight.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.key);
    }
}

enum OwnerOutcome {
    Published(CachedArtifact),
    /// The claim lapsed and was taken over before this owner could proceed.
    LostClaim,
}

enum WaitOutcome {
    Published(CachedArtifact),
    Reclaimable,
}

struct Inner {
    owner: String,
    fingerprints: FingerprintComputer,
    store: ArtifactStore,
    source: Arc<dyn MetadataSource>,
    computer: Arc<dyn MetricComputer>,
    config: CoordinatorConfig,
    backoff: BackoffPolicy,
    admission: Arc<Semaphore>,
    inflight: Mutex<HashMap<InflightKey, InflightSlot>>,
}

#[derive(Clone)]
pub struct ComputationCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ComputationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationCoordinator")
            .field("owner", &self.inner.owner)
            .finish_non_exhaustive()
    }
}

fn fingerprint_text(fingerprint: Fingerprint) -> String {
    fingerprint.to_hex()
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl ComputationCoordinator {
    #[must_use]
    pub fn new(
        store: ArtifactStore,
        fingerprints: FingerprintComputer,
        source: Arc<dyn MetadataSource>,
        computer: Arc<dyn MetricComputer>,
        config: CoordinatorConfig,
    ) -> Self {
        let owner = config
            .owner_id
            .clone()
            .unwrap_or_else(|| format!("precompute-{}", ulid::Ulid::new()));
        Self {
            inner: Arc::new(Inner {
                owner,
                fingerprints,
                store,
                source,
                computer,
                backoff: BackoffPolicy::from_config(&config),
                admission: Arc::new(Semaphore::new(config.max_inflight.max(1))),
                config,
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Claim owner name this process uses.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    #[must_use]
    pub fn fingerprints(&self) -> &FingerprintComputer {
        &self.inner.fingerprints
    }

    #[must_use]
    pub fn store(&self) -> &ArtifactStore {
        &self.inner.store
    }

    /// Distinct computations currently in flight in this process.
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.inner.inflight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Current upstream watermark, read with deadline and retries.
    ///
    /// # Errors
    /// Returns [`KernelError::TransientSource`] when the source stays unavailable.
    pub async fn current_watermark(&self) -> Result<Watermark, KernelError> {
        self.inner.current_watermark().await
    }

    /// Return a fresh artifact for `query`, computing it at most once across
    /// every process sharing the store.
    ///
    /// # Errors
    /// - [`KernelError::Validation`] for malformed queries.
    /// - [`KernelError::TransientSource`] when the source or computation keeps failing transiently.
    /// - [`KernelError::ComputationTimeout`] when this process's computation overran.
    /// - [`KernelError::ComputationFailed`] when the computation failed permanently.
    /// - [`KernelError::Backpressure`] when too many computations are already in flight.
    /// - [`KernelError::WaiterTimeout`] when no result arrived within the waiter deadline.
    pub async fn get_or_compute(&self, query: MetricQuery) -> Result<ComputedArtifact, KernelError> {
        let inner = &self.inner;
        let watermark = inner.current_watermark().await?;
        let required = match query.min_watermark {
            Some(min) if min > watermark => {
                return Err(KernelError::TransientSource(format!(
                    "source is at watermark {watermark} but {min} is required"
                )));
            }
            Some(min) => min.max(watermark.bucket_floor(inner.fingerprints.bucket_size())),
            None => watermark.bucket_floor(inner.fingerprints.bucket_size()),
        };
        let fingerprint = inner.fingerprints.fingerprint(&query, watermark)?;

        match inner.store.lookup(fingerprint, required).await? {
            Lookup::Hit { artifact, tier } => {
                debug!(%fingerprint, ?tier, "artifact hit");
                return Ok(ComputedArtifact { artifact, origin: ArtifactOrigin::Hit });
            }
            Lookup::Invalid { artifact, freshness } => {
                debug!(
                    %fingerprint,
                    ?freshness,
                    found = %artifact.source_watermark,
                    %required,
                    "recomputing invalid artifact"
                );
            }
            Lookup::Miss => {}
        }

        let (slot, leader) = self.join_or_start(fingerprint, query, watermark, required).await?;
        let waited = Instant::now();
        let result = tokio::time::timeout(inner.config.waiter_timeout(), wait_slot(slot))
            .await
            .map_err(|_| KernelError::WaiterTimeout {
                fingerprint: fingerprint_text(fingerprint),
                waited_ms: millis(waited.elapsed()),
            })?;
        let (artifact, origin) = result?;
        let origin = if leader { origin } else { ArtifactOrigin::Joined };
        Ok(ComputedArtifact { artifact, origin })
    }

    /// Attach to the in-flight computation for `fingerprint`, or admit and start one.
    async fn join_or_start(
        &self,
        fingerprint: Fingerprint,
        query: MetricQuery,
        watermark: Watermark,
        required: Watermark,
    ) -> Result<(InflightSlot, bool), KernelError> {
        let inner = &self.inner;
        let key = (fingerprint, required);
        if let Some(slot) = inner.inflight_slot(key) {
            return Ok((slot, false));
        }

        let permit = inner.admit().await?;

        let (sender, receiver) = watch::channel(None);
        {
            let mut inflight = inner.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(slot) = inflight.get(&key) {
                return Ok((slot.clone(), false));
            }
            inflight.insert(key, receiver.clone());
        }

        let entry = InflightEntry { inner: Arc::clone(inner), key };
        tokio::spawn(async move {
            let result = entry.inner.drive(fingerprint, &query, watermark, required).await;
            drop(permit);
            drop(entry);
            // Nobody may be listening any more; the artifact is stored either way.
            let _ = sender.send(Some(result));
        });
        Ok((receiver, true))
    }
}

async fn wait_slot(mut slot: InflightSlot) -> SharedResult {
    loop {
        let current = slot.borrow_and_update().clone();
        if let Some(result) = current {
            return result;
        }
        if slot.changed().await.is_err() {
            let last = slot.borrow().clone();
            return last.unwrap_or_else(|| {
                Err(KernelError::Storage("computation task ended without a result".to_string()))
            });
        }
    }
}

impl Inner {
    fn inflight_slot(&self, key: InflightKey) -> Option<InflightSlot> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner).get(&key).cloned()
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit, KernelError> {
        let limit = self.config.max_inflight;
        match tokio::time::timeout(
            self.config.admission_wait(),
            Arc::clone(&self.admission).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) | Err(_) => {
                warn!(limit, "rejecting computation: admission queue is full");
                Err(KernelError::Backpressure { limit })
            }
        }
    }

    async fn current_watermark(&self) -> Result<Watermark, KernelError> {
        call_source(
            &self.source,
            self.config.source_timeout(),
            &self.backoff,
            self.config.max_attempts,
            "current watermark",
            |source| source.current_watermark(),
        )
        .await
    }

    fn executor(&self) -> &StoreExecutor {
        self.store.executor()
    }

    /// Claim, wait or recover until the fingerprint has an artifact or a definitive failure.
    async fn drive(
        &self,
        fingerprint: Fingerprint,
        query: &MetricQuery,
        watermark: Watermark,
        required: Watermark,
    ) -> SharedResult {
        let started = Instant::now();
        let deadline = started + self.config.waiter_timeout();
        loop {
            let now = OffsetDateTime::now_utc();
            let owner = self.owner.clone();
            let ttl = self.config.claim_ttl();
            let outcome = self
                .executor()
                .run(move |store| store.try_claim(fingerprint, &owner, now, ttl))
                .await?;

            match outcome {
                ClaimOutcome::Acquired { claim, recovered_from } => {
                    if let Some(previous) = recovered_from {
                        info!(
                            %fingerprint,
                            previous_owner = %previous,
                            attempt = claim.attempt,
                            "took over expired computation claim"
                        );
                    }
                    if let Lookup::Hit { artifact, .. } =
                        self.store.lookup(fingerprint, required).await?
                    {
                        self.release(&claim).await;
                        return Ok((artifact, ArtifactOrigin::Joined));
                    }
                    match self.compute_as_owner(&claim, query, watermark).await? {
                        OwnerOutcome::Published(artifact) => {
                            return Ok((artifact, ArtifactOrigin::Computed));
                        }
                        OwnerOutcome::LostClaim => {
                            warn!(%fingerprint, "computation claim lapsed before work began");
                        }
                    }
                }
                ClaimOutcome::Held { claim } => {
                    debug!(%fingerprint, owner = %claim.owner, "waiting on computation claim");
                    match self.wait_for_owner(fingerprint, required, claim, started, deadline).await? {
                        WaitOutcome::Published(artifact) => {
                            return Ok((artifact, ArtifactOrigin::Joined));
                        }
                        WaitOutcome::Reclaimable => {
                            debug!(%fingerprint, "claim released without artifact; reclaiming");
                        }
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(KernelError::WaiterTimeout {
                    fingerprint: fingerprint_text(fingerprint),
                    waited_ms: millis(started.elapsed()),
                });
            }
        }
    }

    async fn release(&self, claim: &ComputationClaim) {
        let fingerprint = claim.fingerprint;
        let held = claim.clone();
        if let Err(err) = self.executor().run(move |store| store.release_claim(&held)).await {
            // The claim lapses on its own once its TTL passes.
            warn!(%fingerprint, error = %err, "failed to release computation claim");
        }
    }

    async fn compute_as_owner(
        &self,
        claim: &ComputationClaim,
        query: &MetricQuery,
        watermark: Watermark,
    ) -> Result<OwnerOutcome, KernelError> {
        let fingerprint = claim.fingerprint;
        let mut attempt = 1;
        loop {
            let now = OffsetDateTime::now_utc();
            let expires_at = now + self.config.claim_ttl();
            let held = claim.clone();
            let still_owner = self
                .executor()
                .run(move |store| store.begin_computing(&held, now, expires_at))
                .await?;
            if !still_owner {
                return Ok(OwnerOutcome::LostClaim);
            }

            let computer = Arc::clone(&self.computer);
            let job = query.clone();
            let timeout = self.config.compute_timeout();
            let outcome =
                blocking_with_deadline(timeout, move || computer.compute(&job, watermark)).await;

            let error = match outcome {
                Deadline::Finished(Ok(payload)) => {
                    let artifact = self.artifact_for(fingerprint, query, payload, watermark);
                    let published = self.store.publish(artifact).await;
                    self.release(claim).await;
                    let kept = published?;
                    info!(
                        %fingerprint,
                        kind = %query.kind,
                        %watermark,
                        kept_watermark = %kept.source_watermark,
                        attempt,
                        "published computed artifact"
                    );
                    return Ok(OwnerOutcome::Published(kept));
                }
                Deadline::Elapsed => {
                    let held = claim.clone();
                    let expired_at = OffsetDateTime::now_utc();
                    if let Err(err) = self
                        .executor()
                        .run(move |store| store.expire_claim(&held, expired_at))
                        .await
                    {
                        warn!(%fingerprint, error = %err, "failed to expire overrun claim");
                    }
                    warn!(%fingerprint, timeout_ms = millis(timeout), "computation overran");
                    return Err(KernelError::ComputationTimeout {
                        fingerprint: fingerprint_text(fingerprint),
                        timeout_ms: millis(timeout),
                    });
                }
                Deadline::Panicked(message) => {
                    ComputeError::Permanent(format!("computation panicked: {message}"))
                }
                Deadline::Finished(Err(err)) => err,
            };

            match error {
                ComputeError::Transient(message) if attempt < self.config.max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        %fingerprint,
                        attempt,
                        delay_ms = millis(delay),
                        error = %message,
                        "transient computation failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                ComputeError::Transient(message) => {
                    self.release(claim).await;
                    warn!(%fingerprint, attempt, error = %message, "transient retries exhausted");
                    return Err(KernelError::TransientSource(format!(
                        "{message} (after {attempt} attempts)"
                    )));
                }
                ComputeError::Permanent(message) => {
                    self.remember_failure(fingerprint, &message).await;
                    self.release(claim).await;
                    warn!(%fingerprint, error = %message, "computation failed permanently");
                    return Err(KernelError::ComputationFailed {
                        fingerprint: fingerprint_text(fingerprint),
                        message,
                    });
                }
            }
        }
    }

    fn artifact_for(
        &self,
        fingerprint: Fingerprint,
        query: &MetricQuery,
        payload: serde_json::Value,
        watermark: Watermark,
    ) -> CachedArtifact {
        let (ttl_secs, clamped) = self.store.config().effective_ttl(query.ttl_secs);
        if clamped {
            warn!(
                %fingerprint,
                requested = ?query.ttl_secs,
                ttl_secs,
                "requested TTL exceeds the ceiling; clamping"
            );
        }
        CachedArtifact {
            fingerprint,
            query_kind: query.kind.clone(),
            payload,
            created_at: OffsetDateTime::now_utc(),
            source_watermark: watermark,
            ttl_secs,
        }
    }

    async fn remember_failure(&self, fingerprint: Fingerprint, message: &str) {
        let failed_at = OffsetDateTime::now_utc();
        let memo = FailureMemo {
            fingerprint,
            owner: self.owner.clone(),
            message: message.to_string(),
            failed_at,
            expires_at: failed_at + self.config.failure_memo(),
        };
        if let Err(err) = self.executor().run(move |store| store.record_failure(&memo)).await {
            warn!(%fingerprint, error = %err, "failed to record failure memo");
        }
    }

    /// Poll until the claim holder publishes, fails, or lets the claim go.
    async fn wait_for_owner(
        &self,
        fingerprint: Fingerprint,
        required: Watermark,
        mut claim: ComputationClaim,
        started: Instant,
        deadline: Instant,
    ) -> Result<WaitOutcome, KernelError> {
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(KernelError::WaiterTimeout {
                    fingerprint: fingerprint_text(fingerprint),
                    waited_ms: millis(started.elapsed()),
                });
            }
            tokio::time::sleep(self.config.poll_interval().min(left)).await;

            if let Lookup::Hit { artifact, .. } = self.store.lookup(fingerprint, required).await? {
                return Ok(WaitOutcome::Published(artifact));
            }

            // The owner records its failure memo before releasing the claim, so
            // reading the claim first guarantees a released claim's memo is visible.
            let now = OffsetDateTime::now_utc();
            let current = self.executor().run(move |store| store.get_claim(fingerprint)).await?;
            let memo = self.executor().run(move |store| store.get_failure(fingerprint)).await?;
            if let Some(memo) = memo {
                if memo.is_active(now) && memo.failed_at >= claim.claimed_at {
                    return Err(KernelError::ComputationFailed {
                        fingerprint: fingerprint_text(fingerprint),
                        message: memo.message,
                    });
                }
            }

            match current {
                None => return Ok(WaitOutcome::Reclaimable),
                Some(current) if !current.is_live(now) => return Ok(WaitOutcome::Reclaimable),
                Some(current) => {
                    if current.owner != claim.owner || current.claimed_at != claim.claimed_at {
                        debug!(%fingerprint, owner = %current.owner, "claim changed hands");
                        claim = current;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use precompute_core::{CacheConfig, FingerprintConfig, QueryParams, StoreConfig, TimeRange};
    use serde_json::{json, Value};

    use super::*;
    use crate::cache::NullCache;
    use crate::source::{ActivityRecord, SourceError};

    struct FixedSource;

    impl MetadataSource for FixedSource {
        fn current_watermark(&self) -> Result<Watermark, SourceError> {
            Ok(Watermark(1))
        }

        fn activity(&self, _range: &TimeRange) -> Result<Vec<ActivityRecord>, SourceError> {
            Ok(Vec::new())
        }
    }

    struct EchoComputer;

    impl MetricComputer for EchoComputer {
        fn compute(&self, query: &MetricQuery, watermark: Watermark) -> Result<Value, ComputeError> {
            Ok(json!({"kind": query.kind, "watermark": watermark.0}))
        }
    }

    fn coordinator(dir: &tempfile::TempDir) -> anyhow::Result<ComputationCoordinator> {
        let executor = StoreExecutor::start(&StoreConfig {
            path: dir.path().join("coordinator.sqlite3"),
            workers: 1,
        })?;
        let store =
            ArtifactStore::new(Arc::new(executor), Arc::new(NullCache), CacheConfig::default());
        let config = CoordinatorConfig {
            owner_id: Some("unit".to_string()),
            poll_interval_ms: 10,
            ..CoordinatorConfig::default()
        };
        Ok(ComputationCoordinator::new(
            store,
            FingerprintComputer::from_config(&FingerprintConfig::default()),
            Arc::new(FixedSource),
            Arc::new(EchoComputer),
            config,
        ))
    }

    fn query() -> MetricQuery {
        MetricQuery::new("deploy-frequency", QueryParams::new().with_scalar("team", "platform"))
    }

    #[tokio::test]
    async fn crashed_driver_frees_its_inflight_slot() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let coordinator = coordinator(&dir)?;
        let fingerprint = coordinator.fingerprints().fingerprint(&query(), Watermark(1))?;
        let key = (fingerprint, Watermark(1));

        let (sender, receiver) = watch::channel(None);
        coordinator.inner.inflight.lock().unwrap_or_else(PoisonError::into_inner).insert(key, receiver);
        let entry = InflightEntry { inner: Arc::clone(&coordinator.inner), key };
        let crashed = tokio::spawn(async move {
            let _entry = entry;
            let _sender = sender;
            panic!("driver crashed before publishing");
        });
        assert!(crashed.await.is_err());
        assert_eq!(coordinator.inflight(), 0);

        let computed = coordinator.get_or_compute(query()).await?;
        assert_eq!(computed.origin, ArtifactOrigin::Computed);
        assert_eq!(computed.artifact.payload["kind"], json!("deploy-frequency"));
        Ok(())
    }

    #[tokio::test]
    async fn waiter_timeout_reports_time_actually_waited() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let coordinator = coordinator(&dir)?;
        let fingerprint = coordinator.fingerprints().fingerprint(&query(), Watermark(1))?;
        let now = OffsetDateTime::now_utc();
        let outcome = coordinator
            .store()
            .executor()
            .run(move |store| {
                store.try_claim(fingerprint, "other-process", now, Duration::from_secs(60))
            })
            .await?;
        let claim = match outcome {
            ClaimOutcome::Acquired { claim, .. } | ClaimOutcome::Held { claim } => claim,
        };

        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let deadline = Instant::now() + Duration::from_millis(50);
        let result =
            coordinator.inner.wait_for_owner(fingerprint, Watermark(1), claim, started, deadline).await;

        match result {
            Err(KernelError::WaiterTimeout { waited_ms, .. }) => {
                assert!(waited_ms >= 250, "waited {waited_ms}ms");
                assert!(waited_ms < coordinator.inner.config.waiter_timeout_ms, "waited {waited_ms}ms");
            }
            Err(err) => panic!("expected a waiter timeout, got {err}"),
            Ok(_) => panic!("nobody published, the wait cannot succeed"),
        }
        Ok(())
    }
}
