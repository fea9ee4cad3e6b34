//! Identity resolution over the durable identity ledger.
//!
//! The in-memory [`IdentityIndex`] is a cache of the ledger. Decisions are
//! planned against it and committed with the revisions they were planned
//! against; a conflicting commit means another process moved first, so the
//! index is caught up and the decision re-planned.

use std::sync::{Arc, PoisonError, RwLock};

use precompute_core::{
    CanonicalId, Identity, IdentityCommit, IdentityEvent, IdentityIndex, KernelError, MergePlan,
    RawIdentifier, ResolutionPlan, ResolverConfig, ResolverPolicy,
};
use precompute_store_sqlite::{CommitOutcome, ReviewItem};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::executor::StoreExecutor;

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Known,
    Attached { score: f64 },
    Created,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Resolution {
    pub raw: RawIdentifier,
    pub canonical_id: CanonicalId,
    #[serde(flatten)]
    pub outcome: ResolutionOutcome,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MergeResult {
    pub canonical_id: CanonicalId,
    /// `false` when both ids already resolved to the same identity.
    pub merged: bool,
    pub sources: Vec<CanonicalId>,
}

/// Live identity as seen through any of its historical ids.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IdentityView {
    pub requested: CanonicalId,
    #[serde(flatten)]
    pub identity: Identity,
    pub merged_from: Vec<CanonicalId>,
}

pub struct IdentityService {
    executor: Arc<StoreExecutor>,
    index: RwLock<IdentityIndex>,
    policy: ResolverPolicy,
    max_retries: u32,
}

impl std::fmt::Debug for IdentityService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityService")
            .field("policy", &self.policy)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

fn require_text(field: &str, value: &str) -> Result<(), KernelError> {
    if value.trim().is_empty() {
        return Err(KernelError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

impl IdentityService {
    /// # Errors
    /// Returns [`KernelError::Validation`] when the resolver policy is invalid.
    pub fn new(executor: Arc<StoreExecutor>, config: &ResolverConfig) -> Result<Self, KernelError> {
        let policy = config.policy();
        policy.validate()?;
        Ok(Self {
            executor,
            index: RwLock::new(IdentityIndex::new()),
            policy,
            max_retries: config.max_merge_retries,
        })
    }

    /// Apply ledger events this process has not seen yet. Returns how many were applied.
    ///
    /// # Errors
    /// Returns [`KernelError::Storage`] when the ledger cannot be read.
    pub async fn sync(&self) -> Result<usize, KernelError> {
        let since = self.index.read().unwrap_or_else(PoisonError::into_inner).last_seq();
        let events = self.executor.run(move |store| store.identity_events_since(since)).await?;
        if events.is_empty() {
            return Ok(0);
        }
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let before = index.last_seq();
        for event in &events {
            index.apply(event)?;
        }
        let applied = events.iter().filter(|event| event.seq > before).count();
        debug!(applied, last_seq = index.last_seq(), "identity index caught up");
        Ok(applied)
    }

    async fn commit(&self, change: IdentityCommit) -> Result<Option<i64>, KernelError> {
        match self.executor.run(move |store| store.commit_identity_change(&change)).await? {
            CommitOutcome::Committed { seq } => {
                self.sync().await?;
                Ok(Some(seq))
            }
            CommitOutcome::Conflict { reason } => {
                debug!(%reason, "identity change conflicted; re-planning");
                Ok(None)
            }
        }
    }

    fn conflict_exhausted(&self, what: &str) -> KernelError {
        KernelError::Storage(format!(
            "{what} kept conflicting with concurrent changes after {} attempts",
            self.max_retries + 1
        ))
    }

    /// Map a raw identifier to its canonical identity, attaching or creating as needed.
    ///
    /// # Errors
    /// - [`KernelError::IdentityAmbiguous`] when the best candidate falls inside the
    ///   ambiguity band; the identifier is queued for review.
    /// - [`KernelError::Validation`] for malformed identifiers.
    pub async fn resolve(&self, raw: &RawIdentifier) -> Result<Resolution, KernelError> {
        raw.validate()?;
        for _ in 0..=self.max_retries {
            self.sync().await?;
            let plan = self
                .index
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .plan_resolution(raw, &self.policy);
            let now = OffsetDateTime::now_utc();

            let (change, resolution) = match plan {
                ResolutionPlan::Known { canonical_id } => {
                    return Ok(Resolution {
                        raw: raw.clone(),
                        canonical_id,
                        outcome: ResolutionOutcome::Known,
                    });
                }
                ResolutionPlan::Ambiguous { candidate, score } => {
                    let queued = raw.clone();
                    self.executor
                        .run(move |store| store.record_review(&queued, candidate, score, now))
                        .await?;
                    warn!(raw = %raw, %candidate, score, "ambiguous identity queued for review");
                    return Err(KernelError::IdentityAmbiguous {
                        raw: raw.to_string(),
                        candidate: candidate.to_string(),
                        score,
                    });
                }
                ResolutionPlan::Create => {
                    let canonical_id = CanonicalId::new();
                    (
                        IdentityCommit {
                            event: IdentityEvent::Created {
                                canonical_id,
                                alias: raw.alias_key(),
                                at: now,
                            },
                            expected_revisions: Vec::new(),
                        },
                        Resolution {
                            raw: raw.clone(),
                            canonical_id,
                            outcome: ResolutionOutcome::Created,
                        },
                    )
                }
                ResolutionPlan::Attach { canonical_id, expected_revision, score } => (
                    IdentityCommit {
                        event: IdentityEvent::AliasAttached {
                            canonical_id,
                            alias: raw.alias_key(),
                            score,
                            at: now,
                        },
                        expected_revisions: vec![(canonical_id, expected_revision)],
                    },
                    Resolution {
                        raw: raw.clone(),
                        canonical_id,
                        outcome: ResolutionOutcome::Attached { score },
                    },
                ),
            };

            if self.commit(change).await?.is_some() {
                info!(
                    raw = %raw,
                    canonical_id = %resolution.canonical_id,
                    outcome = ?resolution.outcome,
                    "resolved identity"
                );
                return Ok(resolution);
            }
        }
        Err(self.conflict_exhausted("identity resolution"))
    }

    /// Merge two identities under a new canonical id. Merging ids that already
    /// share a live identity changes nothing.
    ///
    /// # Errors
    /// Returns [`KernelError::NotFound`] for unknown ids and
    /// [`KernelError::Validation`] when `writer` or `reason` is empty.
    pub async fn merge(
        &self,
        a: CanonicalId,
        b: CanonicalId,
        writer: &str,
        reason: &str,
    ) -> Result<MergeResult, KernelError> {
        require_text("writer", writer)?;
        require_text("reason", reason)?;
        for _ in 0..=self.max_retries {
            self.sync().await?;
            let plan = self.index.read().unwrap_or_else(PoisonError::into_inner).plan_merge(a, b)?;
            let (left, left_revision, right, right_revision) = match plan {
                MergePlan::NoOp { canonical_id } => {
                    return Ok(MergeResult { canonical_id, merged: false, sources: Vec::new() });
                }
                MergePlan::Merge { left, left_revision, right, right_revision } => {
                    (left, left_revision, right, right_revision)
                }
            };

            let into = CanonicalId::new();
            let change = IdentityCommit {
                event: IdentityEvent::Merged {
                    sources: [left, right],
                    into,
                    writer: writer.to_string(),
                    reason: reason.to_string(),
                    at: OffsetDateTime::now_utc(),
                },
                expected_revisions: vec![(left, left_revision), (right, right_revision)],
            };
            if self.commit(change).await?.is_some() {
                info!(%left, %right, %into, writer, "merged identities");
                return Ok(MergeResult {
                    canonical_id: into,
                    merged: true,
                    sources: vec![left, right],
                });
            }
        }
        Err(self.conflict_exhausted("identity merge"))
    }

    /// Pin `raw` to `canonical_id` regardless of scoring.
    ///
    /// # Errors
    /// Returns [`KernelError::NotFound`] when `canonical_id` is unknown.
    pub async fn set_override(
        &self,
        raw: &RawIdentifier,
        canonical_id: CanonicalId,
        writer: &str,
    ) -> Result<CanonicalId, KernelError> {
        raw.validate()?;
        require_text("writer", writer)?;
        for _ in 0..=self.max_retries {
            self.sync().await?;
            let (target, revision) = {
                let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
                let live = index
                    .live(canonical_id)
                    .ok_or_else(|| KernelError::NotFound(format!("identity {canonical_id}")))?;
                (live.canonical_id, live.revision)
            };

            let change = IdentityCommit {
                event: IdentityEvent::OverrideSet {
                    alias: raw.alias_key(),
                    canonical_id: target,
                    writer: writer.to_string(),
                    at: OffsetDateTime::now_utc(),
                },
                expected_revisions: vec![(target, revision)],
            };
            if self.commit(change).await?.is_some() {
                info!(raw = %raw, canonical_id = %target, writer, "identity override set");
                return Ok(target);
            }
        }
        Err(self.conflict_exhausted("identity override"))
    }

    /// # Errors
    /// Returns [`KernelError::NotFound`] when `canonical_id` was never issued.
    pub async fn show(&self, canonical_id: CanonicalId) -> Result<IdentityView, KernelError> {
        self.sync().await?;
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        let live = index
            .live(canonical_id)
            .ok_or_else(|| KernelError::NotFound(format!("identity {canonical_id}")))?;
        Ok(IdentityView {
            requested: canonical_id,
            merged_from: index.merged_sources(live.canonical_id),
            identity: live.clone(),
        })
    }

    /// # Errors
    /// Returns [`KernelError::Storage`] when the review queue cannot be read.
    pub async fn pending_reviews(&self) -> Result<Vec<ReviewItem>, KernelError> {
        self.executor.run(|store| store.list_reviews()).await
    }
}
