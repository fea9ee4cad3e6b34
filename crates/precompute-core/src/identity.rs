use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::KernelError;

const MAX_RAW_LEN: usize = 512;
const MIN_BLOCK_TOKEN_LEN: usize = 3;
const MAX_MERGE_CHAIN: usize = 64;

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(transparent)]
pub struct CanonicalId(pub Ulid);

impl CanonicalId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CanonicalId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CanonicalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CanonicalId {
    type Err = KernelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value.trim())
            .map(Self)
            .map_err(|err| KernelError::Validation(format!("invalid canonical id {value:?}: {err}")))
    }
}

/// Upstream system an alias was observed in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceSystem {
    Git,
    Github,
    Gitlab,
    Bitbucket,
    Jira,
}

impl SourceSystem {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Git => "git",
            Self::Github => "github",
            Self::Gitlab => "gitlab",
            Self::Bitbucket => "bitbucket",
            Self::Jira => "jira",
        }
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] for unknown source names.
    pub fn parse(value: &str) -> Result<Self, KernelError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "git" => Ok(Self::Git),
            "github" => Ok(Self::Github),
            "gitlab" => Ok(Self::Gitlab),
            "bitbucket" => Ok(Self::Bitbucket),
            "jira" => Ok(Self::Jira),
            other => Err(KernelError::Validation(format!("unknown source system: {other}"))),
        }
    }

    /// Account-based sources assign one login per person. Commit signatures do not.
    #[must_use]
    pub fn is_account_namespace(self) -> bool {
        !matches!(self, Self::Git)
    }
}

/// An identifier as observed in one source system, before resolution.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RawIdentifier {
    pub source: SourceSystem,
    pub value: String,
}

impl RawIdentifier {
    /// # Errors
    /// Returns [`KernelError::Validation`] for empty, oversized or control-character values.
    pub fn new(source: SourceSystem, value: impl Into<String>) -> Result<Self, KernelError> {
        let raw = Self { source, value: value.into() };
        raw.validate()?;
        Ok(raw)
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] for empty, oversized or control-character values.
    pub fn validate(&self) -> Result<(), KernelError> {
        let trimmed = self.value.trim();
        if trimmed.is_empty() {
            return Err(KernelError::Validation("raw identifier must not be empty".to_string()));
        }
        if trimmed.len() > MAX_RAW_LEN {
            return Err(KernelError::Validation(format!(
                "raw identifier exceeds {MAX_RAW_LEN} bytes"
            )));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(KernelError::Validation(
                "raw identifier contains control characters".to_string(),
            ));
        }
        Ok(())
    }

    /// Stable key of this alias: `source:normalized-value`.
    #[must_use]
    pub fn alias_key(&self) -> String {
        format!("{}:{}", self.source.as_str(), normalize(&self.value))
    }

    /// Inverse of [`RawIdentifier::alias_key`].
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the key has no source prefix.
    pub fn from_alias_key(key: &str) -> Result<Self, KernelError> {
        let Some((source, value)) = key.split_once(':') else {
            return Err(KernelError::Validation(format!("alias key {key:?} has no source prefix")));
        };
        Self::new(SourceSystem::parse(source)?, value)
    }
}

impl Display for RawIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source.as_str(), self.value)
    }
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Cheap similarity features extracted from one alias.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AliasFeatures {
    source: SourceSystem,
    tokens: BTreeSet<String>,
    compact: String,
    initials: Option<String>,
    domain: Option<String>,
}

impl AliasFeatures {
    fn extract(raw: &RawIdentifier) -> Self {
        let normalized = normalize(&raw.value);
        let (local, domain) = match normalized.rsplit_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
                (local.to_string(), Some(domain.to_string()))
            }
            _ => (normalized.clone(), None),
        };
        let local = local.split('+').next().unwrap_or_default();
        let ordered: Vec<String> = local
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .collect();
        let compact = ordered.concat();
        let initials = match (ordered.first(), ordered.last()) {
            (Some(first), Some(last)) if ordered.len() >= 2 => {
                first.chars().next().map(|initial| format!("{initial}{last}"))
            }
            _ => None,
        };
        Self {
            source: raw.source,
            tokens: ordered.into_iter().collect(),
            compact,
            initials,
            domain,
        }
    }

    fn blocking_keys(&self) -> BTreeSet<String> {
        let mut keys: BTreeSet<String> = self
            .tokens
            .iter()
            .filter(|token| token.chars().count() >= MIN_BLOCK_TOKEN_LEN)
            .cloned()
            .collect();
        if !self.compact.is_empty() {
            keys.insert(self.compact.clone());
        }
        if let Some(initials) = &self.initials {
            keys.insert(initials.clone());
        }
        keys
    }

    fn compact_forms(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.compact.as_str())
            .chain(self.initials.as_deref())
            .filter(|form| !form.is_empty())
    }

    fn score(&self, other: &Self, weights: &ScoringWeights) -> f64 {
        let union = self.tokens.union(&other.tokens).count();
        let token_overlap = if union == 0 {
            0.0
        } else {
            ratio(self.tokens.intersection(&other.tokens).count(), union)
        };
        let compact_match = self
            .compact_forms()
            .any(|left| other.compact_forms().any(|right| left == right));
        let domain_match = matches!((&self.domain, &other.domain), (Some(a), Some(b)) if a == b);

        let total = weights.total();
        if total <= 0.0 {
            return 0.0;
        }
        let weighted = weights.token_overlap * token_overlap
            + weights.compact_match * indicator(compact_match)
            + weights.domain_match * indicator(domain_match);
        weighted / total
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: usize, denominator: usize) -> f64 {
    numerator as f64 / denominator as f64
}

fn indicator(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoringWeights {
    pub token_overlap: f64,
    pub compact_match: f64,
    pub domain_match: f64,
}

impl ScoringWeights {
    #[must_use]
    pub fn total(&self) -> f64 {
        self.token_overlap + self.compact_match + self.domain_match
    }
}

/// Acceptance policy for attaching an alias to an existing identity.
///
/// There is deliberately no `Default`: thresholds and weights are operator policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResolverPolicy {
    pub acceptance_threshold: f64,
    /// Width of the band below the threshold that is reported for review.
    pub ambiguity_band: f64,
    pub weights: ScoringWeights,
}

impl ResolverPolicy {
    /// # Errors
    /// Returns [`KernelError::Validation`] when thresholds or weights are out of range.
    pub fn validate(&self) -> Result<(), KernelError> {
        if !(self.acceptance_threshold > 0.0 && self.acceptance_threshold <= 1.0) {
            return Err(KernelError::Validation(format!(
                "acceptance_threshold must be in (0, 1], got {}",
                self.acceptance_threshold
            )));
        }
        if !(self.ambiguity_band >= 0.0 && self.ambiguity_band < self.acceptance_threshold) {
            return Err(KernelError::Validation(format!(
                "ambiguity_band must be in [0, acceptance_threshold), got {}",
                self.ambiguity_band
            )));
        }
        let weights = [
            self.weights.token_overlap,
            self.weights.compact_match,
            self.weights.domain_match,
        ];
        if weights.iter().any(|weight| !weight.is_finite() || *weight < 0.0) {
            return Err(KernelError::Validation("scoring weights must be finite and >= 0".to_string()));
        }
        if self.weights.total() <= 0.0 {
            return Err(KernelError::Validation("at least one scoring weight must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Identity {
    pub canonical_id: CanonicalId,
    /// Alias keys as produced by [`RawIdentifier::alias_key`].
    pub aliases: BTreeSet<String>,
    pub confidence: f64,
    pub revision: u64,
    pub merged_into: Option<CanonicalId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Identity {
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.merged_into.is_none()
    }
}

/// One entry of the identity audit log. Current mappings are derived from these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IdentityEvent {
    Created {
        canonical_id: CanonicalId,
        alias: String,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    AliasAttached {
        canonical_id: CanonicalId,
        alias: String,
        score: f64,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    Merged {
        sources: [CanonicalId; 2],
        into: CanonicalId,
        writer: String,
        reason: String,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    OverrideSet {
        alias: String,
        canonical_id: CanonicalId,
        writer: String,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
}

impl IdentityEvent {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::AliasAttached { .. } => "alias_attached",
            Self::Merged { .. } => "merged",
            Self::OverrideSet { .. } => "override_set",
        }
    }
}

/// An audit event together with its position in the durable log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordedEvent {
    pub seq: i64,
    pub event: IdentityEvent,
}

/// A proposed audit event plus the identity revisions it was planned against.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityCommit {
    pub event: IdentityEvent,
    pub expected_revisions: Vec<(CanonicalId, u64)>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "plan", rename_all = "snake_case")]
pub enum ResolutionPlan {
    /// The alias is already mapped (directly or through an override).
    Known { canonical_id: CanonicalId },
    Attach { canonical_id: CanonicalId, expected_revision: u64, score: f64 },
    Create,
    Ambiguous { candidate: CanonicalId, score: f64 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "plan", rename_all = "snake_case")]
pub enum MergePlan {
    /// Both sides already resolve to the same live identity.
    NoOp { canonical_id: CanonicalId },
    Merge { left: CanonicalId, left_revision: u64, right: CanonicalId, right_revision: u64 },
}

/// In-memory mapping rebuilt from the identity audit log.
#[derive(Debug, Clone, Default)]
pub struct IdentityIndex {
    identities: BTreeMap<CanonicalId, Identity>,
    alias_owner: BTreeMap<String, CanonicalId>,
    blocks: BTreeMap<String, BTreeSet<CanonicalId>>,
    overrides: BTreeMap<String, CanonicalId>,
    last_seq: i64,
}

impl IdentityIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an index by replaying `events` in order.
    ///
    /// # Errors
    /// Propagates the first inconsistency found by [`IdentityIndex::apply`].
    pub fn replay<'a>(events: impl IntoIterator<Item = &'a RecordedEvent>) -> Result<Self, KernelError> {
        let mut index = Self::new();
        for recorded in events {
            index.apply(recorded)?;
        }
        Ok(index)
    }

    #[must_use]
    pub fn last_seq(&self) -> i64 {
        self.last_seq
    }

    #[must_use]
    pub fn identity(&self, canonical_id: CanonicalId) -> Option<&Identity> {
        self.identities.get(&canonical_id)
    }

    /// Follow `merged_into` links to the identity currently standing for `canonical_id`.
    #[must_use]
    pub fn live(&self, canonical_id: CanonicalId) -> Option<&Identity> {
        let mut current = self.identities.get(&canonical_id)?;
        for _ in 0..MAX_MERGE_CHAIN {
            match current.merged_into {
                None => return Some(current),
                Some(next) => current = self.identities.get(&next)?,
            }
        }
        None
    }

    /// Identities that were merged directly into `canonical_id`.
    #[must_use]
    pub fn merged_sources(&self, canonical_id: CanonicalId) -> Vec<CanonicalId> {
        self.identities
            .values()
            .filter(|identity| identity.merged_into == Some(canonical_id))
            .map(|identity| identity.canonical_id)
            .collect()
    }

    pub fn live_identities(&self) -> impl Iterator<Item = &Identity> {
        self.identities.values().filter(|identity| identity.is_live())
    }

    #[must_use]
    pub fn owner_of(&self, alias_key: &str) -> Option<CanonicalId> {
        let owner = self.overrides.get(alias_key).or_else(|| self.alias_owner.get(alias_key))?;
        self.live(*owner).map(|identity| identity.canonical_id)
    }

    /// Apply one durable event. Events at or below the last applied sequence are skipped.
    ///
    /// # Errors
    /// Returns [`KernelError::Storage`] when the event references unknown identities.
    pub fn apply(&mut self, recorded: &RecordedEvent) -> Result<(), KernelError> {
        if recorded.seq <= self.last_seq {
            return Ok(());
        }
        match &recorded.event {
            IdentityEvent::Created { canonical_id, alias, at } => {
                let identity = Identity {
                    canonical_id: *canonical_id,
                    aliases: BTreeSet::from([alias.clone()]),
                    confidence: 1.0,
                    revision: 1,
                    merged_into: None,
                    created_at: *at,
                };
                self.identities.insert(*canonical_id, identity);
                self.alias_owner.insert(alias.clone(), *canonical_id);
                self.index_aliases(*canonical_id, std::slice::from_ref(alias));
            }
            IdentityEvent::AliasAttached { canonical_id, alias, score, .. } => {
                let identity = self.identity_mut(*canonical_id, recorded.seq)?;
                identity.aliases.insert(alias.clone());
                identity.confidence = identity.confidence.min(*score);
                identity.revision += 1;
                self.alias_owner.insert(alias.clone(), *canonical_id);
                self.index_aliases(*canonical_id, std::slice::from_ref(alias));
            }
            IdentityEvent::Merged { sources, into, at, .. } => {
                let mut aliases = BTreeSet::new();
                let mut confidence = 1.0_f64;
                for source in sources {
                    let identity = self.identity_mut(*source, recorded.seq)?;
                    aliases.extend(identity.aliases.iter().cloned());
                    confidence = confidence.min(identity.confidence);
                    identity.merged_into = Some(*into);
                    identity.revision += 1;
                }
                for source in sources {
                    self.unindex(*source);
                }
                for alias in &aliases {
                    self.alias_owner.insert(alias.clone(), *into);
                }
                let merged: Vec<String> = aliases.iter().cloned().collect();
                self.identities.insert(
                    *into,
                    Identity {
                        canonical_id: *into,
                        aliases,
                        confidence,
                        revision: 1,
                        merged_into: None,
                        created_at: *at,
                    },
                );
                self.index_aliases(*into, &merged);
            }
            IdentityEvent::OverrideSet { alias, canonical_id, .. } => {
                let target = self
                    .live(*canonical_id)
                    .map(|identity| identity.canonical_id)
                    .ok_or_else(|| unknown_identity(*canonical_id, recorded.seq))?;
                let previous = self
                    .alias_owner
                    .get(alias)
                    .and_then(|owner| self.live(*owner))
                    .map(|identity| identity.canonical_id);
                if let Some(previous) = previous.filter(|previous| *previous != target) {
                    let identity = self.identity_mut(previous, recorded.seq)?;
                    identity.aliases.remove(alias);
                    identity.revision += 1;
                    self.unindex(previous);
                    let remaining: Vec<String> = self
                        .identities
                        .get(&previous)
                        .map(|identity| identity.aliases.iter().cloned().collect())
                        .unwrap_or_default();
                    self.index_aliases(previous, &remaining);
                }
                if previous != Some(target) {
                    let identity = self.identity_mut(target, recorded.seq)?;
                    identity.aliases.insert(alias.clone());
                    identity.revision += 1;
                    self.index_aliases(target, std::slice::from_ref(alias));
                }
                self.alias_owner.insert(alias.clone(), target);
                self.overrides.insert(alias.clone(), target);
            }
        }
        self.last_seq = recorded.seq;
        Ok(())
    }

    /// Decide how `raw` should be resolved against the current mapping.
    #[must_use]
    pub fn plan_resolution(&self, raw: &RawIdentifier, policy: &ResolverPolicy) -> ResolutionPlan {
        if let Some(canonical_id) = self.owner_of(&raw.alias_key()) {
            return ResolutionPlan::Known { canonical_id };
        }

        let features = AliasFeatures::extract(raw);
        let candidates: BTreeSet<CanonicalId> = features
            .blocking_keys()
            .iter()
            .filter_map(|key| self.blocks.get(key))
            .flatten()
            .copied()
            .collect();

        let mut best: Option<(&Identity, f64)> = None;
        for candidate in candidates {
            let Some(identity) = self.identities.get(&candidate).filter(|identity| identity.is_live()) else {
                continue;
            };
            let score = candidate_score(&features, identity, policy);
            match best {
                Some((_, top)) if score <= top => {}
                _ => best = Some((identity, score)),
            }
        }

        match best {
            Some((identity, score)) if score >= policy.acceptance_threshold => ResolutionPlan::Attach {
                canonical_id: identity.canonical_id,
                expected_revision: identity.revision,
                score,
            },
            Some((identity, score))
                if score > 0.0 && score >= policy.acceptance_threshold - policy.ambiguity_band =>
            {
                ResolutionPlan::Ambiguous { candidate: identity.canonical_id, score }
            }
            _ => ResolutionPlan::Create,
        }
    }

    /// Decide whether merging `a` and `b` needs a new identity.
    ///
    /// # Errors
    /// Returns [`KernelError::NotFound`] when either side is unknown.
    pub fn plan_merge(&self, a: CanonicalId, b: CanonicalId) -> Result<MergePlan, KernelError> {
        let left = self.live(a).ok_or_else(|| KernelError::NotFound(format!("identity {a}")))?;
        let right = self.live(b).ok_or_else(|| KernelError::NotFound(format!("identity {b}")))?;
        if left.canonical_id == right.canonical_id {
            return Ok(MergePlan::NoOp { canonical_id: left.canonical_id });
        }
        let (left, right) = if left.canonical_id < right.canonical_id { (left, right) } else { (right, left) };
        Ok(MergePlan::Merge {
            left: left.canonical_id,
            left_revision: left.revision,
            right: right.canonical_id,
            right_revision: right.revision,
        })
    }

    fn identity_mut(&mut self, canonical_id: CanonicalId, seq: i64) -> Result<&mut Identity, KernelError> {
        self.identities.get_mut(&canonical_id).ok_or_else(|| unknown_identity(canonical_id, seq))
    }

    fn index_aliases(&mut self, canonical_id: CanonicalId, aliases: &[String]) {
        for alias in aliases {
            let Ok(raw) = RawIdentifier::from_alias_key(alias) else {
                continue;
            };
            for key in AliasFeatures::extract(&raw).blocking_keys() {
                self.blocks.entry(key).or_default().insert(canonical_id);
            }
        }
    }

    fn unindex(&mut self, canonical_id: CanonicalId) {
        self.blocks.retain(|_, members| {
            members.remove(&canonical_id);
            !members.is_empty()
        });
    }
}

fn candidate_score(features: &AliasFeatures, identity: &Identity, policy: &ResolverPolicy) -> f64 {
    let aliases: Vec<AliasFeatures> = identity
        .aliases
        .iter()
        .filter_map(|alias| RawIdentifier::from_alias_key(alias).ok())
        .map(|raw| AliasFeatures::extract(&raw))
        .collect();

    // One login per account-based source: a second, different login disqualifies.
    if features.source.is_account_namespace()
        && aliases.iter().any(|alias| alias.source == features.source)
    {
        return 0.0;
    }

    aliases
        .iter()
        .map(|alias| features.score(alias, &policy.weights))
        .fold(0.0, f64::max)
}

fn unknown_identity(canonical_id: CanonicalId, seq: i64) -> KernelError {
    KernelError::Storage(format!("identity event {seq} references unknown identity {canonical_id}"))
}
