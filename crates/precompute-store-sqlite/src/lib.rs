use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use precompute_core::{
    from_unix_millis, unix_millis, CachedArtifact, CanonicalId, ClaimOutcome, ClaimState,
    ComputationClaim, FailureMemo, Fingerprint, IdentityCommit, IdentityEvent, InvalidationScope,
    PersistentFact, RawIdentifier, RecordedEvent, TimeRange, Watermark,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS artifacts (
  fingerprint TEXT PRIMARY KEY,
  query_kind TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL,
  source_watermark INTEGER NOT NULL CHECK (source_watermark >= 0),
  ttl_secs INTEGER NOT NULL CHECK (ttl_secs >= 1),
  expires_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS computation_claims (
  fingerprint TEXT PRIMARY KEY,
  owner TEXT NOT NULL,
  state TEXT NOT NULL CHECK (state IN ('claimed','computing')),
  claimed_at_ms INTEGER NOT NULL,
  expires_at_ms INTEGER NOT NULL,
  attempt INTEGER NOT NULL CHECK (attempt >= 1)
);

CREATE TABLE IF NOT EXISTS failure_memos (
  fingerprint TEXT PRIMARY KEY,
  owner TEXT NOT NULL,
  message TEXT NOT NULL,
  failed_at_ms INTEGER NOT NULL,
  expires_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS facts (
  subject_id TEXT NOT NULL,
  kind TEXT NOT NULL,
  ts_ns INTEGER NOT NULL,
  payload_json TEXT NOT NULL,
  appended_at TEXT NOT NULL,
  PRIMARY KEY (subject_id, kind, ts_ns)
);

CREATE INDEX IF NOT EXISTS idx_artifacts_query_kind ON artifacts(query_kind);
CREATE INDEX IF NOT EXISTS idx_artifacts_expires_at ON artifacts(expires_at_ms);
CREATE INDEX IF NOT EXISTS idx_artifacts_watermark ON artifacts(source_watermark);
CREATE INDEX IF NOT EXISTS idx_claims_expires_at ON computation_claims(expires_at_ms);
CREATE INDEX IF NOT EXISTS idx_facts_subject_ts ON facts(subject_id, ts_ns);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS identities (
  canonical_id TEXT PRIMARY KEY,
  confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
  revision INTEGER NOT NULL CHECK (revision >= 1),
  merged_into TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (merged_into) REFERENCES identities(canonical_id)
);

CREATE TABLE IF NOT EXISTS identity_aliases (
  alias_key TEXT PRIMARY KEY,
  canonical_id TEXT NOT NULL,
  attached_at TEXT NOT NULL,
  FOREIGN KEY (canonical_id) REFERENCES identities(canonical_id)
);

CREATE TABLE IF NOT EXISTS identity_events (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_kind TEXT NOT NULL CHECK (event_kind IN ('created','alias_attached','merged','override_set')),
  event_json TEXT NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS identity_overrides (
  alias_key TEXT PRIMARY KEY,
  canonical_id TEXT NOT NULL,
  writer TEXT NOT NULL,
  set_at TEXT NOT NULL,
  FOREIGN KEY (canonical_id) REFERENCES identities(canonical_id)
);

CREATE TABLE IF NOT EXISTS identity_reviews (
  alias_key TEXT PRIMARY KEY,
  candidate_id TEXT NOT NULL,
  score REAL NOT NULL,
  first_seen_at TEXT NOT NULL,
  last_seen_at TEXT NOT NULL,
  occurrences INTEGER NOT NULL CHECK (occurrences >= 1)
);

CREATE INDEX IF NOT EXISTS idx_identity_aliases_owner ON identity_aliases(canonical_id);
CREATE INDEX IF NOT EXISTS idx_identities_merged_into ON identities(merged_into);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AppendOutcome {
    Inserted,
    /// An identical fact was already present.
    AlreadyPresent,
    Conflict { existing: PersistentFact },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommitOutcome {
    Committed { seq: i64 },
    /// The change was planned against state that has since moved on.
    Conflict { reason: String },
}

/// An ambiguous resolution waiting for a human decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewItem {
    pub alias_key: String,
    pub raw: RawIdentifier,
    pub candidate: CanonicalId,
    pub score: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen_at: OffsetDateTime,
    pub occurrences: i64,
}

struct ArtifactRow {
    fingerprint: String,
    query_kind: String,
    payload_json: String,
    created_at_ms: i64,
    source_watermark: i64,
    ttl_secs: i64,
}

struct ClaimRow {
    fingerprint: String,
    owner: String,
    state: String,
    claimed_at_ms: i64,
    expires_at_ms: i64,
    attempt: i64,
}

impl SqliteStore {
    /// Open a SQLite-backed store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration(1, MIGRATION_001_SQL)?;
            version = 1;
        }

        if version < 2 {
            self.apply_migration(2, MIGRATION_002_SQL)?;
            version = 2;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        if current_schema_version(&tx)? >= version {
            return Ok(());
        }
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, now_rfc3339()?],
        )
        .with_context(|| format!("failed to record migration version {version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        info!(version, "applied schema migration");
        Ok(())
    }

    // ---- claims ----

    /// Atomically create a claim, or take over an expired one.
    ///
    /// # Errors
    /// Returns an error when the claim transaction fails.
    pub fn try_claim(
        &mut self,
        fingerprint: Fingerprint,
        owner: &str,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> Result<ClaimOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start claim transaction")?;

        let existing = select_claim(&tx, fingerprint)?;
        let now_ms = unix_millis(now);
        let expires_at = now + ttl;

        let outcome = match existing {
            None => {
                tx.execute(
                    "INSERT INTO computation_claims(
                        fingerprint, owner, state, claimed_at_ms, expires_at_ms, attempt
                    ) VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                    params![
                        fingerprint.to_hex(),
                        owner,
                        ClaimState::Claimed.as_str(),
                        now_ms,
                        unix_millis(expires_at),
                    ],
                )
                .context("failed to insert computation claim")?;
                ClaimOutcome::Acquired {
                    claim: ComputationClaim {
                        fingerprint,
                        owner: owner.to_string(),
                        state: ClaimState::Claimed,
                        claimed_at: now,
                        expires_at,
                        attempt: 1,
                    },
                    recovered_from: None,
                }
            }
            Some(current) if !current.is_live(now) => {
                let attempt = current.attempt.saturating_add(1);
                tx.execute(
                    "UPDATE computation_claims
                     SET owner = ?2, state = ?3, claimed_at_ms = ?4, expires_at_ms = ?5, attempt = ?6
                     WHERE fingerprint = ?1",
                    params![
                        fingerprint.to_hex(),
                        owner,
                        ClaimState::Claimed.as_str(),
                        now_ms,
                        unix_millis(expires_at),
                        attempt,
                    ],
                )
                .context("failed to take over expired computation claim")?;
                ClaimOutcome::Acquired {
                    claim: ComputationClaim {
                        fingerprint,
                        owner: owner.to_string(),
                        state: ClaimState::Claimed,
                        claimed_at: now,
                        expires_at,
                        attempt,
                    },
                    recovered_from: Some(current.owner),
                }
            }
            Some(current) => ClaimOutcome::Held { claim: current },
        };

        tx.commit().context("failed to commit claim transaction")?;
        Ok(outcome)
    }

    /// # Errors
    /// Returns an error when the claim cannot be read.
    pub fn get_claim(&self, fingerprint: Fingerprint) -> Result<Option<ComputationClaim>> {
        select_claim(&self.conn, fingerprint)
    }

    /// Move `claim` into the computing state with a new expiry.
    ///
    /// A claim is identified by its owner, claim time and attempt, so a later
    /// claim by the same owner is never mistaken for this one. Returns `false`
    /// when the claim is gone, expired or has been replaced.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn begin_computing(
        &mut self,
        claim: &ComputationClaim,
        now: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE computation_claims
                 SET state = ?5, expires_at_ms = ?7
                 WHERE fingerprint = ?1 AND owner = ?2 AND claimed_at_ms = ?3 AND attempt = ?4
                   AND expires_at_ms > ?6",
                params![
                    claim.fingerprint.to_hex(),
                    claim.owner,
                    unix_millis(claim.claimed_at),
                    claim.attempt,
                    ClaimState::Computing.as_str(),
                    unix_millis(now),
                    unix_millis(expires_at),
                ],
            )
            .context("failed to mark claim as computing")?;
        Ok(changed == 1)
    }

    /// Delete `claim` if it is still the current claim for its fingerprint.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn release_claim(&mut self, claim: &ComputationClaim) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM computation_claims
                 WHERE fingerprint = ?1 AND owner = ?2 AND claimed_at_ms = ?3 AND attempt = ?4",
                params![
                    claim.fingerprint.to_hex(),
                    claim.owner,
                    unix_millis(claim.claimed_at),
                    claim.attempt,
                ],
            )
            .context("failed to release computation claim")?;
        Ok(changed == 1)
    }

    /// Mark `claim` expired so any process may take it over.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn expire_claim(&mut self, claim: &ComputationClaim, now: OffsetDateTime) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE computation_claims SET expires_at_ms = ?5
                 WHERE fingerprint = ?1 AND owner = ?2 AND claimed_at_ms = ?3 AND attempt = ?4",
                params![
                    claim.fingerprint.to_hex(),
                    claim.owner,
                    unix_millis(claim.claimed_at),
                    claim.attempt,
                    unix_millis(now),
                ],
            )
            .context("failed to expire computation claim")?;
        Ok(changed == 1)
    }

    /// # Errors
    /// Returns an error when claims cannot be read.
    pub fn list_claims(&self) -> Result<Vec<ComputationClaim>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT fingerprint, owner, state, claimed_at_ms, expires_at_ms, attempt
                 FROM computation_claims
                 ORDER BY claimed_at_ms ASC, fingerprint ASC",
            )
            .context("failed to prepare claim listing")?;
        let rows = stmt.query_map([], claim_row)?;
        let mut claims = Vec::new();
        for row in rows {
            claims.push(claim_from_row(row?)?);
        }
        Ok(claims)
    }

    /// Delete claims that expired at or before `now`.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn reap_expired_claims(&mut self, now: OffsetDateTime) -> Result<usize> {
        let reaped = self
            .conn
            .execute(
                "DELETE FROM computation_claims WHERE expires_at_ms <= ?1",
                params![unix_millis(now)],
            )
            .context("failed to reap expired claims")?;
        if reaped > 0 {
            info!(reaped, "reaped expired computation claims");
        }
        Ok(reaped)
    }

    // ---- artifacts ----

    /// Insert or replace an artifact. An existing artifact built from a newer
    /// watermark is kept; returns whether the row was written.
    ///
    /// # Errors
    /// Returns an error when serialization or the write fails.
    pub fn upsert_artifact(&mut self, artifact: &CachedArtifact) -> Result<bool> {
        let payload_json =
            serde_json::to_string(&artifact.payload).context("failed to serialize artifact payload")?;
        let ttl_secs = i64::try_from(artifact.ttl_secs).context("artifact ttl out of range")?;
        let changed = self
            .conn
            .execute(
                "INSERT INTO artifacts(
                    fingerprint, query_kind, payload_json, created_at_ms,
                    source_watermark, ttl_secs, expires_at_ms
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                    query_kind = excluded.query_kind,
                    payload_json = excluded.payload_json,
                    created_at_ms = excluded.created_at_ms,
                    source_watermark = excluded.source_watermark,
                    ttl_secs = excluded.ttl_secs,
                    expires_at_ms = excluded.expires_at_ms
                 WHERE excluded.source_watermark >= artifacts.source_watermark",
                params![
                    artifact.fingerprint.to_hex(),
                    artifact.query_kind,
                    payload_json,
                    unix_millis(artifact.created_at),
                    watermark_to_sql(artifact.source_watermark)?,
                    ttl_secs,
                    unix_millis(artifact.expires_at()),
                ],
            )
            .context("failed to upsert artifact")?;
        Ok(changed > 0)
    }

    /// # Errors
    /// Returns an error when the artifact cannot be read or decoded.
    pub fn get_artifact(&self, fingerprint: Fingerprint) -> Result<Option<CachedArtifact>> {
        let row = self
            .conn
            .query_row(
                "SELECT fingerprint, query_kind, payload_json, created_at_ms, source_watermark, ttl_secs
                 FROM artifacts WHERE fingerprint = ?1",
                params![fingerprint.to_hex()],
                artifact_row,
            )
            .optional()
            .context("failed to read artifact")?;
        row.map(artifact_from_row).transpose()
    }

    /// Delete the artifact when it is behind `required` or expired at `now`.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn evict_artifact_if_invalid(
        &mut self,
        fingerprint: Fingerprint,
        required: Watermark,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM artifacts
                 WHERE fingerprint = ?1 AND (source_watermark < ?2 OR expires_at_ms <= ?3)",
                params![fingerprint.to_hex(), watermark_to_sql(required)?, unix_millis(now)],
            )
            .context("failed to evict invalid artifact")?;
        Ok(changed == 1)
    }

    /// Delete every artifact in `scope`, returning the removed fingerprints.
    ///
    /// # Errors
    /// Returns an error when the selection or delete fails.
    pub fn invalidate(&mut self, scope: &InvalidationScope) -> Result<Vec<Fingerprint>> {
        let (filter, value): (&str, Option<rusqlite::types::Value>) = match scope {
            InvalidationScope::Fingerprint(fingerprint) => {
                ("fingerprint = ?1", Some(fingerprint.to_hex().into()))
            }
            InvalidationScope::QueryKind(kind) => ("query_kind = ?1", Some(kind.clone().into())),
            InvalidationScope::WatermarkBefore(watermark) => {
                ("source_watermark < ?1", Some(watermark_to_sql(*watermark)?.into()))
            }
            InvalidationScope::All => ("1 = 1", None),
        };
        let removed = self.delete_artifacts_where(filter, value)?;
        info!(scope = ?scope, removed = removed.len(), "invalidated artifacts");
        Ok(removed)
    }

    /// Delete artifacts whose TTL elapsed at or before `now`.
    ///
    /// # Errors
    /// Returns an error when the selection or delete fails.
    pub fn purge_expired_artifacts(&mut self, now: OffsetDateTime) -> Result<Vec<Fingerprint>> {
        self.delete_artifacts_where("expires_at_ms <= ?1", Some(unix_millis(now).into()))
    }

    fn delete_artifacts_where(
        &mut self,
        filter: &str,
        value: Option<rusqlite::types::Value>,
    ) -> Result<Vec<Fingerprint>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start artifact delete transaction")?;
        let values: Vec<rusqlite::types::Value> = value.into_iter().collect();

        let mut fingerprints = Vec::new();
        {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT fingerprint FROM artifacts WHERE {filter} ORDER BY fingerprint ASC"
                ))
                .context("failed to prepare artifact selection")?;
            let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), |row| {
                row.get::<_, String>(0)
            })?;
            for row in rows {
                fingerprints.push(parse_fingerprint(&row?)?);
            }
        }
        tx.execute(
            &format!("DELETE FROM artifacts WHERE {filter}"),
            rusqlite::params_from_iter(values.iter()),
        )
        .context("failed to delete artifacts")?;
        tx.commit().context("failed to commit artifact delete")?;
        Ok(fingerprints)
    }

    // ---- failure memos ----

    /// # Errors
    /// Returns an error when the write fails.
    pub fn record_failure(&mut self, memo: &FailureMemo) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO failure_memos(fingerprint, owner, message, failed_at_ms, expires_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                    owner = excluded.owner,
                    message = excluded.message,
                    failed_at_ms = excluded.failed_at_ms,
                    expires_at_ms = excluded.expires_at_ms",
                params![
                    memo.fingerprint.to_hex(),
                    memo.owner,
                    memo.message,
                    unix_millis(memo.failed_at),
                    unix_millis(memo.expires_at),
                ],
            )
            .context("failed to record failure memo")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the memo cannot be read.
    pub fn get_failure(&self, fingerprint: Fingerprint) -> Result<Option<FailureMemo>> {
        let row = self
            .conn
            .query_row(
                "SELECT owner, message, failed_at_ms, expires_at_ms
                 FROM failure_memos WHERE fingerprint = ?1",
                params![fingerprint.to_hex()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .context("failed to read failure memo")?;
        let Some((owner, message, failed_at_ms, expires_at_ms)) = row else {
            return Ok(None);
        };
        Ok(Some(FailureMemo {
            fingerprint,
            owner,
            message,
            failed_at: from_unix_millis(failed_at_ms)?,
            expires_at: from_unix_millis(expires_at_ms)?,
        }))
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn purge_expired_failures(&mut self, now: OffsetDateTime) -> Result<usize> {
        self.conn
            .execute("DELETE FROM failure_memos WHERE expires_at_ms <= ?1", params![unix_millis(now)])
            .context("failed to purge failure memos")
    }

    // ---- facts ----

    /// Append a fact unless the same (subject, kind, timestamp) already exists.
    ///
    /// # Errors
    /// Returns an error when validation, serialization or the write fails.
    pub fn append_fact(&mut self, fact: &PersistentFact) -> Result<AppendOutcome> {
        fact.validate().map_err(|err| anyhow!("fact validation failed: {err}"))?;
        let ts_ns = fact_nanos(fact.timestamp)?;
        let payload_json =
            serde_json::to_string(&fact.payload).context("failed to serialize fact payload")?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start fact transaction")?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT payload_json FROM facts WHERE subject_id = ?1 AND kind = ?2 AND ts_ns = ?3",
                params![fact.subject_id, fact.kind, ts_ns],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up existing fact")?;

        let outcome = if let Some(existing_json) = existing {
            let existing_payload: Value = serde_json::from_str(&existing_json)
                .context("stored fact payload is not valid JSON")?;
            if existing_payload == fact.payload {
                AppendOutcome::AlreadyPresent
            } else {
                AppendOutcome::Conflict {
                    existing: PersistentFact { payload: existing_payload, ..fact.clone() },
                }
            }
        } else {
            tx.execute(
                "INSERT INTO facts(subject_id, kind, ts_ns, payload_json, appended_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![fact.subject_id, fact.kind, ts_ns, payload_json, now_rfc3339()?],
            )
            .context("failed to insert fact")?;
            AppendOutcome::Inserted
        };

        tx.commit().context("failed to commit fact transaction")?;
        Ok(outcome)
    }

    /// Facts for `subject_id` inside `range`, ordered by timestamp then kind.
    ///
    /// # Errors
    /// Returns an error when facts cannot be read or decoded.
    pub fn query_facts(
        &self,
        subject_id: &str,
        range: &TimeRange,
        kind: Option<&str>,
    ) -> Result<Vec<PersistentFact>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT kind, ts_ns, payload_json FROM facts
                 WHERE subject_id = ?1 AND ts_ns >= ?2 AND ts_ns < ?3
                   AND (?4 IS NULL OR kind = ?4)
                 ORDER BY ts_ns ASC, kind ASC",
            )
            .context("failed to prepare fact query")?;
        let rows = stmt.query_map(
            params![subject_id, fact_nanos(range.start)?, fact_nanos(range.end)?, kind],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?)),
        )?;

        let mut facts = Vec::new();
        for row in rows {
            let (kind, ts_ns, payload_json) = row?;
            let timestamp = OffsetDateTime::from_unix_timestamp_nanos(i128::from(ts_ns))
                .with_context(|| format!("stored fact timestamp out of range: {ts_ns}"))?;
            let payload = serde_json::from_str(&payload_json)
                .context("stored fact payload is not valid JSON")?;
            facts.push(PersistentFact { subject_id: subject_id.to_string(), kind, timestamp, payload });
        }
        Ok(facts)
    }

    // ---- identity ledger ----

    /// Apply one identity change atomically, checking the revisions it was planned against.
    ///
    /// # Errors
    /// Returns an error when the transaction fails for reasons other than a revision conflict.
    pub fn commit_identity_change(&mut self, change: &IdentityCommit) -> Result<CommitOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start identity transaction")?;

        for (canonical_id, expected) in &change.expected_revisions {
            let current = select_identity_state(&tx, *canonical_id)?;
            match current {
                Some((revision, None)) if revision == *expected => {}
                Some((revision, merged_into)) => {
                    return Ok(CommitOutcome::Conflict {
                        reason: format!(
                            "identity {canonical_id} is at revision {revision} (merged_into {merged_into:?}), expected {expected}"
                        ),
                    });
                }
                None => {
                    return Ok(CommitOutcome::Conflict {
                        reason: format!("identity {canonical_id} does not exist"),
                    });
                }
            }
        }

        match &change.event {
            IdentityEvent::Created { canonical_id, alias, at } => {
                if alias_owner(&tx, alias)?.is_some() {
                    return Ok(CommitOutcome::Conflict {
                        reason: format!("alias {alias} is already mapped"),
                    });
                }
                tx.execute(
                    "INSERT INTO identities(canonical_id, confidence, revision, merged_into, created_at)
                     VALUES (?1, 1.0, 1, NULL, ?2)",
                    params![canonical_id.to_string(), rfc3339(*at)?],
                )
                .context("failed to insert identity")?;
                insert_alias(&tx, alias, *canonical_id, *at)?;
            }
            IdentityEvent::AliasAttached { canonical_id, alias, score, at } => {
                if alias_owner(&tx, alias)?.is_some() {
                    return Ok(CommitOutcome::Conflict {
                        reason: format!("alias {alias} is already mapped"),
                    });
                }
                tx.execute(
                    "UPDATE identities SET revision = revision + 1, confidence = MIN(confidence, ?2)
                     WHERE canonical_id = ?1",
                    params![canonical_id.to_string(), score.clamp(0.0, 1.0)],
                )
                .context("failed to bump identity revision")?;
                insert_alias(&tx, alias, *canonical_id, *at)?;
            }
            IdentityEvent::Merged { sources, into, at, .. } => {
                let [left, right] = sources;
                tx.execute(
                    "INSERT INTO identities(canonical_id, confidence, revision, merged_into, created_at)
                     SELECT ?1, MIN(confidence), 1, NULL, ?2 FROM identities
                     WHERE canonical_id IN (?3, ?4)",
                    params![into.to_string(), rfc3339(*at)?, left.to_string(), right.to_string()],
                )
                .context("failed to insert merged identity")?;
                tx.execute(
                    "UPDATE identities SET merged_into = ?1, revision = revision + 1
                     WHERE canonical_id IN (?2, ?3)",
                    params![into.to_string(), left.to_string(), right.to_string()],
                )
                .context("failed to mark identities as merged")?;
                tx.execute(
                    "UPDATE identity_aliases SET canonical_id = ?1 WHERE canonical_id IN (?2, ?3)",
                    params![into.to_string(), left.to_string(), right.to_string()],
                )
                .context("failed to move aliases to merged identity")?;
                tx.execute(
                    "UPDATE identity_overrides SET canonical_id = ?1 WHERE canonical_id IN (?2, ?3)",
                    params![into.to_string(), left.to_string(), right.to_string()],
                )
                .context("failed to move overrides to merged identity")?;
            }
            IdentityEvent::OverrideSet { alias, canonical_id, writer, at } => {
                match select_identity_state(&tx, *canonical_id)? {
                    Some((_, None)) => {}
                    _ => {
                        return Ok(CommitOutcome::Conflict {
                            reason: format!("override target {canonical_id} is not a live identity"),
                        });
                    }
                }
                let previous = alias_owner(&tx, alias)?;
                if previous != Some(*canonical_id) {
                    if let Some(previous) = previous {
                        bump_revision(&tx, previous)?;
                    }
                    bump_revision(&tx, *canonical_id)?;
                    tx.execute(
                        "INSERT INTO identity_aliases(alias_key, canonical_id, attached_at)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT(alias_key) DO UPDATE SET
                            canonical_id = excluded.canonical_id,
                            attached_at = excluded.attached_at",
                        params![alias, canonical_id.to_string(), rfc3339(*at)?],
                    )
                    .context("failed to move alias to override target")?;
                }
                tx.execute(
                    "INSERT INTO identity_overrides(alias_key, canonical_id, writer, set_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(alias_key) DO UPDATE SET
                        canonical_id = excluded.canonical_id,
                        writer = excluded.writer,
                        set_at = excluded.set_at",
                    params![alias, canonical_id.to_string(), writer, rfc3339(*at)?],
                )
                .context("failed to write identity override")?;
            }
        }

        if let IdentityEvent::Created { alias, .. }
        | IdentityEvent::AliasAttached { alias, .. }
        | IdentityEvent::OverrideSet { alias, .. } = &change.event
        {
            tx.execute("DELETE FROM identity_reviews WHERE alias_key = ?1", params![alias])
                .context("failed to clear resolved review item")?;
        }

        let event_json =
            serde_json::to_string(&change.event).context("failed to serialize identity event")?;
        tx.execute(
            "INSERT INTO identity_events(event_kind, event_json, recorded_at) VALUES (?1, ?2, ?3)",
            params![change.event.kind(), event_json, now_rfc3339()?],
        )
        .context("failed to append identity event")?;
        let seq = tx.last_insert_rowid();

        tx.commit().context("failed to commit identity transaction")?;
        debug!(seq, kind = change.event.kind(), "committed identity event");
        Ok(CommitOutcome::Committed { seq })
    }

    /// Audit events after `seq`, in log order.
    ///
    /// # Errors
    /// Returns an error when events cannot be read or decoded.
    pub fn identity_events_since(&self, seq: i64) -> Result<Vec<RecordedEvent>> {
        let mut stmt = self
            .conn
            .prepare("SELECT seq, event_json FROM identity_events WHERE seq > ?1 ORDER BY seq ASC")
            .context("failed to prepare identity event query")?;
        let rows = stmt.query_map(params![seq], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (seq, event_json) = row?;
            let event = serde_json::from_str(&event_json)
                .with_context(|| format!("identity event {seq} is not decodable"))?;
            events.push(RecordedEvent { seq, event });
        }
        Ok(events)
    }

    /// Queue an ambiguous resolution for manual review. Repeat sightings bump the counter.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn record_review(
        &mut self,
        raw: &RawIdentifier,
        candidate: CanonicalId,
        score: f64,
        now: OffsetDateTime,
    ) -> Result<()> {
        let seen_at = rfc3339(now)?;
        self.conn
            .execute(
                "INSERT INTO identity_reviews(
                    alias_key, candidate_id, score, first_seen_at, last_seen_at, occurrences
                 ) VALUES (?1, ?2, ?3, ?4, ?4, 1)
                 ON CONFLICT(alias_key) DO UPDATE SET
                    candidate_id = excluded.candidate_id,
                    score = excluded.score,
                    last_seen_at = excluded.last_seen_at,
                    occurrences = identity_reviews.occurrences + 1",
                params![raw.alias_key(), candidate.to_string(), score, seen_at],
            )
            .context("failed to record identity review")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when review items cannot be read or decoded.
    pub fn list_reviews(&self) -> Result<Vec<ReviewItem>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT alias_key, candidate_id, score, first_seen_at, last_seen_at, occurrences
                 FROM identity_reviews ORDER BY first_seen_at ASC, alias_key ASC",
            )
            .context("failed to prepare review listing")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (alias_key, candidate, score, first_seen_at, last_seen_at, occurrences) = row?;
            items.push(ReviewItem {
                raw: RawIdentifier::from_alias_key(&alias_key)?,
                alias_key,
                candidate: candidate.parse()?,
                score,
                first_seen_at: parse_rfc3339(&first_seen_at)?,
                last_seen_at: parse_rfc3339(&last_seen_at)?,
                occurrences,
            });
        }
        Ok(items)
    }

    // ---- maintenance ----

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

fn select_claim(conn: &Connection, fingerprint: Fingerprint) -> Result<Option<ComputationClaim>> {
    let row = conn
        .query_row(
            "SELECT fingerprint, owner, state, claimed_at_ms, expires_at_ms, attempt
             FROM computation_claims WHERE fingerprint = ?1",
            params![fingerprint.to_hex()],
            claim_row,
        )
        .optional()
        .context("failed to read computation claim")?;
    row.map(claim_from_row).transpose()
}

fn claim_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClaimRow> {
    Ok(ClaimRow {
        fingerprint: row.get(0)?,
        owner: row.get(1)?,
        state: row.get(2)?,
        claimed_at_ms: row.get(3)?,
        expires_at_ms: row.get(4)?,
        attempt: row.get(5)?,
    })
}

fn claim_from_row(row: ClaimRow) -> Result<ComputationClaim> {
    Ok(ComputationClaim {
        fingerprint: parse_fingerprint(&row.fingerprint)?,
        owner: row.owner,
        state: ClaimState::parse(&row.state)?,
        claimed_at: from_unix_millis(row.claimed_at_ms)?,
        expires_at: from_unix_millis(row.expires_at_ms)?,
        attempt: u32::try_from(row.attempt).context("claim attempt out of range")?,
    })
}

fn artifact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArtifactRow> {
    Ok(ArtifactRow {
        fingerprint: row.get(0)?,
        query_kind: row.get(1)?,
        payload_json: row.get(2)?,
        created_at_ms: row.get(3)?,
        source_watermark: row.get(4)?,
        ttl_secs: row.get(5)?,
    })
}

fn artifact_from_row(row: ArtifactRow) -> Result<CachedArtifact> {
    Ok(CachedArtifact {
        fingerprint: parse_fingerprint(&row.fingerprint)?,
        query_kind: row.query_kind,
        payload: serde_json::from_str(&row.payload_json)
            .context("stored artifact payload is not valid JSON")?,
        created_at: from_unix_millis(row.created_at_ms)?,
        source_watermark: watermark_from_sql(row.source_watermark)?,
        ttl_secs: u64::try_from(row.ttl_secs).context("stored artifact ttl is negative")?,
    })
}

fn select_identity_state(
    conn: &Connection,
    canonical_id: CanonicalId,
) -> Result<Option<(u64, Option<String>)>> {
    let row = conn
        .query_row(
            "SELECT revision, merged_into FROM identities WHERE canonical_id = ?1",
            params![canonical_id.to_string()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
        )
        .optional()
        .context("failed to read identity revision")?;
    row.map(|(revision, merged_into)| {
        Ok((u64::try_from(revision).context("identity revision is negative")?, merged_into))
    })
    .transpose()
}

fn alias_owner(conn: &Connection, alias_key: &str) -> Result<Option<CanonicalId>> {
    let owner: Option<String> = conn
        .query_row(
            "SELECT canonical_id FROM identity_aliases WHERE alias_key = ?1",
            params![alias_key],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read alias owner")?;
    owner.map(|raw| raw.parse::<CanonicalId>().map_err(anyhow::Error::from)).transpose()
}

fn insert_alias(
    conn: &Connection,
    alias_key: &str,
    canonical_id: CanonicalId,
    at: OffsetDateTime,
) -> Result<()> {
    conn.execute(
        "INSERT INTO identity_aliases(alias_key, canonical_id, attached_at) VALUES (?1, ?2, ?3)",
        params![alias_key, canonical_id.to_string(), rfc3339(at)?],
    )
    .with_context(|| format!("failed to insert alias {alias_key}"))?;
    Ok(())
}

fn bump_revision(conn: &Connection, canonical_id: CanonicalId) -> Result<()> {
    conn.execute(
        "UPDATE identities SET revision = revision + 1 WHERE canonical_id = ?1",
        params![canonical_id.to_string()],
    )
    .context("failed to bump identity revision")?;
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn watermark_to_sql(watermark: Watermark) -> Result<i64> {
    i64::try_from(watermark.0).with_context(|| format!("watermark {watermark} exceeds i64 range"))
}

fn watermark_from_sql(value: i64) -> Result<Watermark> {
    u64::try_from(value).map(Watermark).with_context(|| format!("stored watermark is negative: {value}"))
}

fn fact_nanos(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos())
        .with_context(|| format!("fact timestamp out of storable range: {value}"))
}

fn parse_fingerprint(raw: &str) -> Result<Fingerprint> {
    raw.parse::<Fingerprint>().with_context(|| format!("invalid stored fingerprint: {raw}"))
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
