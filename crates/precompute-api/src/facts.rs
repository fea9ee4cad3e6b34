use std::sync::Arc;

use precompute_core::{KernelError, PersistentFact, TimeRange};
use precompute_store_sqlite::AppendOutcome;
use serde::Serialize;
use tracing::{debug, error};

use crate::executor::StoreExecutor;

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FactAppend {
    Inserted,
    /// The identical fact was already recorded.
    AlreadyPresent,
}

/// Append-only log of facts keyed by `(subject_id, kind, timestamp)`.
#[derive(Debug, Clone)]
pub struct FactLog {
    executor: Arc<StoreExecutor>,
}

impl FactLog {
    #[must_use]
    pub fn new(executor: Arc<StoreExecutor>) -> Self {
        Self { executor }
    }

    /// Record a fact. Re-appending an identical fact is a no-op.
    ///
    /// # Errors
    /// Returns [`KernelError::FactConflict`] when a different payload already
    /// exists under the same key, and [`KernelError::Validation`] for malformed facts.
    pub async fn append(&self, fact: PersistentFact) -> Result<FactAppend, KernelError> {
        fact.validate()?;
        let stored = fact.clone();
        match self.executor.run(move |store| store.append_fact(&stored)).await? {
            AppendOutcome::Inserted => {
                debug!(subject_id = %fact.subject_id, kind = %fact.kind, "fact appended");
                Ok(FactAppend::Inserted)
            }
            AppendOutcome::AlreadyPresent => Ok(FactAppend::AlreadyPresent),
            AppendOutcome::Conflict { existing } => {
                error!(
                    subject_id = %fact.subject_id,
                    kind = %fact.kind,
                    existing = %existing.payload,
                    rejected = %fact.payload,
                    "fact key already holds a different payload"
                );
                Err(KernelError::FactConflict {
                    subject_id: fact.subject_id,
                    kind: fact.kind,
                    timestamp: existing
                        .timestamp
                        .format(&time::format_description::well_known::Rfc3339)
                        .unwrap_or_else(|_| existing.timestamp.to_string()),
                })
            }
        }
    }

    /// Facts for `subject_id` inside `range`, ordered by timestamp.
    ///
    /// # Errors
    /// Returns [`KernelError::Storage`] when the log cannot be read.
    pub async fn query(
        &self,
        subject_id: &str,
        range: TimeRange,
        kind: Option<&str>,
    ) -> Result<Vec<PersistentFact>, KernelError> {
        let subject_id = subject_id.to_string();
        let kind = kind.map(str::to_string);
        self.executor
            .run(move |store| store.query_facts(&subject_id, &range, kind.as_deref()))
            .await
    }
}
