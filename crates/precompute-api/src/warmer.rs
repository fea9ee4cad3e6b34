//! Bulk pre-computation of a known set of queries ahead of demand.

use std::sync::Arc;

use precompute_core::MetricQuery;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::coordinator::{ArtifactOrigin, ComputationCoordinator};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WarmFailure {
    pub kind: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct WarmReport {
    pub requested: usize,
    pub hits: usize,
    pub computed: usize,
    pub joined: usize,
    pub failures: Vec<WarmFailure>,
}

#[derive(Debug, Clone)]
pub struct CacheWarmer {
    coordinator: ComputationCoordinator,
    concurrency: usize,
}

impl CacheWarmer {
    #[must_use]
    pub fn new(coordinator: ComputationCoordinator, concurrency: usize) -> Self {
        Self { coordinator, concurrency: concurrency.max(1) }
    }

    /// Run every query through get-or-compute, at most `concurrency` at a time.
    /// One query failing never stops the rest.
    pub async fn warm(&self, queries: Vec<MetricQuery>) -> WarmReport {
        let mut report = WarmReport { requested: queries.len(), ..WarmReport::default() };
        let gate = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = Vec::with_capacity(queries.len());

        for query in queries {
            let coordinator = self.coordinator.clone();
            let gate = Arc::clone(&gate);
            let kind = query.kind.clone();
            let handle = tokio::spawn(async move {
                let _permit = gate.acquire_owned().await;
                coordinator.get_or_compute(query).await
            });
            tasks.push((kind, handle));
        }

        for (kind, handle) in tasks {
            match handle.await {
                Ok(Ok(computed)) => match computed.origin {
                    ArtifactOrigin::Hit => report.hits += 1,
                    ArtifactOrigin::Computed => report.computed += 1,
                    ArtifactOrigin::Joined => report.joined += 1,
                },
                Ok(Err(err)) => {
                    warn!(%kind, code = err.code(), error = %err, "warming query failed");
                    report.failures.push(WarmFailure {
                        kind,
                        code: err.code().to_string(),
                        message: err.to_string(),
                    });
                }
                Err(join_err) => {
                    report.failures.push(WarmFailure {
                        kind,
                        code: "task_failed".to_string(),
                        message: join_err.to_string(),
                    });
                }
            }
        }

        info!(
            requested = report.requested,
            hits = report.hits,
            computed = report.computed,
            joined = report.joined,
            failed = report.failures.len(),
            "cache warm finished"
        );
        report
    }
}
