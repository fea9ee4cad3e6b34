#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use precompute_api::{
    ActivityRecord, Collaborators, ComputeError, MemoryCache, MetadataSource, MetricComputer,
    PrecomputeKernel, SourceError,
};
use precompute_core::{
    CacheConfig, CodecConfig, CodecKey, CoordinatorConfig, FingerprintConfig, MetricQuery,
    PrecomputeConfig, QueryParams, ResolverConfig, ScoringWeights, StaticKeyProvider, StoreConfig,
    TimeRange, Watermark,
};
use serde_json::{json, Value};

pub const KEY_ID: &str = "primary";

pub struct FakeSource {
    watermark: AtomicU64,
    failures_left: AtomicU32,
    activity: Mutex<Vec<ActivityRecord>>,
}

impl FakeSource {
    pub fn at(watermark: u64) -> Arc<Self> {
        Arc::new(Self {
            watermark: AtomicU64::new(watermark),
            failures_left: AtomicU32::new(0),
            activity: Mutex::new(Vec::new()),
        })
    }

    pub fn advance_to(&self, watermark: u64) {
        self.watermark.store(watermark, Ordering::SeqCst);
    }

    pub fn fail_next(&self, calls: u32) {
        self.failures_left.store(calls, Ordering::SeqCst);
    }

    pub fn push_activity(&self, record: ActivityRecord) {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner).push(record);
    }
}

impl MetadataSource for FakeSource {
    fn current_watermark(&self) -> Result<Watermark, SourceError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SourceError::Unavailable("metadata replica offline".to_string()));
        }
        Ok(Watermark(self.watermark.load(Ordering::SeqCst)))
    }

    fn activity(&self, range: &TimeRange) -> Result<Vec<ActivityRecord>, SourceError> {
        let records = self.activity.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.iter().filter(|record| range.contains(record.occurred_at)).cloned().collect())
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Transient(&'static str),
    Permanent(&'static str),
}

/// Computer that counts calls, sleeps `delay` per call, and follows a script
/// of outcomes before falling back to success.
pub struct ScriptedComputer {
    calls: AtomicUsize,
    delay: Duration,
    script: Mutex<VecDeque<Step>>,
}

impl ScriptedComputer {
    pub fn new(delay: Duration) -> Arc<Self> {
        Self::scripted(delay, Vec::new())
    }

    pub fn scripted(delay: Duration, steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), delay, script: Mutex::new(steps.into()) })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MetricComputer for ScriptedComputer {
    fn compute(&self, query: &MetricQuery, watermark: Watermark) -> Result<Value, ComputeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        std::thread::sleep(self.delay);
        let step = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(Step::Succeed);
        match step {
            Step::Succeed => Ok(json!({
                "kind": query.kind,
                "watermark": watermark.0,
                "call": call,
            })),
            Step::Transient(message) => Err(ComputeError::Transient(message.to_string())),
            Step::Permanent(message) => Err(ComputeError::Permanent(message.to_string())),
        }
    }
}

pub fn test_config(db_path: &Path, owner: &str) -> PrecomputeConfig {
    PrecomputeConfig {
        store: StoreConfig { path: db_path.to_path_buf(), workers: 2 },
        cache: CacheConfig { max_ttl_secs: 3_600, ..CacheConfig::default() },
        fingerprint: FingerprintConfig::default(),
        coordinator: CoordinatorConfig {
            owner_id: Some(owner.to_string()),
            claim_ttl_ms: 3_000,
            compute_timeout_ms: 1_000,
            source_timeout_ms: 500,
            max_attempts: 3,
            backoff_initial_ms: 5,
            backoff_max_ms: 20,
            backoff_multiplier: 2.0,
            waiter_timeout_ms: 5_000,
            poll_interval_ms: 10,
            max_inflight: 8,
            admission_wait_ms: 100,
            failure_memo_ms: 5_000,
        },
        resolver: ResolverConfig {
            acceptance_threshold: 0.45,
            ambiguity_band: 0.1,
            weights: ScoringWeights { token_overlap: 0.4, compact_match: 0.5, domain_match: 0.1 },
            max_merge_retries: 5,
        },
        codec: CodecConfig { key_id: KEY_ID.to_string() },
    }
}

pub fn codec_keys() -> Arc<StaticKeyProvider> {
    let key = CodecKey::new((0u8..32).collect())
        .unwrap_or_else(|err| panic!("test codec key rejected: {err}"));
    Arc::new(StaticKeyProvider::new().with_key(KEY_ID, key))
}

pub async fn open_kernel(
    config: PrecomputeConfig,
    source: Arc<FakeSource>,
    computer: Arc<ScriptedComputer>,
) -> Arc<PrecomputeKernel> {
    let cache = Arc::new(MemoryCache::new(config.cache.capacity));
    let kernel = PrecomputeKernel::open(
        config,
        Collaborators { source, computer, cache, keys: codec_keys() },
    )
    .await
    .unwrap_or_else(|err| panic!("kernel failed to open: {err}"));
    Arc::new(kernel)
}

pub fn lead_time_query() -> MetricQuery {
    MetricQuery::new(
        "pr-lead-time",
        QueryParams::new()
            .with_list("repos", ["org/api", "org/web"])
            .with_scalar("granularity", "week"),
    )
}
