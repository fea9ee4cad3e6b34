use criterion::{criterion_group, criterion_main, Criterion};
use precompute_core::{
    CanonicalId, FingerprintComputer, IdentityEvent, IdentityIndex, MetricQuery, QueryParams,
    RawIdentifier, RecordedEvent, ResolverPolicy, ScoringWeights, SourceSystem, Watermark,
};
use time::OffsetDateTime;

fn mk_query(index: u64) -> MetricQuery {
    MetricQuery::new(
        "pr-lead-time",
        QueryParams::new()
            .with_list("repos", (0..20).rev().map(|repo| format!("org/repo-{repo}")))
            .with_entity_ids("teams", (0..50).map(|team| (team * 7919 + index) % 1_000))
            .with_scalar("granularity", "week"),
    )
}

fn mk_index(identities: usize) -> IdentityIndex {
    let events = (0..identities)
        .map(|index| RecordedEvent {
            seq: i64::try_from(index).unwrap_or(i64::MAX) + 1,
            event: IdentityEvent::Created {
                canonical_id: CanonicalId::new(),
                alias: format!("git:dev.number{index}@example.com"),
                at: OffsetDateTime::UNIX_EPOCH,
            },
        })
        .collect::<Vec<_>>();
    match IdentityIndex::replay(&events) {
        Ok(index) => index,
        Err(err) => panic!("benchmark identity index failed to build: {err}"),
    }
}

fn bench_fingerprint(c: &mut Criterion) {
    let computer = FingerprintComputer::new(1, 1);
    let queries = (0..100).map(mk_query).collect::<Vec<_>>();

    c.bench_function("fingerprint_100_queries", |b| {
        b.iter(|| {
            for query in &queries {
                if let Err(err) = computer.fingerprint(query, Watermark(42)) {
                    panic!("fingerprint benchmark failed: {err}");
                }
            }
        });
    });
}

fn bench_resolve(c: &mut Criterion) {
    let index = mk_index(10_000);
    let policy = ResolverPolicy {
        acceptance_threshold: 0.45,
        ambiguity_band: 0.1,
        weights: ScoringWeights { token_overlap: 0.4, compact_match: 0.5, domain_match: 0.1 },
    };
    let raw = RawIdentifier { source: SourceSystem::Github, value: "devnumber4242".to_string() };

    c.bench_function("plan_resolution_10000_identities", |b| {
        b.iter(|| index.plan_resolution(&raw, &policy));
    });
}

criterion_group!(resolver_benches, bench_fingerprint, bench_resolve);
criterion_main!(resolver_benches);
