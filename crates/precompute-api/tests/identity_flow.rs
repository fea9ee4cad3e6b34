mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::{open_kernel, test_config, FakeSource, ScriptedComputer};
use precompute_api::{
    ActivityRecord, Collaborators, ContributorStatus, FactAppend, MemoryCache, PrecomputeKernel,
    ResolutionOutcome,
};
use precompute_core::{
    KernelError, PersistentFact, RawIdentifier, SourceSystem, StaticKeyProvider, TimeRange,
};
use serde_json::json;
use time::macros::datetime;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn raw(source: SourceSystem, value: &str) -> RawIdentifier {
    RawIdentifier::new(source, value).unwrap_or_else(|err| panic!("bad identifier {value}: {err}"))
}

async fn solo(dir: &tempfile::TempDir) -> Arc<PrecomputeKernel> {
    open_kernel(
        test_config(&dir.path().join("identity.sqlite3"), "solo"),
        FakeSource::at(1),
        ScriptedComputer::new(Duration::ZERO),
    )
    .await
}

#[tokio::test(flavor = "multi_thread")]
async fn email_and_login_of_one_person_share_an_identity() -> TestResult {
    let dir = tempfile::tempdir()?;
    let kernel = solo(&dir).await;

    let email = kernel.resolve_identity(&raw(SourceSystem::Git, "j.smith@co.com")).await?;
    assert_eq!(email.outcome, ResolutionOutcome::Created);

    let login = kernel.resolve_identity(&raw(SourceSystem::Github, "jsmith")).await?;
    assert_eq!(login.canonical_id, email.canonical_id);
    match login.outcome {
        ResolutionOutcome::Attached { score } => assert!((score - 0.5).abs() < 1e-9),
        other => panic!("expected attach, got {other:?}"),
    }

    let other = kernel.resolve_identity(&raw(SourceSystem::Git, "a.jones@co.com")).await?;
    assert_ne!(other.canonical_id, email.canonical_id);

    let again = kernel.resolve_identity(&raw(SourceSystem::Github, " JSmith ")).await?;
    assert_eq!(again.outcome, ResolutionOutcome::Known);
    assert_eq!(again.canonical_id, email.canonical_id);

    let view = kernel.identities().show(email.canonical_id).await?;
    assert_eq!(view.identity.revision, 2);
    assert!((view.identity.confidence - 0.5).abs() < 1e-9);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn ambiguous_matches_are_queued_for_review() -> TestResult {
    let dir = tempfile::tempdir()?;
    let mut config = test_config(&dir.path().join("review.sqlite3"), "solo");
    config.resolver.ambiguity_band = 0.3;
    let kernel = open_kernel(config, FakeSource::at(1), ScriptedComputer::new(Duration::ZERO)).await;

    let john = kernel.resolve_identity(&raw(SourceSystem::Git, "john.smith@co.com")).await?;
    for _ in 0..2 {
        let result = kernel.resolve_identity(&raw(SourceSystem::Jira, "smith")).await;
        assert!(matches!(result, Err(KernelError::IdentityAmbiguous { .. })));
    }

    let reviews = kernel.identities().pending_reviews().await?;
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].alias_key, "jira:smith");
    assert_eq!(reviews[0].candidate, john.canonical_id);
    assert_eq!(reviews[0].occurrences, 2);

    let pinned = kernel
        .identities()
        .set_override(&raw(SourceSystem::Jira, "smith"), john.canonical_id, "reviewer")
        .await?;
    assert_eq!(pinned, john.canonical_id);
    assert!(kernel.identities().pending_reviews().await?.is_empty());

    let resolved = kernel.resolve_identity(&raw(SourceSystem::Jira, "smith")).await?;
    assert_eq!(resolved.canonical_id, john.canonical_id);
    assert_eq!(resolved.outcome, ResolutionOutcome::Known);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn merging_twice_is_a_no_op() -> TestResult {
    let dir = tempfile::tempdir()?;
    let kernel = solo(&dir).await;
    let alice = kernel.resolve_identity(&raw(SourceSystem::Git, "alice@co.com")).await?;
    let rabbit = kernel.resolve_identity(&raw(SourceSystem::Github, "wonderland")).await?;

    let merged = kernel
        .merge_identities(alice.canonical_id, rabbit.canonical_id, "admin", "same person")
        .await?;
    assert!(merged.merged);

    let repeated = kernel
        .merge_identities(rabbit.canonical_id, alice.canonical_id, "admin", "same person")
        .await?;
    assert!(!repeated.merged);
    assert_eq!(repeated.canonical_id, merged.canonical_id);

    let view = kernel.identities().show(alice.canonical_id).await?;
    assert_eq!(view.identity.canonical_id, merged.canonical_id);
    let sources: BTreeSet<_> = view.merged_from.into_iter().collect();
    assert_eq!(sources, BTreeSet::from([alice.canonical_id, rabbit.canonical_id]));

    let login = kernel.resolve_identity(&raw(SourceSystem::Github, "wonderland")).await?;
    assert_eq!(login.canonical_id, merged.canonical_id);

    let blank = kernel.merge_identities(alice.canonical_id, rabbit.canonical_id, " ", "x").await;
    assert!(matches!(blank, Err(KernelError::Validation(_))));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_instances_agree_on_new_identities() -> TestResult {
    let dir = tempfile::tempdir()?;
    let db = dir.path().join("shared-identity.sqlite3");
    let first = open_kernel(
        test_config(&db, "instance-a"),
        FakeSource::at(1),
        ScriptedComputer::new(Duration::ZERO),
    )
    .await;
    let second = open_kernel(
        test_config(&db, "instance-b"),
        FakeSource::at(1),
        ScriptedComputer::new(Duration::ZERO),
    )
    .await;

    let mut tasks = Vec::new();
    for index in 0..8 {
        let kernel = if index % 2 == 0 { Arc::clone(&first) } else { Arc::clone(&second) };
        tasks.push(tokio::spawn(async move {
            kernel.resolve_identity(&raw(SourceSystem::Gitlab, "dana")).await
        }));
    }

    let mut ids = BTreeSet::new();
    for task in tasks {
        ids.insert(task.await??.canonical_id);
    }
    assert_eq!(ids.len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn codec_round_trips_and_fails_closed_without_key() -> TestResult {
    let dir = tempfile::tempdir()?;
    let kernel = solo(&dir).await;

    let token = kernel.encode_identifier("repo-4242")?;
    assert_ne!(token, "repo-4242");
    assert_eq!(token.len(), "repo-4242".len());
    assert_eq!(kernel.decode_identifier(&token)?, "repo-4242");

    let keyless = PrecomputeKernel::open(
        test_config(&dir.path().join("keyless.sqlite3"), "keyless"),
        Collaborators {
            source: FakeSource::at(1),
            computer: ScriptedComputer::new(Duration::ZERO),
            cache: Arc::new(MemoryCache::new(4)),
            keys: Arc::new(StaticKeyProvider::new()),
        },
    )
    .await?;
    assert!(matches!(
        keyless.encode_identifier("repo-4242"),
        Err(KernelError::KeyUnavailable(key_id)) if key_id == "primary"
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn facts_are_append_only() -> TestResult {
    let dir = tempfile::tempdir()?;
    let kernel = solo(&dir).await;
    let release = PersistentFact::new(
        "repo/org/api",
        "release",
        datetime!(2024-03-01 12:00 UTC),
        json!({"tag": "v1.2.0"}),
    );

    assert_eq!(kernel.append_fact(release.clone()).await?, FactAppend::Inserted);
    assert_eq!(kernel.append_fact(release.clone()).await?, FactAppend::AlreadyPresent);

    let rewritten = PersistentFact { payload: json!({"tag": "v1.2.1"}), ..release.clone() };
    assert!(matches!(
        kernel.append_fact(rewritten).await,
        Err(KernelError::FactConflict { .. })
    ));

    let later = PersistentFact::new(
        "repo/org/api",
        "deployment",
        datetime!(2024-03-02 08:30 UTC),
        json!({"env": "prod"}),
    );
    kernel.append_fact(later.clone()).await?;

    let march = TimeRange::new(datetime!(2024-03-01 00:00 UTC), datetime!(2024-04-01 00:00 UTC))?;
    assert_eq!(kernel.query_facts("repo/org/api", march).await?, vec![release.clone(), later]);

    let first_day =
        TimeRange::new(datetime!(2024-03-01 00:00 UTC), datetime!(2024-03-02 00:00 UTC))?;
    assert_eq!(kernel.query_facts("repo/org/api", first_day).await?, vec![release]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn activity_authors_resolve_to_contributors() -> TestResult {
    let dir = tempfile::tempdir()?;
    let source = FakeSource::at(1);
    for (system, author) in [
        (SourceSystem::Git, "j.smith@co.com"),
        (SourceSystem::Github, "jsmith"),
        (SourceSystem::Github, "   "),
    ] {
        source.push_activity(ActivityRecord {
            source: system,
            author: author.to_string(),
            subject_id: "repo/org/api".to_string(),
            kind: "commit".to_string(),
            occurred_at: datetime!(2024-05-10 09:00 UTC),
        });
    }
    let kernel = open_kernel(
        test_config(&dir.path().join("activity.sqlite3"), "solo"),
        source,
        ScriptedComputer::new(Duration::ZERO),
    )
    .await;

    let may = TimeRange::new(datetime!(2024-05-01 00:00 UTC), datetime!(2024-06-01 00:00 UTC))?;
    let contributors = kernel.resolve_activity_contributors(may).await?;
    assert_eq!(contributors.len(), 3);

    let ids: Vec<_> = contributors
        .iter()
        .filter_map(|entry| match &entry.status {
            ContributorStatus::Resolved { canonical_id } => Some(*canonical_id),
            _ => None,
        })
        .collect();
    assert_eq!(ids.len(), 2);
    assert_eq!(ids[0], ids[1]);
    assert!(matches!(
        &contributors[2].status,
        ContributorStatus::Rejected { code, .. } if code == "validation"
    ));
    Ok(())
}
