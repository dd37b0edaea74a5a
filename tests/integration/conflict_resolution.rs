//! Conflict handling tests.
//!
//! The oracle errs toward asking: any possible overlap with a running unit
//! goes to the operator, and the operator's verdict is remembered.

use std::collections::BTreeSet;

use ensemble::core::{UnitPair, UnitStatus, Verdict};
use ensemble::orchestration::UnitEvent;

use crate::fixtures::{id, paths, Harness};

/// Test: Undeclared Footprint
/// Given a running unit and a unit whose goal declares nothing
/// When the scheduler considers the second unit
/// Then it is flagged instead of dispatched
#[tokio::test]
async fn test_undeclared_footprint_is_flagged() {
    let mut harness = Harness::new(4);
    harness
        .scheduler
        .create_unit(id("a"), paths(&["src/a.rs"]), 1)
        .await
        .unwrap();
    // No goal document and no explicit paths.
    let b = harness
        .scheduler
        .create_unit(id("b"), None, 0)
        .await
        .unwrap();
    assert!(b.footprint.is_empty());

    let report = harness.scheduler.pass().await.unwrap();
    assert_eq!(report.dispatched, vec![id("a")]);
    assert_eq!(report.flagged, vec![id("b")]);

    let b = harness.unit("b");
    assert_eq!(b.conflicts_with, BTreeSet::from([id("a")]));
    assert!(b.attention_reason.unwrap().contains("a"));
}

/// Test: Directory Prefix Overlap
/// A unit declaring a directory conflicts with one declaring a file inside it.
#[tokio::test]
async fn test_directory_contains_file() {
    let mut harness = Harness::new(4);
    harness
        .scheduler
        .create_unit(id("outer"), paths(&["src/"]), 1)
        .await
        .unwrap();
    harness
        .scheduler
        .create_unit(id("inner"), paths(&["./src/net/tcp.rs"]), 0)
        .await
        .unwrap();
    harness
        .scheduler
        .create_unit(id("sibling"), paths(&["srcs/other.rs"]), 0)
        .await
        .unwrap();

    let report = harness.scheduler.pass().await.unwrap();
    assert_eq!(report.dispatched, vec![id("outer"), id("sibling")]);
    assert_eq!(report.flagged, vec![id("inner")]);
}

/// Test: Parallelize Verdict
/// Given a flagged pair
/// When the operator rules `parallelize`
/// Then both run together, the verdict is stored, and later phases are
/// not flagged again
#[tokio::test]
async fn test_parallelize_verdict_is_remembered() {
    let mut harness = Harness::new(4);
    harness
        .scheduler
        .create_unit(id("a"), paths(&["src/x.rs"]), 1)
        .await
        .unwrap();
    harness
        .scheduler
        .create_unit(id("b"), paths(&["src/x.rs"]), 0)
        .await
        .unwrap();
    harness.scheduler.pass().await.unwrap();
    assert_eq!(harness.status("b"), UnitStatus::NeedsAttention);
    harness.drain_events();

    let b = harness
        .scheduler
        .submit_verdict(&id("b"), Verdict::Parallelize)
        .await
        .unwrap();
    assert_eq!(b.status, UnitStatus::Ready);
    assert!(b.conflicts_with.is_empty());

    let pair = UnitPair::new(id("b"), id("a")).unwrap();
    let verdicts = harness.scheduler.store().verdicts().unwrap();
    assert_eq!(
        verdicts.get(&pair.first, &pair.second),
        Some(Verdict::Parallelize)
    );

    let report = harness.scheduler.pass().await.unwrap();
    assert_eq!(report.dispatched, vec![id("b")]);

    let cleared = harness.drain_events().into_iter().any(|e| {
        matches!(
            e,
            UnitEvent::AttentionChanged { ref unit_id, needs_attention: false, .. } if *unit_id == id("b")
        )
    });
    assert!(cleared, "clearing attention publishes an event");

    // Both units cycle through their phases without being flagged again.
    for _ in 0..6 {
        harness.scheduler.step().await.unwrap();
        let report = harness.scheduler.pass().await.unwrap();
        assert!(report.flagged.is_empty());
    }
}

/// Test: Verdict Without Conflict
/// A verdict for a unit with nothing pending changes nothing.
#[tokio::test]
async fn test_verdict_without_pending_conflict() {
    let harness = Harness::new(1);
    let created = harness
        .scheduler
        .create_unit(id("solo"), paths(&["src/solo.rs"]), 0)
        .await
        .unwrap();
    let after = harness
        .scheduler
        .submit_verdict(&id("solo"), Verdict::Serialize)
        .await
        .unwrap();
    assert_eq!(after.status, created.status);
    assert!(harness.scheduler.store().verdicts().unwrap().is_empty());
}

/// Test: Last Verdict Wins
/// Recording a second verdict for the same pair replaces the first.
#[tokio::test]
async fn test_last_verdict_wins() {
    let harness = Harness::new(1);
    let store = harness.scheduler.store();
    let pair = UnitPair::new(id("a"), id("b")).unwrap();
    store.record_verdict(&pair, Verdict::Serialize).unwrap();
    store.record_verdict(&pair, Verdict::Parallelize).unwrap();

    let verdicts = store.verdicts().unwrap();
    assert_eq!(verdicts.len(), 1);
    assert_eq!(verdicts.get(&id("b"), &id("a")), Some(Verdict::Parallelize));
}
