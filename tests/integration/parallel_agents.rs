//! Parallel execution correctness tests.
//!
//! Disjoint units run side by side up to the pool limit; overlapping units
//! only run one after another once the operator says so.

use std::collections::BTreeSet;

use ensemble::core::{UnitStatus, Verdict};

use crate::fixtures::{id, paths, Harness, Step};

fn finish_with(file: &str, contents: &str) -> Vec<Step> {
    vec![
        Step::Succeed,
        Step::Succeed,
        Step::Edit {
            file: file.into(),
            contents: contents.into(),
        },
        Step::Mark {
            status: "ACTIVE".into(),
        },
    ]
}

/// Test: Disjoint Units
/// Given three units touching different directories
/// When the scheduler runs a pass
/// Then all three are dispatched together and all merge
#[tokio::test]
async fn test_disjoint_units_run_in_parallel() {
    let mut harness = Harness::new(4);
    for (unit, dir) in [("a", "src/a"), ("b", "src/b"), ("c", "docs")] {
        harness.runner.script(unit, finish_with(&format!("{dir}/out.txt"), unit));
        harness
            .scheduler
            .create_unit(id(unit), paths(&[dir]), 0)
            .await
            .unwrap();
    }

    let report = harness.scheduler.pass().await.unwrap();
    assert_eq!(report.dispatched, vec![id("a"), id("b"), id("c")]);
    assert!(report.flagged.is_empty());
    assert_eq!(harness.scheduler.active_sessions(), 3);

    harness.drive(40).await;
    for (unit, dir) in [("a", "src/a"), ("b", "src/b"), ("c", "docs")] {
        assert_eq!(harness.status(unit), UnitStatus::Done, "{unit}");
        assert_eq!(
            harness.repo.read(&format!("{dir}/out.txt")).as_deref(),
            Some(unit)
        );
    }
}

/// Test: Pool Limit
/// Given more ready units than agent slots
/// When the scheduler runs a pass
/// Then only as many as the limit start, highest priority first
#[tokio::test]
async fn test_pool_limit_and_priority() {
    let mut harness = Harness::new(2);
    for (unit, priority) in [("low", 0), ("high", 10), ("mid", 5)] {
        harness
            .scheduler
            .create_unit(id(unit), paths(&[&format!("src/{unit}")]), priority)
            .await
            .unwrap();
    }

    let report = harness.scheduler.pass().await.unwrap();
    assert_eq!(report.dispatched, vec![id("high"), id("mid")]);
    assert_eq!(harness.status("low"), UnitStatus::Ready);

    let running = harness
        .scheduler
        .store()
        .list(Some(UnitStatus::Running))
        .unwrap();
    assert_eq!(running.len(), 2);
}

/// Test: Serialized Overlap
/// Given two units that both touch src/x.rs
/// When the operator rules `serialize`
/// Then B waits BLOCKED until A is DONE and starts from A's result
#[tokio::test]
async fn test_serialize_verdict_orders_units() {
    let mut harness = Harness::new(4);
    harness.runner.script("a", finish_with("src/x.rs", "a\n"));
    harness.runner.script("b", finish_with("src/x.rs", "a\nb\n"));
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

    let report = harness.scheduler.pass().await.unwrap();
    assert_eq!(report.dispatched, vec![id("a")]);
    assert_eq!(report.flagged, vec![id("b")]);

    let b = harness
        .scheduler
        .submit_verdict(&id("b"), Verdict::Serialize)
        .await
        .unwrap();
    assert_eq!(b.status, UnitStatus::Blocked);
    assert_eq!(b.blocked_by, BTreeSet::from([id("a")]));

    harness.drive(40).await;
    assert_eq!(harness.status("a"), UnitStatus::Done);
    assert_eq!(harness.status("b"), UnitStatus::Done);
    assert_eq!(harness.repo.read("src/x.rs").as_deref(), Some("a\nb\n"));

    // B's first session started only after A's last one.
    let calls = harness.runner.calls();
    let last_a = calls.iter().rposition(|c| c.unit == id("a")).unwrap();
    let first_b = calls.iter().position(|c| c.unit == id("b")).unwrap();
    assert!(last_a < first_b);
}

/// Test: Running Units Are Never Concurrent On Overlap
/// However many passes run, two overlapping units are never both RUNNING
/// without a `parallelize` verdict.
#[tokio::test]
async fn test_overlap_never_runs_concurrently() {
    let mut harness = Harness::new(4);
    for unit in ["a", "b", "c"] {
        harness
            .scheduler
            .create_unit(id(unit), paths(&["src/shared"]), 0)
            .await
            .unwrap();
    }
    for _ in 0..5 {
        harness.scheduler.pass().await.unwrap();
        let running = harness
            .scheduler
            .store()
            .list(Some(UnitStatus::Running))
            .unwrap();
        assert!(running.len() <= 1, "overlapping units running together");
    }
    assert_eq!(harness.status("b"), UnitStatus::NeedsAttention);
    assert_eq!(harness.status("c"), UnitStatus::NeedsAttention);
}
