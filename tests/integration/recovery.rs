//! Recovery tests: incomplete closure, timeouts and daemon restarts.

use std::time::Duration;

use tempfile::TempDir;

use ensemble::core::{Phase, UnitStatus, Verdict};
use ensemble::state::StateStore;

use crate::fixtures::{id, paths, Harness, Step, TestRepo};

fn through_implement() -> Vec<Step> {
    vec![Step::Succeed, Step::Succeed, Step::Succeed]
}

/// Test: Completion Retry
/// Given an agent that forgets the completion marker twice
/// When the bound is three retries
/// Then the session is resumed with a reminder until the marker is set
#[tokio::test]
async fn test_completion_retries_until_marker_set() {
    let mut harness = Harness::with_options(1, Duration::from_secs(30), 3);
    let mut steps = through_implement();
    steps.extend([
        Step::Mark {
            status: "IMPLEMENTING".into(),
        },
        Step::Succeed,
        Step::Mark {
            status: "ACTIVE".into(),
        },
    ]);
    harness.runner.script("cache", steps);
    harness
        .scheduler
        .create_unit(id("cache"), paths(&["src/cache.rs"]), 0)
        .await
        .unwrap();

    harness.drive(20).await;

    let unit = harness.unit("cache");
    assert_eq!(unit.status, UnitStatus::Done);
    assert_eq!(unit.completion_retries, 0);

    let calls = harness.runner.calls_for("cache");
    assert_eq!(calls.len(), 6);
    for retry in &calls[4..] {
        assert_eq!(retry.phase, Phase::Complete);
        assert_eq!(retry.resume.as_deref(), Some("session-cache"));
        assert!(retry.prompt.contains("IMPLEMENTING"), "{}", retry.prompt);
    }
    assert!(calls[4].prompt.contains("1 of 3"));
    assert!(calls[5].prompt.contains("2 of 3"));
}

/// Test: Retry Bound
/// Given an agent that never sets the marker
/// When the retries run out
/// Then the unit needs attention with the retry count intact and its work
/// still uncommitted in the worktree
#[tokio::test]
async fn test_completion_retry_bound() {
    let mut harness = Harness::with_options(1, Duration::from_secs(30), 2);
    let mut steps = vec![
        Step::Succeed,
        Step::Succeed,
        Step::Edit {
            file: "src/queue.rs".into(),
            contents: "// wip\n".into(),
        },
    ];
    steps.push(Step::Mark {
        status: "IMPLEMENTING".into(),
    });
    harness.runner.script("queue", steps);
    harness
        .scheduler
        .create_unit(id("queue"), paths(&["src/queue.rs"]), 0)
        .await
        .unwrap();

    harness.drive(20).await;

    let unit = harness.unit("queue");
    assert_eq!(unit.status, UnitStatus::NeedsAttention);
    assert_eq!(unit.phase, Phase::Complete);
    assert_eq!(unit.completion_retries, 2);
    let reason = unit.attention_reason.unwrap();
    assert!(reason.starts_with("incomplete closure"), "{reason}");
    assert!(reason.contains("after 2 retries"), "{reason}");

    // One COMPLETE session plus two retries.
    let complete_runs = harness
        .runner
        .calls_for("queue")
        .iter()
        .filter(|c| c.phase == Phase::Complete)
        .count();
    assert_eq!(complete_runs, 3);

    let worktree = unit.worktree.unwrap();
    assert!(worktree.join("src/queue.rs").exists());
    assert_eq!(harness.repo.read("src/queue.rs"), None);

    // The operator override starts a fresh retry budget.
    let unit = harness.scheduler.retry(&id("queue")).await.unwrap();
    assert_eq!(unit.completion_retries, 0);
    assert_eq!(unit.status, UnitStatus::Ready);
}

/// Test: Agent Timeout
/// Given an agent that never returns
/// When its session exceeds the timeout
/// Then the unit needs attention and the worktree is kept
#[tokio::test]
async fn test_timeout_flags_unit_and_keeps_worktree() {
    let mut harness = Harness::with_options(1, Duration::from_millis(50), 3);
    harness.runner.script("slow", vec![Step::Hang]);
    harness
        .scheduler
        .create_unit(id("slow"), paths(&["src/slow.rs"]), 0)
        .await
        .unwrap();

    harness.drive(5).await;

    let unit = harness.unit("slow");
    assert_eq!(unit.status, UnitStatus::NeedsAttention);
    assert_eq!(unit.phase, Phase::Goal);
    let reason = unit.attention_reason.unwrap();
    assert!(reason.contains("timed out"), "{reason}");
    assert!(unit.worktree.unwrap().exists());
    assert_eq!(harness.scheduler.active_sessions(), 0);
}

/// Test: Restart
/// Given a store on disk with a RUNNING unit, a pending conflict and a
/// verdict
/// When a new scheduler opens it
/// Then everything reads back and the orphaned unit needs attention
#[tokio::test]
async fn test_restart_recovers_from_disk() {
    let state = TempDir::new().unwrap();
    let db = state.path().join("state.db");

    {
        let mut harness = Harness::build(
            TestRepo::new(),
            StateStore::open(&db).unwrap(),
            2,
            Duration::from_secs(30),
            3,
        );
        harness.runner.script("a", vec![Step::Hang]);
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
        harness
            .scheduler
            .create_unit(id("c"), paths(&["src/x.rs"]), 0)
            .await
            .unwrap();
        harness.scheduler.pass().await.unwrap();
        harness
            .scheduler
            .submit_verdict(&id("c"), Verdict::Serialize)
            .await
            .unwrap();
        assert_eq!(harness.status("a"), UnitStatus::Running);
        // Dropping the scheduler mid-session stands in for a crash.
    }

    let store = StateStore::open(&db).unwrap();
    let before = store.list(None).unwrap();
    let harness = Harness::build(TestRepo::new(), store, 2, Duration::from_secs(30), 3);

    let recovered = harness.scheduler.recover().await.unwrap();
    assert_eq!(recovered, vec![id("a")]);

    let a = harness.unit("a");
    assert_eq!(a.status, UnitStatus::NeedsAttention);
    assert!(a.attention_reason.unwrap().contains("restarted"));

    let b = harness.unit("b");
    let b_before = before.iter().find(|u| u.id == id("b")).unwrap();
    assert_eq!(&b, b_before);
    assert_eq!(b.conflicts_with.len(), 1);

    assert_eq!(harness.status("c"), UnitStatus::Blocked);
    let verdicts = harness.scheduler.store().verdicts().unwrap();
    assert_eq!(verdicts.get(&id("a"), &id("c")), Some(Verdict::Serialize));

    let counts = harness.scheduler.store().counts().unwrap();
    assert_eq!(counts.get(&UnitStatus::NeedsAttention), Some(&2));
    assert_eq!(counts.get(&UnitStatus::Blocked), Some(&1));
}

/// Test: Shutdown
/// Stopping the scheduler aborts live sessions and flags their units.
#[tokio::test]
async fn test_stop_flags_in_flight_units() {
    let mut harness = Harness::new(2);
    harness.runner.script("a", vec![Step::Hang]);
    harness
        .scheduler
        .create_unit(id("a"), paths(&["src/a.rs"]), 0)
        .await
        .unwrap();
    harness.scheduler.pass().await.unwrap();
    assert_eq!(harness.scheduler.active_sessions(), 1);

    let interrupted = harness.scheduler.stop().await;
    assert_eq!(interrupted, vec![id("a")]);
    let unit = harness.unit("a");
    assert_eq!(unit.status, UnitStatus::NeedsAttention);
    assert!(unit.attention_reason.unwrap().contains("daemon stopped"));
}
