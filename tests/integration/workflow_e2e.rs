//! End-to-end lifecycle tests.
//!
//! A unit goes GOAL through COMPLETE in its own worktree and its work
//! lands on the base branch.

use ensemble::core::{Phase, UnitStatus};

use crate::fixtures::{id, paths, Harness, Step};

/// Test: Happy Path
/// Given a unit with a committed goal document
/// When every phase succeeds and the agent sets the marker
/// Then the unit is DONE and its change is merged into main
#[tokio::test]
async fn test_unit_lifecycle_merges_into_base() {
    let mut harness = Harness::new(2);
    harness.repo.add_goal("auth", "FUTURE", &["src/auth.rs"]);
    harness.runner.script(
        "auth",
        vec![
            Step::Succeed,
            Step::Succeed,
            Step::Edit {
                file: "src/auth.rs".into(),
                contents: "pub fn login() {}\n".into(),
            },
            Step::Mark {
                status: "ACTIVE".into(),
            },
        ],
    );

    let unit = harness
        .scheduler
        .create_unit(id("auth"), None, 0)
        .await
        .unwrap();
    assert_eq!(unit.footprint, paths(&["src/auth.rs"]).unwrap());

    harness.drive(20).await;

    let unit = harness.unit("auth");
    assert_eq!(unit.status, UnitStatus::Done);
    assert_eq!(unit.phase, Phase::Complete);
    assert_eq!(unit.completion_retries, 0);
    assert_eq!(
        harness.repo.read("src/auth.rs").as_deref(),
        Some("pub fn login() {}\n")
    );

    let phases: Vec<Phase> = harness
        .runner
        .calls_for("auth")
        .iter()
        .map(|c| c.phase)
        .collect();
    assert_eq!(phases, Phase::ALL.to_vec());

    let statuses: Vec<UnitStatus> = unit.history.iter().map(|h| h.status).collect();
    assert_eq!(statuses.first(), Some(&UnitStatus::Ready));
    assert_eq!(statuses.last(), Some(&UnitStatus::Done));

    let names: Vec<&str> = harness.drain_events().iter().map(|e| e.name()).collect();
    assert_eq!(names.first(), Some(&"created"));
    assert!(names.contains(&"transitioned"));
}

/// Test: Question Forwarding
/// Given an agent that asks a question in the GOAL phase
/// When the operator answers
/// Then the same session resumes with the answer and the unit finishes
#[tokio::test]
async fn test_question_answer_resumes_session() {
    let mut harness = Harness::new(1);
    harness.repo.add_goal("api", "FUTURE", &["src/api.rs"]);
    harness.runner.script(
        "api",
        vec![
            Step::Ask("Which port should the server use?".into()),
            Step::Succeed,
            Step::Succeed,
            Step::Succeed,
            Step::Mark {
                status: "ACTIVE".into(),
            },
        ],
    );
    harness
        .scheduler
        .create_unit(id("api"), None, 0)
        .await
        .unwrap();

    harness.drive(5).await;
    let unit = harness.unit("api");
    assert_eq!(unit.status, UnitStatus::NeedsAttention);
    assert_eq!(unit.phase, Phase::Goal);
    assert!(unit
        .attention_reason
        .as_deref()
        .unwrap()
        .contains("Which port should the server use?"));

    harness
        .scheduler
        .answer(&id("api"), "8080".into())
        .await
        .unwrap();
    harness.drive(20).await;

    assert_eq!(harness.status("api"), UnitStatus::Done);
    let calls = harness.runner.calls_for("api");
    assert_eq!(calls.len(), 5);
    assert_eq!(calls[1].phase, Phase::Goal);
    assert_eq!(calls[1].resume.as_deref(), Some("session-api"));
    assert!(calls[1].prompt.contains("8080"));
}

/// Test: Agent Failure
/// Given an agent that fails in the PLAN phase
/// When the operator forces a retry
/// Then the PLAN phase reruns and the unit completes
#[tokio::test]
async fn test_failure_then_operator_retry() {
    let mut harness = Harness::new(1);
    harness.repo.add_goal("db", "FUTURE", &["src/db.rs"]);
    harness.runner.script(
        "db",
        vec![
            Step::Succeed,
            Step::Fail("rate limited".into()),
            Step::Succeed,
            Step::Succeed,
            Step::Mark {
                status: "ACTIVE".into(),
            },
        ],
    );
    harness
        .scheduler
        .create_unit(id("db"), None, 0)
        .await
        .unwrap();

    harness.drive(10).await;
    let unit = harness.unit("db");
    assert_eq!(unit.status, UnitStatus::NeedsAttention);
    assert_eq!(
        unit.attention_reason.as_deref(),
        Some("agent failed in PLAN phase: rate limited")
    );

    let unit = harness.scheduler.retry(&id("db")).await.unwrap();
    assert_eq!(unit.status, UnitStatus::Ready);
    assert_eq!(unit.phase, Phase::Plan);
    assert_eq!(unit.attention_reason, None);

    harness.drive(20).await;
    assert_eq!(harness.status("db"), UnitStatus::Done);
}

/// Test: Unknown Unit
/// Operator writes against a unit that does not exist are rejected.
#[tokio::test]
async fn test_operations_on_missing_unit() {
    let harness = Harness::new(1);
    let scheduler = &harness.scheduler;
    assert!(scheduler.retry(&id("ghost")).await.is_err());
    assert!(scheduler.answer(&id("ghost"), "x".into()).await.is_err());
    assert!(scheduler.delete_unit(&id("ghost")).await.is_err());
    assert!(scheduler.store().list(None).unwrap().is_empty());
}
