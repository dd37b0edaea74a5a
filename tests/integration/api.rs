//! The HTTP API and its client against a live scheduler task.

use chrono::Utc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ensemble::api::types::CreateUnitRequest;
use ensemble::api::{self, AppState, DaemonClient};
use ensemble::core::{UnitStatus, Verdict};
use ensemble::orchestration::SchedulerHandle;
use ensemble::Result;

use crate::fixtures::{Harness, ScriptedRunner, Step, TestRepo};

struct Daemon {
    client: DaemonClient,
    base_url: String,
    shutdown: CancellationToken,
    scheduler: JoinHandle<Result<()>>,
    server: JoinHandle<std::io::Result<()>>,
    _repo: TestRepo,
}

impl Daemon {
    async fn start(setup: impl FnOnce(&ScriptedRunner)) -> Self {
        let Harness {
            repo,
            runner,
            scheduler,
            ..
        } = Harness::new(2);
        setup(&runner);

        let shutdown = CancellationToken::new();
        let (handle, commands) = SchedulerHandle::channel(16);
        let state = AppState {
            store: scheduler.store().clone(),
            scheduler: handle,
            events: scheduler.events().clone(),
            started_at: Utc::now(),
            pid: std::process::id(),
            max_agents: 2,
            shutdown: shutdown.clone(),
        };
        let scheduler = tokio::spawn(scheduler.run(commands, shutdown.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let token = shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, api::app(state))
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        });

        Self {
            client: DaemonClient::new(&base_url).unwrap(),
            base_url,
            shutdown,
            scheduler,
            server,
            _repo: repo,
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.server.await.unwrap().unwrap();
        self.scheduler.await.unwrap().unwrap();
    }
}

fn request(id: &str, footprint: &[&str], priority: i64) -> CreateUnitRequest {
    CreateUnitRequest {
        id: id.into(),
        footprint: Some(footprint.iter().map(|p| p.to_string()).collect()),
        priority,
    }
}

/// Test: Operator Round Trip
/// Create overlapping units over HTTP, see the conflict in the attention
/// list, rule on it, and read the result back.
#[tokio::test]
async fn test_operator_round_trip_over_http() {
    let daemon = Daemon::start(|runner| {
        runner.script("a", vec![Step::Hang]);
    })
    .await;
    let client = &daemon.client;
    assert!(client.is_healthy().await);

    let a = client.create(&request("a", &["src/x.rs"], 1)).await.unwrap();
    assert_eq!(a.status, UnitStatus::Ready);
    client.create(&request("b", &["src/x.rs"], 0)).await.unwrap();

    // The scheduler picks both up on its next tick.
    let mut attention = Vec::new();
    for _ in 0..100 {
        attention = client.attention().await.unwrap();
        if !attention.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(attention.len(), 1);
    assert_eq!(attention[0].id.as_str(), "b");
    assert_eq!(attention[0].related.len(), 1);

    let running = client.list(Some(UnitStatus::Running)).await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id.as_str(), "a");

    let b = client.verdict("b", Verdict::Serialize).await.unwrap();
    assert_eq!(b.status, UnitStatus::Blocked);
    assert!(client.attention().await.unwrap().is_empty());

    let report = client.status().await.unwrap();
    assert_eq!(report.max_agents, 2);
    assert_eq!(report.running_agents(), 1);
    assert_eq!(report.counts.get(&UnitStatus::Blocked), Some(&1));

    let detail = client.get("b").await.unwrap();
    assert!(detail.history.len() >= 3);

    daemon.stop().await;
}

/// Test: Error Mapping
/// Client errors come back with the server's message and status.
#[tokio::test]
async fn test_errors_over_http() {
    let daemon = Daemon::start(|runner| {
        runner.script("busy", vec![Step::Hang]);
    })
    .await;
    let client = &daemon.client;

    let missing = client.get("ghost").await.unwrap_err().to_string();
    assert!(missing.contains("404"), "{missing}");

    let bad = client
        .create(&request("../escape", &["x"], 0))
        .await
        .unwrap_err()
        .to_string();
    assert!(bad.contains("400"), "{bad}");

    client.create(&request("busy", &["src/busy"], 0)).await.unwrap();
    let dup = client
        .create(&request("busy", &["src/busy"], 0))
        .await
        .unwrap_err()
        .to_string();
    assert!(dup.contains("409"), "{dup}");

    let no_question = client.answer("busy", "yes").await.unwrap_err().to_string();
    assert!(no_question.contains("409"), "{no_question}");

    for _ in 0..100 {
        if client.get("busy").await.unwrap().status == UnitStatus::Running {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    let running = client.delete("busy").await.unwrap_err().to_string();
    assert!(running.contains("409"), "{running}");

    daemon.stop().await;
}

/// Test: Event Stream
/// A new subscriber is greeted, then sees unit events as they happen.
#[tokio::test]
async fn test_event_stream() {
    let daemon = Daemon::start(|_| {}).await;

    let mut stream = reqwest::get(format!("{}/api/events", daemon.base_url))
        .await
        .unwrap();
    assert!(stream.status().is_success());
    let greeting = stream.chunk().await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&greeting).contains("event: connected"));

    daemon
        .client
        .create(&request("watched", &["src/w.rs"], 0))
        .await
        .unwrap();

    let mut seen = String::new();
    while !seen.contains("\"watched\"") {
        let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), stream.chunk())
            .await
            .expect("event arrives")
            .unwrap()
            .expect("stream open");
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(seen.contains("event: unit"), "{seen}");
    assert!(seen.contains("\"created\""), "{seen}");

    drop(stream);
    daemon.stop().await;
}
