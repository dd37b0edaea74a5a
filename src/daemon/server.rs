//! The daemon process itself: `ensemble daemon run`.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::lock::{self, LockInfo};
use crate::agent::AgentCommand;
use crate::api::{self, AppState};
use crate::artifacts::ChunkArtifacts;
use crate::config::Config;
use crate::orchestration::{
    AgentPool, ClaudeRunner, EventBus, GitWorkspace, Scheduler, SchedulerConfig, SchedulerHandle,
};
use crate::state::StateStore;
use crate::{Error, Result};

const COMMAND_QUEUE: usize = 64;

/// Run the daemon in the foreground until SIGTERM or SIGINT.
///
/// Startup is all-or-nothing: a held lock, an unreadable store or an
/// unusable repository stops the process before anything is scheduled.
pub async fn run(repo_root: &Path, config: Config) -> Result<()> {
    config.validate()?;
    config.ensure_dirs(repo_root)?;

    let starting = LockInfo::current(&config.http.bind, 0);
    let lock = lock::acquire(&Config::lock_path(repo_root), starting.clone())?;

    let store_path = Config::store_path(repo_root);
    let store = StateStore::open(&store_path)?;
    info!(path = %store_path.display(), schema = store.schema_version()?, "state store open");

    let worktrees = config.worktrees_dir(repo_root);
    let workspace = GitWorkspace::new(repo_root, &worktrees, config.base_branch.as_deref())?;
    info!(base = workspace.base_branch(), worktrees = %worktrees.display(), "workspace ready");

    let runner = ClaudeRunner::new(AgentCommand::from_config(&config), repo_root, &worktrees);
    if !runner.agent().is_available() {
        warn!(
            agent = runner.agent().name(),
            command = config.effective_command(),
            "agent command not found on PATH; sessions will fail until it is installed"
        );
    }
    let pool = AgentPool::new(Arc::new(runner), config.max_agents, config.agent_timeout());
    let events = EventBus::default();
    let scheduler = Scheduler::new(
        store.clone(),
        pool,
        Arc::new(ChunkArtifacts::new(repo_root, &worktrees)),
        Arc::new(workspace),
        events.clone(),
        SchedulerConfig::from(&config),
    );
    scheduler.recover().await?;

    let listener = TcpListener::bind((config.http.bind.as_str(), config.http.port)).await?;
    let addr = listener.local_addr()?;
    lock.publish(&LockInfo {
        port: addr.port(),
        ..starting
    })?;
    info!(%addr, pid = std::process::id(), "daemon listening");

    let shutdown = CancellationToken::new();
    let (handle, commands) = SchedulerHandle::channel(COMMAND_QUEUE);
    let state = AppState {
        store,
        scheduler: handle,
        events,
        started_at: Utc::now(),
        pid: std::process::id(),
        max_agents: config.max_agents,
        shutdown: shutdown.clone(),
    };

    tokio::spawn({
        let token = shutdown.clone();
        async move {
            if let Err(e) = wait_for_signal().await {
                error!(error = %e, "signal handling failed");
            }
            token.cancel();
        }
    });

    let scheduler_task = tokio::spawn({
        let token = shutdown.clone();
        async move {
            let result = scheduler.run(commands, token.clone()).await;
            // A fatal scheduler error takes the HTTP server down with it.
            token.cancel();
            result
        }
    });

    let server_token = shutdown.clone();
    let served = axum::serve(listener, api::app(state))
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await;
    shutdown.cancel();

    let scheduled = scheduler_task
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?;
    served?;
    scheduled?;
    info!("daemon stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = term.recv() => info!("SIGTERM received, shutting down"),
        interrupted = tokio::signal::ctrl_c() => {
            interrupted?;
            info!("interrupt received, shutting down");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    Ok(())
}
