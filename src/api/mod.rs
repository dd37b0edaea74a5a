//! HTTP API for the CLI and dashboards.
//!
//! Reads go straight to the state store. Writes are forwarded to the
//! scheduler task so they are ordered with its own updates.

mod client;
mod routes;
mod sse;
pub mod types;

use axum::Router;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::orchestration::{EventBus, SchedulerHandle};
use crate::state::StateStore;

pub use client::DaemonClient;
pub use routes::{api_router, ApiError};
pub use types::{AttentionItem, StatusReport};

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: StateStore,
    pub scheduler: SchedulerHandle,
    pub events: EventBus,
    pub started_at: DateTime<Utc>,
    pub pid: u32,
    pub max_agents: usize,
    /// Ends open event streams so graceful shutdown can finish.
    pub shutdown: CancellationToken,
}

/// The full application: API routes under `/api`, permissive CORS for
/// local dashboards.
pub fn app(state: AppState) -> Router {
    Router::new()
        .nest("/api", api_router())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
