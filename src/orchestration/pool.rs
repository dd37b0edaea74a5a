//! Agent pool for concurrent sessions.
//!
//! The `AgentPool` owns the in-flight agent sessions, enforces the
//! concurrency limit and the per-session wall-clock timeout, and hands
//! finished sessions back to the scheduler one at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{Id as TaskId, JoinSet};
use tracing::{debug, warn};

use super::runner::{AgentRunner, RunOutcome, RunRequest};
use crate::core::UnitId;
use crate::{Error, Result};

/// Manages a pool of concurrent agent sessions.
///
/// # Example
///
/// ```ignore
/// let mut pool = AgentPool::new(runner, 4, Duration::from_secs(1800));
/// pool.spawn(request)?;
/// while let Some((unit, outcome)) = pool.join_next().await {
///     // feed the outcome back into the state machine
/// }
/// ```
pub struct AgentPool {
    runner: Arc<dyn AgentRunner>,
    max_concurrent: usize,
    timeout: Duration,
    tasks: JoinSet<(UnitId, RunOutcome)>,
    active: HashMap<TaskId, UnitId>,
}

impl AgentPool {
    pub fn new(runner: Arc<dyn AgentRunner>, max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            runner,
            max_concurrent,
            timeout,
            tasks: JoinSet::new(),
            active: HashMap::new(),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn has_capacity(&self) -> bool {
        self.active.len() < self.max_concurrent
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_running(&self, unit: &UnitId) -> bool {
        self.active.values().any(|u| u == unit)
    }

    /// Start a session for `request.unit`.
    ///
    /// # Errors
    ///
    /// [`Error::AgentPoolFull`] at capacity, [`Error::InvalidState`] if the
    /// unit already has a session in flight.
    pub fn spawn(&mut self, request: RunRequest) -> Result<()> {
        if !self.has_capacity() {
            return Err(Error::AgentPoolFull {
                max: self.max_concurrent,
            });
        }
        if self.is_running(&request.unit) {
            return Err(Error::InvalidState(format!(
                "{} already has an agent session",
                request.unit
            )));
        }

        let runner = Arc::clone(&self.runner);
        let timeout = self.timeout;
        let unit = request.unit.clone();
        let handle = self.tasks.spawn(async move {
            let unit = request.unit.clone();
            let outcome = match tokio::time::timeout(timeout, runner.run(request)).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => RunOutcome::Failed {
                    session_id: None,
                    error: e.to_string(),
                },
                Err(_) => RunOutcome::TimedOut { after: timeout },
            };
            (unit, outcome)
        });
        debug!(unit = %unit, active = self.active.len() + 1, "agent session spawned");
        self.active.insert(handle.id(), unit);
        Ok(())
    }

    /// Wait for the next session to finish. `None` when the pool is empty.
    pub async fn join_next(&mut self) -> Option<(UnitId, RunOutcome)> {
        let joined = self.tasks.join_next_with_id().await?;
        match joined {
            Ok((id, (unit, outcome))) => {
                self.active.remove(&id);
                Some((unit, outcome))
            }
            Err(e) => {
                let unit = self.active.remove(&e.id())?;
                warn!(unit = %unit, error = %e, "agent task ended abnormally");
                Some((
                    unit,
                    RunOutcome::Failed {
                        session_id: None,
                        error: format!("agent task ended abnormally: {e}"),
                    },
                ))
            }
        }
    }

    /// Abort every session and return the units that were in flight.
    pub async fn shutdown(&mut self) -> Vec<UnitId> {
        let mut units: Vec<UnitId> = self.active.drain().map(|(_, u)| u).collect();
        units.sort();
        self.tasks.shutdown().await;
        units
    }
}
