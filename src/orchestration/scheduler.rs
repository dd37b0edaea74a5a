//! Scheduler for parallel work units.
//!
//! The Scheduler is the single writer of unit state while the daemon runs.
//! Each pass it releases BLOCKED units whose blockers are done, asks the
//! conflict oracle about every READY unit against a snapshot of the RUNNING
//! ones, and dispatches the approved units to the agent pool. Finished
//! sessions come back through [`Scheduler::handle_outcome`]; operator and
//! collaborator writes arrive as [`Command`]s over a channel so they are
//! ordered with the scheduler's own updates.
//!
//! Every change is persisted before its consequence (spawning an agent,
//! publishing an event) happens.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{changes, EventBus, UnitEvent, UnitSummary};
use super::oracle::{self, Assessment};
use super::pool::AgentPool;
use super::prompts;
use super::runner::{RunOutcome, RunRequest};
use super::workspace::Workspace;
use crate::artifacts::ArtifactSource;
use crate::config::Config;
use crate::core::{Phase, UnitId, UnitPair, UnitStatus, Verdict, WorkUnit};
use crate::state::StateStore;
use crate::util::{blocking, tail_chars};
use crate::{Error, Result};

/// Longest agent error text copied into an attention reason.
const MAX_REASON_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_completion_retries: u32,
    pub poll_interval: Duration,
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_completion_retries: config.max_completion_retries,
            poll_interval: config.poll_interval(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// What one scheduling pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub unblocked: Vec<UnitId>,
    pub dispatched: Vec<UnitId>,
    pub flagged: Vec<UnitId>,
    pub blocked: Vec<UnitId>,
}

impl PassReport {
    pub fn is_idle(&self) -> bool {
        self.unblocked.is_empty()
            && self.dispatched.is_empty()
            && self.flagged.is_empty()
            && self.blocked.is_empty()
    }
}

/// A write requested from outside the scheduler task.
#[derive(Debug)]
pub enum Command {
    Create {
        id: UnitId,
        footprint: Option<BTreeSet<String>>,
        priority: i64,
        reply: oneshot::Sender<Result<WorkUnit>>,
    },
    Answer {
        id: UnitId,
        answer: String,
        reply: oneshot::Sender<Result<WorkUnit>>,
    },
    Verdict {
        id: UnitId,
        verdict: Verdict,
        reply: oneshot::Sender<Result<WorkUnit>>,
    },
    Retry {
        id: UnitId,
        reply: oneshot::Sender<Result<WorkUnit>>,
    },
    Delete {
        id: UnitId,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Sends [`Command`]s to a running scheduler and waits for the reply.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::Daemon("scheduler has stopped".into()))?;
        rx.await
            .map_err(|_| Error::Daemon("scheduler dropped the request".into()))?
    }

    pub async fn create(
        &self,
        id: UnitId,
        footprint: Option<BTreeSet<String>>,
        priority: i64,
    ) -> Result<WorkUnit> {
        self.request(|reply| Command::Create {
            id,
            footprint,
            priority,
            reply,
        })
        .await
    }

    pub async fn answer(&self, id: UnitId, answer: String) -> Result<WorkUnit> {
        self.request(|reply| Command::Answer { id, answer, reply }).await
    }

    pub async fn verdict(&self, id: UnitId, verdict: Verdict) -> Result<WorkUnit> {
        self.request(|reply| Command::Verdict { id, verdict, reply })
            .await
    }

    pub async fn retry(&self, id: UnitId) -> Result<WorkUnit> {
        self.request(|reply| Command::Retry { id, reply }).await
    }

    pub async fn delete(&self, id: UnitId) -> Result<()> {
        self.request(|reply| Command::Delete { id, reply }).await
    }
}

enum Wake {
    Shutdown,
    Finished(UnitId, RunOutcome),
    Command(Option<Command>),
    Tick,
}

pub struct Scheduler {
    store: StateStore,
    pool: AgentPool,
    artifacts: Arc<dyn ArtifactSource>,
    workspace: Arc<dyn Workspace>,
    events: EventBus,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: StateStore,
        pool: AgentPool,
        artifacts: Arc<dyn ArtifactSource>,
        workspace: Arc<dyn Workspace>,
        events: EventBus,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            pool,
            artifacts,
            workspace,
            events,
            config,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn active_sessions(&self) -> usize {
        self.pool.active_count()
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&StateStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        blocking(move || f(&store)).await
    }

    async fn load(&self, id: &UnitId) -> Result<WorkUnit> {
        let id = id.clone();
        self.with_store(move |s| s.load(&id)).await
    }

    /// Persist `unit`, then tell subscribers how it changed.
    async fn save(&self, unit: &WorkUnit, from_status: UnitStatus, from_phase: Phase) -> Result<()> {
        let copy = unit.clone();
        self.with_store(move |s| s.update(&copy)).await?;
        self.events.publish_all(changes(from_status, from_phase, unit));
        Ok(())
    }

    /// Flag `unit` and persist it.
    async fn escalate(&self, unit: &mut WorkUnit, reason: String) -> Result<()> {
        let (status, phase) = (unit.status, unit.phase);
        warn!(unit = %unit.id, %phase, reason = %reason, "unit needs attention");
        unit.flag(reason)?;
        self.save(unit, status, phase).await
    }

    /// Move units left RUNNING by a previous daemon to NEEDS_ATTENTION.
    /// Their sessions died with that process; the worktrees stay as they are.
    pub async fn recover(&self) -> Result<Vec<UnitId>> {
        let orphaned = self
            .with_store(|s| s.list(Some(UnitStatus::Running)))
            .await?;
        let mut recovered = Vec::with_capacity(orphaned.len());
        for mut unit in orphaned {
            let reason = format!(
                "daemon restarted while the {} phase was running; worktree left intact",
                unit.phase
            );
            self.escalate(&mut unit, reason).await?;
            recovered.push(unit.id);
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered interrupted units");
        }
        Ok(recovered)
    }

    /// One scheduling pass.
    pub async fn pass(&mut self) -> Result<PassReport> {
        let mut report = PassReport::default();
        self.release_unblocked(&mut report).await?;
        self.dispatch_ready(&mut report).await?;
        if !report.is_idle() {
            debug!(?report, "scheduling pass");
        }
        Ok(report)
    }

    async fn release_unblocked(&self, report: &mut PassReport) -> Result<()> {
        let units = self.with_store(|s| s.list(None)).await?;
        let statuses: HashMap<UnitId, UnitStatus> =
            units.iter().map(|u| (u.id.clone(), u.status)).collect();

        for mut unit in units.into_iter().filter(|u| u.status == UnitStatus::Blocked) {
            // A blocker that no longer exists cannot finish; treat it as done.
            let waiting = unit
                .blocked_by
                .iter()
                .any(|b| statuses.get(b).is_some_and(|s| *s != UnitStatus::Done));
            if waiting {
                continue;
            }
            let phase = unit.phase;
            unit.unblock()?;
            self.save(&unit, UnitStatus::Blocked, phase).await?;
            info!(unit = %unit.id, "blockers done, unit ready");
            report.unblocked.push(unit.id);
        }
        Ok(())
    }

    async fn dispatch_ready(&mut self, report: &mut PassReport) -> Result<()> {
        let (ready, mut running, verdicts) = self
            .with_store(|s| {
                Ok((
                    s.list(Some(UnitStatus::Ready))?,
                    s.list(Some(UnitStatus::Running))?,
                    s.verdicts()?,
                ))
            })
            .await?;

        for unit in ready {
            let id = unit.id.clone();
            let assessment = oracle::check_conflict(&unit, &running, &verdicts);
            if assessment == Assessment::Clear && !self.pool.has_capacity() {
                continue;
            }
            match self.apply_assessment(unit, assessment, report).await {
                Ok(Some(started)) => running.push(started),
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => error!(unit = %id, error = %e, "dispatch failed"),
            }
        }
        Ok(())
    }

    /// Returns the unit when it was started.
    async fn apply_assessment(
        &mut self,
        mut unit: WorkUnit,
        assessment: Assessment,
        report: &mut PassReport,
    ) -> Result<Option<WorkUnit>> {
        let phase = unit.phase;
        match assessment {
            Assessment::Conflict { with, overlap } => {
                let reason = oracle::conflict_reason(&with, &overlap);
                warn!(unit = %unit.id, ?with, "possible conflict, asking operator");
                unit.flag_conflict(reason, with)?;
                self.save(&unit, UnitStatus::Ready, phase).await?;
                report.flagged.push(unit.id);
                Ok(None)
            }
            Assessment::Wait { on } => {
                info!(unit = %unit.id, ?on, "serialized behind running units");
                unit.block(on)?;
                self.save(&unit, UnitStatus::Ready, phase).await?;
                report.blocked.push(unit.id);
                Ok(None)
            }
            Assessment::Clear => {
                let workspace = Arc::clone(&self.workspace);
                let id = unit.id.clone();
                let worktree = match blocking(move || workspace.prepare(&id)).await {
                    Ok(path) => path,
                    Err(e) => {
                        self.escalate(&mut unit, format!("could not prepare worktree: {e}"))
                            .await?;
                        report.flagged.push(unit.id);
                        return Ok(None);
                    }
                };

                let (prompt, resume) = match unit.take_pending_answer() {
                    Some(answer) if unit.session_id.is_some() => {
                        (prompts::answer_prompt(&answer), unit.session_id.clone())
                    }
                    Some(answer) => (
                        format!(
                            "{}\n\n{}",
                            prompts::phase_prompt(&unit),
                            prompts::answer_prompt(&answer)
                        ),
                        None,
                    ),
                    None => (prompts::phase_prompt(&unit), None),
                };

                unit.start(worktree.clone())?;
                self.save(&unit, UnitStatus::Ready, phase).await?;
                let request = RunRequest {
                    unit: unit.id.clone(),
                    phase,
                    worktree,
                    prompt,
                    resume,
                };
                if let Err(e) = self.pool.spawn(request) {
                    self.escalate(&mut unit, format!("could not start agent: {e}"))
                        .await?;
                    report.flagged.push(unit.id);
                    return Ok(None);
                }
                info!(unit = %unit.id, %phase, "dispatched");
                report.dispatched.push(unit.id.clone());
                Ok(Some(unit))
            }
        }
    }

    /// Wait for one agent session and apply its outcome. Returns `false`
    /// when nothing was in flight.
    pub async fn step(&mut self) -> Result<bool> {
        match self.pool.join_next().await {
            Some((unit, outcome)) => {
                self.handle_outcome(unit, outcome).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Apply a finished session to its unit.
    ///
    /// The session is already gone from the pool, so a non-fatal error while
    /// applying it flags the unit rather than leaving it RUNNING.
    pub async fn handle_outcome(&mut self, id: UnitId, outcome: RunOutcome) -> Result<()> {
        let err = match self.apply_outcome(id.clone(), outcome).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => e,
        };
        error!(unit = %id, error = %err, "could not apply agent result");
        let lookup = id.clone();
        let Some(mut unit) = self.with_store(move |s| s.get(&lookup)).await? else {
            return Ok(());
        };
        if unit.status != UnitStatus::Running || self.pool.is_running(&id) {
            return Ok(());
        }
        self.escalate(&mut unit, format!("could not apply agent result: {err}"))
            .await
    }

    async fn apply_outcome(&mut self, id: UnitId, outcome: RunOutcome) -> Result<()> {
        let lookup = id.clone();
        let Some(mut unit) = self.with_store(move |s| s.get(&lookup)).await? else {
            warn!(unit = %id, "outcome for a unit that no longer exists");
            return Ok(());
        };
        if unit.status != UnitStatus::Running {
            warn!(unit = %id, status = %unit.status, "outcome for a unit that is not running");
            return Ok(());
        }
        debug!(unit = %id, outcome = outcome.kind(), "agent session finished");
        if let Some(session) = outcome.session_id() {
            unit.session_id = Some(session.to_string());
        }

        let phase = unit.phase;
        match outcome {
            RunOutcome::Succeeded { .. } if phase.is_terminal() => self.verify_completion(unit).await,
            RunOutcome::Succeeded { .. } => {
                let next = unit.advance_phase()?;
                info!(unit = %id, from = %phase, to = %next, "phase advanced");
                self.save(&unit, UnitStatus::Running, phase).await
            }
            RunOutcome::Question { question, .. } => {
                let reason = format!("agent question: {}", tail_chars(&question, MAX_REASON_CHARS));
                self.escalate(&mut unit, reason).await
            }
            RunOutcome::Failed { error, .. } => {
                let reason = format!(
                    "agent failed in {phase} phase: {}",
                    tail_chars(&error, MAX_REASON_CHARS)
                );
                self.escalate(&mut unit, reason).await
            }
            RunOutcome::SandboxViolation { paths, .. } => {
                let reason = format!(
                    "sandbox violation: agent wrote outside its worktree: {}",
                    paths.join(", ")
                );
                self.escalate(&mut unit, reason).await
            }
            RunOutcome::TimedOut { after } => {
                let worktree = unit
                    .worktree
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "unknown".into());
                let reason = format!(
                    "agent timed out after {}s in {phase} phase; worktree left intact at {worktree}",
                    after.as_secs()
                );
                self.escalate(&mut unit, reason).await
            }
        }
    }

    /// The COMPLETE phase ran: check the marker, then merge or retry.
    async fn verify_completion(&mut self, mut unit: WorkUnit) -> Result<()> {
        let artifacts = Arc::clone(&self.artifacts);
        let id = unit.id.clone();
        let marker = match blocking(move || artifacts.read_completion_marker(&id)).await {
            Ok(marker) => marker,
            Err(e) => {
                return self
                    .escalate(&mut unit, format!("completion marker unreadable: {e}"))
                    .await;
            }
        };

        if marker.done {
            let Some(worktree) = unit.worktree.clone() else {
                return self
                    .escalate(&mut unit, "no worktree recorded for completed unit".into())
                    .await;
            };
            let workspace = Arc::clone(&self.workspace);
            let id = unit.id.clone();
            return match blocking(move || workspace.integrate(&id, &worktree)).await {
                Ok(commit) => {
                    unit.complete(format!("merged as {commit}"))?;
                    self.save(&unit, UnitStatus::Running, Phase::Complete).await?;
                    info!(unit = %unit.id, %commit, "unit done");
                    Ok(())
                }
                Err(e) => {
                    self.escalate(&mut unit, format!("could not merge: {e}"))
                        .await
                }
            };
        }

        let max = self.config.max_completion_retries;
        if unit.completion_retries >= max {
            let worktree = unit
                .worktree
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            let reason = format!(
                "incomplete closure: completion marker still {} after {max} retries; work left uncommitted in {worktree}",
                marker.status
            );
            return self.escalate(&mut unit, reason).await;
        }

        let attempt = unit.record_completion_retry(max)?;
        self.save(&unit, UnitStatus::Running, Phase::Complete).await?;
        info!(unit = %unit.id, attempt, max, status = %marker.status, "completion not confirmed, resuming session");

        let Some(worktree) = unit.worktree.clone() else {
            return self
                .escalate(&mut unit, "no worktree recorded for completion retry".into())
                .await;
        };
        let request = RunRequest {
            unit: unit.id.clone(),
            phase: Phase::Complete,
            worktree,
            prompt: prompts::completion_reminder(&unit, &marker.status, attempt, max),
            resume: unit.session_id.clone(),
        };
        if let Err(e) = self.pool.spawn(request) {
            return self
                .escalate(&mut unit, format!("could not resume agent: {e}"))
                .await;
        }
        Ok(())
    }

    /// Register a new unit. Without an explicit footprint the declared one
    /// is read from the unit's goal document.
    pub async fn create_unit(
        &self,
        id: UnitId,
        footprint: Option<BTreeSet<String>>,
        priority: i64,
    ) -> Result<WorkUnit> {
        let footprint = match footprint {
            Some(footprint) => footprint,
            None => {
                let artifacts = Arc::clone(&self.artifacts);
                let lookup = id.clone();
                match blocking(move || artifacts.read_resource_footprint(&lookup)).await {
                    Ok(footprint) => footprint,
                    Err(e) => {
                        warn!(unit = %id, error = %e, "no declared footprint, treating as touching everything");
                        BTreeSet::new()
                    }
                }
            }
        };
        let unit = WorkUnit::new(id, footprint).with_priority(priority);
        let copy = unit.clone();
        self.with_store(move |s| s.create(&copy)).await?;
        info!(unit = %unit.id, priority, footprint = unit.footprint.len(), "unit created");
        self.events.publish(UnitEvent::Created {
            unit: UnitSummary::from(&unit),
        });
        Ok(unit)
    }

    /// Deliver an operator answer; the next dispatch resumes the session
    /// with it.
    pub async fn answer(&self, id: &UnitId, answer: String) -> Result<WorkUnit> {
        if answer.trim().is_empty() {
            return Err(Error::Validation("answer must not be empty".into()));
        }
        let mut unit = self.load(id).await?;
        if unit.status != UnitStatus::NeedsAttention {
            return Err(Error::InvalidState(format!(
                "{id} is {} and has no question to answer",
                unit.status
            )));
        }
        if !unit.conflicts_with.is_empty() {
            return Err(Error::InvalidState(format!(
                "{id} is waiting for a conflict verdict, not an answer"
            )));
        }
        let phase = unit.phase;
        unit.resolve(Some(answer), "operator answered")?;
        self.save(&unit, UnitStatus::NeedsAttention, phase).await?;
        info!(unit = %id, "answer recorded");
        Ok(unit)
    }

    /// Record an operator verdict for every pair in the unit's pending
    /// conflict. A unit without a pending conflict is returned unchanged.
    pub async fn submit_verdict(&self, id: &UnitId, verdict: Verdict) -> Result<WorkUnit> {
        let mut unit = self.load(id).await?;
        if unit.status != UnitStatus::NeedsAttention || unit.conflicts_with.is_empty() {
            info!(unit = %id, %verdict, status = %unit.status, "no pending conflict, verdict ignored");
            return Ok(unit);
        }

        let pairs = unit
            .conflicts_with
            .iter()
            .map(|other| UnitPair::new(unit.id.clone(), other.clone()))
            .collect::<Result<Vec<_>>>()?;
        let partners: Vec<UnitId> = unit.conflicts_with.iter().cloned().collect();
        let still_running = self
            .with_store(move |s| {
                for pair in &pairs {
                    s.record_verdict(pair, verdict)?;
                }
                let mut pending = BTreeSet::new();
                for partner in partners {
                    if let Some(other) = s.get(&partner)? {
                        if other.status != UnitStatus::Done {
                            pending.insert(partner);
                        }
                    }
                }
                Ok(pending)
            })
            .await?;

        let phase = unit.phase;
        match verdict {
            Verdict::Parallelize => unit.resolve(None, "operator verdict: parallelize")?,
            Verdict::Serialize if still_running.is_empty() => {
                unit.resolve(None, "operator verdict: serialize; partners already done")?
            }
            Verdict::Serialize => unit.block(still_running)?,
        }
        self.save(&unit, UnitStatus::NeedsAttention, phase).await?;
        info!(unit = %id, %verdict, status = %unit.status, "verdict applied");
        Ok(unit)
    }

    /// Operator override: back to READY with a fresh retry budget.
    pub async fn retry(&self, id: &UnitId) -> Result<WorkUnit> {
        let mut unit = self.load(id).await?;
        let phase = unit.phase;
        unit.resolve(None, "operator forced retry")?;
        unit.completion_retries = 0;
        self.save(&unit, UnitStatus::NeedsAttention, phase).await?;
        info!(unit = %id, %phase, "retry forced");
        Ok(unit)
    }

    pub async fn delete_unit(&self, id: &UnitId) -> Result<()> {
        let unit = self.load(id).await?;
        if unit.status == UnitStatus::Running || self.pool.is_running(id) {
            return Err(Error::InvalidState(format!(
                "{id} is running and cannot be deleted"
            )));
        }
        let target = id.clone();
        self.with_store(move |s| s.delete(&target)).await?;
        info!(unit = %id, "unit deleted");
        self.events.publish(UnitEvent::Deleted {
            unit_id: id.clone(),
        });
        Ok(())
    }

    async fn handle_command(&self, command: Command) {
        // A dropped receiver only means the caller went away.
        match command {
            Command::Create {
                id,
                footprint,
                priority,
                reply,
            } => {
                let _ = reply.send(self.create_unit(id, footprint, priority).await);
            }
            Command::Answer { id, answer, reply } => {
                let _ = reply.send(self.answer(&id, answer).await);
            }
            Command::Verdict { id, verdict, reply } => {
                let _ = reply.send(self.submit_verdict(&id, verdict).await);
            }
            Command::Retry { id, reply } => {
                let _ = reply.send(self.retry(&id).await);
            }
            Command::Delete { id, reply } => {
                let _ = reply.send(self.delete_unit(&id).await);
            }
        }
    }

    /// Run until `shutdown` fires or a fatal error occurs. In-flight
    /// sessions are aborted on the way out and their units flagged.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;
        info!(
            max_agents = self.pool.max_concurrent(),
            max_completion_retries = self.config.max_completion_retries,
            "scheduler started"
        );

        let result = loop {
            if let Err(e) = self.pass().await {
                if e.is_fatal() {
                    break Err(e);
                }
                error!(error = %e, "scheduling pass failed");
            }

            let active = self.pool.active_count() > 0;
            let wake = tokio::select! {
                _ = shutdown.cancelled() => Wake::Shutdown,
                Some((unit, outcome)) = self.pool.join_next(), if active => Wake::Finished(unit, outcome),
                command = commands.recv(), if commands_open => Wake::Command(command),
                _ = ticker.tick() => Wake::Tick,
            };

            let step = match wake {
                Wake::Shutdown => break Ok(()),
                Wake::Finished(unit, outcome) => self.handle_outcome(unit, outcome).await,
                Wake::Command(Some(command)) => {
                    self.handle_command(command).await;
                    Ok(())
                }
                Wake::Command(None) => {
                    debug!("command channel closed");
                    commands_open = false;
                    Ok(())
                }
                Wake::Tick => Ok(()),
            };
            if let Err(e) = step {
                if e.is_fatal() {
                    break Err(e);
                }
                error!(error = %e, "scheduler step failed");
            }
        };

        self.stop().await;
        match &result {
            Ok(()) => info!("scheduler stopped"),
            Err(e) => error!(error = %e, "scheduler stopped on fatal error"),
        }
        result
    }

    /// Abort every agent session and flag its unit.
    pub async fn stop(&mut self) -> Vec<UnitId> {
        let interrupted = self.pool.shutdown().await;
        for id in &interrupted {
            let flagged = async {
                let mut unit = self.load(id).await?;
                if unit.status != UnitStatus::Running {
                    return Ok(());
                }
                let reason = format!(
                    "daemon stopped while the {} phase was running; worktree left intact",
                    unit.phase
                );
                self.escalate(&mut unit, reason).await
            };
            if let Err(e) = flagged.await {
                error!(unit = %id, error = %e, "could not flag interrupted unit");
            }
        }
        interrupted
    }
}
