//! Workflow controller: the engine's run loop and operator surface.
//!
//! The loop is a state machine over `EnginePhase`: select the current subject
//! and resolve the step under the queue lock, execute the step unlocked, then
//! re-acquire the lock to apply the outcome. Nothing in memory is trusted
//! across a suspension point; the persisted checkpoint and queue are re-read
//! on every entry, so a crashed or torn-down worker resumes by simply running
//! the loop again. The `run_flag` in the persisted state is the authoritative
//! stop signal and is re-checked at every point where the loop holds the lock
//! or sleeps.

use std::sync::Arc;
use std::time::Duration;

use stepline_types::config::EngineConfig;
use stepline_types::error::{ConfigError, StoreError};
use stepline_types::state::{EnginePhase, WorkflowState};
use stepline_types::subject::{Subject, SubjectOutcome};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::environment::{EnvError, Environment};
use crate::executor::{StepContext, StepError, StepRegistry, StepStatus};
use crate::lock::{LeaseLock, LockError, LockGuard};
use crate::poller::PollError;
use crate::queue::{QueueError, SubjectQueue};
use crate::resolver::{StepSpec, resolve};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{StateStore, get_typed, keys, set_typed};

/// Name of the lock serializing all state and queue mutations.
pub const QUEUE_LOCK: &str = "queue";

// ---------------------------------------------------------------------------
// RunExit
// ---------------------------------------------------------------------------

/// Why a run loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunExit {
    /// Every subject reached a terminal outcome; the queue is empty.
    QueueDrained,
    /// An operator stop request (or cancellation) was honored.
    Stopped,
    /// A QueueFatal failure halted the run for operator inspection.
    Halted { reason: String },
}

// ---------------------------------------------------------------------------
// WorkflowController
// ---------------------------------------------------------------------------

/// Drives subjects from the persisted queue through the step plan.
///
/// Multiple controllers (in one process or several) may share a store; the
/// queue lock serializes their mutations and the persisted checkpoint keeps
/// them agreeing on the current subject.
pub struct WorkflowController<S: StateStore, E: Environment> {
    store: Arc<S>,
    env: Arc<E>,
    registry: StepRegistry<E>,
    config: EngineConfig,
    policy: RetryPolicy,
    lock: LeaseLock<S>,
    queue: SubjectQueue<S>,
    worker_id: Uuid,
    cancel: CancellationToken,
}

impl<S: StateStore, E: Environment> WorkflowController<S, E> {
    /// Build a controller over a shared store and environment.
    pub fn new(
        store: Arc<S>,
        env: Arc<E>,
        registry: StepRegistry<E>,
        config: EngineConfig,
    ) -> Self {
        let policy = RetryPolicy::from_config(&config);
        let lock = LeaseLock::from_config(Arc::clone(&store), QUEUE_LOCK, &config);
        let queue = SubjectQueue::new(Arc::clone(&store));
        Self {
            store,
            env,
            registry,
            config,
            policy,
            lock,
            queue,
            worker_id: Uuid::now_v7(),
            cancel: CancellationToken::new(),
        }
    }

    /// Identity used for lock leases.
    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    /// Token cancelling this controller's in-flight waits.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn load_state(&self) -> Result<WorkflowState, ControllerError> {
        Ok(get_typed(self.store.as_ref(), keys::STATE)
            .await?
            .unwrap_or_default())
    }

    async fn persist_state(
        &self,
        _guard: &LockGuard,
        state: &WorkflowState,
    ) -> Result<(), ControllerError> {
        set_typed(self.store.as_ref(), keys::STATE, state).await?;
        set_typed(self.store.as_ref(), keys::STATS, &state.stats).await?;
        Ok(())
    }

    /// Run until the queue drains, a stop request lands, or a QueueFatal
    /// failure halts the run.
    ///
    /// Safe to call again after any exit (and after a process restart): the
    /// first iteration re-derives everything from the store and a fresh
    /// environment observation.
    pub async fn run(&self) -> Result<RunExit, ControllerError> {
        let mut phase = EnginePhase::Idle;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(RunExit::Stopped);
            }

            // --- select subject and resolve step, under the lock ---
            let guard = match self.lock.acquire(self.worker_id, &self.cancel).await {
                Ok(guard) => guard,
                Err(LockError::Cancelled) => return Ok(RunExit::Stopped),
                Err(e) => return Err(e.into()),
            };

            let mut state = self.load_state().await?;
            if !state.run_flag {
                let exit = exit_for(&state);
                self.lock.release(guard).await?;
                enter(&mut phase, EnginePhase::Halted);
                return Ok(exit);
            }

            let subjects = self.queue.load_all().await?;
            let subject = state
                .current_subject_id
                .and_then(|id| {
                    subjects
                        .iter()
                        .find(|s| s.id == id && s.outcome == SubjectOutcome::Pending)
                })
                .or_else(|| subjects.iter().find(|s| s.outcome == SubjectOutcome::Pending))
                .cloned();

            let Some(subject) = subject else {
                // Queue drained: reset the run so a later start begins clean.
                state.clear_subject();
                state.run_flag = false;
                self.persist_state(&guard, &state).await?;
                self.lock.release(guard).await?;
                enter(&mut phase, EnginePhase::Idle);
                tracing::info!(
                    processed = state.stats.processed,
                    success = state.stats.success,
                    failed = state.stats.failed,
                    "queue drained"
                );
                return Ok(RunExit::QueueDrained);
            };

            if state.current_subject_id != Some(subject.id) {
                state.clear_subject();
                state.current_subject_id = Some(subject.id);
            }

            enter(&mut phase, EnginePhase::Resolving);
            let location = match self.env.current_location().await {
                Ok(location) => location,
                Err(EnvError::Cancelled) => {
                    self.lock.release(guard).await?;
                    return Ok(RunExit::Stopped);
                }
                Err(e) => {
                    self.lock.release(guard).await?;
                    return Err(ControllerError::Environment(e));
                }
            };
            let step: StepSpec = resolve(self.registry.plan(), &state, &location).clone();
            tracing::debug!(
                subject = %subject.id,
                step = step.id.as_str(),
                location = %location,
                "step resolved"
            );

            // Checkpoint the resolved step before executing, so a crash
            // mid-step resumes here instead of at the previous checkpoint.
            state.current_step_id = Some(step.id.clone());
            state.step_attempt_count = subject.attempt_count;
            self.persist_state(&guard, &state).await?;
            self.lock.release(guard).await?;

            // --- execute, unlocked ---
            enter(&mut phase, EnginePhase::Executing);
            let executor = self
                .registry
                .executor_for(&step.id)
                .cloned()
                .ok_or_else(|| ControllerError::UnknownStep(step.id.clone()))?;
            // Bounded waits inside the step honor this child token; a
            // persisted stop request cancels it, so in-flight marker and
            // channel polls abort at their next wakeup instead of draining
            // the full poll window.
            let step_cancel = self.cancel.child_token();
            let mut ctx = StepContext::new(
                self.config.clone(),
                step_cancel.clone(),
                state.aux_context.clone(),
            );
            let result = {
                let exec = executor.execute(&subject, &mut ctx, self.env.as_ref());
                tokio::pin!(exec);
                tokio::select! {
                    result = &mut exec => result,
                    _ = self.stop_requested() => {
                        step_cancel.cancel();
                        exec.await
                    }
                }
            };

            if self.cancel.is_cancelled() || is_cancelled(&result) {
                return Ok(RunExit::Stopped);
            }

            // --- apply the outcome, under the lock ---
            let guard = match self.lock.acquire(self.worker_id, &self.cancel).await {
                Ok(guard) => guard,
                Err(LockError::Cancelled) => return Ok(RunExit::Stopped),
                Err(e) => return Err(e.into()),
            };
            // Re-read: a stop may have landed while the step was executing.
            let mut state = self.load_state().await?;
            if state.current_subject_id != Some(subject.id) {
                // Another worker retired this subject mid-execution; the
                // checkpoint now describes the next subject and must not be
                // stamped with this one's progress.
                tracing::debug!(
                    subject = %subject.id,
                    "subject retired by another worker during execution; discarding local outcome"
                );
                self.lock.release(guard).await?;
                if !state.run_flag {
                    return Ok(exit_for(&state));
                }
                continue;
            }
            state.aux_context = ctx.aux.clone();

            let decision = match &result {
                Ok(outcome) => match outcome.status {
                    StepStatus::Advance { transitioned } => {
                        enter(&mut phase, EnginePhase::Advancing);
                        self.apply_advance(&guard, &mut state, &subject, &step, outcome, transitioned)
                            .await?;
                        None
                    }
                    StepStatus::Retryable => {
                        Some(self.policy.decide_retryable(subject.attempt_count + 1))
                    }
                    StepStatus::Fatal => Some(RetryDecision::FailSubject {
                        reason: "step reported fatal for this subject".to_string(),
                    }),
                },
                Err(err) => Some(self.policy.decide(err, subject.attempt_count + 1)),
            };

            if let Some(decision) = decision {
                match decision {
                    RetryDecision::Retry { backoff } => {
                        enter(&mut phase, EnginePhase::Retrying);
                        let mut retried = subject.clone();
                        retried.attempt_count += 1;
                        state.step_attempt_count = retried.attempt_count;
                        self.queue.update_subject(&guard, &retried).await?;
                        self.persist_state(&guard, &state).await?;
                        let stop_requested = !state.run_flag;
                        self.lock.release(guard).await?;
                        if stop_requested {
                            return Ok(exit_for(&state));
                        }
                        if self.wait_backoff(backoff).await? {
                            return Ok(RunExit::Stopped);
                        }
                        continue;
                    }
                    RetryDecision::FailSubject { reason } => {
                        enter(&mut phase, EnginePhase::Failing);
                        tracing::warn!(subject = %subject.id, step = step.id.as_str(), reason, "subject failed");
                        self.retire_subject(&guard, &mut state, &subject, SubjectOutcome::Failed)
                            .await?;
                    }
                    RetryDecision::HaltQueue { reason } => {
                        enter(&mut phase, EnginePhase::Halted);
                        tracing::error!(subject = %subject.id, step = step.id.as_str(), reason, "run halted");
                        state.run_flag = false;
                        state.halt_reason = Some(reason.clone());
                        self.persist_state(&guard, &state).await?;
                        self.lock.release(guard).await?;
                        return Ok(RunExit::Halted { reason });
                    }
                }
            }

            let stop_requested = !state.run_flag;
            self.lock.release(guard).await?;
            if stop_requested {
                // Stop landed during execution; the step was allowed to
                // finish and its outcome is checkpointed.
                enter(&mut phase, EnginePhase::Halted);
                return Ok(exit_for(&state));
            }
        }
    }

    /// Apply a successful step: advance the checkpoint, or retire the
    /// subject when the final step completed.
    async fn apply_advance(
        &self,
        guard: &LockGuard,
        state: &mut WorkflowState,
        subject: &Subject,
        step: &StepSpec,
        outcome: &crate::executor::StepOutcome,
        transitioned: bool,
    ) -> Result<(), ControllerError> {
        if transitioned {
            tracing::debug!(step = step.id.as_str(), "step ended in an environment transition");
        }
        if self.registry.plan().is_last(&step.id) {
            self.retire_subject(guard, state, subject, SubjectOutcome::Success)
                .await?;
        } else {
            let next_id = outcome
                .next_hint
                .clone()
                .filter(|hint| self.registry.plan().index_of(hint).is_some())
                .or_else(|| {
                    self.registry
                        .plan()
                        .next_after(&step.id)
                        .map(|s| s.id.clone())
                });
            state.current_step_id = next_id;
            state.step_attempt_count = 0;
            let mut advanced = subject.clone();
            advanced.attempt_count = 0;
            self.queue.update_subject(guard, &advanced).await?;
            self.persist_state(guard, state).await?;
        }
        Ok(())
    }

    /// Remove a subject from the queue with a terminal outcome and point the
    /// checkpoint at the next pending subject.
    async fn retire_subject(
        &self,
        guard: &LockGuard,
        state: &mut WorkflowState,
        subject: &Subject,
        outcome: SubjectOutcome,
    ) -> Result<(), ControllerError> {
        let removed = match self.queue.position_of(subject.id).await? {
            Some(index) => self.queue.remove_at(guard, index).await?.is_some(),
            None => false,
        };
        // Count only on actual removal: another worker may have retired this
        // subject already (steps are idempotent, stats must not be).
        if removed {
            match outcome {
                SubjectOutcome::Success => state.stats.record_success(),
                SubjectOutcome::Failed => state.stats.record_failure(),
                SubjectOutcome::Pending => {}
            }
        }
        state.clear_subject();
        state.current_subject_id = self
            .queue
            .load_all()
            .await?
            .iter()
            .find(|s| s.outcome == SubjectOutcome::Pending)
            .map(|s| s.id);
        self.persist_state(guard, state).await?;
        tracing::info!(subject = %subject.id, ?outcome, "subject retired");
        Ok(())
    }

    /// Sleep out a retry backoff, waking early on cancellation or on a
    /// persisted stop request. Returns `true` when the run should stop.
    async fn wait_backoff(&self, backoff: Duration) -> Result<bool, ControllerError> {
        let mut watch = self.store.watch();
        let mut watch_open = true;
        let sleep = tokio::time::sleep(backoff);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(false),
                _ = self.cancel.cancelled() => return Ok(true),
                event = watch.recv(), if watch_open => match event {
                    Ok(event) if event.key == keys::STATE => {
                        if !self.load_state().await?.run_flag {
                            return Ok(true);
                        }
                    }
                    Ok(_) => {}
                    Err(_) => watch_open = false,
                },
            }
        }
    }

    /// Resolves once a persisted stop request is visible (`run_flag` false);
    /// pends forever while the run stays live.
    ///
    /// Raced against in-flight step executions so their bounded waits can be
    /// cancelled at the next wakeup rather than after the full poll window.
    async fn stop_requested(&self) {
        let mut watch = self.store.watch();
        loop {
            if let Ok(state) = self.load_state().await {
                if !state.run_flag {
                    return;
                }
            }
            loop {
                match watch.recv().await {
                    Ok(event) if event.key == keys::STATE => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => break,
                    Err(RecvError::Closed) => std::future::pending::<()>().await,
                }
            }
        }
    }
}

fn exit_for(state: &WorkflowState) -> RunExit {
    match &state.halt_reason {
        Some(reason) => RunExit::Halted {
            reason: reason.clone(),
        },
        None => RunExit::Stopped,
    }
}

fn is_cancelled(result: &Result<crate::executor::StepOutcome, StepError>) -> bool {
    matches!(
        result,
        Err(StepError::Environment(EnvError::Cancelled))
            | Err(StepError::Channel(PollError::Cancelled))
    )
}

fn enter(phase: &mut EnginePhase, next: EnginePhase) {
    if *phase != next {
        tracing::debug!(from = ?*phase, to = ?next, "phase transition");
        *phase = next;
    }
}

// ---------------------------------------------------------------------------
// Operator surface
// ---------------------------------------------------------------------------

/// Validate subjects, persist the queue, and arm the run flag.
///
/// Rejects the whole batch when any subject is missing required fields, so
/// partial batches never enter the queue.
pub async fn start_run<S: StateStore>(
    store: Arc<S>,
    config: &EngineConfig,
    subjects: Vec<Subject>,
) -> Result<(), ControllerError> {
    if subjects.is_empty() {
        return Err(ConfigError::EmptySubjectList.into());
    }
    let missing: Vec<String> = subjects
        .iter()
        .flat_map(|s| s.missing_required_fields())
        .collect();
    if !missing.is_empty() {
        return Err(ConfigError::MissingFields { fields: missing }.into());
    }

    let lock = LeaseLock::from_config(Arc::clone(&store), QUEUE_LOCK, config);
    let guard = lock.acquire(Uuid::now_v7(), &CancellationToken::new()).await?;

    let existing: WorkflowState = get_typed(store.as_ref(), keys::STATE)
        .await?
        .unwrap_or_default();
    if existing.run_flag {
        lock.release(guard).await?;
        return Err(ControllerError::AlreadyRunning);
    }

    let queue = SubjectQueue::new(Arc::clone(&store));
    queue.rebuild(&guard, &subjects).await?;

    let mut state = WorkflowState::started();
    state.current_subject_id = Some(subjects[0].id);
    set_typed(store.as_ref(), keys::STATE, &state).await?;
    set_typed(store.as_ref(), keys::STATS, &state.stats).await?;
    lock.release(guard).await?;
    tracing::info!(subjects = subjects.len(), "run started");
    Ok(())
}

/// Request a graceful stop: a single persisted flag write, honored by every
/// worker at its next suspension point. In-flight steps finish first.
pub async fn request_stop<S: StateStore>(
    store: Arc<S>,
    config: &EngineConfig,
) -> Result<(), ControllerError> {
    let lock = LeaseLock::from_config(Arc::clone(&store), QUEUE_LOCK, config);
    let guard = lock.acquire(Uuid::now_v7(), &CancellationToken::new()).await?;

    let mut state: WorkflowState = get_typed(store.as_ref(), keys::STATE)
        .await?
        .unwrap_or_default();
    state.run_flag = false;
    set_typed(store.as_ref(), keys::STATE, &state).await?;
    lock.release(guard).await?;
    tracing::info!("stop requested");
    Ok(())
}

/// Point-in-time view of the run for the operator surface.
#[derive(Debug, Clone)]
pub struct StatusReport {
    /// The persisted checkpoint.
    pub state: WorkflowState,
    /// Subjects still pending in the queue.
    pub pending: usize,
}

/// Read the current run status. Lock-free; the report may be momentarily
/// stale while a worker is mutating.
pub async fn load_status<S: StateStore>(store: Arc<S>) -> Result<StatusReport, ControllerError> {
    let state: WorkflowState = get_typed(store.as_ref(), keys::STATE)
        .await?
        .unwrap_or_default();
    let queue = SubjectQueue::new(store);
    let pending = queue
        .load_all()
        .await?
        .iter()
        .filter(|s| s.outcome == SubjectOutcome::Pending)
        .count();
    Ok(StatusReport { state, pending })
}

// ---------------------------------------------------------------------------
// ControllerError
// ---------------------------------------------------------------------------

/// Errors surfaced by the controller and operator functions.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The environment failed outside a step execution (location reads).
    #[error("environment failure: {0}")]
    Environment(#[from] EnvError),

    /// A start was requested while a run is already active.
    #[error("a run is already in progress")]
    AlreadyRunning,

    /// The resolver produced a step with no registered executor.
    #[error("no executor registered for step '{0}'")]
    UnknownStep(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
