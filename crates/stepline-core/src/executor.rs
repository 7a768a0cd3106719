//! Step executors: one per step, dispatched by the controller.
//!
//! An executor verifies its preconditions via bounded marker polling,
//! performs the step's environment actions, confirms postconditions the same
//! way, and reports a `StepOutcome`. Executors must be idempotent under
//! re-invocation after a crash mid-step: the resolver re-derives the step
//! from the live location, so an executor must check "postcondition already
//! holds" before acting and never double-submit.
//!
//! `StepExecutor` returns boxed futures instead of RPITIT so the registry
//! can hold `dyn StepExecutor<E>` trait objects (same pattern as a boxed
//! provider behind a dynamic registry).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use stepline_types::config::EngineConfig;
use stepline_types::subject::Subject;
use tokio_util::sync::CancellationToken;

use crate::environment::{EnvError, Environment};
use crate::poller::PollError;
use crate::resolver::{PlanError, StepPlan, StepSpec};
use crate::verification::VerificationError;

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

/// What a step execution reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// Advance, retry, or fail.
    pub status: StepStatus,
    /// Optional hint naming the step the environment is expected to land on
    /// next (recorded in the checkpoint; the resolver still re-derives).
    pub next_hint: Option<String>,
}

impl StepOutcome {
    /// The step completed and the worker keeps control.
    pub fn advance() -> Self {
        Self {
            status: StepStatus::Advance { transitioned: false },
            next_hint: None,
        }
    }

    /// The step completed by triggering an environment transition; the
    /// worker hands control back and expects a later re-entry.
    pub fn advance_after_transition() -> Self {
        Self {
            status: StepStatus::Advance { transitioned: true },
            next_hint: None,
        }
    }

    /// The step did not complete but is worth retrying.
    pub fn retryable() -> Self {
        Self {
            status: StepStatus::Retryable,
            next_hint: None,
        }
    }

    /// The step failed in a way retrying will not fix for this subject.
    pub fn fatal() -> Self {
        Self {
            status: StepStatus::Fatal,
            next_hint: None,
        }
    }

    /// Attach a next-step hint.
    pub fn with_hint(mut self, step_id: impl Into<String>) -> Self {
        self.next_hint = Some(step_id.into());
        self
    }
}

/// Status reported by a step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Step completed; move to the next step (or finish the subject).
    Advance {
        /// Whether the step ended by triggering an environment transition.
        transitioned: bool,
    },
    /// Transient failure; retry the same step on the same subject.
    Retryable,
    /// This subject cannot pass this step; skip the subject.
    Fatal,
}

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Failures raised by step executors, classified by the retry policy.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Required markers never appeared within the bounded poll window.
    #[error("precondition not met: marker '{marker}' never appeared")]
    PreconditionNotMet { marker: String },

    /// The step acted but its postcondition never held.
    #[error("postcondition not met: marker '{marker}' never appeared")]
    PostconditionNotMet { marker: String },

    /// A required control does not exist at all (structural failure).
    #[error("required control '{marker}' does not exist")]
    ControlMissing { marker: String },

    /// The environment failed an operation.
    #[error(transparent)]
    Environment(#[from] EnvError),

    /// The external channel poll rounds were exhausted.
    #[error("external channel polling exhausted")]
    ChannelExhausted,

    /// Channel infrastructure failure.
    #[error(transparent)]
    Channel(#[from] PollError),

    /// The verification channel rejected this subject.
    #[error("verification rejected: {}", error_ids.join(", "))]
    VerificationRejected { error_ids: Vec<String> },

    /// The verification channel reported an access-level block
    /// (rate limit / IP block); classification is a config choice.
    #[error("access blocked: {0}")]
    AccessBlocked(String),

    /// Verification channel infrastructure failure.
    #[error(transparent)]
    Verification(#[from] VerificationError),
}

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// Per-invocation context handed to an executor.
pub struct StepContext {
    /// Engine tuning knobs (poll windows, retry budgets).
    pub config: EngineConfig,
    /// Stop signal; executors must pass this to every bounded wait.
    pub cancel: CancellationToken,
    /// Free-form data produced by one step and consumed by a later one.
    /// Persisted with the checkpoint after every execution.
    pub aux: Option<Value>,
}

impl StepContext {
    /// Build a context for one execution.
    pub fn new(config: EngineConfig, cancel: CancellationToken, aux: Option<Value>) -> Self {
        Self { config, cancel, aux }
    }
}

// ---------------------------------------------------------------------------
// StepExecutor trait
// ---------------------------------------------------------------------------

/// Future type returned by `StepExecutor::execute`.
pub type ExecuteFuture<'a> =
    Pin<Box<dyn Future<Output = Result<StepOutcome, StepError>> + Send + 'a>>;

/// One executor per step.
///
/// Generic over the environment type; object-safe so the registry can hold
/// executors behind `Arc<dyn StepExecutor<E>>`.
pub trait StepExecutor<E: Environment>: Send + Sync {
    /// The step id this executor implements.
    fn step_id(&self) -> &str;

    /// Execute the step against the live environment.
    fn execute<'a>(
        &'a self,
        subject: &'a Subject,
        ctx: &'a mut StepContext,
        env: &'a E,
    ) -> ExecuteFuture<'a>;
}

// ---------------------------------------------------------------------------
// StepRegistry
// ---------------------------------------------------------------------------

/// The ordered set of step executors making up an engine instance.
///
/// The registry owns the `StepPlan` (validated order and ids) and maps each
/// step id to its executor.
pub struct StepRegistry<E: Environment> {
    plan: StepPlan,
    executors: Vec<Arc<dyn StepExecutor<E>>>,
}

impl<E: Environment> StepRegistry<E> {
    /// Build a registry from (spec, executor) pairs in plan order.
    ///
    /// Fails when the plan is invalid or an executor's `step_id` does not
    /// match its spec.
    pub fn new(
        entries: Vec<(StepSpec, Arc<dyn StepExecutor<E>>)>,
    ) -> Result<Self, RegistryError> {
        let (specs, executors): (Vec<_>, Vec<_>) = entries.into_iter().unzip();
        for (spec, executor) in specs.iter().zip(&executors) {
            if spec.id != executor.step_id() {
                return Err(RegistryError::ExecutorMismatch {
                    spec_id: spec.id.clone(),
                    executor_id: executor.step_id().to_string(),
                });
            }
        }
        let plan = StepPlan::new(specs)?;
        Ok(Self { plan, executors })
    }

    /// The validated step plan.
    pub fn plan(&self) -> &StepPlan {
        &self.plan
    }

    /// Executor for a step id.
    pub fn executor_for(&self, step_id: &str) -> Option<&Arc<dyn StepExecutor<E>>> {
        self.plan
            .index_of(step_id)
            .map(|i| &self.executors[i])
    }
}

/// Errors building a step registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The underlying plan is invalid.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// An executor was registered against the wrong spec.
    #[error("executor '{executor_id}' registered for step '{spec_id}'")]
    ExecutorMismatch {
        spec_id: String,
        executor_id: String,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{ActionDescriptor, LocationSignal};

    struct NullEnv;

    impl Environment for NullEnv {
        async fn current_location(&self) -> Result<LocationSignal, EnvError> {
            Ok(LocationSignal("null://".to_string()))
        }
        async fn observe(&self, _marker: &str) -> Result<bool, EnvError> {
            Ok(true)
        }
        async fn perform_action(&self, _action: &ActionDescriptor) -> Result<(), EnvError> {
            Ok(())
        }
        async fn trigger_transition(&self, _target: &str) -> Result<(), EnvError> {
            Ok(())
        }
    }

    struct AlwaysAdvance {
        id: &'static str,
    }

    impl StepExecutor<NullEnv> for AlwaysAdvance {
        fn step_id(&self) -> &str {
            self.id
        }
        fn execute<'a>(
            &'a self,
            _subject: &'a Subject,
            _ctx: &'a mut StepContext,
            _env: &'a NullEnv,
        ) -> ExecuteFuture<'a> {
            Box::pin(async { Ok(StepOutcome::advance()) })
        }
    }

    fn executor(id: &'static str) -> Arc<dyn StepExecutor<NullEnv>> {
        Arc::new(AlwaysAdvance { id })
    }

    #[test]
    fn test_registry_construction_and_lookup() {
        let registry = StepRegistry::new(vec![
            (StepSpec::at("fill", "/form"), executor("fill")),
            (StepSpec::ordered("submit"), executor("submit")),
        ])
        .unwrap();

        assert_eq!(registry.plan().first().id, "fill");
        assert!(registry.executor_for("submit").is_some());
        assert!(registry.executor_for("missing").is_none());
    }

    #[test]
    fn test_registry_rejects_mismatched_executor() {
        let result = StepRegistry::new(vec![(StepSpec::ordered("fill"), executor("submit"))]);
        assert!(matches!(
            result,
            Err(RegistryError::ExecutorMismatch { .. })
        ));
    }

    #[test]
    fn test_registry_rejects_empty_plan() {
        let result = StepRegistry::<NullEnv>::new(vec![]);
        assert!(matches!(result, Err(RegistryError::Plan(PlanError::Empty))));
    }

    #[tokio::test]
    async fn test_executor_dispatch() {
        let registry =
            StepRegistry::new(vec![(StepSpec::ordered("fill"), executor("fill"))]).unwrap();
        let subject = Subject::new(vec![]);
        let mut ctx = StepContext::new(
            EngineConfig::default(),
            CancellationToken::new(),
            None,
        );
        let env = NullEnv;

        let outcome = registry
            .executor_for("fill")
            .unwrap()
            .execute(&subject, &mut ctx, &env)
            .await
            .unwrap();
        assert_eq!(outcome.status, StepStatus::Advance { transitioned: false });
    }

    #[test]
    fn test_outcome_constructors() {
        assert_eq!(
            StepOutcome::advance_after_transition().status,
            StepStatus::Advance { transitioned: true }
        );
        assert_eq!(StepOutcome::retryable().status, StepStatus::Retryable);
        let hinted = StepOutcome::advance().with_hint("verify-email");
        assert_eq!(hinted.next_hint.as_deref(), Some("verify-email"));
    }
}
