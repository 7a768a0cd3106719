//! Retry policy and error classifier.
//!
//! One taxonomy, one policy: every step failure in the engine is classified
//! here and nowhere else, so near-duplicate code paths cannot grow divergent
//! retry semantics. Three severities drive three outcomes: Transient retries
//! the same step (capped, then escalates), SubjectFatal skips the subject,
//! QueueFatal halts the run for the operator.

use std::time::Duration;

use stepline_types::config::{EngineConfig, RateLimitPolicy};
use stepline_types::error::Severity;

use crate::executor::StepError;
use crate::poller::PollError;
use crate::verification::VerificationError;

// ---------------------------------------------------------------------------
// RetryRecord
// ---------------------------------------------------------------------------

/// Ephemeral per-step retry bookkeeping.
///
/// Lives only for the current process; the subject's persisted
/// `attempt_count` is the durable half, so budgets survive restarts.
#[derive(Debug, Clone, Copy)]
pub struct RetryRecord {
    /// Attempts made so far (1-based after the first execution).
    pub attempts: u32,
    /// Budget before escalation.
    pub max_attempts: u32,
    /// Classification of the most recent failure, if any.
    pub severity: Option<Severity>,
}

impl RetryRecord {
    /// Start a record, seeding `attempts` from the subject's persisted
    /// counter so a restart does not reset the budget.
    pub fn resumed(attempts: u32, max_attempts: u32) -> Self {
        Self {
            attempts,
            max_attempts,
            severity: None,
        }
    }

    /// Record one more failed attempt.
    pub fn record(&mut self, severity: Severity) {
        self.attempts += 1;
        self.severity = Some(severity);
    }

    /// Whether the budget is spent.
    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

// ---------------------------------------------------------------------------
// RetryDecision
// ---------------------------------------------------------------------------

/// What the controller should do after a failed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the same step on the same subject after `backoff`.
    Retry { backoff: Duration },
    /// Mark the subject failed, remove it, move to the next subject.
    FailSubject { reason: String },
    /// Halt the entire run, leaving the subject in place for inspection.
    HaltQueue { reason: String },
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// The engine's single retry/backoff/classification policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_step_attempts: u32,
    base_backoff: Duration,
    rate_limit_policy: RateLimitPolicy,
    rate_limit_backoff: Duration,
}

impl RetryPolicy {
    /// Build the policy from the engine configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_step_attempts: config.max_step_attempts.max(1),
            base_backoff: Duration::from_millis(config.retry_backoff_ms),
            rate_limit_policy: config.rate_limit_policy,
            rate_limit_backoff: Duration::from_millis(config.rate_limit_backoff_ms),
        }
    }

    /// The per-step attempt budget.
    pub fn max_step_attempts(&self) -> u32 {
        self.max_step_attempts
    }

    /// Classify a step error into the three-severity taxonomy.
    pub fn classify(&self, error: &StepError) -> Severity {
        match error {
            // Environment timing: the page was not ready yet.
            StepError::PreconditionNotMet { .. }
            | StepError::PostconditionNotMet { .. }
            | StepError::ChannelExhausted => Severity::Transient,

            StepError::Environment(_) => Severity::Transient,

            StepError::Channel(PollError::AccessDenied(_)) => Severity::QueueFatal,
            StepError::Channel(_) => Severity::Transient,

            // A control that never exists is structural, not timing.
            StepError::ControlMissing { .. } => Severity::QueueFatal,

            StepError::VerificationRejected { .. } => Severity::SubjectFatal,

            // Rate limit / IP block: the source systems disagreed here, so
            // the boundary is an explicit configuration choice.
            StepError::AccessBlocked(_)
            | StepError::Verification(VerificationError::Blocked(_)) => {
                match self.rate_limit_policy {
                    RateLimitPolicy::Halt => Severity::QueueFatal,
                    RateLimitPolicy::LongBackoff => Severity::Transient,
                }
            }
            StepError::Verification(VerificationError::Request(_)) => Severity::Transient,
        }
    }

    /// Backoff before the next attempt at a Transient failure.
    pub fn backoff_for(&self, error: &StepError) -> Duration {
        match error {
            StepError::AccessBlocked(_)
            | StepError::Verification(VerificationError::Blocked(_)) => self.rate_limit_backoff,
            _ => self.base_backoff,
        }
    }

    /// Decide the controller's next move for a classified failure.
    pub fn decide_severity(
        &self,
        severity: Severity,
        attempts: u32,
        backoff: Duration,
        reason: String,
    ) -> RetryDecision {
        match severity {
            Severity::Transient => {
                if attempts < self.max_step_attempts {
                    RetryDecision::Retry { backoff }
                } else {
                    // Budget spent: escalate so a flapping environment can
                    // never retry forever.
                    tracing::warn!(
                        attempts,
                        max = self.max_step_attempts,
                        reason = reason.as_str(),
                        "transient retry budget exhausted; failing subject"
                    );
                    RetryDecision::FailSubject {
                        reason: format!("retry budget exhausted after {attempts} attempts: {reason}"),
                    }
                }
            }
            Severity::SubjectFatal => RetryDecision::FailSubject { reason },
            Severity::QueueFatal => RetryDecision::HaltQueue { reason },
        }
    }

    /// Decide for a `StepError`, classifying it first.
    ///
    /// `attempts` is the count *including* the attempt that just failed.
    pub fn decide(&self, error: &StepError, attempts: u32) -> RetryDecision {
        let severity = self.classify(error);
        self.decide_severity(severity, attempts, self.backoff_for(error), error.to_string())
    }

    /// Decide for a step that reported `Retryable` without an error.
    pub fn decide_retryable(&self, attempts: u32) -> RetryDecision {
        self.decide_severity(
            Severity::Transient,
            attempts,
            self.base_backoff,
            "step reported retryable".to_string(),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
