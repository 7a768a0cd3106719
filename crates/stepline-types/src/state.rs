//! Durable workflow state: the engine's checkpoint record.
//!
//! `WorkflowState` is the single persisted checkpoint the controller writes
//! after every step outcome and re-reads on every entry. It is the anchor of
//! crash recovery: combined with a live environment observation it is enough
//! to re-derive the current step without replaying completed work.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

/// The durable checkpoint for a workflow run.
///
/// Invariant: `current_subject_id` always references a subject still in the
/// queue, or is `None` between subjects. Mutated after every step outcome;
/// reset when the queue empties or the operator issues a stop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Subject currently in flight, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_subject_id: Option<Uuid>,
    /// Step the engine last checkpointed for the current subject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    /// Attempts made at the current step (mirrors the subject's persisted
    /// counter while the subject is in flight).
    #[serde(default)]
    pub step_attempt_count: u32,
    /// Whether the engine is supposed to be actively running.
    ///
    /// The authoritative stop signal: a stop request is a single write of
    /// `false` here, re-read at every suspension point.
    #[serde(default)]
    pub run_flag: bool,
    /// Cumulative run counters.
    #[serde(default)]
    pub stats: RunStats,
    /// Free-form data produced by one step and consumed by a later one
    /// (e.g. a generated correspondence address).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux_context: Option<serde_json::Value>,
    /// Human-readable reason when the run was halted by a QueueFatal error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<String>,
}

impl WorkflowState {
    /// Fresh state for a newly started run.
    pub fn started() -> Self {
        Self {
            run_flag: true,
            ..Self::default()
        }
    }

    /// Clear per-subject fields when moving to the next subject.
    pub fn clear_subject(&mut self) {
        self.current_subject_id = None;
        self.current_step_id = None;
        self.step_attempt_count = 0;
        self.aux_context = None;
    }
}

// ---------------------------------------------------------------------------
// RunStats
// ---------------------------------------------------------------------------

/// Cumulative counters for a run, exposed on the operator surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Subjects that reached a terminal outcome (success or failed).
    pub processed: u64,
    /// Subjects that completed every step.
    pub success: u64,
    /// Subjects marked failed and removed from the queue.
    pub failed: u64,
}

impl RunStats {
    /// Record a successfully completed subject.
    pub fn record_success(&mut self) {
        self.processed += 1;
        self.success += 1;
    }

    /// Record a failed (skipped) subject.
    pub fn record_failure(&mut self) {
        self.processed += 1;
        self.failed += 1;
    }
}

// ---------------------------------------------------------------------------
// EnginePhase
// ---------------------------------------------------------------------------

/// The controller's state machine phases.
///
/// `Idle → Resolving → Executing → (Advancing | Retrying | Failing | Halted)
/// → Resolving …`. Re-entry after a process restart always starts in
/// `Resolving`, never assumes `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnginePhase {
    /// No run in progress (initial and queue-drained terminal state).
    Idle,
    /// Deriving the current step from persisted state + live observation.
    Resolving,
    /// A step executor is running.
    Executing,
    /// Step advanced; moving to the next step or subject.
    Advancing,
    /// Transient outcome; backing off before re-resolving the same subject.
    Retrying,
    /// SubjectFatal outcome; skipping to the next subject.
    Failing,
    /// Explicit stop or QueueFatal; requires operator intervention.
    Halted,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
