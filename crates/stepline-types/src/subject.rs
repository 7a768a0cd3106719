//! Subject types: one unit of work moving through the workflow.
//!
//! A `Subject` is one record in the work queue (e.g. one account to create,
//! one eligibility case to verify). Subjects carry the typed fields the step
//! executors need, a persisted per-step attempt counter, and a terminal
//! outcome. They are owned by the queue and mutated only by the controller.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Subject
// ---------------------------------------------------------------------------

/// One unit of work in the subject queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    /// UUIDv7 assigned when the subject is enqueued.
    pub id: Uuid,
    /// Ordered, typed fields required by step executors.
    pub fields: Vec<SubjectField>,
    /// Persisted attempt counter for the subject's current step.
    ///
    /// Persisted (not just in-memory) so a process restart does not reset
    /// retry budgets to zero and re-enter an infinite retry loop.
    #[serde(default)]
    pub attempt_count: u32,
    /// Terminal outcome. Subjects leave the queue once this is not `Pending`.
    #[serde(default)]
    pub outcome: SubjectOutcome,
}

impl Subject {
    /// Create a new pending subject with a fresh UUIDv7.
    pub fn new(fields: Vec<SubjectField>) -> Self {
        Self {
            id: Uuid::now_v7(),
            fields,
            attempt_count: 0,
            outcome: SubjectOutcome::Pending,
        }
    }

    /// Look up a field value by name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }

    /// Names of required fields whose value is empty or missing.
    pub fn missing_required_fields(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.required && f.value.trim().is_empty())
            .map(|f| f.name.clone())
            .collect()
    }
}

/// A single named field on a subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectField {
    /// Field name (e.g. "given_name", "birth_date").
    pub name: String,
    /// Field value as entered by the operator.
    pub value: String,
    /// Whether the field must be non-empty before the subject may enqueue.
    #[serde(default)]
    pub required: bool,
}

impl SubjectField {
    /// Convenience constructor for an optional field.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            required: false,
        }
    }

    /// Convenience constructor for a required field.
    pub fn required(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            required: true,
        }
    }
}

/// Terminal outcome of a subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectOutcome {
    /// Still in the queue, not yet fully processed.
    #[default]
    Pending,
    /// All steps completed.
    Success,
    /// Skipped after a SubjectFatal classification or exhausted retries.
    Failed,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
