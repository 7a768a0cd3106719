//! Error taxonomy shared across the engine.
//!
//! Three severities drive the retry policy: `Transient` (retry the step),
//! `SubjectFatal` (skip the subject), `QueueFatal` (halt the run). A fourth
//! category, configuration errors, is rejected before a subject ever enters
//! the queue and is never retried.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Severity classification of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Environment timing issue; retry the same step on the same subject.
    Transient,
    /// This subject cannot proceed (data or external eligibility rejected);
    /// mark it failed and advance to the next subject.
    SubjectFatal,
    /// Structural failure compromising the whole run (e.g. access denied at
    /// the channel level); halt all workers and leave the subject untouched.
    QueueFatal,
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Errors from state store operations (implemented in stepline-infra).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error")]
    Connection,

    #[error("store query error: {0}")]
    Query(String),

    #[error("value for key '{key}' is not valid JSON: {reason}")]
    Corrupt { key: String, reason: String },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Subject validation failures, rejected before enqueue. Never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("subject is missing required fields: {}", fields.join(", "))]
    MissingFields { fields: Vec<String> },

    #[error("subject list is empty")]
    EmptySubjectList,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
