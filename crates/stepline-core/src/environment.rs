//! The observed environment boundary.
//!
//! The engine never talks to a page, UI, or host directly; it queries and
//! acts through this trait. Observations are asynchronous and unstable (a
//! page may still be rendering), so marker checks go through `await_marker`
//! with a bounded poll window rather than a single read.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use stepline_types::config::EngineConfig;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// LocationSignal
// ---------------------------------------------------------------------------

/// Opaque token identifying "where the environment is right now".
///
/// The engine never interprets the contents beyond `matches`; producing the
/// token (URL, view name, page fingerprint) is the environment's business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationSignal(pub String);

impl LocationSignal {
    /// Whether this location carries the given signal token.
    pub fn matches(&self, token: &str) -> bool {
        !token.is_empty() && self.0.contains(token)
    }
}

impl std::fmt::Display for LocationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ActionDescriptor
// ---------------------------------------------------------------------------

/// A side effect the engine asks the environment to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionDescriptor {
    /// Fill the input identified by `marker` with `value`.
    Fill { marker: String, value: String },
    /// Activate (click/submit) the control identified by `marker`.
    Click { marker: String },
}

// ---------------------------------------------------------------------------
// Environment trait
// ---------------------------------------------------------------------------

/// Abstraction over the live environment the workflow drives.
///
/// Implemented by the host's UI/page-automation layer; the engine consumes
/// the two query operations and the two action operations, nothing more.
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
pub trait Environment: Send + Sync {
    /// Where is the environment right now.
    fn current_location(
        &self,
    ) -> impl std::future::Future<Output = Result<LocationSignal, EnvError>> + Send;

    /// Is the given marker (an input, a condition) currently present.
    fn observe(
        &self,
        marker: &str,
    ) -> impl std::future::Future<Output = Result<bool, EnvError>> + Send;

    /// Perform a side effect (fill, click).
    fn perform_action(
        &self,
        action: &ActionDescriptor,
    ) -> impl std::future::Future<Output = Result<(), EnvError>> + Send;

    /// Ask the environment to transition (navigate) to `target`.
    ///
    /// After a transition the worker's logical thread may be torn down by
    /// the host; the controller treats the step as ended and expects a
    /// later re-entry.
    fn trigger_transition(
        &self,
        target: &str,
    ) -> impl std::future::Future<Output = Result<(), EnvError>> + Send;
}

// ---------------------------------------------------------------------------
// Bounded marker polling
// ---------------------------------------------------------------------------

/// Poll `observe(marker)` until present, up to `attempts` reads spaced
/// `interval` apart. Returns `false` when the window closes without the
/// marker appearing, `Err(EnvError::Cancelled)` on a stop request.
pub async fn await_marker<E: Environment>(
    env: &E,
    marker: &str,
    attempts: u32,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<bool, EnvError> {
    for attempt in 1..=attempts.max(1) {
        if cancel.is_cancelled() {
            return Err(EnvError::Cancelled);
        }
        if env.observe(marker).await? {
            return Ok(true);
        }
        if attempt < attempts {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return Err(EnvError::Cancelled),
            }
        }
    }
    tracing::debug!(marker, attempts, "marker never appeared in poll window");
    Ok(false)
}

/// `await_marker` with the window taken from the engine configuration.
pub async fn await_marker_with_config<E: Environment>(
    env: &E,
    marker: &str,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> Result<bool, EnvError> {
    await_marker(
        env,
        marker,
        config.observe_attempts,
        Duration::from_millis(config.observe_interval_ms),
        cancel,
    )
    .await
}

// ---------------------------------------------------------------------------
// EnvError
// ---------------------------------------------------------------------------

/// Errors surfaced by the environment boundary.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    /// The environment rejected or failed an operation.
    #[error("environment error: {0}")]
    Failed(String),

    /// The environment instance is gone (tab closed, host shut down).
    #[error("environment detached")]
    Detached,

    /// An observation wait was cancelled by a stop request.
    #[error("observation cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
