//! Engine configuration types.
//!
//! `EngineConfig` represents the `config.toml` tuning knobs: retry budgets,
//! lock lease and backoff timings, observation polling windows, and the
//! rate-limit policy choice. All fields have serde defaults so a missing or
//! partial file degrades to the recommended values.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Top-level engine configuration, loaded from `{data_dir}/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum attempts at a single step before escalating to SubjectFatal.
    #[serde(default = "default_max_step_attempts")]
    pub max_step_attempts: u32,

    /// Base backoff between transient retries, in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Lock lease duration in milliseconds. Leases auto-expire so a crashed
    /// holder cannot permanently block the queue.
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: u64,

    /// Lower bound of the jittered backoff after a denied lock acquisition.
    #[serde(default = "default_lock_backoff_min_ms")]
    pub lock_backoff_min_ms: u64,

    /// Upper bound of the jittered backoff after a denied lock acquisition.
    #[serde(default = "default_lock_backoff_max_ms")]
    pub lock_backoff_max_ms: u64,

    /// Interval between environment marker observations, in milliseconds.
    #[serde(default = "default_observe_interval_ms")]
    pub observe_interval_ms: u64,

    /// Bounded number of marker observations before PreconditionNotMet.
    #[serde(default = "default_observe_attempts")]
    pub observe_attempts: u32,

    /// Interval between external channel poll attempts, in milliseconds.
    #[serde(default = "default_channel_poll_interval_ms")]
    pub channel_poll_interval_ms: u64,

    /// Poll attempts per channel polling round before `Exhausted`.
    #[serde(default = "default_channel_poll_attempts")]
    pub channel_poll_attempts: u32,

    /// How a rate-limit / access-block condition is classified.
    #[serde(default)]
    pub rate_limit_policy: RateLimitPolicy,

    /// Backoff applied before retrying when `rate_limit_policy` is
    /// `long_backoff`, in milliseconds.
    #[serde(default = "default_rate_limit_backoff_ms")]
    pub rate_limit_backoff_ms: u64,
}

fn default_max_step_attempts() -> u32 {
    10
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_lock_lease_ms() -> u64 {
    500
}

fn default_lock_backoff_min_ms() -> u64 {
    100
}

fn default_lock_backoff_max_ms() -> u64 {
    200
}

fn default_observe_interval_ms() -> u64 {
    750
}

fn default_observe_attempts() -> u32 {
    12
}

fn default_channel_poll_interval_ms() -> u64 {
    5_000
}

fn default_channel_poll_attempts() -> u32 {
    12
}

fn default_rate_limit_backoff_ms() -> u64 {
    60_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_step_attempts: default_max_step_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            lock_lease_ms: default_lock_lease_ms(),
            lock_backoff_min_ms: default_lock_backoff_min_ms(),
            lock_backoff_max_ms: default_lock_backoff_max_ms(),
            observe_interval_ms: default_observe_interval_ms(),
            observe_attempts: default_observe_attempts(),
            channel_poll_interval_ms: default_channel_poll_interval_ms(),
            channel_poll_attempts: default_channel_poll_attempts(),
            rate_limit_policy: RateLimitPolicy::default(),
            rate_limit_backoff_ms: default_rate_limit_backoff_ms(),
        }
    }
}

/// Classification of a detected rate-limit / access-block condition.
///
/// The source systems disagreed on this boundary, so it is an explicit
/// operator choice rather than a hard-coded severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitPolicy {
    /// Halt the whole run for operator inspection (default).
    #[default]
    Halt,
    /// Treat as Transient with a long backoff before the next attempt.
    LongBackoff,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
