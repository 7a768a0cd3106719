//! Named, leased mutual exclusion built on the state store.
//!
//! Acquisition is a compare-and-set on a store key holding
//! `{holder_id, expires_at}`: a worker may acquire only when the key is
//! absent or the recorded lease has expired. Denied callers back off with a
//! jittered delay and retry -- starvation is acceptable at single-digit
//! worker counts, but the randomized backoff avoids livelock. Leases
//! auto-expire so a crashed holder cannot permanently block the queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use stepline_types::config::EngineConfig;
use stepline_types::error::StoreError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::store::{StateStore, keys};

// ---------------------------------------------------------------------------
// LeaseRecord
// ---------------------------------------------------------------------------

/// The persisted form of a held lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Identity of the worker holding the lease.
    pub holder_id: Uuid,
    /// Instant after which any worker may take the lock over.
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

// ---------------------------------------------------------------------------
// LockGuard
// ---------------------------------------------------------------------------

/// Proof of a held lease.
///
/// Queue and state mutations take `&LockGuard` so they cannot be written
/// without an acquisition on the call path. Release is explicit (or the
/// lease simply expires).
#[derive(Debug)]
pub struct LockGuard {
    name: String,
    holder_id: Uuid,
    record: LeaseRecord,
}

impl LockGuard {
    /// Name of the lock this guard was granted for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The holder identity the lease was granted to.
    pub fn holder_id(&self) -> Uuid {
        self.holder_id
    }
}

// ---------------------------------------------------------------------------
// LeaseLock
// ---------------------------------------------------------------------------

/// A named lock over a `StateStore` key.
pub struct LeaseLock<S: StateStore> {
    store: Arc<S>,
    name: String,
    lease: Duration,
    backoff_min: Duration,
    backoff_max: Duration,
}

impl<S: StateStore> LeaseLock<S> {
    /// Create a lock with explicit lease and backoff timings.
    pub fn new(
        store: Arc<S>,
        name: impl Into<String>,
        lease: Duration,
        backoff_min: Duration,
        backoff_max: Duration,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            lease,
            backoff_min,
            backoff_max,
        }
    }

    /// Create a lock with timings from the engine configuration.
    pub fn from_config(store: Arc<S>, name: impl Into<String>, config: &EngineConfig) -> Self {
        Self::new(
            store,
            name,
            Duration::from_millis(config.lock_lease_ms),
            Duration::from_millis(config.lock_backoff_min_ms),
            Duration::from_millis(config.lock_backoff_max_ms),
        )
    }

    fn key(&self) -> String {
        keys::lock(&self.name)
    }

    fn fresh_record(&self, holder_id: Uuid) -> LeaseRecord {
        LeaseRecord {
            holder_id,
            expires_at: Utc::now()
                + chrono::Duration::from_std(self.lease).unwrap_or(chrono::Duration::zero()),
        }
    }

    /// Attempt a single acquisition. Returns `None` when denied.
    pub async fn try_acquire(&self, holder_id: Uuid) -> Result<Option<LockGuard>, LockError> {
        let key = self.key();
        let record = self.fresh_record(holder_id);
        let record_json = serde_json::to_value(&record).map_err(|e| LockError::Codec(e.to_string()))?;

        let current = self.store.get(&key).await?;
        let granted = match &current {
            None => self.store.compare_and_set(&key, None, &record_json).await?,
            Some(value) => {
                let existing: LeaseRecord = serde_json::from_value(value.clone())
                    .map_err(|e| LockError::Codec(e.to_string()))?;
                if existing.expired(Utc::now()) {
                    // Take over an abandoned lease; the CAS loses cleanly if
                    // another worker got there first.
                    self.store
                        .compare_and_set(&key, Some(value), &record_json)
                        .await?
                } else {
                    false
                }
            }
        };

        if granted {
            tracing::debug!(lock = self.name.as_str(), holder = %holder_id, "lock acquired");
            Ok(Some(LockGuard {
                name: self.name.clone(),
                holder_id,
                record,
            }))
        } else {
            Ok(None)
        }
    }

    /// Acquire the lock, retrying with jittered backoff until granted or
    /// cancelled.
    pub async fn acquire(
        &self,
        holder_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<LockGuard, LockError> {
        loop {
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled);
            }
            if let Some(guard) = self.try_acquire(holder_id).await? {
                return Ok(guard);
            }

            // rand's thread_rng is not Send; draw the jitter before awaiting.
            let backoff = {
                let mut rng = rand::thread_rng();
                let min = self.backoff_min.as_millis() as u64;
                let max = self.backoff_max.as_millis().max(self.backoff_min.as_millis()) as u64;
                Duration::from_millis(rng.gen_range(min..=max))
            };

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return Err(LockError::Cancelled),
            }
        }
    }

    /// Release a held lease.
    ///
    /// Implemented as a compare-and-set to an already-expired record, so a
    /// stale release can never clobber a lease another worker has since
    /// taken over. Releasing after expiry is a no-op.
    pub async fn release(&self, guard: LockGuard) -> Result<(), LockError> {
        let key = self.key();
        let current_json =
            serde_json::to_value(&guard.record).map_err(|e| LockError::Codec(e.to_string()))?;
        let released = LeaseRecord {
            holder_id: guard.holder_id,
            expires_at: DateTime::<Utc>::UNIX_EPOCH,
        };
        let released_json =
            serde_json::to_value(&released).map_err(|e| LockError::Codec(e.to_string()))?;

        let swapped = self
            .store
            .compare_and_set(&key, Some(&current_json), &released_json)
            .await?;
        if !swapped {
            tracing::debug!(
                lock = guard.name.as_str(),
                holder = %guard.holder_id,
                "release skipped; lease already superseded"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LockError
// ---------------------------------------------------------------------------

/// Errors from lock operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Underlying store operation failed.
    #[error("lock store error: {0}")]
    Store(#[from] StoreError),

    /// Lease record could not be (de)serialized.
    #[error("lock lease codec error: {0}")]
    Codec(String),

    /// Acquisition wait was cancelled by a stop request.
    #[error("lock acquisition cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
