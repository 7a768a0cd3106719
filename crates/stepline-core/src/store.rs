//! Persistent state store port.
//!
//! Every other component reads and writes through `StateStore`: the workflow
//! checkpoint, the subject queue, the stats counters, and the lock leases all
//! live under namespaced keys. Operations are eventually-durable; there is no
//! multi-key transaction -- higher layers compensate via the lock. The one
//! atomic primitive is `compare_and_set`, which the lease lock is built on.
//!
//! The SQLite implementation lives in `stepline-infra`; `MemoryStateStore`
//! here backs single-process runs and the core test suite.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use stepline_types::error::StoreError;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Key layout
// ---------------------------------------------------------------------------

/// Namespaced key layout, kept JSON-scalar/object only so an operator can
/// inspect the store directly during crash recovery.
pub mod keys {
    /// The durable workflow checkpoint (`WorkflowState`).
    pub const STATE: &str = "workflow.state";
    /// The persisted subject queue (ordered `Vec<Subject>`).
    pub const QUEUE: &str = "workflow.queue";
    /// Cumulative run counters (`RunStats`).
    pub const STATS: &str = "workflow.stats";

    /// Key for a named lock lease.
    pub fn lock(name: &str) -> String {
        format!("workflow.lock.{name}")
    }
}

// ---------------------------------------------------------------------------
// StoreEvent
// ---------------------------------------------------------------------------

/// Change notification fired on every same-process mutation.
///
/// Used to propagate stop signals instantly between workers sharing a store.
/// Cross-process propagation relies on re-reading keys at suspension points,
/// so a missed event is never load-bearing.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    /// The key that was set or removed.
    pub key: String,
}

// ---------------------------------------------------------------------------
// StateStore trait
// ---------------------------------------------------------------------------

/// Durable key/value storage surviving process restarts.
///
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
pub trait StateStore: Send + Sync {
    /// Get a value by key. Returns `None` if the key does not exist.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<Value>, StoreError>> + Send;

    /// Set a value for a key (upsert).
    fn set(
        &self,
        key: &str,
        value: &Value,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Remove a key. No-op if the key does not exist.
    fn remove(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Atomically set `key` to `value` if its current value equals `expected`
    /// (`None` = key absent). Returns `true` when the swap happened.
    ///
    /// This is the only atomic multi-step primitive the engine assumes; the
    /// lease lock is built on it.
    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&Value>,
        value: &Value,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    /// Subscribe to same-process change notifications.
    fn watch(&self) -> broadcast::Receiver<StoreEvent>;
}

// ---------------------------------------------------------------------------
// Typed access helpers
// ---------------------------------------------------------------------------

/// Read a key and deserialize it, treating an absent key as `None`.
pub async fn get_typed<T, S>(store: &S, key: &str) -> Result<Option<T>, StoreError>
where
    T: serde::de::DeserializeOwned,
    S: StateStore + ?Sized,
{
    match store.get(key).await? {
        Some(value) => {
            let typed = serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
            Ok(Some(typed))
        }
        None => Ok(None),
    }
}

/// Serialize and write a value under a key.
pub async fn set_typed<T, S>(store: &S, key: &str, value: &T) -> Result<(), StoreError>
where
    T: serde::Serialize,
    S: StateStore + ?Sized,
{
    let json = serde_json::to_value(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    store.set(key, &json).await
}

// ---------------------------------------------------------------------------
// MemoryStateStore
// ---------------------------------------------------------------------------

/// In-process `StateStore` backed by a mutex-guarded map.
///
/// Shared between workers via `Arc`. Durability is the caller's concern
/// (single-process runs and tests); the contract otherwise matches the
/// SQLite implementation, including atomic `compare_and_set`.
pub struct MemoryStateStore {
    entries: Mutex<HashMap<String, Value>>,
    notify: broadcast::Sender<StoreEvent>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(64);
        Self {
            entries: Mutex::new(HashMap::new()),
            notify,
        }
    }

    fn publish(&self, key: &str) {
        // No subscribers is fine; stop propagation falls back to re-reads.
        let _ = self.notify.send(StoreEvent {
            key: key.to_string(),
        });
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Connection)?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        {
            let mut entries = self
                .entries
                .lock()
                .map_err(|_| StoreError::Connection)?;
            entries.insert(key.to_string(), value.clone());
        }
        self.publish(key);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let existed = {
            let mut entries = self
                .entries
                .lock()
                .map_err(|_| StoreError::Connection)?;
            entries.remove(key).is_some()
        };
        if existed {
            self.publish(key);
        }
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&Value>,
        value: &Value,
    ) -> Result<bool, StoreError> {
        let swapped = {
            let mut entries = self
                .entries
                .lock()
                .map_err(|_| StoreError::Connection)?;
            if entries.get(key) == expected {
                entries.insert(key.to_string(), value.clone());
                true
            } else {
                false
            }
        };
        if swapped {
            self.publish(key);
        }
        Ok(swapped)
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.notify.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let store = MemoryStateStore::new();
        store.set("workflow.state", &json!({"run_flag": true})).await.unwrap();
        let got = store.get("workflow.state").await.unwrap();
        assert_eq!(got, Some(json!({"run_flag": true})));
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = MemoryStateStore::new();
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove() {
        let store = MemoryStateStore::new();
        store.set("k", &json!(1)).await.unwrap();
        store.remove("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        // removing again is a no-op
        store.remove("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_compare_and_set_absent_key() {
        let store = MemoryStateStore::new();
        assert!(store.compare_and_set("k", None, &json!("a")).await.unwrap());
        // second CAS against "absent" must fail
        assert!(!store.compare_and_set("k", None, &json!("b")).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(json!("a")));
    }

    #[tokio::test]
    async fn test_compare_and_set_expected_value() {
        let store = MemoryStateStore::new();
        store.set("k", &json!("old")).await.unwrap();
        assert!(
            store
                .compare_and_set("k", Some(&json!("old")), &json!("new"))
                .await
                .unwrap()
        );
        assert!(
            !store
                .compare_and_set("k", Some(&json!("old")), &json!("other"))
                .await
                .unwrap()
        );
        assert_eq!(store.get("k").await.unwrap(), Some(json!("new")));
    }

    #[tokio::test]
    async fn test_watch_fires_on_set_and_remove() {
        let store = MemoryStateStore::new();
        let mut rx = store.watch();

        store.set("workflow.state", &json!(1)).await.unwrap();
        store.remove("workflow.state").await.unwrap();

        assert_eq!(rx.recv().await.unwrap().key, "workflow.state");
        assert_eq!(rx.recv().await.unwrap().key, "workflow.state");
    }

    #[tokio::test]
    async fn test_typed_helpers() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Counter {
            n: u32,
        }

        let store = MemoryStateStore::new();
        set_typed(&store, "counter", &Counter { n: 7 }).await.unwrap();
        let got: Option<Counter> = get_typed(&store, "counter").await.unwrap();
        assert_eq!(got, Some(Counter { n: 7 }));

        let missing: Option<Counter> = get_typed(&store, "missing").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_typed_helper_corrupt_value() {
        let store = MemoryStateStore::new();
        store.set("counter", &json!("not a counter")).await.unwrap();
        let result: Result<Option<u32>, _> = get_typed(&store, "counter").await;
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_lock_key_namespacing() {
        assert_eq!(keys::lock("queue"), "workflow.lock.queue");
    }
}
