//! SQLite state store implementation.
//!
//! Implements `StateStore` from `stepline-core` over the `engine_kv` table.
//! Values are stored as JSON text and compared as text for `compare_and_set`
//! (serde_json serializes maps with sorted keys, so equal values serialize
//! identically). All writes go through the single-connection writer pool,
//! which is what makes the conditional UPDATE atomic across workers sharing
//! the database file.

use chrono::Utc;
use serde_json::Value;
use stepline_core::store::{StateStore, StoreEvent};
use stepline_types::error::StoreError;
use tokio::sync::broadcast;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `StateStore`.
pub struct SqliteStateStore {
    pool: DatabasePool,
    notify: broadcast::Sender<StoreEvent>,
}

impl SqliteStateStore {
    /// Create a state store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        let (notify, _) = broadcast::channel(64);
        Self { pool, notify }
    }

    /// Open a store at a database URL, running migrations.
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let pool = DatabasePool::new(database_url)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(Self::new(pool))
    }

    fn publish(&self, key: &str) {
        // Same-process only; workers in other processes re-read keys at
        // suspension points instead.
        let _ = self.notify.send(StoreEvent {
            key: key.to_string(),
        });
    }
}

fn encode(key: &str, value: &Value) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

impl StateStore for SqliteStateStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM engine_kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        match row {
            Some((text,)) => {
                let value = serde_json::from_str(&text).map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let text = encode(key, value)?;
        sqlx::query(
            r#"INSERT INTO engine_kv (key, value, updated_at)
               VALUES (?, ?, ?)
               ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at"#,
        )
        .bind(key)
        .bind(&text)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        self.publish(key);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM engine_kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        if result.rows_affected() > 0 {
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
        let text = encode(key, value)?;
        let now = Utc::now().to_rfc3339();

        let swapped = match expected {
            // Insert only if the key is absent.
            None => {
                let result = sqlx::query(
                    r#"INSERT INTO engine_kv (key, value, updated_at)
                       VALUES (?, ?, ?)
                       ON CONFLICT (key) DO NOTHING"#,
                )
                .bind(key)
                .bind(&text)
                .bind(&now)
                .execute(&self.pool.writer)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;
                result.rows_affected() == 1
            }
            // Update only if the current value matches the expectation.
            Some(expected) => {
                let expected_text = encode(key, expected)?;
                let result = sqlx::query(
                    "UPDATE engine_kv SET value = ?, updated_at = ? WHERE key = ? AND value = ?",
                )
                .bind(&text)
                .bind(&now)
                .bind(key)
                .bind(&expected_text)
                .execute(&self.pool.writer)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;
                result.rows_affected() == 1
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open_store(dir: &tempfile::TempDir) -> SqliteStateStore {
        let db_path = dir.path().join("store.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        SqliteStateStore::open(&url).await.unwrap()
    }

    #[tokio::test]
    async fn test_set_get_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store
            .set("workflow.state", &json!({"run_flag": true}))
            .await
            .unwrap();
        assert_eq!(
            store.get("workflow.state").await.unwrap(),
            Some(json!({"run_flag": true}))
        );

        store.remove("workflow.state").await.unwrap();
        assert!(store.get("workflow.state").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("store.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        {
            let store = SqliteStateStore::open(&url).await.unwrap();
            store.set("workflow.queue", &json!([1, 2, 3])).await.unwrap();
        }

        // Fresh pool over the same file, as after a process restart.
        let store = SqliteStateStore::open(&url).await.unwrap();
        assert_eq!(
            store.get("workflow.queue").await.unwrap(),
            Some(json!([1, 2, 3]))
        );
    }

    #[tokio::test]
    async fn test_compare_and_set_absent_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        assert!(store.compare_and_set("k", None, &json!("a")).await.unwrap());
        assert!(!store.compare_and_set("k", None, &json!("b")).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(json!("a")));
    }

    #[tokio::test]
    async fn test_compare_and_set_expected_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        store.set("k", &json!({"holder": "w1"})).await.unwrap();
        assert!(
            store
                .compare_and_set("k", Some(&json!({"holder": "w1"})), &json!({"holder": "w2"}))
                .await
                .unwrap()
        );
        assert!(
            !store
                .compare_and_set("k", Some(&json!({"holder": "w1"})), &json!({"holder": "w3"}))
                .await
                .unwrap()
        );
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"holder": "w2"})));
    }

    #[tokio::test]
    async fn test_cas_is_atomic_across_store_instances() {
        // Two stores over the same file, as two worker processes. Exactly
        // one CAS against the absent key may win.
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("shared.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        let store_a = SqliteStateStore::open(&url).await.unwrap();
        let store_b = SqliteStateStore::open(&url).await.unwrap();

        let a = store_a
            .compare_and_set("workflow.lock.queue", None, &json!("a"))
            .await
            .unwrap();
        let b = store_b
            .compare_and_set("workflow.lock.queue", None, &json!("b"))
            .await
            .unwrap();
        assert!(a);
        assert!(!b);
    }

    #[tokio::test]
    async fn test_watch_fires_on_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let mut rx = store.watch();

        store.set("workflow.state", &json!(1)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().key, "workflow.state");
    }
}
