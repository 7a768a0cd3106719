//! Persisted subject queue.
//!
//! The queue's persisted form (`workflow.queue`) is the sole source of truth:
//! every worker re-reads it on resume, never trusting in-memory state across
//! a suspend/resume boundary. All mutating operations take a `&LockGuard`, so
//! writes without a held lock do not compile. Read-only access is permitted
//! without the lock but callers must tolerate a stale read and revalidate
//! before acting.

use std::sync::Arc;

use stepline_types::error::StoreError;
use stepline_types::subject::Subject;
use uuid::Uuid;

use crate::lock::LockGuard;
use crate::store::{StateStore, get_typed, keys, set_typed};

// ---------------------------------------------------------------------------
// SubjectQueue
// ---------------------------------------------------------------------------

/// Ordered collection of pending subjects, backed by the store.
pub struct SubjectQueue<S: StateStore> {
    store: Arc<S>,
}

impl<S: StateStore> SubjectQueue<S> {
    /// Create a queue view over the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Load the full persisted queue. An absent key is an empty queue.
    pub async fn load_all(&self) -> Result<Vec<Subject>, QueueError> {
        Ok(get_typed(self.store.as_ref(), keys::QUEUE)
            .await?
            .unwrap_or_default())
    }

    /// Read the subject at `index` without taking the lock.
    pub async fn peek_current(&self, index: usize) -> Result<Option<Subject>, QueueError> {
        Ok(self.load_all().await?.into_iter().nth(index))
    }

    /// Find the current index of a subject by id.
    pub async fn position_of(&self, subject_id: Uuid) -> Result<Option<usize>, QueueError> {
        Ok(self
            .load_all()
            .await?
            .iter()
            .position(|s| s.id == subject_id))
    }

    /// Replace the persisted queue wholesale.
    pub async fn rebuild(
        &self,
        _guard: &LockGuard,
        subjects: &[Subject],
    ) -> Result<(), QueueError> {
        set_typed(self.store.as_ref(), keys::QUEUE, &subjects).await?;
        tracing::debug!(len = subjects.len(), "queue rebuilt");
        Ok(())
    }

    /// Remove and return the subject at `index`.
    pub async fn remove_at(
        &self,
        guard: &LockGuard,
        index: usize,
    ) -> Result<Option<Subject>, QueueError> {
        let mut subjects = self.load_all().await?;
        if index >= subjects.len() {
            return Ok(None);
        }
        let removed = subjects.remove(index);
        self.rebuild(guard, &subjects).await?;
        tracing::debug!(subject_id = %removed.id, index, "subject removed from queue");
        Ok(Some(removed))
    }

    /// Overwrite the subject with `subject.id` in place (attempt counters,
    /// outcome). No-op when the subject has already left the queue.
    pub async fn update_subject(
        &self,
        guard: &LockGuard,
        subject: &Subject,
    ) -> Result<(), QueueError> {
        let mut subjects = self.load_all().await?;
        if let Some(slot) = subjects.iter_mut().find(|s| s.id == subject.id) {
            *slot = subject.clone();
            self.rebuild(guard, &subjects).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// QueueError
// ---------------------------------------------------------------------------

/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Underlying store operation failed.
    #[error("queue store error: {0}")]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LeaseLock;
    use crate::store::MemoryStateStore;
    use std::time::Duration;
    use stepline_types::subject::{SubjectField, SubjectOutcome};

    async fn guard_for(store: &Arc<MemoryStateStore>) -> (LeaseLock<MemoryStateStore>, LockGuard) {
        let lock = LeaseLock::new(
            Arc::clone(store),
            "queue",
            Duration::from_millis(500),
            Duration::from_millis(5),
            Duration::from_millis(10),
        );
        let guard = lock.try_acquire(Uuid::now_v7()).await.unwrap().unwrap();
        (lock, guard)
    }

    fn subject(name: &str) -> Subject {
        Subject::new(vec![SubjectField::required("given_name", name)])
    }

    #[tokio::test]
    async fn test_empty_store_is_empty_queue() {
        let store = Arc::new(MemoryStateStore::new());
        let queue = SubjectQueue::new(store);
        assert!(queue.load_all().await.unwrap().is_empty());
        assert!(queue.peek_current(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rebuild_and_load() {
        let store = Arc::new(MemoryStateStore::new());
        let queue = SubjectQueue::new(Arc::clone(&store));
        let (_lock, guard) = guard_for(&store).await;

        let subjects = vec![subject("a"), subject("b"), subject("c")];
        queue.rebuild(&guard, &subjects).await.unwrap();

        let loaded = queue.load_all().await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[1].id, subjects[1].id);
    }

    #[tokio::test]
    async fn test_remove_at_preserves_order() {
        let store = Arc::new(MemoryStateStore::new());
        let queue = SubjectQueue::new(Arc::clone(&store));
        let (_lock, guard) = guard_for(&store).await;

        let subjects = vec![subject("a"), subject("b"), subject("c")];
        queue.rebuild(&guard, &subjects).await.unwrap();

        let removed = queue.remove_at(&guard, 1).await.unwrap().unwrap();
        assert_eq!(removed.id, subjects[1].id);

        let remaining = queue.load_all().await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].id, subjects[0].id);
        assert_eq!(remaining[1].id, subjects[2].id);
    }

    #[tokio::test]
    async fn test_remove_at_out_of_bounds() {
        let store = Arc::new(MemoryStateStore::new());
        let queue = SubjectQueue::new(Arc::clone(&store));
        let (_lock, guard) = guard_for(&store).await;

        queue.rebuild(&guard, &[subject("a")]).await.unwrap();
        assert!(queue.remove_at(&guard, 5).await.unwrap().is_none());
        assert_eq!(queue.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_position_of() {
        let store = Arc::new(MemoryStateStore::new());
        let queue = SubjectQueue::new(Arc::clone(&store));
        let (_lock, guard) = guard_for(&store).await;

        let subjects = vec![subject("a"), subject("b")];
        queue.rebuild(&guard, &subjects).await.unwrap();

        assert_eq!(queue.position_of(subjects[1].id).await.unwrap(), Some(1));
        assert_eq!(queue.position_of(Uuid::now_v7()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_subject_in_place() {
        let store = Arc::new(MemoryStateStore::new());
        let queue = SubjectQueue::new(Arc::clone(&store));
        let (_lock, guard) = guard_for(&store).await;

        let mut s = subject("a");
        queue.rebuild(&guard, std::slice::from_ref(&s)).await.unwrap();

        s.attempt_count = 4;
        s.outcome = SubjectOutcome::Failed;
        queue.update_subject(&guard, &s).await.unwrap();

        let loaded = queue.load_all().await.unwrap();
        assert_eq!(loaded[0].attempt_count, 4);
        assert_eq!(loaded[0].outcome, SubjectOutcome::Failed);
    }

    #[tokio::test]
    async fn test_update_departed_subject_is_noop() {
        let store = Arc::new(MemoryStateStore::new());
        let queue = SubjectQueue::new(Arc::clone(&store));
        let (_lock, guard) = guard_for(&store).await;

        queue.rebuild(&guard, &[subject("a")]).await.unwrap();
        let gone = subject("b");
        queue.update_subject(&guard, &gone).await.unwrap();
        assert_eq!(queue.load_all().await.unwrap().len(), 1);
    }
}
