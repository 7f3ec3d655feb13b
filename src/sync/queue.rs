//! Offline Queue Module - durable FIFO of pending mutations
//!
//! Mutations made while offline (or before the coordinator got to them) are
//! stored in the `sync_queue` collection and replayed in insertion order.
//!
//! Features:
//! - SQLite-backed persistent queue (survives restarts)
//! - Insertion order preserved; it defines replay order
//! - Idempotent removal after terminal handling (applied or conflicted)
//! - Undecodable records are treated as poison and dropped

use super::models::{Mutation, QueueItem};
use crate::db::{Collection, Database, DbError};
use std::sync::Arc;

// ============================================================================
// Queue Manager
// ============================================================================

/// Manages the offline mutation queue
#[derive(Clone)]
pub struct QueueManager {
    db: Arc<Database>,
}

impl QueueManager {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append a mutation with a fresh id and timestamp
    pub fn enqueue(&self, mutation: Mutation) -> Result<QueueItem, QueueError> {
        let item = QueueItem::new(mutation);
        self.db.put(Collection::SyncQueue, &item.id, &item)?;

        log::info!("Queued {} as {}", item.kind(), item.id);
        Ok(item)
    }

    /// Snapshot of every pending item, oldest first.
    ///
    /// Records that no longer decode (unknown mutation kind, malformed
    /// payload) are deleted here and never retried.
    pub fn drain(&self) -> Result<Vec<QueueItem>, QueueError> {
        let entries = self.db.get_all(Collection::SyncQueue)?;
        let mut items = Vec::with_capacity(entries.len());

        for (key, value) in entries {
            match serde_json::from_value::<QueueItem>(value) {
                Ok(item) => items.push(item),
                Err(e) => {
                    log::warn!("Discarding undecodable queue item {}: {}", key, e);
                    self.db.delete(Collection::SyncQueue, &key)?;
                }
            }
        }

        log::debug!("Queue snapshot holds {} items", items.len());
        Ok(items)
    }

    /// Get a pending item by id
    pub fn get(&self, id: &str) -> Result<Option<QueueItem>, QueueError> {
        Ok(self.db.get(Collection::SyncQueue, id)?)
    }

    /// Delete an item. Removing a missing id is a no-op.
    pub fn remove(&self, id: &str) -> Result<(), QueueError> {
        if self.db.delete(Collection::SyncQueue, id)? {
            log::debug!("Removed queue item {}", id);
        }
        Ok(())
    }

    pub fn len(&self) -> Result<usize, QueueError> {
        Ok(self.db.count(Collection::SyncQueue)?)
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    /// Drop every pending item (manual action)
    pub fn clear(&self) -> Result<usize, QueueError> {
        let deleted = self.db.clear(Collection::SyncQueue)?;
        log::info!("Cleared {} queue items", deleted);
        Ok(deleted)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::{ChecklistResponse, EntityUpdate, MutationKind};
    use serde_json::json;

    fn create_test_manager() -> (Arc<Database>, QueueManager) {
        let db = Arc::new(Database::in_memory().expect("Failed to create test DB"));
        (db.clone(), QueueManager::new(db))
    }

    fn order_update(id: i64, status: &str) -> Mutation {
        Mutation::OrderUpdate(EntityUpdate::new(id, json!({ "status": status })))
    }

    #[test]
    fn test_queue_creation() {
        let (_, manager) = create_test_manager();
        assert_eq!(manager.len().unwrap(), 0);
        assert!(manager.is_empty().unwrap());
    }

    #[test]
    fn test_enqueue_assigns_unique_ids() {
        let (_, manager) = create_test_manager();

        let first = manager.enqueue(order_update(1, "open")).unwrap();
        let second = manager.enqueue(order_update(1, "open")).unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(manager.len().unwrap(), 2);
        assert_eq!(manager.get(&first.id).unwrap(), Some(first));
    }

    #[test]
    fn test_drain_preserves_insertion_order() {
        let (_, manager) = create_test_manager();

        let statuses = ["a", "b", "c", "d", "e"];
        for status in statuses {
            manager.enqueue(order_update(42, status)).unwrap();
        }
        manager
            .enqueue(Mutation::ChecklistResponse(ChecklistResponse {
                template_id: 1,
                body: json!({}),
            }))
            .unwrap();

        let items = manager.drain().unwrap();
        assert_eq!(items.len(), 6);

        let replayed: Vec<String> = items[..5]
            .iter()
            .map(|item| match &item.mutation {
                Mutation::OrderUpdate(update) => update.data["status"].as_str().unwrap().to_string(),
                other => panic!("unexpected mutation {:?}", other),
            })
            .collect();
        assert_eq!(replayed, statuses);
        assert_eq!(items[5].kind(), MutationKind::ChecklistResponse);

        // Draining is a read; items stay until removed
        assert_eq!(manager.len().unwrap(), 6);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (_, manager) = create_test_manager();
        let item = manager.enqueue(order_update(1, "x")).unwrap();

        manager.remove(&item.id).unwrap();
        manager.remove(&item.id).unwrap();
        manager.remove("never-existed").unwrap();

        assert_eq!(manager.len().unwrap(), 0);
    }

    #[test]
    fn test_drain_discards_unknown_kinds() {
        let (db, manager) = create_test_manager();

        manager.enqueue(order_update(1, "before")).unwrap();
        db.put(
            Collection::SyncQueue,
            "poison",
            &json!({
                "id": "poison",
                "createdAt": "2024-01-01T00:00:00Z",
                "mutation": { "type": "photo-upload", "payload": {} }
            }),
        )
        .unwrap();
        manager.enqueue(order_update(1, "after")).unwrap();

        let items = manager.drain().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(manager.len().unwrap(), 2);
        assert!(manager.get("poison").unwrap().is_none());
    }

    #[test]
    fn test_clear() {
        let (_, manager) = create_test_manager();
        manager.enqueue(order_update(1, "a")).unwrap();
        manager.enqueue(order_update(2, "b")).unwrap();

        assert_eq!(manager.clear().unwrap(), 2);
        assert!(manager.is_empty().unwrap());
    }

    #[test]
    fn test_queue_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        let queued = {
            let manager = QueueManager::new(Arc::new(Database::new(path.clone()).unwrap()));
            manager.enqueue(order_update(42, "offline edit")).unwrap()
        };

        let manager = QueueManager::new(Arc::new(Database::new(path).unwrap()));
        let items = manager.drain().unwrap();
        assert_eq!(items, vec![queued]);
    }
}
