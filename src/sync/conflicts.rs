//! Conflict Store - unresolved divergences between offline edits and server state
//!
//! A conflict is recorded when a queued mutation's baseline `updated_at` no
//! longer matches the server record. It keeps the original mutation and the
//! server snapshot observed at detection time, and is only removed by an
//! explicit resolution.

use super::models::{Conflict, NewConflict, ReferenceType};
use crate::db::{Collection, Database, DbError};
use std::sync::Arc;

#[derive(Clone)]
pub struct ConflictStore {
    db: Arc<Database>,
}

impl ConflictStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Persist a conflict with a fresh id and timestamp
    pub fn record(&self, conflict: NewConflict) -> Result<Conflict, ConflictError> {
        let conflict = conflict.into_conflict();
        self.db.put(Collection::Conflicts, &conflict.id, &conflict)?;

        log::warn!(
            "Recorded {} conflict {} for {}:{}",
            conflict.kind,
            conflict.id,
            conflict
                .reference_type
                .map(|reference_type| reference_type.as_str())
                .unwrap_or("-"),
            conflict
                .reference_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
        Ok(conflict)
    }

    /// All unresolved conflicts, oldest first
    pub fn list(&self) -> Result<Vec<Conflict>, ConflictError> {
        let entries = self.db.get_all(Collection::Conflicts)?;
        let mut conflicts = Vec::with_capacity(entries.len());

        for (key, value) in entries {
            match serde_json::from_value::<Conflict>(value) {
                Ok(conflict) => conflicts.push(conflict),
                // Kept in storage: conflicts are never silently dropped.
                Err(e) => log::error!("Skipping unreadable conflict {}: {}", key, e),
            }
        }

        Ok(conflicts)
    }

    pub fn get(&self, id: &str) -> Result<Option<Conflict>, ConflictError> {
        Ok(self.db.get(Collection::Conflicts, id)?)
    }

    /// Conflicts attached to one order or call
    pub fn list_by_reference(
        &self,
        reference_type: ReferenceType,
        reference_id: i64,
    ) -> Result<Vec<Conflict>, ConflictError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|conflict| {
                conflict.reference_type == Some(reference_type)
                    && conflict.reference_id == Some(reference_id)
            })
            .collect())
    }

    /// Delete a conflict. Returns whether it existed.
    pub fn remove(&self, id: &str) -> Result<bool, ConflictError> {
        Ok(self.db.delete(Collection::Conflicts, id)?)
    }

    pub fn len(&self) -> Result<usize, ConflictError> {
        Ok(self.db.count(Collection::Conflicts)?)
    }

    pub fn is_empty(&self) -> Result<bool, ConflictError> {
        Ok(self.len()? == 0)
    }

    /// Drop every conflict (manual action)
    pub fn clear(&self) -> Result<usize, ConflictError> {
        let deleted = self.db.clear(Collection::Conflicts)?;
        log::info!("Cleared {} conflicts", deleted);
        Ok(deleted)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConflictError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),
}
