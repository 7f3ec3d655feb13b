//! Local Mirror - offline copies of server records
//!
//! Orders and calls are mirrored by id so screens can render without the
//! network and so an "accept server" resolution can take effect locally
//! without a round trip. Checklists and material lists are mirrored per
//! `(reference type, reference id)`.

use super::models::ReferenceType;
use crate::cache::{CacheStats, EntityCache};
use crate::db::{Collection, Database, DbError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Mirrored checklist for an order or call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedChecklist {
    pub template_id: i64,
    pub reference_type: ReferenceType,
    pub reference_id: i64,
    pub template: serde_json::Value,
    pub responses: Vec<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

/// Mirrored material list for an order or call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedMaterials {
    pub reference_type: ReferenceType,
    pub reference_id: i64,
    pub materials: Vec<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

fn reference_key(reference_type: ReferenceType, reference_id: i64) -> String {
    format!("{}:{}", reference_type.as_str(), reference_id)
}

fn entity_collection(reference_type: ReferenceType) -> Collection {
    match reference_type {
        ReferenceType::MaintenanceOrder => Collection::Orders,
        ReferenceType::MaintenanceCall => Collection::Calls,
    }
}

#[derive(Clone)]
pub struct LocalMirror {
    db: Arc<Database>,
    cache: EntityCache,
}

impl LocalMirror {
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_cache(db, EntityCache::new())
    }

    pub fn with_cache(db: Arc<Database>, cache: EntityCache) -> Self {
        Self { db, cache }
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    // ========================================================================
    // Orders & calls
    // ========================================================================

    /// Store a server record under its `id` field
    pub async fn cache_entity(
        &self,
        reference_type: ReferenceType,
        record: &serde_json::Value,
    ) -> Result<i64, MirrorError> {
        let id = record
            .get("id")
            .and_then(serde_json::Value::as_i64)
            .ok_or(MirrorError::MissingId(reference_type))?;

        self.db
            .put(entity_collection(reference_type), &id.to_string(), record)?;
        self.cache.insert(reference_type, id, record.clone()).await;

        log::debug!("Mirrored {} {}", reference_type, id);
        Ok(id)
    }

    pub async fn get_cached_entity(
        &self,
        reference_type: ReferenceType,
        id: i64,
    ) -> Result<Option<serde_json::Value>, MirrorError> {
        if let Some(record) = self.cache.get(reference_type, id).await {
            return Ok(Some(record));
        }

        let record: Option<serde_json::Value> =
            self.db.get(entity_collection(reference_type), &id.to_string())?;
        if let Some(record) = &record {
            self.cache.insert(reference_type, id, record.clone()).await;
        }
        Ok(record)
    }

    pub async fn remove_cached_entity(
        &self,
        reference_type: ReferenceType,
        id: i64,
    ) -> Result<(), MirrorError> {
        self.db
            .delete(entity_collection(reference_type), &id.to_string())?;
        self.cache.remove(reference_type, id).await;
        Ok(())
    }

    pub async fn cache_order(&self, order: &serde_json::Value) -> Result<i64, MirrorError> {
        self.cache_entity(ReferenceType::MaintenanceOrder, order).await
    }

    pub async fn get_cached_order(&self, id: i64) -> Result<Option<serde_json::Value>, MirrorError> {
        self.get_cached_entity(ReferenceType::MaintenanceOrder, id).await
    }

    pub async fn remove_cached_order(&self, id: i64) -> Result<(), MirrorError> {
        self.remove_cached_entity(ReferenceType::MaintenanceOrder, id).await
    }

    pub async fn cache_call(&self, call: &serde_json::Value) -> Result<i64, MirrorError> {
        self.cache_entity(ReferenceType::MaintenanceCall, call).await
    }

    pub async fn get_cached_call(&self, id: i64) -> Result<Option<serde_json::Value>, MirrorError> {
        self.get_cached_entity(ReferenceType::MaintenanceCall, id).await
    }

    pub async fn remove_cached_call(&self, id: i64) -> Result<(), MirrorError> {
        self.remove_cached_entity(ReferenceType::MaintenanceCall, id).await
    }

    // ========================================================================
    // Checklists & materials
    // ========================================================================

    pub fn cache_checklist(
        &self,
        reference_type: ReferenceType,
        reference_id: i64,
        template_id: i64,
        template: serde_json::Value,
        responses: Vec<serde_json::Value>,
    ) -> Result<CachedChecklist, MirrorError> {
        let checklist = CachedChecklist {
            template_id,
            reference_type,
            reference_id,
            template,
            responses,
            updated_at: Utc::now(),
        };
        self.db.put(
            Collection::Checklists,
            &reference_key(reference_type, reference_id),
            &checklist,
        )?;
        Ok(checklist)
    }

    pub fn get_cached_checklist(
        &self,
        reference_type: ReferenceType,
        reference_id: i64,
    ) -> Result<Option<CachedChecklist>, MirrorError> {
        Ok(self
            .db
            .get(Collection::Checklists, &reference_key(reference_type, reference_id))?)
    }

    pub fn remove_cached_checklist(
        &self,
        reference_type: ReferenceType,
        reference_id: i64,
    ) -> Result<(), MirrorError> {
        self.db
            .delete(Collection::Checklists, &reference_key(reference_type, reference_id))?;
        Ok(())
    }

    pub fn cache_materials(
        &self,
        reference_type: ReferenceType,
        reference_id: i64,
        materials: Vec<serde_json::Value>,
    ) -> Result<CachedMaterials, MirrorError> {
        let cached = CachedMaterials {
            reference_type,
            reference_id,
            materials,
            updated_at: Utc::now(),
        };
        self.db.put(
            Collection::Materials,
            &reference_key(reference_type, reference_id),
            &cached,
        )?;
        Ok(cached)
    }

    pub fn get_cached_materials(
        &self,
        reference_type: ReferenceType,
        reference_id: i64,
    ) -> Result<Option<CachedMaterials>, MirrorError> {
        Ok(self
            .db
            .get(Collection::Materials, &reference_key(reference_type, reference_id))?)
    }

    pub fn remove_cached_materials(
        &self,
        reference_type: ReferenceType,
        reference_id: i64,
    ) -> Result<(), MirrorError> {
        self.db
            .delete(Collection::Materials, &reference_key(reference_type, reference_id))?;
        Ok(())
    }

    /// Wipe every offline collection, including the queue and conflicts
    /// (e.g. on logout)
    pub async fn clear_all(&self) -> Result<(), MirrorError> {
        for collection in Collection::ALL {
            self.db.clear(collection)?;
        }
        self.cache.clear().await;
        log::info!("Cleared all offline collections");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("{0} record has no numeric id")]
    MissingId(ReferenceType),
}
