//! Sync Data Models
//!
//! Defines the data structures shared by the queue, conflict store and
//! coordinator:
//! - SyncConfig: engine settings (API location, database path, timers)
//! - Mutation: one pending change, a typed payload per mutation kind
//! - Conflict: a mutation whose baseline no longer matches the server
//! - SyncState: the observable summary published to subscribers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================================================
// Sync Configuration
// ============================================================================

const DEFAULT_API_BASE_URL: &str = "http://localhost:3001/api";
const DEFAULT_DRAIN_INTERVAL_SECS: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Bounds for the periodic drain interval
pub const MIN_INTERVAL_SECS: u64 = 1;
pub const MAX_INTERVAL_SECS: u64 = 86_400;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the remote REST API (e.g. `https://sgm.example.com/api`)
    pub api_base_url: String,

    /// SQLite file holding the offline collections
    pub database_path: PathBuf,

    /// Periodic drain interval in seconds
    pub drain_interval_secs: u64,

    /// HTTP request timeout in seconds
    pub request_timeout_secs: u64,

    /// Initial connectivity assumption until the host reports otherwise
    pub start_online: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            database_path: default_database_path(),
            drain_interval_secs: DEFAULT_DRAIN_INTERVAL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            start_online: true,
        }
    }
}

impl SyncConfig {
    /// Build configuration from environment variables (and `.env`, if any)
    ///
    /// - `SGM_API_URL`
    /// - `SGM_DB_PATH`
    /// - `SGM_DRAIN_INTERVAL_SECS`
    /// - `SGM_REQUEST_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Ok(url) = std::env::var("SGM_API_URL") {
            config.api_base_url = url;
        }
        if let Ok(path) = std::env::var("SGM_DB_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(secs) = parse_env_u64("SGM_DRAIN_INTERVAL_SECS")? {
            config.drain_interval_secs = secs;
        }
        if let Some(secs) = parse_env_u64("SGM_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.api_base_url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", self.api_base_url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }
        if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&self.drain_interval_secs) {
            return Err(ConfigError::InvalidValue {
                name: "drain_interval_secs",
                value: self.drain_interval_secs.to_string(),
            });
        }
        Ok(())
    }
}

fn parse_env_u64(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        Err(_) => Ok(None),
    }
}

/// Platform data directory, falling back to the working directory
fn default_database_path() -> PathBuf {
    directories::ProjectDirs::from("com", "sgm", "sgm-offline")
        .map(|dirs| dirs.data_dir().join("sgm-offline.db"))
        .unwrap_or_else(|| PathBuf::from("sgm-offline.db"))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid API URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

// ============================================================================
// Domain references
// ============================================================================

/// Remote entity kinds that mutations can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    MaintenanceOrder,
    MaintenanceCall,
}

impl ReferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaintenanceOrder => "maintenance_order",
            Self::MaintenanceCall => "maintenance_call",
        }
    }

    /// REST path of a single record
    pub fn record_path(&self, id: i64) -> String {
        match self {
            Self::MaintenanceOrder => format!("/maintenance/{}", id),
            Self::MaintenanceCall => format!("/calls/{}", id),
        }
    }
}

impl std::fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP verb used to apply an update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Put,
    Post,
}

// ============================================================================
// Mutations
// ============================================================================

/// Closed set of mutation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
    OrderUpdate,
    CallUpdate,
    ChecklistResponse,
    MaterialsUpdate,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrderUpdate => "order-update",
            Self::CallUpdate => "call-update",
            Self::ChecklistResponse => "checklist-response",
            Self::MaterialsUpdate => "materials-update",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "order-update" => Some(Self::OrderUpdate),
            "call-update" => Some(Self::CallUpdate),
            "checklist-response" => Some(Self::ChecklistResponse),
            "materials-update" => Some(Self::MaterialsUpdate),
            _ => None,
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partial update of a work order or service call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityUpdate {
    #[serde(alias = "orderId", alias = "callId")]
    pub reference_id: i64,

    /// Update body sent to the server
    pub data: serde_json::Value,

    /// Path override (defaults to the record path)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub method: HttpMethod,

    /// Server `updated_at` the edit was based on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_updated_at: Option<String>,

    /// Skip conflict detection
    #[serde(default)]
    pub force: bool,
}

impl EntityUpdate {
    pub fn new(reference_id: i64, data: serde_json::Value) -> Self {
        Self {
            reference_id,
            data,
            endpoint: None,
            method: HttpMethod::Put,
            baseline_updated_at: None,
            force: false,
        }
    }

    pub fn with_baseline(mut self, baseline: impl Into<String>) -> Self {
        self.baseline_updated_at = Some(baseline.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>, method: HttpMethod) -> Self {
        self.endpoint = Some(endpoint.into());
        self.method = method;
        self
    }
}

/// Checklist submission. Append-only on the server, never conflicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistResponse {
    pub template_id: i64,

    #[serde(alias = "responseBody")]
    pub body: serde_json::Value,
}

/// Material usage attached to an order or a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialsUpdate {
    pub reference_type: ReferenceType,
    pub reference_id: i64,
    pub data: serde_json::Value,

    /// Path override; when set the update is POSTed there
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_updated_at: Option<String>,

    #[serde(default)]
    pub force: bool,
}

/// A pending change, tagged by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Mutation {
    OrderUpdate(EntityUpdate),
    CallUpdate(EntityUpdate),
    ChecklistResponse(ChecklistResponse),
    MaterialsUpdate(MaterialsUpdate),
}

/// Remote call that applies a mutation
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: HttpMethod,
    pub path: String,
    pub body: serde_json::Value,
}

/// Optimistic-concurrency check to run before applying
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCheck {
    pub reference_type: ReferenceType,
    pub reference_id: i64,
    pub baseline_updated_at: String,
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            Self::OrderUpdate(_) => MutationKind::OrderUpdate,
            Self::CallUpdate(_) => MutationKind::CallUpdate,
            Self::ChecklistResponse(_) => MutationKind::ChecklistResponse,
            Self::MaterialsUpdate(_) => MutationKind::MaterialsUpdate,
        }
    }

    /// Entity the mutation targets (checklists have none)
    pub fn reference(&self) -> Option<(ReferenceType, i64)> {
        match self {
            Self::OrderUpdate(update) => Some((ReferenceType::MaintenanceOrder, update.reference_id)),
            Self::CallUpdate(update) => Some((ReferenceType::MaintenanceCall, update.reference_id)),
            Self::ChecklistResponse(_) => None,
            Self::MaterialsUpdate(update) => Some((update.reference_type, update.reference_id)),
        }
    }

    pub fn baseline_updated_at(&self) -> Option<&str> {
        match self {
            Self::OrderUpdate(update) | Self::CallUpdate(update) => {
                update.baseline_updated_at.as_deref()
            }
            Self::ChecklistResponse(_) => None,
            Self::MaterialsUpdate(update) => update.baseline_updated_at.as_deref(),
        }
    }

    pub fn is_forced(&self) -> bool {
        match self {
            Self::OrderUpdate(update) | Self::CallUpdate(update) => update.force,
            Self::ChecklistResponse(_) => false,
            Self::MaterialsUpdate(update) => update.force,
        }
    }

    /// Same mutation with conflict detection disabled
    pub fn forced(mut self) -> Self {
        match &mut self {
            Self::OrderUpdate(update) | Self::CallUpdate(update) => update.force = true,
            Self::ChecklistResponse(_) => {}
            Self::MaterialsUpdate(update) => update.force = true,
        }
        self
    }

    /// The check to perform before applying, if any.
    ///
    /// `None` when forced, when no baseline was captured, or for kinds
    /// without conflict detection.
    pub fn version_check(&self) -> Option<VersionCheck> {
        if self.is_forced() {
            return None;
        }
        let (reference_type, reference_id) = self.reference()?;
        let baseline = self.baseline_updated_at()?;
        if baseline.is_empty() {
            return None;
        }
        Some(VersionCheck {
            reference_type,
            reference_id,
            baseline_updated_at: baseline.to_string(),
        })
    }

    /// Request that applies this mutation remotely
    pub fn remote_request(&self) -> RemoteRequest {
        match self {
            Self::OrderUpdate(update) => entity_request(ReferenceType::MaintenanceOrder, update),
            Self::CallUpdate(update) => entity_request(ReferenceType::MaintenanceCall, update),
            Self::ChecklistResponse(response) => RemoteRequest {
                method: HttpMethod::Post,
                path: format!("/checklists/{}/responses", response.template_id),
                body: response.body.clone(),
            },
            Self::MaterialsUpdate(update) => match &update.endpoint {
                Some(endpoint) => RemoteRequest {
                    method: HttpMethod::Post,
                    path: endpoint.clone(),
                    body: update.data.clone(),
                },
                None => RemoteRequest {
                    method: HttpMethod::Put,
                    path: update.reference_type.record_path(update.reference_id),
                    body: update.data.clone(),
                },
            },
        }
    }
}

fn entity_request(reference_type: ReferenceType, update: &EntityUpdate) -> RemoteRequest {
    RemoteRequest {
        method: update.method,
        path: update
            .endpoint
            .clone()
            .unwrap_or_else(|| reference_type.record_path(update.reference_id)),
        body: update.data.clone(),
    }
}

// ============================================================================
// Queue items & conflicts
// ============================================================================

/// A mutation waiting in the durable queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub mutation: Mutation,
    pub created_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new(mutation: Mutation) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mutation,
            created_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> MutationKind {
        self.mutation.kind()
    }
}

/// Divergence between a queued mutation's baseline and the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: MutationKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_type: Option<ReferenceType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<i64>,

    /// The original mutation, as it was queued
    pub mutation: Mutation,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_updated_at: Option<String>,

    /// Server record observed when the conflict was detected
    pub server_data: serde_json::Value,

    pub created_at: DateTime<Utc>,
}

/// Conflict details before the store assigns id and timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct NewConflict {
    pub mutation: Mutation,
    pub baseline_updated_at: Option<String>,
    pub server_data: serde_json::Value,
}

impl NewConflict {
    pub fn into_conflict(self) -> Conflict {
        let reference = self.mutation.reference();
        Conflict {
            id: uuid::Uuid::new_v4().to_string(),
            kind: self.mutation.kind(),
            reference_type: reference.map(|(reference_type, _)| reference_type),
            reference_id: reference.map(|(_, id)| id),
            mutation: self.mutation,
            baseline_updated_at: self.baseline_updated_at,
            server_data: self.server_data,
            created_at: Utc::now(),
        }
    }
}

/// How a caller chose to resolve a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictResolution {
    /// Re-queue the offline edit with conflict detection disabled
    ApplyOffline,
    /// Keep the server record and discard the offline edit
    AcceptServer,
}

// ============================================================================
// Observable state
// ============================================================================

/// Summary published to subscribers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub is_syncing: bool,
    pub queue_length: usize,
    pub conflict_count: usize,
    pub is_online: bool,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mutation_wire_format() {
        let mutation = Mutation::OrderUpdate(
            EntityUpdate::new(42, json!({"status": "done"})).with_baseline("T1"),
        );

        let value = serde_json::to_value(&mutation).unwrap();
        assert_eq!(value["type"], "order-update");
        assert_eq!(value["payload"]["referenceId"], 42);
        assert_eq!(value["payload"]["method"], "PUT");
        assert_eq!(value["payload"]["baselineUpdatedAt"], "T1");
    }

    #[test]
    fn test_legacy_field_names_accepted() {
        let mutation: Mutation = serde_json::from_value(json!({
            "type": "call-update",
            "payload": { "callId": 7, "data": {"x": 1}, "baselineUpdatedAt": "T0" }
        }))
        .unwrap();

        assert_eq!(mutation.reference(), Some((ReferenceType::MaintenanceCall, 7)));
        assert!(!mutation.is_forced());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result: Result<Mutation, _> = serde_json::from_value(json!({
            "type": "photo-upload",
            "payload": {}
        }));
        assert!(result.is_err());
        assert_eq!(MutationKind::parse("photo-upload"), None);
        assert_eq!(MutationKind::parse("materials-update"), Some(MutationKind::MaterialsUpdate));
    }

    #[test]
    fn test_version_check_skipped_when_forced_or_without_baseline() {
        let with_baseline =
            Mutation::OrderUpdate(EntityUpdate::new(1, json!({})).with_baseline("T1"));
        assert_eq!(
            with_baseline.version_check(),
            Some(VersionCheck {
                reference_type: ReferenceType::MaintenanceOrder,
                reference_id: 1,
                baseline_updated_at: "T1".into(),
            })
        );

        assert!(with_baseline.clone().forced().version_check().is_none());

        let no_baseline = Mutation::CallUpdate(EntityUpdate::new(1, json!({})));
        assert!(no_baseline.version_check().is_none());

        let checklist = Mutation::ChecklistResponse(ChecklistResponse {
            template_id: 3,
            body: json!({}),
        });
        assert!(checklist.version_check().is_none());
    }

    #[test]
    fn test_remote_request_paths() {
        let order = Mutation::OrderUpdate(EntityUpdate::new(42, json!({"a": 1})));
        let request = order.remote_request();
        assert_eq!(request.method, HttpMethod::Put);
        assert_eq!(request.path, "/maintenance/42");

        let call = Mutation::CallUpdate(
            EntityUpdate::new(9, json!({})).with_endpoint("/calls/9/close", HttpMethod::Post),
        );
        let request = call.remote_request();
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.path, "/calls/9/close");

        let checklist = Mutation::ChecklistResponse(ChecklistResponse {
            template_id: 5,
            body: json!({"answers": []}),
        });
        assert_eq!(checklist.remote_request().path, "/checklists/5/responses");
        assert_eq!(checklist.remote_request().method, HttpMethod::Post);

        let materials = MaterialsUpdate {
            reference_type: ReferenceType::MaintenanceCall,
            reference_id: 11,
            data: json!({"materials": []}),
            endpoint: None,
            baseline_updated_at: None,
            force: false,
        };
        let request = Mutation::MaterialsUpdate(materials.clone()).remote_request();
        assert_eq!((request.method, request.path.as_str()), (HttpMethod::Put, "/calls/11"));

        let request = Mutation::MaterialsUpdate(MaterialsUpdate {
            endpoint: Some("/calls/11/materials".into()),
            ..materials
        })
        .remote_request();
        assert_eq!(
            (request.method, request.path.as_str()),
            (HttpMethod::Post, "/calls/11/materials")
        );
    }

    #[test]
    fn test_new_conflict_derives_reference() {
        let conflict = NewConflict {
            mutation: Mutation::OrderUpdate(EntityUpdate::new(42, json!({})).with_baseline("T1")),
            baseline_updated_at: Some("T1".into()),
            server_data: json!({"id": 42, "updated_at": "T2"}),
        }
        .into_conflict();

        assert_eq!(conflict.kind, MutationKind::OrderUpdate);
        assert_eq!(conflict.reference_type, Some(ReferenceType::MaintenanceOrder));
        assert_eq!(conflict.reference_id, Some(42));
        assert!(!conflict.id.is_empty());
    }

    #[test]
    fn test_sync_state_serializes_camel_case() {
        let state = SyncState {
            is_syncing: true,
            queue_length: 2,
            conflict_count: 1,
            is_online: false,
        };
        let value = serde_json::to_value(state).unwrap();
        assert_eq!(value["isSyncing"], true);
        assert_eq!(value["queueLength"], 2);
        assert_eq!(value["conflictCount"], 1);
        assert_eq!(value["isOnline"], false);
    }

    #[test]
    fn test_config_validation() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.drain_interval_secs, 30);

        let bad_url = SyncConfig {
            api_base_url: "not a url".into(),
            ..SyncConfig::default()
        };
        assert!(matches!(bad_url.validate(), Err(ConfigError::InvalidUrl(_))));

        let bad_interval = SyncConfig {
            drain_interval_secs: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(
            bad_interval.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));

        let too_long = SyncConfig {
            drain_interval_secs: MAX_INTERVAL_SECS + 1,
            ..SyncConfig::default()
        };
        assert!(matches!(
            too_long.validate(),
            Err(ConfigError::InvalidValue { name: "drain_interval_secs", .. })
        ));

        let longest = SyncConfig {
            drain_interval_secs: MAX_INTERVAL_SECS,
            ..SyncConfig::default()
        };
        assert!(longest.validate().is_ok());
    }
}
