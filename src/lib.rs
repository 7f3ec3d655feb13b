//! # SGM Offline
//!
//! Offline-first sync engine for the SGM maintenance app. Field edits to
//! maintenance orders, calls, checklists and material lists are queued
//! locally and replayed against the SGM REST API when the device is online.

pub mod cache;
pub mod db;
pub mod sync;

use db::{Database, DbError};
use std::sync::Arc;
use sync::{
    BackgroundScheduler, ConfigError, ConnectivityEvent, ConnectivityMonitor, DrainReport,
    SchedulerError, SyncApiClient, SyncApiError, SyncConfig, SyncManager,
};

/// Initialize logging from `RUST_LOG` (defaults to `info`).
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

// ============================================================================
// Engine
// ============================================================================

/// Wires storage, API client, coordinator and scheduler together
pub struct SyncEngine {
    config: SyncConfig,
    db: Arc<Database>,
    api: Arc<SyncApiClient>,
    manager: SyncManager,
    scheduler: BackgroundScheduler,
}

impl SyncEngine {
    /// Open the local database and build the engine. Nothing runs until
    /// [`SyncEngine::start`].
    pub fn open(config: SyncConfig) -> Result<Self, EngineError> {
        config.validate()?;

        log::info!("Database path: {:?}", config.database_path);
        let db = Arc::new(Database::new(config.database_path.clone())?);
        log::info!("Database initialized successfully");

        let api = Arc::new(SyncApiClient::from_config(&config)?);
        let connectivity = ConnectivityMonitor::new(config.start_online);
        let manager = SyncManager::new(db.clone(), api.clone(), connectivity);
        let scheduler = BackgroundScheduler::new(db.clone(), manager.clone());

        Ok(Self {
            config,
            db,
            api,
            manager,
            scheduler,
        })
    }

    /// Load published state, run the startup drain and start the scheduler
    pub async fn start(&self) -> Result<DrainReport, EngineError> {
        // Stored settings win; the configured interval only seeds a first run
        let scheduler_config = self
            .scheduler
            .load_or_seed_config(self.config.drain_interval_secs)
            .await?;

        let queued = self.manager.queue_length().await;
        log::info!("Sync engine starting with {} queued mutations", queued);

        let report = self.manager.trigger_drain(false).await;

        if scheduler_config.enabled {
            self.scheduler.start().await?;
        } else {
            log::info!("Periodic drain disabled in settings");
        }

        Ok(report)
    }

    /// Stop the scheduler. Queued mutations stay on disk.
    pub async fn shutdown(&self) {
        match self.scheduler.stop().await {
            Ok(()) | Err(SchedulerError::NotRunning) => {}
            Err(e) => log::warn!("Failed to stop scheduler: {}", e),
        }
        log::info!("Sync engine stopped");
    }

    /// Forward the host's network status
    pub fn set_online(&self, online: bool) -> Option<ConnectivityEvent> {
        self.manager.connectivity().set_online(online)
    }

    pub fn manager(&self) -> &SyncManager {
        &self.manager
    }

    pub fn scheduler(&self) -> &BackgroundScheduler {
        &self.scheduler
    }

    pub fn api(&self) -> &SyncApiClient {
        &self.api
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("API client error: {0}")]
    Api(#[from] SyncApiError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;
    use sync::{EntityUpdate, Mutation, QueueManager};
    use tempfile::TempDir;

    fn config_for(url: String, temp_dir: &TempDir, online: bool) -> SyncConfig {
        SyncConfig {
            api_base_url: url,
            database_path: temp_dir.path().join("sgm-offline.db"),
            drain_interval_secs: 30,
            request_timeout_secs: 5,
            start_online: online,
        }
    }

    #[test]
    fn test_open_rejects_invalid_url() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_for("not a url".into(), &temp_dir, true);

        assert!(matches!(SyncEngine::open(config), Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_drains_backlog_and_runs_scheduler() {
        let temp_dir = TempDir::new().unwrap();
        let mut server = Server::new_async().await;
        let put = server
            .mock("PUT", "/maintenance/42")
            .match_header("authorization", "Bearer field-token")
            .match_body(Matcher::Json(json!({ "status": "done" })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let config = config_for(server.url(), &temp_dir, true);

        // Left over from a previous session
        {
            let db = Arc::new(Database::new(config.database_path.clone()).unwrap());
            QueueManager::new(db)
                .enqueue(Mutation::OrderUpdate(EntityUpdate::new(42, json!({ "status": "done" }))))
                .unwrap();
        }

        let engine = SyncEngine::open(config).unwrap();
        engine.api().set_token("field-token".into()).await;

        let report = engine.start().await.unwrap();
        assert_eq!(report.applied, 1);
        assert!(engine.scheduler().is_running());
        assert_eq!(engine.manager().state().queue_length, 0);

        engine.shutdown().await;
        assert!(!engine.scheduler().is_running());
        put.assert_async().await;
    }

    #[test]
    fn test_open_rejects_interval_above_a_day() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = config_for("http://127.0.0.1:9".into(), &temp_dir, false);
        config.drain_interval_secs = 86_401;

        assert!(matches!(SyncEngine::open(config), Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_stored_scheduler_interval_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_for("http://127.0.0.1:9".into(), &temp_dir, false);

        {
            let engine = SyncEngine::open(config.clone()).unwrap();
            engine.start().await.unwrap();
            assert_eq!(engine.scheduler().get_config().await.interval_secs, 30);

            engine.scheduler().update_config(true, 300).await.unwrap();
            engine.shutdown().await;
        }

        let engine = SyncEngine::open(config).unwrap();
        engine.start().await.unwrap();

        let scheduler_config = engine.scheduler().get_config().await;
        assert_eq!(scheduler_config.interval_secs, 300);
        assert!(engine.scheduler().is_running());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_offline_keeps_queue() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_for("http://127.0.0.1:9".into(), &temp_dir, false);

        let engine = SyncEngine::open(config).unwrap();
        engine
            .manager()
            .enqueue_order_update(EntityUpdate::new(1, json!({})))
            .await
            .unwrap();

        let report = engine.start().await.unwrap();
        assert!(report.skipped);
        assert_eq!(engine.manager().queue_length().await, 1);
        assert!(!engine.manager().state().is_online);

        engine.shutdown().await;
        // Idempotent
        engine.shutdown().await;
    }
}
