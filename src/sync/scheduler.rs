//! Background Sync Scheduler
//!
//! Drives the sync manager from a Tokio task. A pass runs when:
//! - the periodic timer fires
//! - connectivity comes back
//! - someone calls `SyncManager::request_drain` (new mutation, "apply offline")
//!
//! Going offline only republishes the state.

use super::connectivity::{ConnectivityEvent, ConnectivitySubscription};
use super::manager::SyncManager;
use super::models::{MAX_INTERVAL_SECS, MIN_INTERVAL_SECS};
use crate::db::Database;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const CONFIG_KEY: &str = "scheduler_config";

/// Scheduler configuration stored in settings table
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub last_run: Option<String>, // ISO 8601 timestamp
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            last_run: None,
        }
    }
}

/// Background scheduler for automatic drain passes
#[derive(Clone)]
pub struct BackgroundScheduler {
    db: Arc<Database>,
    manager: SyncManager,
    config: Arc<RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

fn validate_interval(interval_secs: u64) -> Result<(), SchedulerError> {
    if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&interval_secs) {
        return Err(SchedulerError::InvalidInterval(format!(
            "Interval must be {}-{} seconds, got {}",
            MIN_INTERVAL_SECS, MAX_INTERVAL_SECS, interval_secs
        )));
    }
    Ok(())
}

impl BackgroundScheduler {
    pub fn new(db: Arc<Database>, manager: SyncManager) -> Self {
        Self {
            db,
            manager,
            config: Arc::new(RwLock::new(SchedulerConfig::default())),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Load configuration from database settings table.
    ///
    /// Returns `false` (and keeps the defaults) when nothing is stored yet.
    pub async fn load_config(&self) -> Result<bool, SchedulerError> {
        let stored: Option<SchedulerConfig> = self
            .db
            .get_setting(CONFIG_KEY)
            .map_err(|e| SchedulerError::Database(e.to_string()))?;

        let found = stored.is_some();
        *self.config.write().await = stored.unwrap_or_default();
        Ok(found)
    }

    /// Load the stored configuration, or store a fresh one with the given
    /// interval on first run. The resulting interval is validated.
    pub async fn load_or_seed_config(&self, seed_interval_secs: u64) -> Result<SchedulerConfig, SchedulerError> {
        if !self.load_config().await? {
            validate_interval(seed_interval_secs)?;
            self.config.write().await.interval_secs = seed_interval_secs;
            self.save_config().await?;
            log::info!("Seeded scheduler config (interval: {} seconds)", seed_interval_secs);
        }

        let config = self.get_config().await;
        validate_interval(config.interval_secs)?;
        Ok(config)
    }

    /// Save configuration to database settings table
    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        self.db
            .set_setting(CONFIG_KEY, &config)
            .map_err(|e| SchedulerError::Database(e.to_string()))?;
        Ok(())
    }

    /// Start background scheduler task
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let interval_secs = self.config.read().await.interval_secs;
        validate_interval(interval_secs)?;

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }

        // Subscribe before spawning so no edge is missed
        let connectivity = self.manager.connectivity().subscribe();
        let handle = tokio::spawn(Self::scheduler_loop(
            self.running.clone(),
            connectivity,
            self.db.clone(),
            self.config.clone(),
            self.manager.clone(),
        ));

        *lock_handle(&self.task_handle) = Some(handle);

        log::info!("Background scheduler started (interval: {} seconds)", interval_secs);
        Ok(())
    }

    /// Stop background scheduler task
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(SchedulerError::NotRunning);
        }

        let handle = lock_handle(&self.task_handle).take();
        if let Some(handle) = handle {
            handle.abort();
            // Wait for the task to unwind so an interrupted pass has released
            // its syncing flag before the state is republished
            let _ = handle.await;
            self.manager.publish();
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Update configuration and restart scheduler if needed
    pub async fn update_config(&self, enabled: bool, interval_secs: u64) -> Result<(), SchedulerError> {
        validate_interval(interval_secs)?;

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_secs = interval_secs;
        }
        self.save_config().await?;

        if self.is_running() {
            // Ignore error if not running (race condition)
            let _ = self.stop().await;
        }
        if enabled {
            self.start().await?;
        }

        log::info!(
            "Scheduler config updated: enabled={}, interval={} seconds",
            enabled,
            interval_secs
        );
        Ok(())
    }

    /// Background scheduler loop (runs in spawned task)
    async fn scheduler_loop(
        running: Arc<AtomicBool>,
        mut connectivity: ConnectivitySubscription,
        db: Arc<Database>,
        config: Arc<RwLock<SchedulerConfig>>,
        manager: SyncManager,
    ) {
        let period = Duration::from_secs(config.read().await.interval_secs);
        // Startup drain is the caller's job, so skip the immediate first tick
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::info!("Scheduler loop started (interval: {:?})", period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !running.load(Ordering::Acquire) {
                        break;
                    }
                    log::debug!("Periodic drain triggered by scheduler");
                    let report = manager.trigger_drain(false).await;
                    if !report.skipped {
                        Self::record_last_run(&db, &config).await;
                    }
                }
                event = connectivity.next_event() => {
                    let Some(event) = event else {
                        log::warn!("Connectivity monitor dropped, stopping scheduler loop");
                        break;
                    };
                    if event == ConnectivityEvent::BecameOnline {
                        log::info!("Back online, draining sync queue");
                    }
                    manager.handle_connectivity_event(event).await;
                }
                _ = manager.drain_requested() => {
                    manager.trigger_drain(false).await;
                }
            }

            if !running.load(Ordering::Acquire) {
                break;
            }
        }

        log::info!("Scheduler loop exited");
    }

    async fn record_last_run(db: &Database, config: &RwLock<SchedulerConfig>) {
        let mut cfg = config.write().await;
        cfg.last_run = Some(Utc::now().to_rfc3339());

        if let Err(e) = db.set_setting(CONFIG_KEY, &*cfg) {
            log::error!("Failed to save last_run timestamp: {}", e);
        }
    }
}

fn lock_handle(
    handle: &StdMutex<Option<JoinHandle<()>>>,
) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
    handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Tests
// ============================================================================
