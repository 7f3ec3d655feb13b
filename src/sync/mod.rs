//! Sync Module - Offline-first replay of field edits
//!
//! Edits made while a technician is offline are queued durably and replayed
//! against the REST API once connectivity returns:
//! - Maintenance order and call updates
//! - Checklist responses
//! - Material lists
//!
//! Architecture:
//! - Durable FIFO queue, drained by one pass at a time
//! - Optimistic concurrency on the server's `updated_at` stamp
//! - Conflicts are parked until the user picks a resolution

pub mod models;
pub mod queue;
pub mod conflicts;
pub mod mirror;
pub mod api;
pub mod connectivity;
pub mod manager;
pub mod scheduler;


// Re-export commonly used types
pub use models::{
    SyncConfig, ConfigError,
    ReferenceType, HttpMethod, MutationKind,
    EntityUpdate, ChecklistResponse, MaterialsUpdate, Mutation,
    RemoteRequest, VersionCheck,
    QueueItem, Conflict, NewConflict, ConflictResolution,
    SyncState,
};

pub use queue::{QueueManager, QueueError};
pub use conflicts::{ConflictStore, ConflictError};
pub use mirror::{LocalMirror, CachedChecklist, CachedMaterials, MirrorError};
pub use api::{RemoteAuthority, SyncApiClient, SyncApiError};
pub use connectivity::{ConnectivityMonitor, ConnectivityEvent, ConnectivitySubscription};
pub use manager::{SyncManager, SyncManagerError, DrainReport, Subscription};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError};
