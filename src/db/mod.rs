//! Database module for SGM Offline
//!
//! Durable key-value storage backing the sync engine. Every named collection
//! (orders, calls, checklists, materials, sync queue, conflicts) is its own
//! SQLite table of `key -> JSON value` rows. Rows are returned in insertion
//! order (rowid), which the sync queue relies on for FIFO replay.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Latest schema version (stored in `PRAGMA user_version`)
pub const SCHEMA_VERSION: i32 = 2;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Named collections of the offline store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Orders,
    Calls,
    Checklists,
    Materials,
    SyncQueue,
    Conflicts,
}

impl Collection {
    pub const ALL: [Collection; 6] = [
        Collection::Orders,
        Collection::Calls,
        Collection::Checklists,
        Collection::Materials,
        Collection::SyncQueue,
        Collection::Conflicts,
    ];

    /// Backing table name. Only ever interpolated from this closed set.
    pub fn table_name(&self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::Calls => "calls",
            Self::Checklists => "checklists",
            Self::Materials => "materials",
            Self::SyncQueue => "sync_queue",
            Self::Conflicts => "conflicts",
        }
    }
}

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) the database file and bring the schema up to date
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
            conn.execute_batch(
                r#"
                PRAGMA busy_timeout = 5000;
                PRAGMA synchronous = NORMAL;
                PRAGMA temp_store = MEMORY;
            "#,
            )
        });

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(1))
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::run_migrations(&conn)?;
        drop(conn);

        log::info!("Offline database opened at {}", db_path.display());

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every SQLite in-memory connection is a separate database, so the pool
    /// is pinned to a single connection.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder().max_size(1).build(manager)?;

        let conn = pool.get()?;
        Self::run_migrations(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // MIGRATIONS
    // =========================================================================

    /// Additive migrations only: existing collections are never dropped or
    /// rewritten when a newer version adds tables.
    fn run_migrations(conn: &Connection) -> DbResult<()> {
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version < 1 {
            log::info!("Running migration 1: creating entity collections and sync queue");
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS orders (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS calls (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS checklists (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS materials (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS sync_queue (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                PRAGMA user_version = 1;
            "#,
            )?;
        }

        if version < 2 {
            log::info!("Running migration 2: creating conflicts collection");
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS conflicts (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                PRAGMA user_version = 2;
            "#,
            )?;
        }

        Ok(())
    }

    /// Current schema version
    pub fn schema_version(&self) -> DbResult<i32> {
        let conn = self.get_conn()?;
        let version = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(version)
    }

    // =========================================================================
    // COLLECTIONS
    // =========================================================================

    /// Insert or replace a value. Replacing keeps the original insertion slot.
    pub fn put<T: Serialize>(&self, collection: Collection, key: &str, value: &T) -> DbResult<()> {
        let json = serde_json::to_string(value)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        let conn = self.get_conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                collection.table_name()
            ),
            params![key, json, chrono::Utc::now().to_rfc3339()],
        )?;

        Ok(())
    }

    /// Get a value by key
    pub fn get<T: DeserializeOwned>(&self, collection: Collection, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let json: Option<String> = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", collection.table_name()),
                [key],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|json| {
            serde_json::from_str(&json).map_err(|e| DbError::Serialization(e.to_string()))
        })
        .transpose()
    }

    /// Delete a value. Returns whether a row existed.
    pub fn delete(&self, collection: Collection, key: &str) -> DbResult<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            &format!("DELETE FROM {} WHERE key = ?1", collection.table_name()),
            [key],
        )?;
        Ok(affected > 0)
    }

    /// All `(key, value)` pairs in insertion order.
    ///
    /// Values are returned as raw JSON so callers can decide what to do with
    /// rows they cannot decode.
    pub fn get_all(&self, collection: Collection) -> DbResult<Vec<(String, serde_json::Value)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT key, value FROM {} ORDER BY rowid ASC",
            collection.table_name()
        ))?;

        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, json) = row?;
            // Unparseable JSON is surfaced as a string so the row stays visible.
            let value = serde_json::from_str(&json).unwrap_or(serde_json::Value::String(json));
            entries.push((key, value));
        }

        Ok(entries)
    }

    /// Number of rows in a collection
    pub fn count(&self, collection: Collection) -> DbResult<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", collection.table_name()),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    /// Remove every row of a collection
    pub fn clear(&self, collection: Collection) -> DbResult<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute(&format!("DELETE FROM {}", collection.table_name()), [])?;
        Ok(deleted)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = serde_json::to_string(value)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_in_memory_has_all_collections() {
        let db = Database::in_memory().expect("Failed to create database");
        for collection in Collection::ALL {
            assert_eq!(db.count(collection).unwrap(), 0, "{}", collection.table_name());
        }
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_put_get_delete() {
        let db = Database::in_memory().unwrap();

        db.put(Collection::Orders, "42", &json!({"id": 42, "updated_at": "T1"}))
            .unwrap();

        let order: Option<serde_json::Value> = db.get(Collection::Orders, "42").unwrap();
        assert_eq!(order.unwrap()["updated_at"], "T1");

        assert!(db.delete(Collection::Orders, "42").unwrap());
        assert!(!db.delete(Collection::Orders, "42").unwrap());

        let order: Option<serde_json::Value> = db.get(Collection::Orders, "42").unwrap();
        assert!(order.is_none());
    }

    #[test]
    fn test_collections_are_isolated() {
        let db = Database::in_memory().unwrap();
        db.put(Collection::Orders, "1", &json!({"kind": "order"})).unwrap();
        db.put(Collection::Calls, "1", &json!({"kind": "call"})).unwrap();

        let call: serde_json::Value = db.get(Collection::Calls, "1").unwrap().unwrap();
        assert_eq!(call["kind"], "call");
        assert_eq!(db.count(Collection::Orders).unwrap(), 1);
    }

    #[test]
    fn test_get_all_preserves_insertion_order_across_updates() {
        let db = Database::in_memory().unwrap();

        // Keys deliberately out of lexical order
        for key in ["c", "a", "b"] {
            db.put(Collection::SyncQueue, key, &json!({ "key": key })).unwrap();
        }
        // Overwrite keeps the original slot
        db.put(Collection::SyncQueue, "c", &json!({ "key": "c", "v": 2 })).unwrap();

        let keys: Vec<String> = db
            .get_all(Collection::SyncQueue)
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_clear_collection() {
        let db = Database::in_memory().unwrap();
        db.put(Collection::Materials, "maintenance_order:1", &json!([])).unwrap();
        db.put(Collection::Materials, "maintenance_order:2", &json!([])).unwrap();

        assert_eq!(db.clear(Collection::Materials).unwrap(), 2);
        assert_eq!(db.count(Collection::Materials).unwrap(), 0);
    }

    #[test]
    fn test_settings_roundtrip() {
        let db = Database::in_memory().unwrap();
        assert!(db.get_setting::<u64>("missing").unwrap().is_none());

        db.set_setting("drain_interval", &30u64).unwrap();
        assert_eq!(db.get_setting::<u64>("drain_interval").unwrap(), Some(30));
    }

    #[test]
    fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offline.db");

        {
            let db = Database::new(path.clone()).unwrap();
            db.put(Collection::Calls, "7", &json!({"id": 7})).unwrap();
        }

        let db = Database::new(path).unwrap();
        let call: Option<serde_json::Value> = db.get(Collection::Calls, "7").unwrap();
        assert_eq!(call.unwrap()["id"], 7);
    }

    #[test]
    fn test_migration_from_v1_preserves_existing_collections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.db");

        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                r#"
                CREATE TABLE orders (key TEXT PRIMARY KEY, value TEXT NOT NULL, updated_at TEXT NOT NULL);
                CREATE TABLE calls (key TEXT PRIMARY KEY, value TEXT NOT NULL, updated_at TEXT NOT NULL);
                CREATE TABLE checklists (key TEXT PRIMARY KEY, value TEXT NOT NULL, updated_at TEXT NOT NULL);
                CREATE TABLE materials (key TEXT PRIMARY KEY, value TEXT NOT NULL, updated_at TEXT NOT NULL);
                CREATE TABLE sync_queue (key TEXT PRIMARY KEY, value TEXT NOT NULL, updated_at TEXT NOT NULL);
                CREATE TABLE settings (key TEXT PRIMARY KEY, value TEXT NOT NULL);
                INSERT INTO orders (key, value, updated_at) VALUES ('42', '{"id":42}', '2024-01-01T00:00:00Z');
                PRAGMA user_version = 1;
            "#,
            )
            .unwrap();
        }

        let db = Database::new(path).unwrap();
        assert_eq!(db.schema_version().unwrap(), 2);
        assert_eq!(db.count(Collection::Conflicts).unwrap(), 0);

        let order: serde_json::Value = db.get(Collection::Orders, "42").unwrap().unwrap();
        assert_eq!(order["id"], 42);
    }
}
