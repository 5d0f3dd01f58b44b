//! Dangerous-weather alert state: who is subscribed, and what they were
//! last told.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use stormwatch_core::{DatabaseError, RusqliteErrorExt};

use crate::store::StoreResult;
use crate::types::LocationKey;

/// SQLite store for alert subscriptions and dedup state.
///
/// Kept apart from the weather cache: subscriptions outlive cache eviction
/// and are never touched by refreshes.
pub struct AlertStore {
    conn: Mutex<Connection>,
}

impl AlertStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(RusqliteErrorExt::into_database_error)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(RusqliteErrorExt::into_database_error)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS alert_subscriptions (
                key TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS notification_dedup (
                key TEXT PRIMARY KEY,
                last_message TEXT NOT NULL
            );
            "#,
        )
        .map_err(RusqliteErrorExt::into_database_error)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn set_enabled(&self, key: &LocationKey, enabled: bool) -> StoreResult<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO alert_subscriptions (key, name, enabled) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET enabled = excluded.enabled",
                params![key.canonical(), key.as_str(), enabled],
            )
            .map_err(RusqliteErrorExt::into_database_error)?;
        Ok(())
    }

    pub fn is_enabled(&self, key: &LocationKey) -> StoreResult<bool> {
        let enabled: Option<bool> = self
            .conn
            .lock()
            .query_row(
                "SELECT enabled FROM alert_subscriptions WHERE key = ?1",
                params![key.canonical()],
                |row| row.get(0),
            )
            .optional()
            .map_err(RusqliteErrorExt::into_database_error)?;
        Ok(enabled.unwrap_or(false))
    }

    /// Keys with alerts switched on.
    pub fn enabled_keys(&self) -> StoreResult<Vec<LocationKey>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT name FROM alert_subscriptions WHERE enabled = 1 ORDER BY name")
            .map_err(RusqliteErrorExt::into_database_error)?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(RusqliteErrorExt::into_database_error)?;

        rows.map(|name| name.map(LocationKey::new))
            .collect::<Result<Vec<_>, _>>()
            .map_err(RusqliteErrorExt::into_database_error)
    }

    pub fn load_dedup(&self) -> StoreResult<HashMap<LocationKey, String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT key, last_message FROM notification_dedup")
            .map_err(RusqliteErrorExt::into_database_error)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((LocationKey::new(row.get::<_, String>(0)?), row.get(1)?))
            })
            .map_err(RusqliteErrorExt::into_database_error)?;

        rows.collect::<Result<HashMap<_, _>, _>>()
            .map_err(RusqliteErrorExt::into_database_error)
    }

    pub fn save_dedup(&self, key: &LocationKey, message: &str) -> StoreResult<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO notification_dedup (key, last_message) VALUES (?1, ?2)",
                params![key.canonical(), message],
            )
            .map_err(RusqliteErrorExt::into_database_error)?;
        Ok(())
    }

    pub fn clear_dedup(&self, key: &LocationKey) -> StoreResult<()> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM notification_dedup WHERE key = ?1",
                params![key.canonical()],
            )
            .map_err(RusqliteErrorExt::into_database_error)?;
        Ok(())
    }
}

/// Last delivered alert message per location.
///
/// A message is delivered only when it differs from the previous one, so a
/// forecast that keeps predicting the same danger notifies once.
pub struct NotificationDedup {
    last: Mutex<HashMap<LocationKey, String>>,
    store: Arc<AlertStore>,
}

impl NotificationDedup {
    /// Load persisted state from `store`.
    pub fn load(store: Arc<AlertStore>) -> StoreResult<Self> {
        let last = store.load_dedup()?;
        tracing::debug!("Loaded dedup state for {} locations", last.len());
        Ok(Self {
            last: Mutex::new(last),
            store,
        })
    }

    pub fn should_notify(&self, key: &LocationKey, message: &str) -> bool {
        self.last.lock().get(key).map(String::as_str) != Some(message)
    }

    /// Remember `message` as delivered. Call after the sink accepted it.
    pub fn record(&self, key: &LocationKey, message: &str) -> StoreResult<()> {
        self.store.save_dedup(key, message)?;
        self.last.lock().insert(key.clone(), message.to_string());
        Ok(())
    }

    pub fn last_delivered(&self, key: &LocationKey) -> Option<String> {
        self.last.lock().get(key).cloned()
    }

    /// Forget what was delivered for `key`.
    pub fn reset(&self, key: &LocationKey) -> StoreResult<()> {
        self.store.clear_dedup(key)?;
        self.last.lock().remove(key);
        Ok(())
    }

    /// Unsubscribe `key` and drop its history, so a later subscription
    /// starts clean.
    pub fn forget(&self, key: &LocationKey) -> StoreResult<()> {
        self.store.set_enabled(key, false)?;
        self.reset(key)
    }
}
