//! Durable storage for cached weather.
//!
//! `PersistentStore` is the contract the in-memory cache writes through to;
//! `SqliteStore` is the production implementation. Only `CacheStore` talks to
//! a store, so implementations only need to make each call atomic on its own.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use stormwatch_core::{DatabaseError, RusqliteErrorExt};

use crate::types::{CurrentObservation, ForecastPoint, ForecastSeries, LocationKey, OrderIndex};

pub type StoreResult<T> = Result<T, DatabaseError>;

/// A persisted location with both halves as last written.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub key: LocationKey,
    pub order: OrderIndex,
    pub current: Option<CurrentObservation>,
    pub forecast: Option<ForecastSeries>,
}

pub trait PersistentStore: Send + Sync {
    /// Tracked keys ordered by their index.
    fn all_keys(&self) -> StoreResult<Vec<(LocationKey, OrderIndex)>>;

    fn load_current(&self, key: &LocationKey) -> StoreResult<Option<CurrentObservation>>;

    fn load_forecast(&self, key: &LocationKey) -> StoreResult<Option<ForecastSeries>>;

    /// Reserve the next order index. Never hands out the same value twice.
    fn next_index(&self) -> StoreResult<OrderIndex>;

    /// Upsert the current half, tracking `key` at `order` if it is new.
    fn save_current(
        &self,
        key: &LocationKey,
        order: OrderIndex,
        observation: &CurrentObservation,
    ) -> StoreResult<()>;

    /// Replace every forecast point for `key` in one transaction.
    fn replace_forecast(
        &self,
        key: &LocationKey,
        order: OrderIndex,
        series: &ForecastSeries,
    ) -> StoreResult<()>;

    /// Persist both halves of an entry in one transaction.
    fn save_entry(
        &self,
        key: &LocationKey,
        order: OrderIndex,
        observation: &CurrentObservation,
        series: &ForecastSeries,
    ) -> StoreResult<()>;

    /// Forget `key` entirely. Missing keys are not an error.
    fn delete(&self, key: &LocationKey) -> StoreResult<()>;

    /// Everything needed to rebuild the memory layer, in display order.
    fn load_all(&self) -> StoreResult<Vec<StoredEntry>> {
        self.all_keys()?
            .into_iter()
            .map(|(key, order)| {
                Ok(StoredEntry {
                    current: self.load_current(&key)?,
                    forecast: self.load_forecast(&key)?,
                    key,
                    order,
                })
            })
            .collect()
    }
}

const ORDER_COUNTER: &str = "order_index";

/// SQLite-backed weather store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(RusqliteErrorExt::into_database_error)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory store.
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(RusqliteErrorExt::into_database_error)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        self.conn
            .lock()
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS locations (
                    key TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    order_index INTEGER NOT NULL UNIQUE
                );

                CREATE TABLE IF NOT EXISTS current_weather (
                    key TEXT PRIMARY KEY,
                    temperature REAL NOT NULL,
                    condition_icon TEXT NOT NULL,
                    observed_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS forecasts (
                    key TEXT PRIMARY KEY,
                    observed_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS forecast_points (
                    key TEXT NOT NULL,
                    position INTEGER NOT NULL,
                    timestamp INTEGER NOT NULL,
                    temp_max REAL NOT NULL,
                    temp_min REAL NOT NULL,
                    condition_icon TEXT NOT NULL,
                    wind REAL,
                    rain REAL,
                    snow REAL,
                    PRIMARY KEY (key, position)
                );

                CREATE TABLE IF NOT EXISTS counters (
                    name TEXT PRIMARY KEY,
                    value INTEGER NOT NULL
                );

                INSERT OR IGNORE INTO counters (name, value)
                    SELECT 'order_index', COALESCE(MAX(order_index) + 1, 0) FROM locations;
                "#,
            )
            .map_err(RusqliteErrorExt::into_database_error)
    }

    /// Run `work` in one transaction; any error rolls everything back.
    fn in_transaction<F>(&self, work: F) -> StoreResult<()>
    where
        F: FnOnce(&Transaction<'_>) -> rusqlite::Result<()>,
    {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(RusqliteErrorExt::into_database_error)?;
        work(&tx).map_err(RusqliteErrorExt::into_database_error)?;
        tx.commit().map_err(RusqliteErrorExt::into_database_error)
    }

    fn track(tx: &Transaction<'_>, key: &LocationKey, order: OrderIndex) -> rusqlite::Result<()> {
        tx.execute(
            "INSERT INTO locations (key, name, order_index) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO NOTHING",
            params![key.canonical(), key.as_str(), order.0],
        )?;
        Ok(())
    }

    fn row_to_point(row: &rusqlite::Row) -> rusqlite::Result<ForecastPoint> {
        Ok(ForecastPoint {
            timestamp: from_millis(row.get(0)?),
            temp_max: row.get(1)?,
            temp_min: row.get(2)?,
            condition_icon: row.get(3)?,
            wind: row.get(4)?,
            rain: row.get(5)?,
            snow: row.get(6)?,
        })
    }

    /// Number of tracked locations.
    pub fn count(&self) -> StoreResult<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM locations", [], |row| row.get(0))
            .map_err(RusqliteErrorExt::into_database_error)?;
        Ok(count as usize)
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn write_current(
    tx: &Transaction<'_>,
    key: &LocationKey,
    observation: &CurrentObservation,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO current_weather (key, temperature, condition_icon, observed_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            key.canonical(),
            observation.temperature,
            observation.condition_icon,
            observation.observed_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

/// Delete-then-insert of every point, inside the caller's transaction.
fn write_forecast(
    tx: &Transaction<'_>,
    key: &LocationKey,
    series: &ForecastSeries,
) -> rusqlite::Result<()> {
    tx.execute(
        "DELETE FROM forecast_points WHERE key = ?1",
        params![key.canonical()],
    )?;
    tx.execute(
        "INSERT OR REPLACE INTO forecasts (key, observed_at) VALUES (?1, ?2)",
        params![key.canonical(), series.observed_at.timestamp_millis()],
    )?;

    let mut insert = tx.prepare(
        "INSERT INTO forecast_points
         (key, position, timestamp, temp_max, temp_min, condition_icon, wind, rain, snow)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    for (position, point) in series.items.iter().enumerate() {
        insert.execute(params![
            key.canonical(),
            position as i64,
            point.timestamp.timestamp_millis(),
            point.temp_max,
            point.temp_min,
            point.condition_icon,
            point.wind,
            point.rain,
            point.snow,
        ])?;
    }
    Ok(())
}

impl PersistentStore for SqliteStore {
    fn all_keys(&self) -> StoreResult<Vec<(LocationKey, OrderIndex)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT name, order_index FROM locations ORDER BY order_index ASC")
            .map_err(RusqliteErrorExt::into_database_error)?;

        let rows = stmt
            .query_map([], |row| {
                let name: String = row.get(0)?;
                Ok((LocationKey::new(name), OrderIndex(row.get(1)?)))
            })
            .map_err(RusqliteErrorExt::into_database_error)?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(RusqliteErrorExt::into_database_error)
    }

    fn load_current(&self, key: &LocationKey) -> StoreResult<Option<CurrentObservation>> {
        self.conn
            .lock()
            .query_row(
                "SELECT temperature, condition_icon, observed_at FROM current_weather WHERE key = ?1",
                params![key.canonical()],
                |row| {
                    Ok(CurrentObservation {
                        temperature: row.get(0)?,
                        condition_icon: row.get(1)?,
                        observed_at: from_millis(row.get(2)?),
                    })
                },
            )
            .optional()
            .map_err(RusqliteErrorExt::into_database_error)
    }

    fn load_forecast(&self, key: &LocationKey) -> StoreResult<Option<ForecastSeries>> {
        let conn = self.conn.lock();

        let observed_at: Option<i64> = conn
            .query_row(
                "SELECT observed_at FROM forecasts WHERE key = ?1",
                params![key.canonical()],
                |row| row.get(0),
            )
            .optional()
            .map_err(RusqliteErrorExt::into_database_error)?;

        let Some(observed_at) = observed_at else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare(
                "SELECT timestamp, temp_max, temp_min, condition_icon, wind, rain, snow
                 FROM forecast_points WHERE key = ?1 ORDER BY position ASC",
            )
            .map_err(RusqliteErrorExt::into_database_error)?;

        let items = stmt
            .query_map(params![key.canonical()], Self::row_to_point)
            .map_err(RusqliteErrorExt::into_database_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(RusqliteErrorExt::into_database_error)?;

        Ok(Some(ForecastSeries {
            items,
            observed_at: from_millis(observed_at),
        }))
    }

    fn next_index(&self) -> StoreResult<OrderIndex> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(RusqliteErrorExt::into_database_error)?;

        let value: i64 = tx
            .query_row(
                "SELECT value FROM counters WHERE name = ?1",
                params![ORDER_COUNTER],
                |row| row.get(0),
            )
            .optional()
            .map_err(RusqliteErrorExt::into_database_error)?
            .unwrap_or(0);

        tx.execute(
            "INSERT INTO counters (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            params![ORDER_COUNTER, value + 1],
        )
        .map_err(RusqliteErrorExt::into_database_error)?;

        tx.commit().map_err(RusqliteErrorExt::into_database_error)?;
        Ok(OrderIndex(value))
    }

    fn save_current(
        &self,
        key: &LocationKey,
        order: OrderIndex,
        observation: &CurrentObservation,
    ) -> StoreResult<()> {
        self.in_transaction(|tx| {
            Self::track(tx, key, order)?;
            write_current(tx, key, observation)
        })
    }

    fn replace_forecast(
        &self,
        key: &LocationKey,
        order: OrderIndex,
        series: &ForecastSeries,
    ) -> StoreResult<()> {
        self.in_transaction(|tx| {
            Self::track(tx, key, order)?;
            write_forecast(tx, key, series)
        })
    }

    fn save_entry(
        &self,
        key: &LocationKey,
        order: OrderIndex,
        observation: &CurrentObservation,
        series: &ForecastSeries,
    ) -> StoreResult<()> {
        self.in_transaction(|tx| {
            Self::track(tx, key, order)?;
            write_current(tx, key, observation)?;
            write_forecast(tx, key, series)
        })
    }

    fn delete(&self, key: &LocationKey) -> StoreResult<()> {
        self.in_transaction(|tx| {
            for sql in [
                "DELETE FROM forecast_points WHERE key = ?1",
                "DELETE FROM forecasts WHERE key = ?1",
                "DELETE FROM current_weather WHERE key = ?1",
                "DELETE FROM locations WHERE key = ?1",
            ] {
                tx.execute(sql, params![key.canonical()])?;
            }
            Ok(())
        })
    }
}
