//! SQLite persistence for the event store
//!
//! The database layer uses separate connection pools:
//! - Writer pool: single connection, SQLite serializes writes anyway
//! - Reader pool: multiple connections for loads and lookups
//! - Metadata pool: counters and housekeeping
//!
//! The in-memory [`crate::EventStore`] is authoritative while running; this
//! layer makes its contents survive restarts.

use crate::error::{RelayError, Result};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Transaction, params};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use vine_nostr::Event;

/// Environment variable naming the relay database file.
pub const DB_PATH_ENV: &str = "VINE_RELAY_DB_PATH";

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    pub path: PathBuf,
    /// Maximum number of reader connections
    pub max_reader_connections: u32,
    /// Maximum number of metadata connections
    pub max_metadata_connections: u32,
}

impl DatabaseConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Configuration from `VINE_RELAY_DB_PATH`, if set.
    pub fn from_env() -> Option<Self> {
        std::env::var(DB_PATH_ENV)
            .ok()
            .filter(|p| !p.is_empty())
            .map(Self::at)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("vine-relay.db"),
            max_reader_connections: 4,
            max_metadata_connections: 2,
        }
    }
}

/// Writer, reader and metadata pools over one database file
pub struct ConnectionPool {
    writer: Pool<SqliteConnectionManager>,
    reader: Pool<SqliteConnectionManager>,
    metadata: Pool<SqliteConnectionManager>,
}

impl ConnectionPool {
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        let manager = || {
            SqliteConnectionManager::file(&config.path).with_init(|conn| {
                conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            })
        };

        let writer = Pool::builder().max_size(1).build(manager())?;
        let reader = Pool::builder()
            .max_size(config.max_reader_connections)
            .build(manager())?;
        let metadata = Pool::builder()
            .max_size(config.max_metadata_connections)
            .build(manager())?;

        Ok(Self {
            writer,
            reader,
            metadata,
        })
    }

    pub fn writer(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.writer.get().map_err(RelayError::Pool)
    }

    pub fn reader(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.reader.get().map_err(RelayError::Pool)
    }

    pub fn metadata(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.metadata.get().map_err(RelayError::Pool)
    }
}

/// Main database interface
pub struct Database {
    pool: ConnectionPool,
    path: PathBuf,
}

impl Database {
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        let pool = ConnectionPool::new(&config)?;

        let conn = pool.writer()?;
        Self::init_schema(&conn)?;
        drop(conn);

        info!("Database initialized at {:?}", config.path);

        Ok(Self {
            pool,
            path: config.path,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                pubkey TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                kind INTEGER NOT NULL,
                raw_event TEXT NOT NULL,
                first_seen INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_pubkey_kind ON events(pubkey, kind);
            CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);

            CREATE TABLE IF NOT EXISTS deleted_events (
                id TEXT PRIMARY KEY,
                deleted_at INTEGER NOT NULL
            );",
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Store an event.
    pub fn store_event(&self, event: &Event) -> Result<()> {
        self.replace_event(event, None)
    }

    /// Store `event`, removing `previous` in the same transaction.
    pub fn replace_event(&self, event: &Event, previous: Option<&str>) -> Result<()> {
        let mut conn = self.pool.writer()?;
        let tx = conn.transaction()?;

        if let Some(previous) = previous {
            tx.execute("DELETE FROM events WHERE id = ?1", params![previous])?;
        }
        insert_event(&tx, event)?;

        tx.commit()?;
        debug!("Stored event {}", event.id);
        Ok(())
    }

    /// Delete an event and remember its id so it is never re-accepted.
    pub fn delete_event(&self, event_id: &str) -> Result<bool> {
        let mut conn = self.pool.writer()?;
        let tx = conn.transaction()?;

        let rows = tx.execute("DELETE FROM events WHERE id = ?1", params![event_id])?;
        tx.execute(
            "INSERT OR IGNORE INTO deleted_events (id, deleted_at) VALUES (?1, ?2)",
            params![event_id, unix_now()],
        )?;

        tx.commit()?;
        Ok(rows > 0)
    }

    /// Every stored event, oldest first.
    pub fn load_events(&self) -> Result<Vec<Event>> {
        let conn = self.pool.reader()?;
        let mut stmt = conn.prepare("SELECT raw_event FROM events ORDER BY created_at ASC, id ASC")?;

        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut events = Vec::new();
        for row in rows {
            events.push(serde_json::from_str(&row?)?);
        }
        Ok(events)
    }

    pub fn load_tombstones(&self) -> Result<Vec<String>> {
        let conn = self.pool.reader()?;
        let mut stmt = conn.prepare("SELECT id FROM deleted_events")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Rows in the events table.
    pub fn count_events(&self) -> Result<i64> {
        let conn = self.pool.metadata()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn insert_event(tx: &Transaction<'_>, event: &Event) -> Result<()> {
    let raw_event = serde_json::to_string(event)?;

    tx.execute(
        "INSERT OR REPLACE INTO events (id, pubkey, created_at, kind, raw_event, first_seen)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            &event.id,
            &event.pubkey,
            event.created_at as i64,
            event.kind,
            raw_event,
            unix_now(),
        ],
    )?;
    Ok(())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
