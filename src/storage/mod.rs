//! SQLite storage layer for incidents, memberships, users and chat.
//!
//! Incidents are stored as a row plus child tables (memberships, reports,
//! report acceptances) and reassembled into [`Incident`](crate::model::Incident)
//! documents on read. Every multi-row mutation runs inside a single
//! transaction so readers never observe half of an update.
//!
//! Most operations exist twice: a method on [`Storage`] that opens its own
//! transaction, and a free function over `&mut SqliteConnection` so the
//! assignment engine can compose several steps in one transaction.
//!
//! SQLite allows one writer at a time and a deferred transaction that reads
//! before it writes cannot wait for the write lock. Every write therefore goes
//! through [`Storage::begin`], which holds a process-wide writer lock for the
//! life of the transaction. File databases run in WAL mode so readers are
//! never blocked by that writer.

use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, SqliteConnection, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::Config;
use crate::error::{AppError, AppResult};

pub mod chat;
pub mod history;
pub mod incidents;
pub mod members;
pub mod users;

pub use members::Membership;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

/// A write transaction holding the store's writer lock.
///
/// Dereferences to the underlying connection so the free functions of the
/// storage modules can run inside it. Dropping it without [`commit`](Self::commit)
/// rolls back.
pub struct WriteTransaction {
    tx: Transaction<'static, Sqlite>,
    _writer: OwnedMutexGuard<()>,
}

impl WriteTransaction {
    pub async fn commit(self) -> AppResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

impl Deref for WriteTransaction {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        &self.tx
    }
}

impl DerefMut for WriteTransaction {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:reliefnet.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> AppResult<Self> {
        Self::with_max_connections(database_url, 5).await
    }

    /// Open storage using the pool settings from `config`.
    pub async fn from_config(config: &Config) -> AppResult<Self> {
        Self::with_max_connections(&config.database_url, config.max_connections).await
    }

    async fn with_max_connections(database_url: &str, max_connections: u32) -> AppResult<Self> {
        let mut options =
            SqliteConnectOptions::from_str(database_url)?.busy_timeout(Duration::from_secs(5));
        if !database_url.contains(":memory:") {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let storage = Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Start a write transaction, waiting for any other writer to finish.
    pub async fn begin(&self) -> AppResult<WriteTransaction> {
        let writer = Arc::clone(&self.writer).lock_owned().await;
        let tx = self.pool.begin().await?;
        Ok(WriteTransaction {
            tx,
            _writer: writer,
        })
    }

    /// Create the database schema if it doesn't exist.
    async fn initialize_schema(&self) -> AppResult<()> {
        const SCHEMA: &[&str] = &[
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                role TEXT NOT NULL,
                credential TEXT NOT NULL UNIQUE,
                lng REAL,
                lat REAL,
                location_updated_at INTEGER,
                assigned_incident TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS incidents (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                status TEXT NOT NULL,
                lng REAL NOT NULL,
                lat REAL NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_incidents_lat_lng
            ON incidents(lat, lng)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS incident_members (
                incident_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                joined_at INTEGER NOT NULL,
                PRIMARY KEY (incident_id, user_id, kind)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_incident_members_user
            ON incident_members(user_id, kind)
            "#,
            // One row per stint on an incident; open while left_at is NULL
            r#"
            CREATE TABLE IF NOT EXISTS membership_history (
                incident_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                joined_at INTEGER NOT NULL,
                left_at INTEGER
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_membership_history_user
            ON membership_history(user_id, joined_at)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS reports (
                incident_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                author_id TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (incident_id, idx)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS report_acceptances (
                incident_id TEXT NOT NULL,
                report_idx INTEGER NOT NULL,
                volunteer_id TEXT NOT NULL,
                PRIMARY KEY (incident_id, report_idx, volunteer_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS chat_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                incident_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                message TEXT NOT NULL,
                sent_at INTEGER NOT NULL
            )
            "#,
            // Chat history is always read per incident in insertion order
            r#"
            CREATE INDEX IF NOT EXISTS idx_chat_messages_incident
            ON chat_messages(incident_id, seq)
            "#,
        ];

        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }
}

/// Generate an opaque identifier.
pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Collect one TEXT column from every row.
pub(crate) fn string_column(rows: &[SqliteRow], column: &str) -> AppResult<Vec<String>> {
    rows.iter()
        .map(|r| r.try_get::<String, _>(column).map_err(AppError::from))
        .collect()
}

pub(crate) fn parse_column<T>(raw: &str) -> AppResult<T>
where
    T: FromStr<Err = AppError>,
{
    raw.parse()
        .map_err(|e: AppError| AppError::Internal(format!("corrupt column value: {e}")))
}
