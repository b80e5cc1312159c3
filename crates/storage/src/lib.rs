#![forbid(unsafe_code)]
//! Durable job store. The single `jobs` table is the sole synchronization
//! primitive between workers: every mutation runs inside an IMMEDIATE
//! transaction, and lease acquisition re-checks its predicate in the guarded
//! UPDATE so two connections can never claim the same row.

mod jobs;
mod support;

use qc_core::model::JobState;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use support::time::now_ms;

pub const DB_FILE: &str = "queuectl.db";

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Sql(rusqlite::Error),
    InvalidInput(&'static str),
    DuplicateId { id: String },
    NotFound { id: String },
    InvalidTransition { id: String, state: JobState },
    LeaseLost { id: String },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Sql(err) => write!(f, "sqlite: {err}"),
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Self::DuplicateId { id } => write!(f, "job '{id}' already exists"),
            Self::NotFound { id } => write!(f, "job '{id}' not found"),
            Self::InvalidTransition { id, state } => {
                write!(f, "job '{id}' is {}, not dead", state.as_str())
            }
            Self::LeaseLost { id } => write!(f, "lease on job '{id}' no longer held"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql(value)
    }
}

/// One row of the `jobs` table. Timestamps are epoch milliseconds.
#[derive(Clone, Debug)]
pub struct JobRow {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: i64,
    pub updated_at: i64,
    pub next_retry_at: Option<i64>,
    pub locked_by: Option<String>,
    pub locked_at: Option<i64>,
    pub last_error: Option<String>,
    pub output: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.dead
    }
}

#[derive(Debug)]
pub struct SqliteStore {
    storage_dir: PathBuf,
    conn: Connection,
}

impl SqliteStore {
    /// Each process opens its own connection; nothing is shared in memory.
    pub fn open(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;
        let db_path = storage_dir.join(DB_FILE);
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self { storage_dir, conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS jobs (
              id TEXT PRIMARY KEY,
              command TEXT NOT NULL,
              state TEXT NOT NULL,
              attempts INTEGER NOT NULL DEFAULT 0,
              max_retries INTEGER NOT NULL DEFAULT 3,
              created_at INTEGER NOT NULL,
              updated_at INTEGER NOT NULL,
              next_retry_at INTEGER,
              locked_by TEXT,
              locked_at INTEGER,
              last_error TEXT,
              output TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state, created_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_next_retry ON jobs(next_retry_at);
            "#,
        )?;
        Ok(())
    }

    fn tx_immediate(&mut self) -> Result<Transaction<'_>, rusqlite::Error> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
    }
}
