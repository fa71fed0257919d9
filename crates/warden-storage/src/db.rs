//! SQLite handle shared by the proposal store.
//!
//! One connection behind a mutex. Single statements go through `with_conn`;
//! multi-statement writes that must land together go through `with_tx`,
//! which takes SQLite's write lock up front so other processes sharing the
//! file wait on `busy_timeout` instead of failing mid-transaction.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use warden_core::error::WardenError;

use crate::migrations;

/// Pragmas for file-backed databases.
const FILE_PRAGMAS: &str = "PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;
     PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the governance database at `path`, creating parent
    /// directories and applying pending migrations.
    pub fn new(path: &Path) -> Result<Self, WardenError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| WardenError::Storage(format!("Failed to open database: {}", e)))?;
        let db = Self::prepare(conn, FILE_PRAGMAS)?;
        info!(path = %path.display(), "Governance database opened");
        Ok(db)
    }

    /// Private in-memory database, used by tests and ephemeral pipelines.
    pub fn in_memory() -> Result<Self, WardenError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| WardenError::Storage(format!("Failed to open in-memory db: {}", e)))?;
        Self::prepare(conn, "PRAGMA foreign_keys = ON;")
    }

    fn prepare(conn: Connection, pragmas: &str) -> Result<Self, WardenError> {
        conn.execute_batch(pragmas)
            .map_err(|e| WardenError::Storage(format!("Failed to set pragmas: {}", e)))?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, WardenError> {
        self.conn
            .lock()
            .map_err(|e| WardenError::Storage(format!("Database lock poisoned: {}", e)))
    }

    /// Run `f` against the connection while holding the lock.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, WardenError>
    where
        F: FnOnce(&Connection) -> Result<T, WardenError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside an immediate transaction.
    ///
    /// Commits when `f` returns `Ok`; any error rolls every statement back.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, WardenError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, WardenError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| WardenError::Storage(format!("Failed to begin transaction: {}", e)))?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()
                    .map_err(|e| WardenError::Storage(format!("Failed to commit: {}", e)))?;
                Ok(value)
            }
            Err(e) => {
                debug!(error = %e, "Transaction rolled back");
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}
