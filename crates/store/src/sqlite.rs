//! Connection lifecycle, schema versioning, and error mapping.
//!
//! # Schema Versioning
//!
//! A single-row `schema_version` table records the applied version. Bump
//! [`CURRENT_SCHEMA_VERSION`] and add a step to `run_migrations` to change
//! the schema; steps run in order from the stored version.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use pipeline::StorageError;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

/// Schema version this build writes.
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// SQLite-backed implementation of every storage port.
///
/// One connection guarded by a mutex; synchronous rusqlite calls run on the
/// blocking pool via `tokio::task::spawn_blocking`. Cloning shares the
/// connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").field("path", &self.path).finish()
    }
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and migrates it.
    ///
    /// # Durability
    ///
    /// - `journal_mode = WAL`
    /// - `synchronous = FULL`
    /// - `busy_timeout = 5000ms`
    /// - `foreign_keys = ON`
    ///
    /// # Errors
    ///
    /// [`StorageError::Schema`] when the database is newer than this build or
    /// a migration fails; [`StorageError::Unavailable`] for I/O failures.
    /// Both are fatal at startup.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::unavailable(
                        "create database directory",
                        format!("{}: {e}", parent.display()),
                    )
                })?;
            }
        }
        let conn = Connection::open(path).map_err(|e| sql_error("open database", e))?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| sql_error("set journal_mode", e))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            return Err(StorageError::Schema {
                message: format!(
                    "WAL journal mode unavailable for {} (SQLite kept '{journal_mode}')",
                    path.display()
                ),
            });
        }

        Self::configure(conn, Some(path.to_path_buf()))
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(|e| sql_error("open database", e))?;
        Self::configure(conn, None)
    }

    fn configure(conn: Connection, path: Option<PathBuf>) -> Result<Self, StorageError> {
        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            PRAGMA foreign_keys = ON;
            "#,
        )
        .map_err(|e| sql_error("configure pragmas", e))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| schema_error("create schema_version table", e))?;

        let current: i64 = conn
            .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| schema_error("read schema version", e))?
            .unwrap_or(0);

        run_migrations(&conn, current)?;

        let location = path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ":memory:".to_string());
        tracing::info!(
            path = %location,
            schema_version = CURRENT_SCHEMA_VERSION,
            "Store opened"
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Database file, or `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Applied schema version.
    pub async fn schema_version(&self) -> Result<i64, StorageError> {
        self.blocking("read schema version", |conn| {
            conn.query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
                row.get(0)
            })
            .map_err(|e| sql_error("read schema version", e))
        })
        .await
    }

    /// Flushes the write-ahead log into the main database file.
    ///
    /// Other clones keep working after this returns; the connection closes
    /// when the last clone is dropped.
    pub async fn close(self) -> Result<(), StorageError> {
        if self.path.is_none() {
            return Ok(());
        }
        self.blocking("checkpoint wal", |conn| {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
                .map_err(|e| sql_error("checkpoint wal", e))
        })
        .await?;
        tracing::info!(path = ?self.path, "Store closed");
        Ok(())
    }

    /// Runs `op` against the connection on the blocking pool.
    pub(crate) async fn blocking<T, F>(&self, operation: &'static str, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            // Every write is transactional, so a panic mid-operation has
            // already been rolled back by SQLite.
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            op(&mut guard)
        })
        .await
        .map_err(|e| StorageError::unavailable(operation, e.to_string()))?
    }
}

fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), StorageError> {
    if from_version > CURRENT_SCHEMA_VERSION {
        return Err(StorageError::Schema {
            message: format!(
                "database schema version {from_version} is newer than supported version {CURRENT_SCHEMA_VERSION}"
            ),
        });
    }
    if from_version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    if from_version < 1 {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS deliveries (
                delivery_id TEXT PRIMARY KEY,
                event TEXT NOT NULL,
                received_at INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                run_id TEXT,
                reason TEXT,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_deliveries_received_at
                ON deliveries(received_at);

            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                delivery_id TEXT NOT NULL UNIQUE REFERENCES deliveries(delivery_id),
                run_key TEXT NOT NULL,
                state TEXT NOT NULL,
                checkpoint TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_state ON runs(state);

            CREATE TABLE IF NOT EXISTS entities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                natural_key TEXT NOT NULL,
                repository TEXT,
                file_path TEXT,
                attributes TEXT NOT NULL DEFAULT '{}',
                embedding TEXT,
                stale INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                UNIQUE (kind, natural_key)
            );
            CREATE INDEX IF NOT EXISTS idx_entities_scope
                ON entities(repository, kind);
            CREATE INDEX IF NOT EXISTS idx_entities_file
                ON entities(repository, file_path) WHERE file_path IS NOT NULL;

            CREATE TABLE IF NOT EXISTS edges (
                src INTEGER NOT NULL REFERENCES entities(id),
                dst INTEGER NOT NULL REFERENCES entities(id),
                kind TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (src, dst, kind)
            );
            CREATE INDEX IF NOT EXISTS idx_edges_dst ON edges(dst, kind);

            CREATE TABLE IF NOT EXISTS policy_evaluations (
                pull_request TEXT NOT NULL,
                policy_id TEXT NOT NULL,
                result TEXT NOT NULL,
                reason TEXT NOT NULL,
                evaluated_at INTEGER NOT NULL,
                PRIMARY KEY (pull_request, policy_id)
            );
            "#,
        )
        .map_err(|e| schema_error("migration v1", e))?;
    }

    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
        params![CURRENT_SCHEMA_VERSION],
    )
    .map_err(|e| schema_error("update schema version", e))?;

    tracing::info!(from_version, to_version = CURRENT_SCHEMA_VERSION, "Schema migrated");
    Ok(())
}

/// Maps a rusqlite error: lock contention is a retryable conflict,
/// everything else means the store is unavailable.
pub(crate) fn sql_error(operation: &str, err: rusqlite::Error) -> StorageError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            StorageError::conflict(operation, err.to_string())
        }
        _ => StorageError::unavailable(operation, err.to_string()),
    }
}

fn schema_error(operation: &str, err: rusqlite::Error) -> StorageError {
    StorageError::Schema {
        message: format!("{operation}: {err}"),
    }
}

pub(crate) fn json_error(what: &str) -> impl Fn(serde_json::Error) -> StorageError + '_ {
    move |e| {
        tracing::error!(what, error = %e, "Stored JSON failed to decode");
        StorageError::corruption(what)
    }
}
