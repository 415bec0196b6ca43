//! SQLite backend using `rusqlite`.
//!
//! [`SqliteBackend`] implements [`DbExecutor`] over a single `rusqlite`
//! connection guarded by an async mutex; every operation runs inside
//! `tokio::task::spawn_blocking` so the driver never blocks the runtime.
//!
//! - In-memory databases via [`SqliteBackend::memory`] (the test setup)
//! - WAL journal mode for file-based databases
//! - A [`force_rollback`](SqliteBackend::set_force_rollback) toggle that
//!   marks the connection as transient: writes still execute, but the
//!   engine logs a warning because they will not outlive the surrounding
//!   transaction

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::base::DatabaseBackend;
use marrow_core::{OrmError, OrmResult};
use marrow_db::query::Dialect;
use marrow_db::{DbExecutor, Row, Value};

/// A SQLite database backend.
pub struct SqliteBackend {
    path: PathBuf,
    conn: Arc<Mutex<rusqlite::Connection>>,
    force_rollback: AtomicBool,
}

impl SqliteBackend {
    /// Opens a SQLite database at the given path (`:memory:` for an
    /// in-memory database). File-based databases get WAL journal mode.
    pub fn open(path: impl Into<PathBuf>) -> OrmResult<Self> {
        let path = path.into();
        let conn = if path.to_str() == Some(":memory:") {
            rusqlite::Connection::open_in_memory()
        } else {
            rusqlite::Connection::open(&path)
        }
        .map_err(|e| OrmError::Operational(format!("SQLite open failed: {e}")))?;

        if path.to_str() != Some(":memory:") {
            conn.execute_batch("PRAGMA journal_mode=WAL;")
                .map_err(|e| OrmError::Operational(format!("Failed to set pragmas: {e}")))?;
        }
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| OrmError::Operational(format!("Failed to set pragmas: {e}")))?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
            force_rollback: AtomicBool::new(false),
        })
    }

    /// Opens an in-memory database.
    pub fn memory() -> OrmResult<Self> {
        Self::open(":memory:")
    }

    /// Returns the database file path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Marks the connection as forced-rollback (or clears the mark).
    /// Test harnesses set this inside a transaction they always roll back.
    pub fn set_force_rollback(&self, flag: bool) {
        self.force_rollback.store(flag, Ordering::SeqCst);
    }

    /// Binds ORM values to a prepared statement.
    fn bind_params(stmt: &mut rusqlite::Statement<'_>, params: &[Value]) -> OrmResult<()> {
        for (i, param) in params.iter().enumerate() {
            let idx = i + 1;
            match param {
                Value::Null => stmt.raw_bind_parameter(idx, rusqlite::types::Null),
                Value::Bool(b) => stmt.raw_bind_parameter(idx, b),
                Value::Int(v) => stmt.raw_bind_parameter(idx, v),
                Value::Float(v) => stmt.raw_bind_parameter(idx, v),
                Value::String(s) => stmt.raw_bind_parameter(idx, s.as_str()),
                Value::Bytes(b) => stmt.raw_bind_parameter(idx, b.as_slice()),
                Value::Date(d) => stmt.raw_bind_parameter(idx, d.to_string().as_str()),
                Value::DateTime(dt) => stmt.raw_bind_parameter(idx, dt.to_string().as_str()),
                Value::DateTimeTz(dt) => {
                    stmt.raw_bind_parameter(idx, dt.to_rfc3339().as_str())
                }
                Value::Time(t) => stmt.raw_bind_parameter(idx, t.to_string().as_str()),
                Value::Uuid(u) => stmt.raw_bind_parameter(idx, u.to_string().as_str()),
                Value::Json(j) => stmt.raw_bind_parameter(idx, j.to_string().as_str()),
                Value::List(vals) => {
                    let json = serde_json::to_string(vals)
                        .map_err(|e| OrmError::Database(format!("List encode error: {e}")))?;
                    stmt.raw_bind_parameter(idx, json.as_str())
                }
            }
            .map_err(|e| OrmError::Database(format!("Bind error: {e}")))?;
        }
        Ok(())
    }

    /// Converts a `rusqlite` row to the generic [`Row`].
    fn convert_row(sqlite_row: &rusqlite::Row<'_>, column_names: &[String]) -> Row {
        let values: Vec<Value> = column_names
            .iter()
            .enumerate()
            .map(|(i, _)| {
                let val_ref = sqlite_row
                    .get_ref(i)
                    .unwrap_or(rusqlite::types::ValueRef::Null);
                match val_ref {
                    rusqlite::types::ValueRef::Null => Value::Null,
                    rusqlite::types::ValueRef::Integer(v) => Value::Int(v),
                    rusqlite::types::ValueRef::Real(v) => Value::Float(v),
                    rusqlite::types::ValueRef::Text(b) => {
                        Value::String(String::from_utf8_lossy(b).to_string())
                    }
                    rusqlite::types::ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
                }
            })
            .collect();
        Row::new(column_names.to_vec(), values)
    }
}

#[async_trait::async_trait]
impl DbExecutor for SqliteBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn in_forced_rollback(&self) -> bool {
        self.force_rollback.load(Ordering::SeqCst)
    }

    async fn execute_sql(&self, sql: &str, params: &[Value]) -> OrmResult<u64> {
        debug!(sql, params = params.len(), "executing statement");
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        let params = params.to_vec();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| OrmError::Database(format!("{e}")))?;
            Self::bind_params(&mut stmt, &params)?;
            let count = stmt
                .raw_execute()
                .map_err(|e| OrmError::Database(format!("{e}")))?;
            Ok(count as u64)
        })
        .await
        .map_err(|e| OrmError::Database(format!("Task join error: {e}")))?
    }

    async fn query(&self, sql: &str, params: &[Value]) -> OrmResult<Vec<Row>> {
        debug!(sql, params = params.len(), "running query");
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        let params = params.to_vec();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| OrmError::Database(format!("{e}")))?;
            let column_names: Vec<String> =
                stmt.column_names().into_iter().map(String::from).collect();

            Self::bind_params(&mut stmt, &params)?;
            let mut raw_rows = stmt.raw_query();

            let mut rows = Vec::new();
            while let Some(row) = raw_rows
                .next()
                .map_err(|e| OrmError::Database(format!("{e}")))?
            {
                rows.push(Self::convert_row(row, &column_names));
            }
            Ok(rows)
        })
        .await
        .map_err(|e| OrmError::Database(format!("Task join error: {e}")))?
    }

    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> OrmResult<Value> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        let params = params.to_vec();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| OrmError::Database(format!("{e}")))?;
            Self::bind_params(&mut stmt, &params)?;
            stmt.raw_execute()
                .map_err(|e| OrmError::Database(format!("{e}")))?;
            Ok(Value::Int(conn.last_insert_rowid()))
        })
        .await
        .map_err(|e| OrmError::Database(format!("Task join error: {e}")))?
    }
}

#[async_trait::async_trait]
impl DatabaseBackend for SqliteBackend {
    fn vendor(&self) -> &str {
        "sqlite"
    }

    async fn execute_batch(&self, sql: &str) -> OrmResult<()> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute_batch(&sql)
                .map_err(|e| OrmError::Database(format!("{e}")))
        })
        .await
        .map_err(|e| OrmError::Database(format!("Task join error: {e}")))?
    }
}
