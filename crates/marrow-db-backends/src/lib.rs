//! # marrow-db-backends
//!
//! Concrete database drivers implementing the engine's
//! [`DbExecutor`](marrow_db::DbExecutor) seam. Currently ships SQLite
//! (behind the default `sqlite` feature).

pub mod base;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use base::DatabaseBackend;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;
