//! The common backend contract.
//!
//! A backend is a [`DbExecutor`] (the query engine's seam) plus the small
//! amount of surface the engine itself never needs: a vendor name for
//! diagnostics and a batch-DDL helper used by test harnesses to provision
//! schemas and tables.

use async_trait::async_trait;
use marrow_core::OrmResult;
use marrow_db::DbExecutor;

/// A concrete database driver.
#[async_trait]
pub trait DatabaseBackend: DbExecutor {
    /// The vendor name (e.g. `"sqlite"`).
    fn vendor(&self) -> &str;

    /// Executes a batch of semicolon-separated statements without
    /// parameters. Intended for DDL in tests and provisioning scripts.
    async fn execute_batch(&self, sql: &str) -> OrmResult<()>;
}
