//! The database executor abstraction and row-level persistence.
//!
//! [`DbExecutor`] is the async seam between the query engine and a concrete
//! backend: the engine compiles SQL and hands it over with its parameters,
//! the backend runs it. [`ModelLifecycleHooks`] gives models pre/post save
//! and delete callbacks; the free functions here ([`save`], [`create`],
//! [`delete`], [`refresh_model`]) drive single-instance persistence through
//! both.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::model::Model;
use crate::query::compiler::{Dialect, Query, ResolvedOp, SqlCompiler, WhereNode};
use crate::query::path::ColumnRef;
use crate::tenancy;
use crate::value::{Row, Value};
use marrow_core::{OrmError, OrmResult};

/// The async interface every database backend implements.
///
/// All statements arrive fully compiled and parameterized; implementations
/// never see lookup paths or model metadata.
#[async_trait]
pub trait DbExecutor: Send + Sync {
    /// Returns the SQL dialect to compile statements for.
    fn dialect(&self) -> Dialect;

    /// Executes a statement, returning the number of affected rows.
    async fn execute_sql(&self, sql: &str, params: &[Value]) -> OrmResult<u64>;

    /// Runs a query, returning all result rows.
    async fn query(&self, sql: &str, params: &[Value]) -> OrmResult<Vec<Row>>;

    /// Runs a query, returning the first row if any.
    async fn query_one(&self, sql: &str, params: &[Value]) -> OrmResult<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Executes an INSERT and returns the generated primary key.
    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> OrmResult<Value>;

    /// Whether the connection is in forced-rollback mode (every write is
    /// discarded at the end of the surrounding transaction, as test
    /// harnesses arrange).
    fn in_forced_rollback(&self) -> bool {
        false
    }
}

/// Logs a warning when writes are issued against a forced-rollback
/// connection. The write still executes; it just will not persist.
pub(crate) fn warn_if_forced_rollback(db: &dyn DbExecutor, operation: &str) {
    if db.in_forced_rollback() {
        warn!(
            operation,
            "write issued on a forced-rollback connection; it will not persist"
        );
    }
}

/// Lifecycle callbacks invoked around persistence operations.
///
/// All hooks default to no-ops; models opt in with an empty impl and
/// override what they need.
#[async_trait]
pub trait ModelLifecycleHooks: Model {
    /// Called before INSERT or UPDATE.
    async fn pre_save(&mut self, _db: &dyn DbExecutor) -> OrmResult<()> {
        Ok(())
    }

    /// Called after INSERT or UPDATE; `created` is true for INSERT.
    async fn post_save(&mut self, _db: &dyn DbExecutor, _created: bool) -> OrmResult<()> {
        Ok(())
    }

    /// Called before DELETE.
    async fn pre_delete(&mut self, _db: &dyn DbExecutor) -> OrmResult<()> {
        Ok(())
    }

    /// Called after DELETE.
    async fn post_delete(&mut self, _db: &dyn DbExecutor) -> OrmResult<()> {
        Ok(())
    }
}

fn pk_column<M: Model>() -> ColumnRef {
    let pk = M::meta().pk_field();
    ColumnRef {
        table_alias: None,
        column: pk.name.to_string(),
        field_type: pk.field_type,
        null: pk.null,
    }
}

fn pk_query<M: Model>(pk: Value) -> Query {
    let mut query = Query::new(M::table_name());
    query.schema = tenancy::active_schema();
    query.where_clause = Some(WhereNode::Cond {
        column: pk_column::<M>(),
        op: ResolvedOp::Exact(pk),
    });
    query
}

/// Saves a model instance: UPDATE when it has a primary key, INSERT
/// otherwise. Runs `pre_save`/`post_save` hooks around the statement.
pub async fn save<M: ModelLifecycleHooks>(instance: &mut M, db: &dyn DbExecutor) -> OrmResult<()> {
    warn_if_forced_rollback(db, "save");
    instance.pre_save(db).await?;

    let compiler = SqlCompiler::new(db.dialect());
    let created = match instance.pk() {
        Some(pk) => {
            let query = pk_query::<M>(pk);
            let fields = instance.non_pk_field_values();
            let (sql, params) = compiler.compile_update(&query, &fields)?;
            debug!(table = M::table_name(), sql, "updating row");
            let affected = db.execute_sql(&sql, &params).await?;
            if affected == 0 {
                return Err(OrmError::DoesNotExist(format!(
                    "{} row vanished during save",
                    M::table_name()
                )));
            }
            false
        }
        None => {
            let fields = instance.non_pk_field_values();
            let (sql, params) = compiler.compile_insert(
                tenancy::active_schema().as_deref(),
                M::table_name(),
                &fields,
            );
            debug!(table = M::table_name(), sql, "inserting row");
            let id = db.insert_returning_id(&sql, &params).await?;
            instance.set_pk(id);
            true
        }
    };

    instance.post_save(db, created).await
}

/// Inserts a new model instance and returns it with its primary key set.
pub async fn create<M: ModelLifecycleHooks>(mut instance: M, db: &dyn DbExecutor) -> OrmResult<M> {
    save(&mut instance, db).await?;
    Ok(instance)
}

/// Deletes a saved model instance, running `pre_delete`/`post_delete`.
pub async fn delete<M: ModelLifecycleHooks>(
    instance: &mut M,
    db: &dyn DbExecutor,
) -> OrmResult<()> {
    warn_if_forced_rollback(db, "delete");
    let pk = instance.require_pk()?;
    instance.pre_delete(db).await?;

    let compiler = SqlCompiler::new(db.dialect());
    let (sql, params) = compiler.compile_delete(&pk_query::<M>(pk))?;
    debug!(table = M::table_name(), sql, "deleting row");
    db.execute_sql(&sql, &params).await?;

    instance.post_delete(db).await
}

/// Reloads a model instance from the database by primary key, replacing all
/// field values. Restores deferred fields after an `only`/`defer` fetch.
pub async fn refresh_model<M: Model>(instance: &mut M, db: &dyn DbExecutor) -> OrmResult<()> {
    let pk = instance.require_pk()?;
    let compiler = SqlCompiler::new(db.dialect());
    let (sql, params) = compiler.compile_select(&pk_query::<M>(pk))?;
    debug!(table = M::table_name(), sql, "refreshing row");
    let row = db.query_one(&sql, &params).await?.ok_or_else(|| {
        OrmError::DoesNotExist(format!("{} row no longer exists", M::table_name()))
    })?;
    *instance = M::from_row(&row)?;
    Ok(())
}
