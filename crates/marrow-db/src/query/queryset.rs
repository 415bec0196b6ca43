//! The lazy, chainable `QuerySet`.
//!
//! A `QuerySet` accumulates filter criteria, ordering, projection, joins,
//! and set operations without touching the database; every chain method
//! consumes `self` and returns a new value whose caches start empty. SQL is
//! compiled and executed only by the terminal methods (`all`, `fetch`,
//! `get`, `count`, ...), and the compiled statement plus the fetched rows
//! are cached on the instance that executed them — never on chained copies.
//!
//! Configuration mistakes (`only` + `defer`, duplicate prefetch targets,
//! combining querysets bound to different schemas) fail at the chain call,
//! before any I/O.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::executor::{self, warn_if_forced_rollback, DbExecutor, ModelLifecycleHooks};
use crate::fields::{FieldType, RelationKind};
use crate::model::{Model, ModelMeta};
use crate::query::clause::{Criterion, Q};
use crate::query::compiler::{
    CompoundType, Dialect, Distinct, OrderTerm, Query, ResolvedOp, SelectColumn, SqlCompiler,
    WhereNode,
};
use crate::query::path::{
    resolve_order_column, resolve_path, ColumnRef, FieldPath, Join, JoinPlan, OperatorSuffix,
    PATH_SEPARATOR,
};
use crate::tenancy;
use crate::value::{Row, Value};
use marrow_core::{OrmError, OrmResult};

/// A materialized model instance plus its eagerly loaded companions.
///
/// Models have no dynamic attributes, so rows loaded through
/// `select_related` ride alongside the instance keyed by relation path, and
/// prefetched rows keyed by their prefetch target. The raw base row is kept
/// so callers can reach columns the model struct does not carry.
#[derive(Debug, Clone)]
pub struct Fetched<M: Model> {
    instance: Arc<M>,
    row: Row,
    related: HashMap<String, Row>,
    prefetched: HashMap<String, Vec<Row>>,
}

impl<M: Model> Fetched<M> {
    /// Returns the shared instance.
    pub fn shared(&self) -> Arc<M> {
        Arc::clone(&self.instance)
    }

    /// Returns the raw base row.
    pub const fn row(&self) -> &Row {
        &self.row
    }

    /// Returns the eagerly joined row for a `select_related` path, if the
    /// join matched.
    pub fn related(&self, path: &str) -> Option<&Row> {
        self.related.get(path)
    }

    /// Materializes the eagerly joined row for a path as a model instance.
    pub fn related_as<T: Model>(&self, path: &str) -> OrmResult<Option<T>> {
        self.related.get(path).map(|r| T::from_row(r)).transpose()
    }

    /// Returns the prefetched rows under a prefetch target key.
    pub fn prefetched(&self, key: &str) -> &[Row] {
        self.prefetched.get(key).map_or(&[], Vec::as_slice)
    }

    /// Materializes the prefetched rows under a key as model instances.
    pub fn prefetched_as<T: Model>(&self, key: &str) -> OrmResult<Vec<T>> {
        self.prefetched(key).iter().map(T::from_row).collect()
    }
}

impl<M: Model> std::ops::Deref for Fetched<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.instance
    }
}

/// A prefetch directive: which relation path to load in a follow-up query,
/// under what key, with an optional extra filter and ordering on the final
/// hop.
#[derive(Debug, Clone)]
pub struct Prefetch {
    path: String,
    to_attr: Option<String>,
    filter: Q,
    order_by: Vec<String>,
}

impl Prefetch {
    /// Creates a prefetch for the given relation path.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            to_attr: None,
            filter: Q::empty(),
            order_by: Vec::new(),
        }
    }

    /// Stores the results under a custom key instead of the path.
    #[must_use]
    pub fn to_attr(mut self, name: impl Into<String>) -> Self {
        self.to_attr = Some(name.into());
        self
    }

    /// Restricts the prefetched rows with an extra filter on the target.
    #[must_use]
    pub fn filter(mut self, q: Q) -> Self {
        self.filter = self.filter & q;
        self
    }

    /// Orders the prefetched rows.
    #[must_use]
    pub fn order_by(mut self, fields: &[&str]) -> Self {
        self.order_by = fields.iter().map(|f| (*f).to_string()).collect();
        self
    }

    /// The key results are stored under.
    pub fn key(&self) -> &str {
        self.to_attr.as_deref().unwrap_or(&self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
enum Projection {
    #[default]
    Full,
    Only(Vec<String>),
    Defer(Vec<String>),
}

/// The lazy query builder over a model type.
pub struct QuerySet<M: Model> {
    criteria: Q,
    order_fields: Vec<String>,
    reversed: bool,
    limit: Option<usize>,
    offset: Option<usize>,
    distinct_all: bool,
    distinct_fields: Vec<String>,
    group_fields: Vec<String>,
    select_related: Vec<String>,
    prefetches: Vec<Prefetch>,
    projection: Projection,
    hide_secrets: bool,
    schema_override: Option<String>,
    executor_override: Option<Arc<dyn DbExecutor>>,
    compound: Vec<(CompoundType, QuerySet<M>)>,
    sql_cache: Mutex<Option<(String, Vec<Value>)>>,
    result_cache: Mutex<Option<Arc<Vec<Fetched<M>>>>>,
}

impl<M: Model> std::fmt::Debug for QuerySet<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySet")
            .field("criteria", &self.criteria)
            .field("order_fields", &self.order_fields)
            .field("reversed", &self.reversed)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("distinct_all", &self.distinct_all)
            .field("distinct_fields", &self.distinct_fields)
            .field("group_fields", &self.group_fields)
            .field("select_related", &self.select_related)
            .field("prefetches", &self.prefetches)
            .field("projection", &self.projection)
            .field("hide_secrets", &self.hide_secrets)
            .field("schema_override", &self.schema_override)
            .finish_non_exhaustive()
    }
}

// Caches are deliberately not carried into copies: a chained queryset is a
// different query and must not observe its parent's results.
impl<M: Model> Clone for QuerySet<M> {
    fn clone(&self) -> Self {
        Self {
            criteria: self.criteria.clone(),
            order_fields: self.order_fields.clone(),
            reversed: self.reversed,
            limit: self.limit,
            offset: self.offset,
            distinct_all: self.distinct_all,
            distinct_fields: self.distinct_fields.clone(),
            group_fields: self.group_fields.clone(),
            select_related: self.select_related.clone(),
            prefetches: self.prefetches.clone(),
            projection: self.projection.clone(),
            hide_secrets: self.hide_secrets,
            schema_override: self.schema_override.clone(),
            executor_override: self.executor_override.clone(),
            compound: self.compound.clone(),
            sql_cache: Mutex::new(None),
            result_cache: Mutex::new(None),
        }
    }
}

impl<M: Model> Default for QuerySet<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Model> QuerySet<M> {
    /// Creates an unfiltered queryset over the model's table.
    pub fn new() -> Self {
        Self {
            criteria: Q::empty(),
            order_fields: Vec::new(),
            reversed: false,
            limit: None,
            offset: None,
            distinct_all: false,
            distinct_fields: Vec::new(),
            group_fields: Vec::new(),
            select_related: Vec::new(),
            prefetches: Vec::new(),
            projection: Projection::Full,
            hide_secrets: false,
            schema_override: None,
            executor_override: None,
            compound: Vec::new(),
            sql_cache: Mutex::new(None),
            result_cache: Mutex::new(None),
        }
    }

    // ----- chain methods -------------------------------------------------

    /// ANDs the expression into the filter tree.
    #[must_use]
    pub fn filter(mut self, q: Q) -> Self {
        self.criteria = self.criteria & q;
        self
    }

    /// Shorthand for `filter(Q::expr(path, value))`.
    #[must_use]
    pub fn filter_by(self, path: impl Into<String>, value: impl Into<crate::value::Arg>) -> Self {
        self.filter(Q::expr(path, value))
    }

    /// ANDs the negated expression into the filter tree.
    #[must_use]
    pub fn exclude(mut self, q: Q) -> Self {
        self.criteria = self.criteria & !q;
        self
    }

    /// ORs the expression against the *entire* accumulated tree.
    #[must_use]
    pub fn or_(mut self, q: Q) -> Self {
        self.criteria = self.criteria | q;
        self
    }

    /// ORs the given expressions among themselves, then ANDs the group into
    /// the accumulated tree.
    #[must_use]
    pub fn local_or(mut self, exprs: impl IntoIterator<Item = Q>) -> Self {
        let group = crate::query::clause::or_(exprs);
        self.criteria = self.criteria & group;
        self
    }

    /// Alias for [`exclude`](Self::exclude).
    #[must_use]
    pub fn not_(self, q: Q) -> Self {
        self.exclude(q)
    }

    /// Replaces the ordering; a leading `-` sorts descending. The last call
    /// wins.
    #[must_use]
    pub fn order_by(mut self, fields: &[&str]) -> Self {
        self.order_fields = fields.iter().map(|f| (*f).to_string()).collect();
        self
    }

    /// Flips the direction of every ordering field.
    #[must_use]
    pub fn reverse(mut self) -> Self {
        self.reversed = !self.reversed;
        self
    }

    /// Caps the number of returned rows.
    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Skips the first `n` rows.
    #[must_use]
    pub fn offset(mut self, n: usize) -> Self {
        self.offset = Some(n);
        self
    }

    /// Requests full-row DISTINCT.
    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.distinct_all = true;
        self
    }

    /// Requests `DISTINCT ON` the named columns (dialect support is checked
    /// at compile time).
    #[must_use]
    pub fn distinct_on(mut self, fields: &[&str]) -> Self {
        self.distinct_all = true;
        self.distinct_fields = fields.iter().map(|f| (*f).to_string()).collect();
        self
    }

    /// Groups by the named columns.
    #[must_use]
    pub fn group_by(mut self, fields: &[&str]) -> Self {
        self.group_fields = fields.iter().map(|f| (*f).to_string()).collect();
        self
    }

    /// Eagerly joins the given single-valued relation paths. `"a"` and
    /// `"a__b"` share the `a` join.
    #[must_use]
    pub fn select_related(mut self, paths: &[&str]) -> Self {
        for path in paths {
            if !self.select_related.iter().any(|p| p == path) {
                self.select_related.push((*path).to_string());
            }
        }
        self
    }

    /// Registers a follow-up prefetch query, erroring on a duplicate
    /// target key.
    pub fn prefetch_related(mut self, prefetch: Prefetch) -> OrmResult<Self> {
        if self.prefetches.iter().any(|p| p.key() == prefetch.key()) {
            return Err(OrmError::QuerySet(format!(
                "duplicate prefetch target '{}'",
                prefetch.key()
            )));
        }
        self.prefetches.push(prefetch);
        Ok(self)
    }

    /// Restricts the selected columns to the named fields (plus the primary
    /// key). Mutually exclusive with [`defer`](Self::defer).
    pub fn only(mut self, fields: &[&str]) -> OrmResult<Self> {
        if matches!(self.projection, Projection::Defer(_)) {
            return Err(OrmError::QuerySet(
                "only() and defer() cannot be combined".to_string(),
            ));
        }
        self.projection = Projection::Only(Self::validated_columns(fields)?);
        Ok(self)
    }

    /// Drops the named fields from the selection (the primary key is always
    /// kept). Mutually exclusive with [`only`](Self::only).
    pub fn defer(mut self, fields: &[&str]) -> OrmResult<Self> {
        if matches!(self.projection, Projection::Only(_)) {
            return Err(OrmError::QuerySet(
                "only() and defer() cannot be combined".to_string(),
            ));
        }
        self.projection = Projection::Defer(Self::validated_columns(fields)?);
        Ok(self)
    }

    /// Toggles secret-field exclusion; applies recursively to eagerly
    /// joined relations. The last call wins.
    #[must_use]
    pub fn exclude_secrets(mut self, flag: bool) -> Self {
        self.hide_secrets = flag;
        self
    }

    /// Pins query compilation to the given schema, overriding the ambient
    /// active schema.
    #[must_use]
    pub fn using_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema_override = Some(schema.into());
        self
    }

    /// Pins execution to the given connection; terminal methods ignore the
    /// connection they are handed.
    #[must_use]
    pub fn using(mut self, db: Arc<dyn DbExecutor>) -> Self {
        self.executor_override = Some(db);
        self
    }

    /// Combines with `UNION` (deduplicating).
    pub fn union(self, other: Self) -> OrmResult<Self> {
        self.combine(CompoundType::Union, other)
    }

    /// Combines with `UNION ALL`.
    pub fn union_all(self, other: Self) -> OrmResult<Self> {
        self.combine(CompoundType::UnionAll, other)
    }

    /// Combines with `INTERSECT`.
    pub fn intersect(self, other: Self) -> OrmResult<Self> {
        self.combine(CompoundType::Intersect, other)
    }

    /// Combines with `EXCEPT`.
    pub fn except_(self, other: Self) -> OrmResult<Self> {
        self.combine(CompoundType::Except, other)
    }

    fn combine(mut self, op: CompoundType, mut other: Self) -> OrmResult<Self> {
        if self.schema_override != other.schema_override {
            return Err(OrmError::QuerySet(
                "combined querysets must share the same schema binding".to_string(),
            ));
        }
        // Chained combinations flatten into one N-way statement.
        let tail = std::mem::take(&mut other.compound);
        self.compound.push((op, other));
        self.compound.extend(tail);
        Ok(self)
    }

    // ----- compilation ---------------------------------------------------

    /// The effective ordering: `(descending, field)` pairs with the
    /// reversal flag folded in. Used by the paginators.
    pub(crate) fn order_spec(&self) -> Vec<(bool, String)> {
        self.order_fields
            .iter()
            .map(|raw| {
                let (descending, name) = parse_order_field(raw);
                (descending ^ self.reversed, name.to_string())
            })
            .collect()
    }

    fn effective_schema(&self) -> Option<String> {
        self.schema_override
            .clone()
            .or_else(tenancy::active_schema)
    }

    fn validated_columns(fields: &[&str]) -> OrmResult<Vec<String>> {
        let meta = M::meta();
        fields
            .iter()
            .map(|name| {
                meta.field(name)
                    .and_then(|f| f.local_column())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        OrmError::UnknownField(format!("'{name}' on table '{}'", meta.table))
                    })
            })
            .collect()
    }

    /// Base-table columns under the active projection and secrets policy;
    /// the primary key is always retained.
    fn base_columns(&self) -> Vec<String> {
        M::meta()
            .fields
            .iter()
            .filter_map(|f| f.local_column().map(|c| (f, c)))
            .filter(|(f, c)| {
                if f.primary_key {
                    return true;
                }
                if self.hide_secrets && f.secret {
                    return false;
                }
                match &self.projection {
                    Projection::Full => true,
                    Projection::Only(keep) => keep.iter().any(|k| k == c),
                    Projection::Defer(drop) => !drop.iter().any(|d| d == c),
                }
            })
            .map(|(_, c)| c.to_string())
            .collect()
    }

    /// The `select_related` chain expanded to (alias, target meta) pairs,
    /// one per traversed hop, deduplicated by alias.
    fn related_targets(&self) -> OrmResult<Vec<(String, &'static ModelMeta)>> {
        let mut out: Vec<(String, &'static ModelMeta)> = Vec::new();
        for path in &self.select_related {
            let mut meta = M::meta();
            let mut prefix = String::new();
            for segment in path.split(PATH_SEPARATOR) {
                let field = meta.field(segment).ok_or_else(|| {
                    OrmError::UnknownField(format!("'{segment}' on table '{}'", meta.table))
                })?;
                let rel = field.relation.as_ref().ok_or_else(|| {
                    OrmError::UnknownField(format!(
                        "'{segment}' on table '{}' is not a relation",
                        meta.table
                    ))
                })?;
                if matches!(
                    rel.kind,
                    RelationKind::ReverseForeignKey { .. } | RelationKind::ManyToMany { .. }
                ) {
                    return Err(OrmError::QuerySet(format!(
                        "select_related('{path}') traverses a multi-valued relation; \
                         use prefetch_related instead"
                    )));
                }
                if !prefix.is_empty() {
                    prefix.push_str(PATH_SEPARATOR);
                }
                prefix.push_str(segment);
                meta = rel.target_meta();
                if !out.iter().any(|(a, _)| a == &prefix) {
                    out.push((prefix.clone(), meta));
                }
            }
        }
        Ok(out)
    }

    /// Builds the resolved query AST for this queryset's own clauses,
    /// ignoring compound operands.
    fn build_core(&self, criterion: Option<&Criterion>) -> OrmResult<Query> {
        let meta = M::meta();
        let mut plan = JoinPlan::new();

        let where_clause = criterion
            .map(|c| criterion_to_where(meta, c, &mut plan))
            .transpose()?;

        // Ordering. Combined queries may only order by base columns (the
        // outer SELECT has no joins to order against).
        let mut order_by = Vec::new();
        {
            let mut order_plan = JoinPlan::new();
            for raw in &self.order_fields {
                let (descending, name) = parse_order_field(raw);
                let resolved = resolve_order_column(meta, name)?;
                for join in resolved.joins {
                    order_plan.add(join);
                }
                order_by.push(OrderTerm {
                    column: resolved.column,
                    descending: descending ^ self.reversed,
                });
            }
            if !order_plan.is_empty() {
                if self.compound.is_empty() {
                    plan.merge(&order_plan);
                } else {
                    return Err(OrmError::QuerySet(
                        "combined querysets can only be ordered by base columns".to_string(),
                    ));
                }
            }
        }

        let mut group_by = Vec::new();
        for raw in &self.group_fields {
            let resolved = resolve_order_column(meta, raw)?;
            for join in resolved.joins {
                plan.add(join);
            }
            group_by.push(resolved.column);
        }

        let distinct = if self.distinct_fields.is_empty() {
            if self.distinct_all {
                Distinct::All
            } else {
                Distinct::None
            }
        } else {
            let mut cols = Vec::new();
            for raw in &self.distinct_fields {
                let resolved = resolve_order_column(meta, raw)?;
                for join in resolved.joins {
                    plan.add(join);
                }
                cols.push(resolved.column);
            }
            Distinct::On(cols)
        };

        // Eager joins and their labeled columns.
        let related = self.related_targets()?;
        let mut related_columns = Vec::new();
        for path in &self.select_related {
            let parsed = FieldPath {
                segments: path.split(PATH_SEPARATOR).map(str::to_string).collect(),
                operator: None,
            };
            let resolved = resolve_path(meta, &parsed)?;
            for join in resolved.joins {
                plan.add(join);
            }
        }
        for (alias, target_meta) in &related {
            for field in &target_meta.fields {
                if self.hide_secrets && field.secret && !field.primary_key {
                    continue;
                }
                if let Some(column) = field.local_column() {
                    related_columns.push(SelectColumn::Related {
                        alias: alias.clone(),
                        column: column.to_string(),
                    });
                }
            }
        }

        let explicit_select = !plan.is_empty()
            || !related_columns.is_empty()
            || self.projection != Projection::Full
            || self.hide_secrets;
        let select = if explicit_select {
            self.base_columns()
                .into_iter()
                .map(SelectColumn::Base)
                .chain(related_columns)
                .collect()
        } else {
            Vec::new()
        };

        Ok(Query {
            table: meta.table.to_string(),
            schema: self.effective_schema(),
            select,
            joins: plan.joins().to_vec(),
            where_clause,
            distinct,
            group_by,
            order_by,
            limit: self.limit,
            offset: self.offset,
            compound: Vec::new(),
        })
    }

    async fn resolved_criterion(&self) -> OrmResult<Option<Criterion>> {
        match self.criteria.criterion() {
            Some(c) if c.has_lazy_args() => Ok(Some(c.resolved().await?)),
            Some(c) => Ok(Some(c.clone())),
            None => Ok(None),
        }
    }

    /// Builds the complete query AST, awaiting lazy filter arguments.
    async fn build_query(&self) -> OrmResult<Query> {
        let criterion = self.resolved_criterion().await?;
        let mut query = self.build_core(criterion.as_ref())?;
        for (op, operand) in &self.compound {
            let operand_criterion = operand.resolved_criterion().await?;
            query
                .compound
                .push((*op, operand.build_core(operand_criterion.as_ref())?));
        }
        Ok(query)
    }

    /// Compiles the queryset to SQL without executing it.
    ///
    /// This synchronous inspection path cannot await; it errors if any
    /// filter argument is still lazy.
    pub fn to_sql(&self, dialect: Dialect) -> OrmResult<(String, Vec<Value>)> {
        let mut query = self.build_core(self.criteria.criterion())?;
        for (op, operand) in &self.compound {
            query
                .compound
                .push((*op, operand.build_core(operand.criteria.criterion())?));
        }
        SqlCompiler::new(dialect).compile_select(&query)
    }

    async fn prepare(&self, dialect: Dialect) -> OrmResult<(String, Vec<Value>)> {
        if let Some(cached) = self
            .sql_cache
            .lock()
            .expect("queryset cache lock poisoned")
            .clone()
        {
            return Ok(cached);
        }
        let query = self.build_query().await?;
        let compiled = SqlCompiler::new(dialect).compile_select(&query)?;
        *self
            .sql_cache
            .lock()
            .expect("queryset cache lock poisoned") = Some(compiled.clone());
        Ok(compiled)
    }

    /// Drops the compiled-statement and fetched-result caches. Safe to call
    /// repeatedly; the next terminal read recompiles and refetches.
    pub fn clear_caches(&self) {
        *self
            .sql_cache
            .lock()
            .expect("queryset cache lock poisoned") = None;
        *self
            .result_cache
            .lock()
            .expect("queryset cache lock poisoned") = None;
    }

    // ----- terminal reads ------------------------------------------------

    fn resolve_db<'a>(&'a self, db: &'a dyn DbExecutor) -> &'a dyn DbExecutor {
        self.executor_override.as_deref().unwrap_or(db)
    }

    /// Executes the query, bypassing and not touching the result cache.
    pub async fn fetch(&self, db: &dyn DbExecutor) -> OrmResult<Vec<Fetched<M>>> {
        let db = self.resolve_db(db);
        if db.in_forced_rollback() {
            warn!(
                table = M::table_name(),
                "fetch on a forced-rollback connection; results reflect uncommitted state"
            );
        }
        let (sql, params) = self.prepare(db.dialect()).await?;
        debug!(table = M::table_name(), sql, "executing query");
        let rows = db.query(&sql, &params).await?;

        let related = self.related_targets()?;
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let base = row.base_columns();
            let instance = Arc::new(M::from_row(&base)?);
            let mut related_rows = HashMap::new();
            for (alias, target_meta) in &related {
                let sub = row.split_prefix(alias);
                // A LEFT JOIN miss yields an all-NULL block; presence is
                // decided by the target's primary key.
                let hit = sub
                    .value(target_meta.pk_field().name)
                    .is_some_and(|v| !v.is_null());
                if hit {
                    related_rows.insert(alias.clone(), sub);
                }
            }
            items.push(Fetched {
                instance,
                row: base,
                related: related_rows,
                prefetched: HashMap::new(),
            });
        }

        self.run_prefetches(db, &mut items).await?;
        Ok(items)
    }

    /// Executes the query, caching the result; repeated calls return the
    /// cached rows until [`clear_caches`](Self::clear_caches).
    pub async fn all(&self, db: &dyn DbExecutor) -> OrmResult<Arc<Vec<Fetched<M>>>> {
        if let Some(cached) = self
            .result_cache
            .lock()
            .expect("queryset cache lock poisoned")
            .clone()
        {
            return Ok(cached);
        }
        let items = Arc::new(self.fetch(db).await?);
        *self
            .result_cache
            .lock()
            .expect("queryset cache lock poisoned") = Some(Arc::clone(&items));
        Ok(items)
    }

    /// Fetches exactly one row matching the extra expression.
    ///
    /// Errors with [`OrmError::DoesNotExist`] on zero rows and
    /// [`OrmError::MultipleObjectsReturned`] on more than one.
    pub async fn get(&self, db: &dyn DbExecutor, q: Q) -> OrmResult<Fetched<M>> {
        let mut narrowed = self.clone().filter(q);
        narrowed.limit = Some(2);
        narrowed.offset = None;
        let mut items = narrowed.fetch(db).await?;
        match items.len() {
            0 => Err(OrmError::DoesNotExist(format!(
                "no {} row matches the query",
                M::table_name()
            ))),
            1 => Ok(items.remove(0)),
            _ => Err(OrmError::MultipleObjectsReturned(format!(
                "query on {} matched more than one row",
                M::table_name()
            ))),
        }
    }

    /// Like [`get`](Self::get) but returns `None` on zero rows.
    pub async fn get_or_none(&self, db: &dyn DbExecutor, q: Q) -> OrmResult<Option<Fetched<M>>> {
        match self.get(db, q).await {
            Ok(item) => Ok(Some(item)),
            Err(OrmError::DoesNotExist(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns the first row under the current ordering, if any.
    pub async fn first(&self, db: &dyn DbExecutor) -> OrmResult<Option<Fetched<M>>> {
        let mut narrowed = self.clone();
        narrowed.limit = Some(1);
        Ok(narrowed.fetch(db).await?.into_iter().next())
    }

    /// Returns the last row under the current ordering (primary key order
    /// when unordered), if any.
    pub async fn last(&self, db: &dyn DbExecutor) -> OrmResult<Option<Fetched<M>>> {
        let mut narrowed = self.clone();
        if narrowed.order_fields.is_empty() {
            narrowed.order_fields = vec![M::pk_field_name().to_string()];
        }
        narrowed.reversed = !narrowed.reversed;
        narrowed.limit = Some(1);
        Ok(narrowed.fetch(db).await?.into_iter().next())
    }

    /// Probes whether any row matches.
    pub async fn exists(&self, db: &dyn DbExecutor) -> OrmResult<bool> {
        let db = self.resolve_db(db);
        let query = self.build_query().await?;
        let (sql, params) = SqlCompiler::new(db.dialect()).compile_exists(&query)?;
        debug!(table = M::table_name(), sql, "probing existence");
        let row = db.query_one(&sql, &params).await?.ok_or_else(|| {
            OrmError::Database("EXISTS probe returned no row".to_string())
        })?;
        row.get("exists")
    }

    /// Counts matching rows, ignoring limit and offset.
    pub async fn count(&self, db: &dyn DbExecutor) -> OrmResult<u64> {
        let db = self.resolve_db(db);
        let query = self.build_query().await?;
        let (sql, params) = SqlCompiler::new(db.dialect()).compile_count(&query)?;
        debug!(table = M::table_name(), sql, "counting rows");
        let row = db.query_one(&sql, &params).await?.ok_or_else(|| {
            OrmError::Database("COUNT returned no row".to_string())
        })?;
        let count: i64 = row.get("count")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Returns `true` if the saved instance matches the queryset's filters.
    pub async fn contains(&self, db: &dyn DbExecutor, instance: &M) -> OrmResult<bool> {
        let pk = instance.require_pk()?;
        self.clone()
            .filter(Q::expr(M::pk_field_name(), pk))
            .exists(db)
            .await
    }

    // ----- value projections ---------------------------------------------

    fn value_columns(
        fields: Option<&[&str]>,
        exclude: Option<&[&str]>,
    ) -> OrmResult<Vec<String>> {
        let meta = M::meta();
        let mut names = match fields {
            Some(fs) => Self::validated_columns(fs)?,
            None => meta.column_names().iter().map(|c| (*c).to_string()).collect(),
        };
        if let Some(excluded) = exclude {
            let excluded = Self::validated_columns(excluded)?;
            names.retain(|n| !excluded.contains(n));
        }
        Ok(names)
    }

    /// Returns mapping rows instead of model instances.
    pub async fn values(
        &self,
        db: &dyn DbExecutor,
        fields: Option<&[&str]>,
        exclude: Option<&[&str]>,
        exclude_none: bool,
    ) -> OrmResult<Vec<BTreeMap<String, Value>>> {
        let names = Self::value_columns(fields, exclude)?;
        let rows = self.fetch_columns(db, &names).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                names
                    .iter()
                    .filter_map(|name| {
                        let value = row.value(name).cloned().unwrap_or(Value::Null);
                        if exclude_none && value.is_null() {
                            None
                        } else {
                            Some((name.clone(), value))
                        }
                    })
                    .collect()
            })
            .collect())
    }

    /// Returns tuple rows (one `Vec<Value>` per row, in field order).
    pub async fn values_list(
        &self,
        db: &dyn DbExecutor,
        fields: &[&str],
    ) -> OrmResult<Vec<Vec<Value>>> {
        let names = Self::value_columns(Some(fields), None)?;
        let rows = self.fetch_columns(db, &names).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                names
                    .iter()
                    .map(|name| row.value(name).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect())
    }

    /// Returns a flat list of single values; exactly one field is required.
    pub async fn values_list_flat(
        &self,
        db: &dyn DbExecutor,
        fields: &[&str],
    ) -> OrmResult<Vec<Value>> {
        if fields.len() != 1 {
            return Err(OrmError::QuerySet(format!(
                "flat values_list takes exactly one field, got {}",
                fields.len()
            )));
        }
        Ok(self
            .values_list(db, fields)
            .await?
            .into_iter()
            .filter_map(|mut row| (!row.is_empty()).then(|| row.remove(0)))
            .collect())
    }

    async fn fetch_columns(&self, db: &dyn DbExecutor, names: &[String]) -> OrmResult<Vec<Row>> {
        let db = self.resolve_db(db);
        let mut query = self.build_query().await?;
        query.select = names
            .iter()
            .map(|n| SelectColumn::Base(n.clone()))
            .collect();
        let (sql, params) = SqlCompiler::new(db.dialect()).compile_select(&query)?;
        debug!(table = M::table_name(), sql, "fetching value rows");
        db.query(&sql, &params).await
    }

    // ----- prefetch engine -----------------------------------------------

    async fn run_prefetches(
        &self,
        db: &dyn DbExecutor,
        items: &mut [Fetched<M>],
    ) -> OrmResult<()> {
        for prefetch in &self.prefetches {
            self.run_prefetch(db, prefetch, items).await?;
        }
        Ok(())
    }

    /// Executes one prefetch hop-by-hop: each hop issues a single query for
    /// all parent rows, keyed on the previous hop's key set.
    async fn run_prefetch(
        &self,
        db: &dyn DbExecutor,
        prefetch: &Prefetch,
        items: &mut [Fetched<M>],
    ) -> OrmResult<()> {
        let segments: Vec<&str> = prefetch.path.split(PATH_SEPARATOR).collect();
        let compiler = SqlCompiler::new(db.dialect());
        let schema = self.effective_schema();

        let mut current_meta = M::meta();
        let mut per_item: Vec<Vec<Row>> = items.iter().map(|f| vec![f.row.clone()]).collect();
        let mut prefix = String::new();

        for (hop, segment) in segments.iter().enumerate() {
            let is_last = hop + 1 == segments.len();
            let field = current_meta.field(segment).ok_or_else(|| {
                OrmError::UnknownField(format!("'{segment}' on table '{}'", current_meta.table))
            })?;
            let rel = field.relation.as_ref().ok_or_else(|| {
                OrmError::UnknownField(format!(
                    "'{segment}' on table '{}' is not a relation",
                    current_meta.table
                ))
            })?;
            let target = rel.target_meta();
            if !prefix.is_empty() {
                prefix.push_str(PATH_SEPARATOR);
            }
            prefix.push_str(segment);

            // Keys linking parent rows to the rows this hop will fetch.
            let key_column = match &rel.kind {
                RelationKind::ForeignKey { column } | RelationKind::OneToOne { column } => *column,
                RelationKind::ReverseForeignKey { .. } | RelationKind::ManyToMany { .. } => {
                    current_meta.pk_field().name
                }
            };
            let per_item_keys: Vec<Vec<Value>> = per_item
                .iter()
                .map(|rows| {
                    rows.iter()
                        .filter_map(|r| r.value(key_column))
                        .filter(|v| !v.is_null())
                        .cloned()
                        .collect()
                })
                .collect();
            let mut all_keys: Vec<Value> = Vec::new();
            for keys in &per_item_keys {
                for key in keys {
                    if !all_keys.contains(key) {
                        all_keys.push(key.clone());
                    }
                }
            }
            if all_keys.is_empty() {
                for item in items.iter_mut() {
                    item.prefetched.insert(prefetch.key().to_string(), Vec::new());
                }
                return Ok(());
            }

            let mut query = Query::new(target.table);
            query.schema = schema.clone();
            let match_column: String;
            match &rel.kind {
                RelationKind::ForeignKey { .. } | RelationKind::OneToOne { .. } => {
                    let pk = target.pk_field();
                    match_column = pk.name.to_string();
                    query.where_clause = Some(WhereNode::Cond {
                        column: ColumnRef {
                            table_alias: None,
                            column: pk.name.to_string(),
                            field_type: pk.field_type,
                            null: pk.null,
                        },
                        op: ResolvedOp::In(all_keys),
                    });
                }
                RelationKind::ReverseForeignKey { related_column } => {
                    match_column = (*related_column).to_string();
                    query.where_clause = Some(WhereNode::Cond {
                        column: ColumnRef {
                            table_alias: None,
                            column: (*related_column).to_string(),
                            field_type: FieldType::Integer,
                            null: false,
                        },
                        op: ResolvedOp::In(all_keys),
                    });
                }
                RelationKind::ManyToMany {
                    through_table,
                    source_column,
                    target_column,
                } => {
                    match_column = format!("through.{source_column}");
                    query.joins.push(Join {
                        path: "through".to_string(),
                        table: through_table,
                        alias: "through".to_string(),
                        left_alias: None,
                        left_column: target.pk_field().name.to_string(),
                        right_column: (*target_column).to_string(),
                    });
                    query.where_clause = Some(WhereNode::Cond {
                        column: ColumnRef {
                            table_alias: Some("through".to_string()),
                            column: (*source_column).to_string(),
                            field_type: FieldType::Integer,
                            null: false,
                        },
                        op: ResolvedOp::In(all_keys),
                    });
                    query.select = target
                        .column_names()
                        .iter()
                        .map(|c| SelectColumn::Base((*c).to_string()))
                        .chain(std::iter::once(SelectColumn::Related {
                            alias: "through".to_string(),
                            column: (*source_column).to_string(),
                        }))
                        .collect();
                }
            }

            if is_last {
                if let Some(crit) = prefetch.filter.criterion() {
                    let resolved = if crit.has_lazy_args() {
                        crit.resolved().await?
                    } else {
                        crit.clone()
                    };
                    let mut plan = JoinPlan::new();
                    let node = criterion_to_where(target, &resolved, &mut plan)?;
                    for join in plan.joins() {
                        query.joins.push(join.clone());
                    }
                    query.where_clause = Some(match query.where_clause.take() {
                        Some(existing) => WhereNode::And(vec![existing, node]),
                        None => node,
                    });
                }
                for raw in &prefetch.order_by {
                    let (descending, name) = parse_order_field(raw);
                    let resolved = resolve_order_column(target, name)?;
                    for join in resolved.joins {
                        query.joins.push(join);
                    }
                    query.order_by.push(OrderTerm {
                        column: resolved.column,
                        descending,
                    });
                }
            }

            if !query.joins.is_empty() && query.select.is_empty() {
                query.select = target
                    .column_names()
                    .iter()
                    .map(|c| SelectColumn::Base((*c).to_string()))
                    .collect();
            }

            let (sql, params) = compiler.compile_select(&query)?;
            debug!(table = target.table, sql, "executing prefetch hop");
            let rows = db.query(&sql, &params).await?;

            let store_key = if is_last {
                prefetch.key().to_string()
            } else {
                prefix.clone()
            };
            let mut next_per_item = Vec::with_capacity(per_item.len());
            for keys in &per_item_keys {
                let matched: Vec<Row> = rows
                    .iter()
                    .filter(|r| r.value(&match_column).is_some_and(|v| keys.contains(v)))
                    .map(Row::base_columns)
                    .collect();
                next_per_item.push(matched);
            }
            for (item, matched) in items.iter_mut().zip(&next_per_item) {
                item.prefetched.insert(store_key.clone(), matched.clone());
            }

            per_item = next_per_item;
            current_meta = target;
        }
        Ok(())
    }

    // ----- terminal writes -----------------------------------------------

    /// Inserts a new instance, firing its lifecycle hooks.
    pub async fn create(&self, db: &dyn DbExecutor, instance: M) -> OrmResult<M>
    where
        M: ModelLifecycleHooks,
    {
        executor::create(instance, self.resolve_db(db)).await
    }

    /// Inserts each instance in order, firing hooks per instance.
    pub async fn bulk_create(&self, db: &dyn DbExecutor, instances: Vec<M>) -> OrmResult<Vec<M>>
    where
        M: ModelLifecycleHooks,
    {
        let db = self.resolve_db(db);
        let mut created = Vec::with_capacity(instances.len());
        for instance in instances {
            created.push(executor::create(instance, db).await?);
        }
        Ok(created)
    }

    /// Writes the named fields of each saved instance back, firing hooks.
    /// Returns the number of updated rows.
    pub async fn bulk_update(
        &self,
        db: &dyn DbExecutor,
        instances: &mut [M],
        fields: &[&str],
    ) -> OrmResult<u64>
    where
        M: ModelLifecycleHooks,
    {
        let db = self.resolve_db(db);
        warn_if_forced_rollback(db, "bulk_update");
        let compiler = SqlCompiler::new(db.dialect());
        let schema = self.effective_schema();
        let pk_field = M::meta().pk_field();
        let mut affected = 0;

        for instance in instances.iter_mut() {
            let pk = instance.require_pk()?;
            instance.pre_save(db).await?;
            let values = instance.field_values();
            let mut changes = Vec::with_capacity(fields.len());
            for field in fields {
                let (name, value) = values
                    .iter()
                    .find(|(n, _)| n == field)
                    .ok_or_else(|| {
                        OrmError::UnknownField(format!(
                            "'{field}' on table '{}'",
                            M::table_name()
                        ))
                    })?;
                changes.push((*name, value.clone()));
            }

            let mut query = Query::new(M::table_name());
            query.schema = schema.clone();
            query.where_clause = Some(WhereNode::Cond {
                column: ColumnRef {
                    table_alias: None,
                    column: pk_field.name.to_string(),
                    field_type: pk_field.field_type,
                    null: pk_field.null,
                },
                op: ResolvedOp::Exact(pk),
            });
            let (sql, params) = compiler.compile_update(&query, &changes)?;
            affected += db.execute_sql(&sql, &params).await?;
            instance.post_save(db, false).await?;
        }
        Ok(affected)
    }

    /// Updates all matching rows with the given column assignments,
    /// returning the number of affected rows.
    pub async fn update(&self, db: &dyn DbExecutor, changes: &[(&str, Value)]) -> OrmResult<u64> {
        let db = self.resolve_db(db);
        warn_if_forced_rollback(db, "update");
        let query = self.build_query().await?;
        let (sql, params) = SqlCompiler::new(db.dialect()).compile_update(&query, changes)?;
        debug!(table = M::table_name(), sql, "bulk updating rows");
        db.execute_sql(&sql, &params).await
    }

    /// Deletes all matching rows, returning the number of deleted rows.
    pub async fn delete(&self, db: &dyn DbExecutor) -> OrmResult<u64> {
        let db = self.resolve_db(db);
        warn_if_forced_rollback(db, "delete");
        let query = self.build_query().await?;
        let (sql, params) = SqlCompiler::new(db.dialect()).compile_delete(&query)?;
        debug!(table = M::table_name(), sql, "bulk deleting rows");
        db.execute_sql(&sql, &params).await
    }

    /// Fetches the row matching `q`, or inserts `build()` when none exists.
    /// Returns the instance and whether it was created.
    pub async fn get_or_create(
        &self,
        db: &dyn DbExecutor,
        q: Q,
        build: impl FnOnce() -> M + Send,
    ) -> OrmResult<(M, bool)>
    where
        M: ModelLifecycleHooks + Clone,
    {
        match self.get_or_none(db, q).await? {
            Some(found) => Ok(((*found.instance).clone(), false)),
            None => {
                let created = executor::create(build(), self.resolve_db(db)).await?;
                Ok((created, true))
            }
        }
    }

    /// Fetches the row matching `q` and applies `apply` to it, or inserts
    /// `build()` when none exists. Returns the instance and whether it was
    /// created.
    pub async fn update_or_create(
        &self,
        db: &dyn DbExecutor,
        q: Q,
        build: impl FnOnce() -> M + Send,
        apply: impl FnOnce(&mut M) + Send,
    ) -> OrmResult<(M, bool)>
    where
        M: ModelLifecycleHooks + Clone,
    {
        let db = self.resolve_db(db);
        match self.get_or_none(db, q).await? {
            Some(found) => {
                let mut instance = (*found.instance).clone();
                apply(&mut instance);
                executor::save(&mut instance, db).await?;
                Ok((instance, false))
            }
            None => {
                let created = executor::create(build(), db).await?;
                Ok((created, true))
            }
        }
    }
}

fn parse_order_field(raw: &str) -> (bool, &str) {
    raw.strip_prefix('-').map_or((false, raw), |rest| (true, rest))
}

/// Lowers a criterion tree to a WHERE tree, registering joins for every
/// relation-traversing lookup.
fn criterion_to_where(
    meta: &'static ModelMeta,
    criterion: &Criterion,
    plan: &mut JoinPlan,
) -> OrmResult<WhereNode> {
    match criterion {
        Criterion::Leaf { path, value } => {
            let parsed = FieldPath::parse(path)?;
            let resolved = resolve_path(meta, &parsed)?;
            for join in resolved.joins {
                plan.add(join);
            }
            let concrete = value.expect_value()?.clone();
            let op = build_operator(resolved.column.field_type, resolved.operator, concrete)?;
            Ok(WhereNode::Cond {
                column: resolved.column,
                op,
            })
        }
        Criterion::And(children) => Ok(WhereNode::And(
            children
                .iter()
                .map(|c| criterion_to_where(meta, c, plan))
                .collect::<OrmResult<Vec<_>>>()?,
        )),
        Criterion::Or(children) => Ok(WhereNode::Or(
            children
                .iter()
                .map(|c| criterion_to_where(meta, c, plan))
                .collect::<OrmResult<Vec<_>>>()?,
        )),
        Criterion::Not(inner) => Ok(WhereNode::Not(Box::new(criterion_to_where(
            meta, inner, plan,
        )?))),
    }
}

fn require_string(value: Value, operator: &str) -> OrmResult<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(OrmError::QuerySet(format!(
            "'{operator}' requires a string value, got {other:?}"
        ))),
    }
}

fn require_bool(value: Value, operator: &str) -> OrmResult<bool> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(OrmError::QuerySet(format!(
            "'{operator}' requires a boolean value, got {other:?}"
        ))),
    }
}

/// Pairs an operator suffix with its concrete right-hand value.
///
/// A bare lookup (no suffix) means equality, or membership when the value
/// is a list.
fn build_operator(
    field_type: FieldType,
    operator: Option<OperatorSuffix>,
    value: Value,
) -> OrmResult<ResolvedOp> {
    use OperatorSuffix as Op;
    Ok(match operator.unwrap_or(Op::Exact) {
        Op::Exact => match value {
            Value::List(items) => ResolvedOp::In(items),
            v => ResolvedOp::Exact(v),
        },
        Op::IExact => ResolvedOp::IExact(require_string(value, "iexact")?),
        Op::Contains => ResolvedOp::Contains(require_string(value, "contains")?),
        Op::IContains => ResolvedOp::IContains(require_string(value, "icontains")?),
        Op::StartsWith => ResolvedOp::StartsWith(require_string(value, "startswith")?),
        Op::IStartsWith => ResolvedOp::IStartsWith(require_string(value, "istartswith")?),
        Op::EndsWith => ResolvedOp::EndsWith(require_string(value, "endswith")?),
        Op::IEndsWith => ResolvedOp::IEndsWith(require_string(value, "iendswith")?),
        Op::In => match value {
            Value::List(items) => ResolvedOp::In(items),
            other => {
                return Err(OrmError::QuerySet(format!(
                    "'in' requires a list value, got {other:?}"
                )))
            }
        },
        Op::Gt => ResolvedOp::Gt(value),
        Op::Gte => ResolvedOp::Gte(value),
        Op::Lt => ResolvedOp::Lt(value),
        Op::Lte => ResolvedOp::Lte(value),
        Op::IsNull => ResolvedOp::IsNull(require_bool(value, "isnull")?),
        Op::IsEmpty => ResolvedOp::IsEmpty {
            empty: require_bool(value, "isempty")?,
            field_type,
        },
        Op::Range => match value {
            Value::List(items) => {
                let [low, high]: [Value; 2] = items.try_into().map_err(|items: Vec<Value>| {
                    OrmError::QuerySet(format!(
                        "'range' requires exactly two values, got {}",
                        items.len()
                    ))
                })?;
                ResolvedOp::Range(low, high)
            }
            other => {
                return Err(OrmError::QuerySet(format!(
                    "'range' requires a two-element list, got {other:?}"
                )))
            }
        },
    })
}
