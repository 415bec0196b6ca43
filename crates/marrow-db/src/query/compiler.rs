//! Resolved query AST and SQL compilation.
//!
//! [`Query`] is the fully resolved statement description the execution
//! engine hands to [`SqlCompiler`]: every lookup path has already been
//! turned into a [`ColumnRef`] and the join plan into concrete [`Join`]s.
//! The compiler translates the AST into parameterized SQL for the SQLite
//! (`?`) or PostgreSQL (`$1, $2, ...`) placeholder dialect — the ORM never
//! interpolates values into SQL text.

use crate::fields::FieldType;
use crate::query::path::{escape_like, ColumnRef, Join};
use crate::value::Value;
use marrow_core::{OrmError, OrmResult};

/// The SQL dialect to compile for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// SQLite (`?` placeholders).
    Sqlite,
    /// PostgreSQL (`$1, $2, ...` placeholders, `DISTINCT ON` support).
    Postgres,
}

/// A resolved comparison operator with its bound values.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedOp {
    /// `col = value` (or `IS NULL` when the value is null).
    Exact(Value),
    /// Case-insensitive equality, wildcard-escaped.
    IExact(String),
    /// `col LIKE %value%`, wildcard-escaped.
    Contains(String),
    /// Case-insensitive contains, wildcard-escaped.
    IContains(String),
    /// `col IN (values...)`.
    In(Vec<Value>),
    /// `col > value`.
    Gt(Value),
    /// `col >= value`.
    Gte(Value),
    /// `col < value`.
    Lt(Value),
    /// `col <= value`.
    Lte(Value),
    /// `col LIKE value%`, wildcard-escaped.
    StartsWith(String),
    /// Case-insensitive prefix, wildcard-escaped.
    IStartsWith(String),
    /// `col LIKE %value`, wildcard-escaped.
    EndsWith(String),
    /// Case-insensitive suffix, wildcard-escaped.
    IEndsWith(String),
    /// `col IS NULL` / `col IS NOT NULL`.
    IsNull(bool),
    /// Field-type-dependent emptiness test.
    IsEmpty {
        /// Whether to match empty (true) or non-empty (false).
        empty: bool,
        /// The field's semantic type, which decides what "empty" means.
        field_type: FieldType,
    },
    /// `col BETWEEN low AND high`.
    Range(Value, Value),
}

/// A WHERE clause node over resolved columns.
#[derive(Debug, Clone, PartialEq)]
pub enum WhereNode {
    /// A single comparison.
    Cond {
        /// The resolved column.
        column: ColumnRef,
        /// The comparison to apply.
        op: ResolvedOp,
    },
    /// Logical AND. Empty means "always true" (`1=1`).
    And(Vec<WhereNode>),
    /// Logical OR.
    Or(Vec<WhereNode>),
    /// Logical NOT.
    Not(Box<WhereNode>),
}

/// A column in the SELECT list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectColumn {
    /// A base-table column, selected under its own name.
    Base(String),
    /// A joined-table column, labeled `alias.column` so materialization can
    /// split rows by relation path.
    Related {
        /// The join alias.
        alias: String,
        /// The column on the joined table.
        column: String,
    },
}

/// One ORDER BY term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTerm {
    /// The resolved column.
    pub column: ColumnRef,
    /// Whether to sort descending.
    pub descending: bool,
}

/// The DISTINCT mode of a query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Distinct {
    /// No DISTINCT.
    #[default]
    None,
    /// Full-row `DISTINCT`.
    All,
    /// `DISTINCT ON (columns...)` — PostgreSQL only.
    On(Vec<ColumnRef>),
}

/// A SQL set operator combining two selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundType {
    /// `UNION` (deduplicating).
    Union,
    /// `UNION ALL` (preserving duplicates).
    UnionAll,
    /// `INTERSECT`.
    Intersect,
    /// `EXCEPT`.
    Except,
}

impl CompoundType {
    const fn sql_keyword(self) -> &'static str {
        match self {
            Self::Union => "UNION",
            Self::UnionAll => "UNION ALL",
            Self::Intersect => "INTERSECT",
            Self::Except => "EXCEPT",
        }
    }
}

/// A fully resolved SELECT description.
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// The base table (unqualified).
    pub table: String,
    /// The schema qualifying the base table and joined tables, if any.
    pub schema: Option<String>,
    /// The SELECT list; empty selects every base column (`*` semantics are
    /// avoided so related columns stay labeled).
    pub select: Vec<SelectColumn>,
    /// Joins in registration order.
    pub joins: Vec<Join>,
    /// The WHERE tree.
    pub where_clause: Option<WhereNode>,
    /// DISTINCT mode (outer, for compound queries).
    pub distinct: Distinct,
    /// GROUP BY columns.
    pub group_by: Vec<ColumnRef>,
    /// ORDER BY terms (outer, for compound queries).
    pub order_by: Vec<OrderTerm>,
    /// LIMIT (outer, for compound queries).
    pub limit: Option<usize>,
    /// OFFSET (outer, for compound queries).
    pub offset: Option<usize>,
    /// Additional operands combined with set operators. Operand orderings
    /// are structurally discarded; only the outer terms above order the
    /// combined result.
    pub compound: Vec<(CompoundType, Query)>,
}

impl Query {
    /// Creates an empty query over the given table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }
}

/// Compiles a [`Query`] into parameterized SQL.
#[derive(Debug, Clone, Copy)]
pub struct SqlCompiler {
    dialect: Dialect,
}

impl SqlCompiler {
    /// Creates a compiler for the given dialect.
    pub const fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    fn placeholder(self, n: usize) -> String {
        match self.dialect {
            Dialect::Sqlite => "?".to_string(),
            Dialect::Postgres => format!("${n}"),
        }
    }

    fn quote_table(schema: Option<&str>, table: &str) -> String {
        schema.map_or_else(
            || format!("\"{table}\""),
            |s| format!("\"{s}\".\"{table}\""),
        )
    }

    fn render_column(query: &Query, column: &ColumnRef) -> String {
        match &column.table_alias {
            Some(alias) => format!("\"{alias}\".\"{}\"", column.column),
            None => {
                if query.joins.is_empty() {
                    format!("\"{}\"", column.column)
                } else {
                    format!("\"{}\".\"{}\"", query.table, column.column)
                }
            }
        }
    }

    /// Compiles a SELECT statement.
    pub fn compile_select(self, query: &Query) -> OrmResult<(String, Vec<Value>)> {
        let mut params = Vec::new();
        if query.compound.is_empty() {
            let sql = self.compile_simple_select(query, &mut params, true)?;
            return Ok((sql, params));
        }

        // Set operations: compile each operand as an independent SELECT with
        // its ordering discarded, then wrap the combination in an outer
        // SELECT that applies the outer distinct/order/limit/offset.
        let mut parts = vec![self.compile_operand(query, &mut params)?];
        for (op, operand) in &query.compound {
            parts.push(format!(
                "{} {}",
                op.sql_keyword(),
                self.compile_operand(operand, &mut params)?
            ));
        }

        let mut sql = String::from("SELECT ");
        match &query.distinct {
            Distinct::None => sql.push('*'),
            Distinct::All => sql.push_str("DISTINCT *"),
            Distinct::On(_) => {
                return Err(OrmError::QuerySet(
                    "DISTINCT ON cannot be applied to a combined query".to_string(),
                ))
            }
        }
        sql.push_str(&format!(" FROM ({}) AS \"combined\"", parts.join(" ")));

        if !query.order_by.is_empty() {
            let terms: Vec<String> = query
                .order_by
                .iter()
                .map(|t| {
                    let dir = if t.descending { " DESC" } else { " ASC" };
                    format!("\"{}\"{dir}", t.column.column)
                })
                .collect();
            sql.push_str(&format!(" ORDER BY {}", terms.join(", ")));
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = query.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        Ok((sql, params))
    }

    /// Compiles one set-operation operand: a plain SELECT with ordering,
    /// limit, and offset structurally discarded.
    fn compile_operand(self, query: &Query, params: &mut Vec<Value>) -> OrmResult<String> {
        let stripped = Query {
            order_by: Vec::new(),
            limit: None,
            offset: None,
            distinct: Distinct::None,
            compound: Vec::new(),
            ..query.clone()
        };
        self.compile_simple_select(&stripped, params, false)
    }

    fn compile_simple_select(
        self,
        query: &Query,
        params: &mut Vec<Value>,
        with_window: bool,
    ) -> OrmResult<String> {
        let mut sql = String::from("SELECT ");

        match &query.distinct {
            Distinct::None => {}
            Distinct::All => sql.push_str("DISTINCT "),
            Distinct::On(columns) => {
                if self.dialect != Dialect::Postgres {
                    return Err(OrmError::QuerySet(
                        "DISTINCT ON named columns requires the PostgreSQL dialect".to_string(),
                    ));
                }
                let cols: Vec<String> = columns
                    .iter()
                    .map(|c| Self::render_column(query, c))
                    .collect();
                sql.push_str(&format!("DISTINCT ON ({}) ", cols.join(", ")));
            }
        }

        let select_parts: Vec<String> = if query.select.is_empty() {
            vec!["*".to_string()]
        } else {
            query
                .select
                .iter()
                .map(|col| match col {
                    SelectColumn::Base(name) => {
                        if query.joins.is_empty() {
                            format!("\"{name}\"")
                        } else {
                            format!("\"{}\".\"{name}\"", query.table)
                        }
                    }
                    SelectColumn::Related { alias, column } => {
                        format!("\"{alias}\".\"{column}\" AS \"{alias}.{column}\"")
                    }
                })
                .collect()
        };
        sql.push_str(&select_parts.join(", "));

        sql.push_str(&format!(
            " FROM {}",
            Self::quote_table(query.schema.as_deref(), &query.table)
        ));
        if !query.joins.is_empty() {
            sql.push_str(&format!(" AS \"{}\"", query.table));
        }

        for join in &query.joins {
            let left = join.left_alias.as_deref().unwrap_or(&query.table);
            sql.push_str(&format!(
                " LEFT JOIN {} AS \"{}\" ON \"{left}\".\"{}\" = \"{}\".\"{}\"",
                Self::quote_table(query.schema.as_deref(), join.table),
                join.alias,
                join.left_column,
                join.alias,
                join.right_column,
            ));
        }

        if let Some(where_clause) = &query.where_clause {
            sql.push_str(" WHERE ");
            self.compile_where_node(query, where_clause, &mut sql, params);
        }

        if !query.group_by.is_empty() {
            let cols: Vec<String> = query
                .group_by
                .iter()
                .map(|c| Self::render_column(query, c))
                .collect();
            sql.push_str(&format!(" GROUP BY {}", cols.join(", ")));
        }

        if with_window {
            if !query.order_by.is_empty() {
                let terms: Vec<String> = query
                    .order_by
                    .iter()
                    .map(|t| {
                        let dir = if t.descending { " DESC" } else { " ASC" };
                        format!("{}{dir}", Self::render_column(query, &t.column))
                    })
                    .collect();
                sql.push_str(&format!(" ORDER BY {}", terms.join(", ")));
            }
            if let Some(limit) = query.limit {
                sql.push_str(&format!(" LIMIT {limit}"));
            }
            if let Some(offset) = query.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }

        Ok(sql)
    }

    fn compile_where_node(
        self,
        query: &Query,
        node: &WhereNode,
        sql: &mut String,
        params: &mut Vec<Value>,
    ) {
        match node {
            WhereNode::Cond { column, op } => {
                self.compile_op(Self::render_column(query, column), op, sql, params);
            }
            WhereNode::And(children) => {
                if children.is_empty() {
                    sql.push_str("1=1");
                    return;
                }
                sql.push('(');
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(" AND ");
                    }
                    self.compile_where_node(query, child, sql, params);
                }
                sql.push(')');
            }
            WhereNode::Or(children) => {
                if children.is_empty() {
                    sql.push_str("1=0");
                    return;
                }
                sql.push('(');
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(" OR ");
                    }
                    self.compile_where_node(query, child, sql, params);
                }
                sql.push(')');
            }
            WhereNode::Not(inner) => {
                sql.push_str("NOT (");
                self.compile_where_node(query, inner, sql, params);
                sql.push(')');
            }
        }
    }

    fn push_param(self, value: Value, params: &mut Vec<Value>) -> String {
        params.push(value);
        self.placeholder(params.len())
    }

    fn like(
        self,
        column: &str,
        pattern: String,
        case_insensitive: bool,
        sql: &mut String,
        params: &mut Vec<Value>,
    ) {
        let ph = self.push_param(Value::String(pattern), params);
        if case_insensitive {
            sql.push_str(&format!("LOWER({column}) LIKE LOWER({ph}) ESCAPE '\\'"));
        } else {
            sql.push_str(&format!("{column} LIKE {ph} ESCAPE '\\'"));
        }
    }

    fn compile_op(self, column: String, op: &ResolvedOp, sql: &mut String, params: &mut Vec<Value>) {
        match op {
            ResolvedOp::Exact(val) => {
                if val.is_null() {
                    sql.push_str(&format!("{column} IS NULL"));
                } else {
                    let ph = self.push_param(val.clone(), params);
                    sql.push_str(&format!("{column} = {ph}"));
                }
            }
            ResolvedOp::IExact(val) => {
                self.like(&column, escape_like(val), true, sql, params);
            }
            ResolvedOp::Contains(val) => {
                self.like(&column, format!("%{}%", escape_like(val)), false, sql, params);
            }
            ResolvedOp::IContains(val) => {
                self.like(&column, format!("%{}%", escape_like(val)), true, sql, params);
            }
            ResolvedOp::StartsWith(val) => {
                self.like(&column, format!("{}%", escape_like(val)), false, sql, params);
            }
            ResolvedOp::IStartsWith(val) => {
                self.like(&column, format!("{}%", escape_like(val)), true, sql, params);
            }
            ResolvedOp::EndsWith(val) => {
                self.like(&column, format!("%{}", escape_like(val)), false, sql, params);
            }
            ResolvedOp::IEndsWith(val) => {
                self.like(&column, format!("%{}", escape_like(val)), true, sql, params);
            }
            ResolvedOp::In(vals) => {
                if vals.is_empty() {
                    sql.push_str("1=0");
                    return;
                }
                let placeholders: Vec<String> = vals
                    .iter()
                    .map(|v| self.push_param(v.clone(), params))
                    .collect();
                sql.push_str(&format!("{column} IN ({})", placeholders.join(", ")));
            }
            ResolvedOp::Gt(val) => {
                let ph = self.push_param(val.clone(), params);
                sql.push_str(&format!("{column} > {ph}"));
            }
            ResolvedOp::Gte(val) => {
                let ph = self.push_param(val.clone(), params);
                sql.push_str(&format!("{column} >= {ph}"));
            }
            ResolvedOp::Lt(val) => {
                let ph = self.push_param(val.clone(), params);
                sql.push_str(&format!("{column} < {ph}"));
            }
            ResolvedOp::Lte(val) => {
                let ph = self.push_param(val.clone(), params);
                sql.push_str(&format!("{column} <= {ph}"));
            }
            ResolvedOp::IsNull(is_null) => {
                if *is_null {
                    sql.push_str(&format!("{column} IS NULL"));
                } else {
                    sql.push_str(&format!("{column} IS NOT NULL"));
                }
            }
            ResolvedOp::IsEmpty { empty, field_type } => {
                let test = match field_type {
                    t if t.is_textual() => format!("({column} IS NULL OR {column} = '')"),
                    FieldType::Json => format!(
                        "({column} IS NULL OR {column} = 'null' OR {column} = '{{}}' OR {column} = '[]')"
                    ),
                    FieldType::List => format!("({column} IS NULL OR {column} = '[]')"),
                    _ => format!("{column} IS NULL"),
                };
                if *empty {
                    sql.push_str(&test);
                } else {
                    sql.push_str(&format!("NOT {test}"));
                }
            }
            ResolvedOp::Range(low, high) => {
                let ph_low = self.push_param(low.clone(), params);
                let ph_high = self.push_param(high.clone(), params);
                sql.push_str(&format!("{column} BETWEEN {ph_low} AND {ph_high}"));
            }
        }
    }

    /// Compiles an INSERT statement.
    pub fn compile_insert(
        self,
        schema: Option<&str>,
        table: &str,
        fields: &[(&str, Value)],
    ) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let columns: Vec<String> = fields.iter().map(|(n, _)| format!("\"{n}\"")).collect();
        let placeholders: Vec<String> = fields
            .iter()
            .map(|(_, v)| self.push_param(v.clone(), &mut params))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            Self::quote_table(schema, table),
            columns.join(", "),
            placeholders.join(", ")
        );
        (sql, params)
    }

    /// Compiles an UPDATE statement over the given WHERE tree.
    pub fn compile_update(
        self,
        query: &Query,
        fields: &[(&str, Value)],
    ) -> OrmResult<(String, Vec<Value>)> {
        if !query.joins.is_empty() {
            return Err(OrmError::QuerySet(
                "update() cannot span related tables".to_string(),
            ));
        }
        let mut params = Vec::new();
        let assignments: Vec<String> = fields
            .iter()
            .map(|(n, v)| {
                let ph = self.push_param(v.clone(), &mut params);
                format!("\"{n}\" = {ph}")
            })
            .collect();
        let mut sql = format!(
            "UPDATE {} SET {}",
            Self::quote_table(query.schema.as_deref(), &query.table),
            assignments.join(", ")
        );
        sql.push_str(" WHERE ");
        let where_clause = query
            .where_clause
            .clone()
            .unwrap_or(WhereNode::And(Vec::new()));
        self.compile_where_node(query, &where_clause, &mut sql, &mut params);
        Ok((sql, params))
    }

    /// Compiles a DELETE statement over the given WHERE tree.
    pub fn compile_delete(self, query: &Query) -> OrmResult<(String, Vec<Value>)> {
        if !query.joins.is_empty() {
            return Err(OrmError::QuerySet(
                "delete() cannot span related tables".to_string(),
            ));
        }
        let mut params = Vec::new();
        let mut sql = format!(
            "DELETE FROM {}",
            Self::quote_table(query.schema.as_deref(), &query.table)
        );
        sql.push_str(" WHERE ");
        let where_clause = query
            .where_clause
            .clone()
            .unwrap_or(WhereNode::And(Vec::new()));
        self.compile_where_node(query, &where_clause, &mut sql, &mut params);
        Ok((sql, params))
    }

    /// Compiles a COUNT over the query (wrapping compound queries whole).
    pub fn compile_count(self, query: &Query) -> OrmResult<(String, Vec<Value>)> {
        let mut inner = query.clone();
        inner.order_by = Vec::new();
        inner.limit = None;
        inner.offset = None;
        let (inner_sql, params) = self.compile_select(&inner)?;
        Ok((
            format!("SELECT COUNT(*) AS \"count\" FROM ({inner_sql}) AS \"counted\""),
            params,
        ))
    }

    /// Compiles an EXISTS probe.
    pub fn compile_exists(self, query: &Query) -> OrmResult<(String, Vec<Value>)> {
        let mut inner = query.clone();
        inner.order_by = Vec::new();
        inner.limit = Some(1);
        inner.offset = None;
        let (inner_sql, params) = self.compile_select(&inner)?;
        Ok((
            format!("SELECT EXISTS({inner_sql}) AS \"exists\""),
            params,
        ))
    }
}
