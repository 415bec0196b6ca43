//! The lookup-path grammar: parsing and resolution.
//!
//! A lookup path is a string of the form `segment(__segment)*(__operator)?`.
//! Non-terminal segments traverse relations (foreign key, one-to-one,
//! reverse foreign key, many-to-many); the final segment names a column,
//! optionally followed by an operator suffix such as `gte` or `icontains`.
//!
//! Resolution walks the model-metadata chain, registering one join per
//! distinct relation path in a [`JoinPlan`]. Two lookups traversing the same
//! chain share the same join and alias.

use std::collections::HashMap;

use crate::fields::{FieldType, RelationKind};
use crate::model::ModelMeta;
use marrow_core::{OrmError, OrmResult};

/// The separator between path segments.
pub const PATH_SEPARATOR: &str = "__";

/// A lookup operator suffix.
///
/// Each variant maps to a column-expression builder in the compiler; the
/// enum replaces any reflection-style suffix probing with an explicit table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorSuffix {
    /// Equality (the implicit default).
    Exact,
    /// Case-insensitive equality.
    IExact,
    /// Substring match.
    Contains,
    /// Case-insensitive substring match.
    IContains,
    /// Membership test.
    In,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Prefix match.
    StartsWith,
    /// Case-insensitive prefix match.
    IStartsWith,
    /// Suffix match.
    EndsWith,
    /// Case-insensitive suffix match.
    IEndsWith,
    /// SQL NULL test.
    IsNull,
    /// Field-type-dependent emptiness test (NULL, empty string, empty
    /// JSON, or zero-length list).
    IsEmpty,
    /// Inclusive range test.
    Range,
}

impl OperatorSuffix {
    /// Parses an operator keyword, returning `None` for unknown words.
    pub fn parse(word: &str) -> Option<Self> {
        match word {
            "exact" => Some(Self::Exact),
            "iexact" => Some(Self::IExact),
            "contains" => Some(Self::Contains),
            "icontains" => Some(Self::IContains),
            "in" => Some(Self::In),
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            "startswith" => Some(Self::StartsWith),
            "istartswith" => Some(Self::IStartsWith),
            "endswith" => Some(Self::EndsWith),
            "iendswith" => Some(Self::IEndsWith),
            "isnull" => Some(Self::IsNull),
            "isempty" => Some(Self::IsEmpty),
            "range" => Some(Self::Range),
            _ => None,
        }
    }
}

/// A parsed lookup path: ordered segments plus an optional operator suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    /// The path segments, relation names first, column name last.
    pub segments: Vec<String>,
    /// The operator suffix, if present.
    pub operator: Option<OperatorSuffix>,
}

impl FieldPath {
    /// Parses a raw lookup string.
    ///
    /// The final segment is treated as an operator only when it matches a
    /// known keyword *and* at least one segment precedes it; a bare keyword
    /// like `"in"` is a column name.
    pub fn parse(raw: &str) -> OrmResult<Self> {
        let mut segments: Vec<String> = raw.split(PATH_SEPARATOR).map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(OrmError::UnknownField(format!(
                "malformed lookup path '{raw}'"
            )));
        }
        let operator = if segments.len() > 1 {
            OperatorSuffix::parse(segments.last().map(String::as_str).unwrap_or_default())
        } else {
            None
        };
        if operator.is_some() {
            segments.pop();
        }
        Ok(Self { segments, operator })
    }
}

/// A single join required to reach a related table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    /// The relation path this join serves (the dedup key).
    pub path: String,
    /// The joined table (unqualified; schema applied at compile time).
    pub table: &'static str,
    /// The alias the joined table is known by in the statement.
    pub alias: String,
    /// The alias on the left side of the ON condition (`None` = base table).
    pub left_alias: Option<String>,
    /// The left-side column of the ON condition.
    pub left_column: String,
    /// The right-side column (on the joined table).
    pub right_column: String,
}

/// An ordered, deduplicated set of joins keyed by relation path.
///
/// Resolving the same path twice never adds a duplicate join.
#[derive(Debug, Clone, Default)]
pub struct JoinPlan {
    joins: Vec<Join>,
    index: HashMap<String, usize>,
}

impl JoinPlan {
    /// Creates an empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a join unless one with the same path key is already present.
    pub fn add(&mut self, join: Join) {
        if !self.index.contains_key(&join.path) {
            self.index.insert(join.path.clone(), self.joins.len());
            self.joins.push(join);
        }
    }

    /// Merges another plan into this one, preserving idempotence.
    pub fn merge(&mut self, other: &Self) {
        for join in &other.joins {
            self.add(join.clone());
        }
    }

    /// Returns the joins in registration order.
    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    /// Returns `true` if the plan holds no joins.
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }
}

/// A resolved column reference: which alias (or the base table) and column
/// a lookup path landed on, plus the field metadata the compiler needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    /// The table alias, or `None` for the base table.
    pub table_alias: Option<String>,
    /// The column name.
    pub column: String,
    /// The field's semantic type (drives `isempty`).
    pub field_type: FieldType,
    /// Whether the column is nullable.
    pub null: bool,
}

/// The result of resolving a [`FieldPath`] against a model.
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    /// The column the path terminated on.
    pub column: ColumnRef,
    /// The operator suffix carried by the path.
    pub operator: Option<OperatorSuffix>,
    /// The joins required to reach the column, in traversal order.
    pub joins: Vec<Join>,
}

/// Resolves a parsed path against a model's metadata, descending relation
/// chains and accumulating joins keyed by the path-so-far.
///
/// Fails with [`OrmError::UnknownField`] when an intermediate segment is
/// neither a field nor a relation on the current model, or when a
/// non-terminal segment is a plain field.
pub fn resolve_path(meta: &'static ModelMeta, path: &FieldPath) -> OrmResult<ResolvedPath> {
    let mut current = meta;
    let mut joins = Vec::new();
    let mut prefix = String::new();
    let mut current_alias: Option<String> = None;

    for (i, segment) in path.segments.iter().enumerate() {
        let is_last = i + 1 == path.segments.len();
        let field = current.field(segment).ok_or_else(|| {
            OrmError::UnknownField(format!("'{segment}' on table '{}'", current.table))
        })?;

        match &field.relation {
            None => {
                if !is_last {
                    return Err(OrmError::UnknownField(format!(
                        "'{segment}' on table '{}' is not a relation",
                        current.table
                    )));
                }
                return Ok(ResolvedPath {
                    column: ColumnRef {
                        table_alias: current_alias,
                        column: segment.clone(),
                        field_type: field.field_type,
                        null: field.null,
                    },
                    operator: path.operator,
                    joins,
                });
            }
            Some(rel) => {
                let target = rel.target_meta();
                if !prefix.is_empty() {
                    prefix.push_str(PATH_SEPARATOR);
                }
                prefix.push_str(segment);
                let alias = prefix.clone();

                match &rel.kind {
                    RelationKind::ForeignKey { column } | RelationKind::OneToOne { column } => {
                        joins.push(Join {
                            path: alias.clone(),
                            table: target.table,
                            alias: alias.clone(),
                            left_alias: current_alias.clone(),
                            left_column: (*column).to_string(),
                            right_column: target.pk_field().name.to_string(),
                        });
                    }
                    RelationKind::ReverseForeignKey { related_column } => {
                        joins.push(Join {
                            path: alias.clone(),
                            table: target.table,
                            alias: alias.clone(),
                            left_alias: current_alias.clone(),
                            left_column: current.pk_field().name.to_string(),
                            right_column: (*related_column).to_string(),
                        });
                    }
                    RelationKind::ManyToMany {
                        through_table,
                        source_column,
                        target_column,
                    } => {
                        // The through hop and the target hop dedup as a unit
                        // under the same relation path.
                        let through_alias = format!("{alias}:through");
                        joins.push(Join {
                            path: through_alias.clone(),
                            table: through_table,
                            alias: through_alias.clone(),
                            left_alias: current_alias.clone(),
                            left_column: current.pk_field().name.to_string(),
                            right_column: (*source_column).to_string(),
                        });
                        joins.push(Join {
                            path: alias.clone(),
                            table: target.table,
                            alias: alias.clone(),
                            left_alias: Some(through_alias),
                            left_column: (*target_column).to_string(),
                            right_column: target.pk_field().name.to_string(),
                        });
                    }
                }

                if is_last {
                    // A relation as the terminal segment compares against
                    // the related table's primary key.
                    let pk = target.pk_field();
                    return Ok(ResolvedPath {
                        column: ColumnRef {
                            table_alias: Some(alias),
                            column: pk.name.to_string(),
                            field_type: pk.field_type,
                            null: pk.null,
                        },
                        operator: path.operator,
                        joins,
                    });
                }

                current = target;
                current_alias = Some(alias);
            }
        }
    }

    Err(OrmError::UnknownField("empty lookup path".to_string()))
}

/// Resolves a plain column path (no operator allowed), as used by
/// `order_by` and cursor fields.
pub fn resolve_order_column(meta: &'static ModelMeta, name: &str) -> OrmResult<ResolvedPath> {
    let path = FieldPath::parse(name)?;
    if path.operator.is_some() {
        return Err(OrmError::UnknownField(format!(
            "operator suffix not allowed in ordering field '{name}'"
        )));
    }
    resolve_path(meta, &path)
}

/// Escapes SQL LIKE wildcard characters in a literal so `%` and `_` in data
/// match literally. Paired with `ESCAPE '\'` in the generated pattern.
pub fn escape_like(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for ch in literal.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
