//! Field definitions and relation metadata for the ORM.
//!
//! [`FieldDef`] captures everything the query engine needs to know about a
//! model field: its column, nullability, secrecy, semantic type (which drives
//! the `isempty` lookup policy), and — for relational fields — a
//! [`RelationDef`] describing how to reach the related model's table.
//!
//! The query engine routes by field *name* and relation *shape* only; value
//! validation is the model layer's concern.

use crate::model::ModelMeta;

/// The semantic type of a model field.
///
/// Determines the SQL column type and, for the `isempty` lookup, what
/// "empty" means (`NULL`, empty string, empty JSON, or zero-length list).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Auto-incrementing 64-bit integer primary key.
    BigAuto,
    /// Variable-length string.
    Char,
    /// Unlimited-length text.
    Text,
    /// 64-bit signed integer.
    Integer,
    /// 64-bit floating-point number.
    Float,
    /// Boolean.
    Boolean,
    /// Date without time.
    Date,
    /// Date and time.
    DateTime,
    /// UUID.
    Uuid,
    /// JSON document.
    Json,
    /// Homogeneous list of values.
    List,
    /// Raw binary data.
    Binary,
}

impl FieldType {
    /// Returns `true` if `isempty` on this type also matches the empty
    /// string (textual types).
    pub const fn is_textual(self) -> bool {
        matches!(self, Self::Char | Self::Text)
    }
}

/// The shape of a relational field.
#[derive(Debug, Clone)]
pub enum RelationKind {
    /// Many-to-one: this model holds a column referencing the target's
    /// primary key.
    ForeignKey {
        /// The local foreign-key column.
        column: &'static str,
    },
    /// One-to-one: a unique foreign key.
    OneToOne {
        /// The local foreign-key column.
        column: &'static str,
    },
    /// The reverse side of a foreign key: the target model holds the column.
    ReverseForeignKey {
        /// The column on the target's table referencing this model's
        /// primary key.
        related_column: &'static str,
    },
    /// Many-to-many via an intermediate ("through") table.
    ManyToMany {
        /// The intermediate table name.
        through_table: &'static str,
        /// The through-table column referencing this model's primary key.
        source_column: &'static str,
        /// The through-table column referencing the target's primary key.
        target_column: &'static str,
    },
}

/// Metadata describing a traversable relation on a model.
///
/// The target model's metadata is reached through a function pointer so
/// relation chains resolve without a global registry: model metas are
/// `'static` (built in `LazyLock`s), and a plain `fn` keeps `RelationDef`
/// constructible in const-adjacent contexts.
#[derive(Debug, Clone)]
pub struct RelationDef {
    /// The relation shape.
    pub kind: RelationKind,
    /// Accessor for the related model's metadata.
    pub target: fn() -> &'static ModelMeta,
}

impl RelationDef {
    /// Returns the related model's metadata.
    pub fn target_meta(&self) -> &'static ModelMeta {
        (self.target)()
    }
}

/// Complete metadata about a single model field.
///
/// Built with a fluent builder:
///
/// ```
/// use marrow_db::fields::{FieldDef, FieldType};
///
/// let field = FieldDef::new("email", FieldType::Char).null().secret();
/// assert!(field.null);
/// assert!(field.secret);
/// ```
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// The field (and column) name.
    pub name: &'static str,
    /// The semantic type.
    pub field_type: FieldType,
    /// Whether the column is nullable.
    pub null: bool,
    /// Whether this field is the primary key.
    pub primary_key: bool,
    /// Whether this field is excluded when secrets-exclusion is requested.
    pub secret: bool,
    /// Relation metadata, present only on relational fields.
    pub relation: Option<RelationDef>,
}

impl FieldDef {
    /// Creates a plain (non-relational) field.
    pub const fn new(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            null: false,
            primary_key: false,
            secret: false,
            relation: None,
        }
    }

    /// Creates a forward foreign-key field.
    pub const fn foreign_key(
        name: &'static str,
        column: &'static str,
        target: fn() -> &'static ModelMeta,
    ) -> Self {
        Self {
            name,
            field_type: FieldType::Integer,
            null: false,
            primary_key: false,
            secret: false,
            relation: Some(RelationDef {
                kind: RelationKind::ForeignKey { column },
                target,
            }),
        }
    }

    /// Creates a one-to-one field.
    pub const fn one_to_one(
        name: &'static str,
        column: &'static str,
        target: fn() -> &'static ModelMeta,
    ) -> Self {
        Self {
            name,
            field_type: FieldType::Integer,
            null: false,
            primary_key: false,
            secret: false,
            relation: Some(RelationDef {
                kind: RelationKind::OneToOne { column },
                target,
            }),
        }
    }

    /// Creates a reverse foreign-key accessor.
    pub const fn reverse_foreign_key(
        name: &'static str,
        related_column: &'static str,
        target: fn() -> &'static ModelMeta,
    ) -> Self {
        Self {
            name,
            field_type: FieldType::Integer,
            null: false,
            primary_key: false,
            secret: false,
            relation: Some(RelationDef {
                kind: RelationKind::ReverseForeignKey { related_column },
                target,
            }),
        }
    }

    /// Creates a many-to-many accessor through an intermediate table.
    pub const fn many_to_many(
        name: &'static str,
        through_table: &'static str,
        source_column: &'static str,
        target_column: &'static str,
        target: fn() -> &'static ModelMeta,
    ) -> Self {
        Self {
            name,
            field_type: FieldType::Integer,
            null: false,
            primary_key: false,
            secret: false,
            relation: Some(RelationDef {
                kind: RelationKind::ManyToMany {
                    through_table,
                    source_column,
                    target_column,
                },
                target,
            }),
        }
    }

    /// Marks the field nullable.
    #[must_use]
    pub const fn null(mut self) -> Self {
        self.null = true;
        self
    }

    /// Marks the field as the primary key.
    #[must_use]
    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Marks the field secret (excluded under secrets-exclusion).
    #[must_use]
    pub const fn secret(mut self) -> Self {
        self.secret = true;
        self
    }

    /// Returns `true` if this field is a traversable relation.
    pub const fn is_relation(&self) -> bool {
        self.relation.is_some()
    }

    /// Returns the column name holding this field's data on the model's own
    /// table, or `None` for accessors without a local column (reverse FK,
    /// many-to-many).
    pub fn local_column(&self) -> Option<&'static str> {
        match &self.relation {
            None => Some(self.name),
            Some(rel) => match rel.kind {
                RelationKind::ForeignKey { column } | RelationKind::OneToOne { column } => {
                    Some(column)
                }
                RelationKind::ReverseForeignKey { .. } | RelationKind::ManyToMany { .. } => None,
            },
        }
    }
}
