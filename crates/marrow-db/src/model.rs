//! Model trait and metadata for the ORM.
//!
//! The [`Model`] trait is the core abstraction all ORM models implement. It
//! provides access to metadata, field values, and construction from database
//! rows. [`ModelMeta`] is the field-name → field-metadata mapping the query
//! engine resolves lookup paths against.

use crate::fields::FieldDef;
use crate::value::{Row, Value};
use marrow_core::{OrmError, OrmResult};

/// Static metadata for a model: its table and its fields.
#[derive(Debug, Clone)]
pub struct ModelMeta {
    /// The database table name (unqualified; schema is applied at compile
    /// time from the active tenant or an explicit override).
    pub table: &'static str,
    /// All fields, including relational accessors.
    pub fields: Vec<FieldDef>,
}

impl ModelMeta {
    /// Looks up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Returns the primary-key field.
    ///
    /// # Panics
    ///
    /// Panics if the model declares no primary key; every concrete model
    /// must have one.
    pub fn pk_field(&self) -> &FieldDef {
        self.fields
            .iter()
            .find(|f| f.primary_key)
            .expect("model has no primary key field")
    }

    /// Returns the names of the concrete (non-relational-accessor) columns.
    pub fn column_names(&self) -> Vec<&'static str> {
        self.fields
            .iter()
            .filter_map(FieldDef::local_column)
            .collect()
    }
}

/// The core trait for all ORM models.
///
/// # Examples
///
/// ```
/// use marrow_db::model::{Model, ModelMeta};
/// use marrow_db::fields::{FieldDef, FieldType};
/// use marrow_db::value::{Row, Value};
/// use marrow_core::OrmResult;
///
/// #[derive(Debug, Clone)]
/// struct Article {
///     id: i64,
///     title: String,
/// }
///
/// impl Model for Article {
///     fn meta() -> &'static ModelMeta {
///         use std::sync::LazyLock;
///         static META: LazyLock<ModelMeta> = LazyLock::new(|| ModelMeta {
///             table: "blog_article",
///             fields: vec![
///                 FieldDef::new("id", FieldType::BigAuto).primary_key(),
///                 FieldDef::new("title", FieldType::Char),
///             ],
///         });
///         &META
///     }
///
///     fn pk(&self) -> Option<Value> {
///         (self.id != 0).then(|| Value::Int(self.id))
///     }
///     fn set_pk(&mut self, value: Value) {
///         if let Value::Int(id) = value { self.id = id; }
///     }
///     fn field_values(&self) -> Vec<(&'static str, Value)> {
///         vec![
///             ("id", Value::Int(self.id)),
///             ("title", Value::String(self.title.clone())),
///         ]
///     }
///     fn from_row(row: &Row) -> OrmResult<Self> {
///         Ok(Self {
///             id: row.get("id")?,
///             title: row.get::<Option<String>>("title")?.unwrap_or_default(),
///         })
///     }
/// }
/// ```
pub trait Model: Send + Sync + Sized + 'static {
    /// Returns the static metadata for this model type.
    fn meta() -> &'static ModelMeta;

    /// Returns the database table name.
    fn table_name() -> &'static str {
        Self::meta().table
    }

    /// Returns the name of the primary key field.
    fn pk_field_name() -> &'static str {
        Self::meta().pk_field().name
    }

    /// Returns the primary key value, or `None` if unsaved.
    fn pk(&self) -> Option<Value>;

    /// Sets the primary key value on this instance (used after INSERT).
    fn set_pk(&mut self, value: Value);

    /// Returns all field name-value pairs for this instance.
    fn field_values(&self) -> Vec<(&'static str, Value)>;

    /// Returns field name-value pairs excluding the primary key.
    fn non_pk_field_values(&self) -> Vec<(&'static str, Value)> {
        let pk_name = Self::pk_field_name();
        self.field_values()
            .into_iter()
            .filter(|(name, _)| *name != pk_name)
            .collect()
    }

    /// Constructs a model instance from a database row.
    ///
    /// Rows produced under an `only`/`defer` projection may be missing
    /// columns; implementations should tolerate that (e.g. via
    /// `Option<T>` gets) so a deferred field materializes as its default
    /// until [`refresh_model`](crate::executor::refresh_model) reloads the
    /// full row.
    fn from_row(row: &Row) -> OrmResult<Self>;

    /// Returns the primary key, erroring when the instance is unsaved.
    fn require_pk(&self) -> OrmResult<Value> {
        self.pk().ok_or_else(|| {
            OrmError::QuerySet(format!(
                "{} instance has no primary key set",
                Self::table_name()
            ))
        })
    }
}
