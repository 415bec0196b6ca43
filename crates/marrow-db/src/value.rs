//! ORM value types for representing database values in a backend-agnostic way.
//!
//! The [`Value`] enum is the core type used throughout the ORM for field
//! values, query parameters, and result cells. [`Row`] is the generic result
//! row produced by backends, and [`Arg`] wraps a filter's right-hand side so
//! it can be either a concrete value or a deferred (possibly async) callable
//! resolved just before execution.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use marrow_core::{OrmError, OrmResult};

/// A backend-agnostic representation of a database value.
///
/// `Value` is the universal type used to pass data between the ORM layer and
/// database backends. It covers the standard SQL data types and maps to the
/// appropriate native types for each backend.
///
/// # Examples
///
/// ```
/// use marrow_db::value::Value;
///
/// let v = Value::from(42_i64);
/// assert_eq!(v, Value::Int(42));
///
/// let v = Value::from("hello");
/// assert_eq!(v, Value::String("hello".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    /// SQL NULL.
    Null,
    /// A boolean value.
    Bool(bool),
    /// A 64-bit signed integer.
    Int(i64),
    /// A 64-bit floating-point number.
    Float(f64),
    /// A UTF-8 string.
    String(String),
    /// Raw binary data.
    Bytes(Vec<u8>),
    /// A date without time.
    Date(chrono::NaiveDate),
    /// A date and time without timezone.
    DateTime(chrono::NaiveDateTime),
    /// A date and time with UTC timezone.
    DateTimeTz(chrono::DateTime<chrono::Utc>),
    /// A time without date.
    Time(chrono::NaiveTime),
    /// A UUID value.
    Uuid(uuid::Uuid),
    /// A JSON value.
    Json(serde_json::Value),
    /// A list of values (for IN clauses and list fields).
    List(Vec<Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Date(d) => write!(f, "{d}"),
            Self::DateTime(dt) => write!(f, "{dt}"),
            Self::DateTimeTz(dt) => write!(f, "{dt}"),
            Self::Time(t) => write!(f, "{t}"),
            Self::Uuid(u) => write!(f, "{u}"),
            Self::Json(j) => write!(f, "{j}"),
            Self::List(vals) => {
                write!(f, "[")?;
                for (i, v) in vals.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<chrono::NaiveDate> for Value {
    fn from(v: chrono::NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<chrono::NaiveDateTime> for Value {
    fn from(v: chrono::NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for Value {
    fn from(v: chrono::DateTime<chrono::Utc>) -> Self {
        Self::DateTimeTz(v)
    }
}

impl From<chrono::NaiveTime> for Value {
    fn from(v: chrono::NaiveTime) -> Self {
        Self::Time(v)
    }
}

impl From<uuid::Uuid> for Value {
    fn from(v: uuid::Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl Value {
    /// Returns `true` if this value is `Null`.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Attempts to extract a boolean value.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Attempts to extract an integer value.
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Attempts to extract a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Trait for converting a [`Value`] to a concrete Rust type.
pub trait FromValue: Sized {
    /// Attempts to convert a value reference to this type.
    fn from_value(value: &Value) -> OrmResult<Self>;
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> OrmResult<Self> {
        match value {
            Value::Int(i) => Ok(*i),
            _ => Err(OrmError::Database(format!("Expected Int, got {value:?}"))),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> OrmResult<Self> {
        match value {
            Value::Int(i) => Self::try_from(*i)
                .map_err(|_| OrmError::Database(format!("Int {i} out of i32 range"))),
            _ => Err(OrmError::Database(format!("Expected Int, got {value:?}"))),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> OrmResult<Self> {
        match value {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as Self),
            _ => Err(OrmError::Database(format!("Expected Float, got {value:?}"))),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> OrmResult<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            _ => Err(OrmError::Database(format!("Expected Bool, got {value:?}"))),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> OrmResult<Self> {
        match value {
            Value::String(s) => Ok(s.clone()),
            _ => Err(OrmError::Database(format!(
                "Expected String, got {value:?}"
            ))),
        }
    }
}

impl FromValue for uuid::Uuid {
    fn from_value(value: &Value) -> OrmResult<Self> {
        match value {
            Value::Uuid(u) => Ok(*u),
            Value::String(s) => Self::parse_str(s)
                .map_err(|e| OrmError::Database(format!("Invalid UUID '{s}': {e}"))),
            _ => Err(OrmError::Database(format!("Expected Uuid, got {value:?}"))),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> OrmResult<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> OrmResult<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

/// A generic result row returned by database backends.
///
/// Column order matches the SELECT list; related columns eagerly joined via
/// `select_related` are aliased with their relation-path prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a new row from column names and values.
    ///
    /// # Panics
    ///
    /// Panics if the number of columns does not match the number of values.
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        assert_eq!(
            columns.len(),
            values.len(),
            "Row column count must match value count"
        );
        Self { columns, values }
    }

    /// Returns the column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Gets a typed value by column name.
    ///
    /// Missing columns resolve as `Null` so that rows produced under an
    /// `only`/`defer` projection still materialize; [`FromValue`] decides
    /// whether `Null` is acceptable for the requested type.
    pub fn get<T: FromValue>(&self, column: &str) -> OrmResult<T> {
        match self.value(column) {
            Some(v) => T::from_value(v),
            None => T::from_value(&Value::Null),
        }
    }

    /// Gets a typed value by column index.
    pub fn get_by_index<T: FromValue>(&self, idx: usize) -> OrmResult<T> {
        let value = self.values.get(idx).ok_or_else(|| {
            OrmError::Database(format!(
                "Column index {idx} out of bounds (row has {} columns)",
                self.values.len()
            ))
        })?;
        T::from_value(value)
    }

    /// Returns a reference to the raw value at the given column name.
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| &self.values[idx])
    }

    /// Returns `true` if the row contains the given column.
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Splits off the columns whose names start with `prefix` followed by a
    /// dot, stripping the prefix. Used to peel eagerly joined relation
    /// columns out of a combined result row.
    pub fn split_prefix(&self, prefix: &str) -> Self {
        let needle = format!("{prefix}.");
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for (c, v) in self.columns.iter().zip(&self.values) {
            if let Some(rest) = c.strip_prefix(&needle) {
                columns.push(rest.to_string());
                values.push(v.clone());
            }
        }
        Self { columns, values }
    }

    /// Returns the columns that carry no relation-path prefix.
    pub fn base_columns(&self) -> Self {
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for (c, v) in self.columns.iter().zip(&self.values) {
            if !c.contains('.') {
                columns.push(c.clone());
                values.push(v.clone());
            }
        }
        Self { columns, values }
    }
}

/// The future type produced by a lazy filter argument.
pub type LazyFuture = Pin<Box<dyn Future<Output = OrmResult<Value>> + Send>>;

/// A deferred right-hand side: an async callable whose return value is
/// substituted into the filter at execution time.
pub type LazyValue = Arc<dyn Fn() -> LazyFuture + Send + Sync>;

/// A filter argument: either a concrete value or a deferred callable.
///
/// Deferred arguments let a filter's right-hand side be computed at execution
/// time (e.g. "now", or a value fetched from elsewhere). They are awaited
/// sequentially while the statement is being compiled for execution.
#[derive(Clone)]
pub enum Arg {
    /// A concrete value, ready to bind.
    Value(Value),
    /// A callable resolved (awaited) at execution time.
    Lazy(LazyValue),
}

impl Arg {
    /// Wraps an async closure as a lazy argument.
    pub fn lazy<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = OrmResult<Value>> + Send + 'static,
    {
        Self::Lazy(Arc::new(move || Box::pin(f())))
    }

    /// Resolves this argument to a concrete value, awaiting if deferred.
    pub async fn resolve(&self) -> OrmResult<Value> {
        match self {
            Self::Value(v) => Ok(v.clone()),
            Self::Lazy(f) => f().await,
        }
    }

    /// Returns the concrete value, erroring if the argument is still lazy.
    ///
    /// The synchronous SQL inspection path cannot await; callers must
    /// resolve lazy arguments first.
    pub fn expect_value(&self) -> OrmResult<&Value> {
        match self {
            Self::Value(v) => Ok(v),
            Self::Lazy(_) => Err(OrmError::QuerySet(
                "lazy filter argument not resolved; execute the queryset asynchronously"
                    .to_string(),
            )),
        }
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Lazy(_) => f.write_str("Lazy(..)"),
        }
    }
}

impl PartialEq for Arg {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Value(a), Self::Value(b)) => a == b,
            _ => false,
        }
    }
}

impl<T: Into<Value>> From<T> for Arg {
    fn from(v: T) -> Self {
        Self::Value(v.into())
    }
}
