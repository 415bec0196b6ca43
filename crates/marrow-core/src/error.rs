//! Error types for the marrow ORM.
//!
//! This module provides the [`OrmError`] enum covering every failure class
//! the query engine can produce, from chain-call misuse through database
//! failures. Each kind is a distinct variant so callers can branch on it —
//! for example, catching [`OrmError::DoesNotExist`] is exactly how
//! `get_or_create` is built on top of `get`.

use thiserror::Error;

/// The primary error type for the marrow ORM.
///
/// Variants fall into four groups:
///
/// - **Usage/configuration errors** ([`QuerySet`](Self::QuerySet),
///   [`Configuration`](Self::Configuration), [`InvalidPage`](Self::InvalidPage))
///   are raised synchronously at the offending chain call or paginator
///   construction, before any I/O.
/// - **Lookup resolution errors** ([`UnknownField`](Self::UnknownField)) are
///   raised when a field path is resolved against model metadata, and are
///   never wrapped so callers can tell "bad path" from "bad value".
/// - **Cardinality errors** ([`DoesNotExist`](Self::DoesNotExist),
///   [`MultipleObjectsReturned`](Self::MultipleObjectsReturned)) come from
///   terminal `get()` calls.
/// - **Database errors** ([`Database`](Self::Database),
///   [`Operational`](Self::Operational)) propagate from the backend verbatim;
///   the ORM never retries, suppresses, or translates them.
#[derive(Error, Debug)]
pub enum OrmError {
    /// QuerySet misuse: conflicting `only`/`defer`, a bad `values_list`
    /// shape, colliding prefetch targets, or incompatible set-operation
    /// operands.
    #[error("QuerySet error: {0}")]
    QuerySet(String),

    /// An unknown field or relation segment in a lookup, ordering, or
    /// cursor path.
    #[error("Unknown field: {0}")]
    UnknownField(String),

    /// `get()` matched zero rows.
    #[error("Object does not exist: {0}")]
    DoesNotExist(String),

    /// `get()` matched more than one row.
    #[error("Multiple objects returned: {0}")]
    MultipleObjectsReturned(String),

    /// An invalid page number was passed to a paginator.
    #[error("Invalid page: {0}")]
    InvalidPage(String),

    /// A paginator precondition was violated at construction time
    /// (unordered queryset, nullable cursor field).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A database statement failed (integrity violation, syntax, binding).
    #[error("Database error: {0}")]
    Database(String),

    /// The database connection itself failed (open, I/O).
    #[error("Operational error: {0}")]
    Operational(String),
}

/// A convenient result alias used throughout the marrow crates.
pub type OrmResult<T> = Result<T, OrmError>;
