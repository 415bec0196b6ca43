//! # marrow-db
//!
//! The ORM core for marrow. Provides the [`Model`](model::Model) trait for
//! defining database models, the lazy [`QuerySet`](query::QuerySet) for
//! building and executing queries, the `field__relation__operator` lookup
//! grammar, and the paginator family
//! ([`Paginator`](pagination::Paginator) /
//! [`CursorPaginator`](pagination::CursorPaginator)).
//!
//! ## Architecture
//!
//! Everything is lazy until a terminal method runs. A
//! [`QuerySet`](query::QuerySet) accumulates filters (composable
//! [`Q`](query::Q) expressions over lookup paths), ordering, projection,
//! and set operations; the first terminal call resolves the lookup paths
//! against model metadata, lowers everything to a
//! [`Query`](query::Query) AST, and hands the
//! [`SqlCompiler`](query::SqlCompiler)'s parameterized SQL to a
//! [`DbExecutor`](executor::DbExecutor).
//!
//! ## Module Overview
//!
//! - [`model`] - The [`Model`](model::Model) trait and [`ModelMeta`](model::ModelMeta)
//! - [`fields`] - Field and relation definitions ([`FieldDef`](fields::FieldDef))
//! - [`value`] - The backend-agnostic [`Value`](value::Value) enum and lazy [`Arg`](value::Arg)
//! - [`query`] - Lookup resolution, Q expressions, the QuerySet, and SQL compilation
//! - [`executor`] - The backend seam and single-instance persistence
//! - [`pagination`] - Numbered and cursor paginators
//! - [`tenancy`] - The ambient schema for schema-per-tenant routing

// These clippy lints are intentionally allowed for the ORM crate:
// - result_large_err: OrmError is the crate error type and is used consistently
// - too_many_lines: the compiler and prefetch engine are large match-heavy functions
// - format_push_string: format! with push_str is clearer than write! for SQL generation
// - doc_markdown: backtick requirements for documentation items are too strict
// - needless_pass_by_value: chain methods consume self by design
#![allow(clippy::result_large_err)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::format_push_string)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::use_self)]
#![allow(clippy::match_same_arms)]
// significant_drop_tightening: false positives around cache Mutex guards
#![allow(clippy::significant_drop_tightening)]

pub mod executor;
pub mod fields;
pub mod model;
pub mod pagination;
pub mod query;
pub mod tenancy;
pub mod value;

pub use executor::{create, delete, refresh_model, save, DbExecutor, ModelLifecycleHooks};
pub use model::{Model, ModelMeta};
pub use pagination::{Cursor, CursorPage, CursorPaginator, Page, PageItem, Paginator};
pub use query::{Fetched, Prefetch, Q, QuerySet};
pub use value::{Arg, Row, Value};

pub use marrow_core::{OrmError, OrmResult};
