//! Query construction and compilation.
//!
//! The pipeline runs in four stages: [`path`] parses and resolves lookup
//! strings against model metadata, [`clause`] composes boolean filter
//! expressions, [`queryset`] accumulates a lazy query description, and
//! [`compiler`] turns the resolved AST into parameterized SQL.

pub mod clause;
pub mod compiler;
pub mod path;
pub mod queryset;

pub use clause::{and_, not_, or_, Criterion, Q};
pub use compiler::{CompoundType, Dialect, Query, SqlCompiler};
pub use path::{FieldPath, OperatorSuffix};
pub use queryset::{Fetched, Prefetch, QuerySet};
