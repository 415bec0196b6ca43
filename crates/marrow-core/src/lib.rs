//! # marrow-core
//!
//! Error types and logging integration for the marrow ORM. This crate has no
//! internal dependencies and provides the foundation for the other crates.
//!
//! ## Modules
//!
//! - [`error`] - The [`OrmError`] enum and [`OrmResult`] alias
//! - [`logging`] - Tracing-based logging integration

pub mod error;
pub mod logging;

// Re-export the most commonly used types at the crate root.
pub use error::{OrmError, OrmResult};
