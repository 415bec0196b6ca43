//! Schema-per-tenant routing.
//!
//! Multi-tenant deployments give each tenant its own schema; the query
//! engine qualifies every table with the schema in effect when a statement
//! is compiled. The schema is resolved in two steps:
//!
//! 1. an explicit `QuerySet::using_schema(..)` override, if present;
//! 2. otherwise the ambient *active schema* set here.
//!
//! The explicit override always wins. Schema creation and teardown are the
//! provisioning layer's concern, not this module's.

use std::sync::{LazyLock, RwLock};

static ACTIVE_SCHEMA: LazyLock<RwLock<Option<String>>> = LazyLock::new(|| RwLock::new(None));

/// Sets the ambient active schema for subsequent query compilation.
///
/// Pass `None` to clear it (queries fall back to the connection's default
/// schema).
pub fn set_active_schema(schema: Option<&str>) {
    let mut guard = ACTIVE_SCHEMA
        .write()
        .expect("active schema lock poisoned");
    *guard = schema.map(str::to_string);
}

/// Returns the ambient active schema, if any.
pub fn active_schema() -> Option<String> {
    ACTIVE_SCHEMA
        .read()
        .expect("active schema lock poisoned")
        .clone()
}

/// A guard that activates a schema for its lifetime and restores the
/// previous one on drop.
///
/// # Examples
///
/// ```
/// use marrow_db::tenancy::{active_schema, SchemaGuard};
///
/// {
///     let _guard = SchemaGuard::activate("tenant_a");
///     assert_eq!(active_schema().as_deref(), Some("tenant_a"));
/// }
/// assert_eq!(active_schema(), None);
/// ```
pub struct SchemaGuard {
    previous: Option<String>,
}

impl SchemaGuard {
    /// Activates `schema`, remembering the previously active one.
    pub fn activate(schema: &str) -> Self {
        let previous = active_schema();
        set_active_schema(Some(schema));
        Self { previous }
    }
}

impl Drop for SchemaGuard {
    fn drop(&mut self) {
        set_active_schema(self.previous.as_deref());
    }
}
