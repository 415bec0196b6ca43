//! Logging integration for the marrow ORM.
//!
//! Provides helpers for configuring [`tracing`]-based logging and for
//! creating per-query spans so statement compilation and execution show up
//! under one span in application logs.

/// Sets up the global tracing subscriber.
///
/// The filter is read from `RUST_LOG`, falling back to the given default
/// level (e.g. `"info"`). With `pretty` a human-readable format is used;
/// otherwise structured JSON for production log shipping.
pub fn setup_logging(default_level: &str, pretty: bool) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if pretty {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .pretty()
            .try_init()
            .ok();
    } else {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .try_init()
            .ok();
    }
}

/// Creates a tracing span for one database query.
///
/// # Examples
///
/// ```
/// use marrow_core::logging::query_span;
///
/// let span = query_span("blog_article");
/// let _guard = span.enter();
/// tracing::debug!("compiling statement");
/// ```
pub fn query_span(table: &str) -> tracing::Span {
    tracing::debug_span!("query", table = table)
}
