//! Middleware layer.
//!
//! Middleware is an [`Application`](crate::Application) that wraps another
//! one. It sees every scope before the application does and may observe or
//! replace the outbound channel. That makes it the right place for
//! cross-cutting concerns that must not leak into route handlers.
//!
//! Built-in middleware:
//! - [`MetricsMiddleware`]: request, response, exception and status-code counters

mod labels;
mod metrics;

pub use labels::{DEFAULT_EXCLUDE_PATHS, bucket_status};
pub use metrics::{
    EXCEPTIONS_TOTAL, MetricsBuilder, MetricsConfig, MetricsMiddleware, REQUESTS_TOTAL,
    RESPONSES_TOTAL, STATUS_CODES_TOTAL,
};
