//! The application contract: what a host calls, and what middleware wraps.
//!
//! An [`Application`] is called once per connection with a [`Scope`], an
//! [`Inbound`] event stream and an [`Outbound`] message channel. It finishes
//! with `Ok(())` or fails with a [`BoxError`]. Routers, middleware and plain
//! async closures all implement it, so they stack freely:
//!
//! ```text
//! Server ─▶ MetricsMiddleware ─▶ Router ─▶ handler
//! ```

use std::future::Future;
use std::sync::Arc;

use crate::error::BoxError;
use crate::handler::BoxFuture;
use crate::resolver::RouteResolver;
use crate::scope::{Inbound, Outbound, Scope};

pub trait Application: Send + Sync + 'static {
    /// Handle one connection.
    ///
    /// The returned future owns everything it needs. A host may drop it
    /// before completion to cancel the request.
    fn call(&self, scope: Scope, receive: Inbound, send: Outbound)
        -> BoxFuture<'static, Result<(), BoxError>>;

    /// Route-matching capability of this application, if it has one.
    ///
    /// Hosts attach it to every [`Scope`] they create so that layers in
    /// front of the router can ask which route template a request hits.
    fn route_resolver(&self) -> Option<Arc<dyn RouteResolver>> {
        None
    }
}

/// Any `Fn(Scope, Inbound, Outbound) -> impl Future<Output = Result<(), BoxError>>`
/// is an application.
impl<F, Fut> Application for F
where
    F: Fn(Scope, Inbound, Outbound) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    fn call(&self, scope: Scope, receive: Inbound, send: Outbound)
        -> BoxFuture<'static, Result<(), BoxError>>
    {
        Box::pin(self(scope, receive, send))
    }
}

/// Turn an async closure into an [`Application`].
///
/// Closures passed straight to a generic `impl Application` parameter cannot
/// have their argument types inferred; routing them through this function
/// pins the signature, in the same way hyper's `service_fn` does.
///
/// ```rust
/// use tsu_metrics::{app_fn, BoxError, Inbound, Message, Outbound, Scope};
///
/// let app = app_fn(|_scope: Scope, _rx: Inbound, mut tx: Outbound| async move {
///     tx.send(Message::ResponseStart { status: 204, headers: vec![] }).await?;
///     Ok::<(), BoxError>(())
/// });
/// ```
pub fn app_fn<F, Fut>(f: F) -> F
where
    F: Fn(Scope, Inbound, Outbound) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    f
}
