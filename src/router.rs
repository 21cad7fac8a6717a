//! Radix-tree request router.
//!
//! One tree per HTTP method. O(path-length) lookup. The router is an
//! [`Application`] in its own right, and it also answers the question the
//! metrics layer asks of every request: which registered route template, if
//! any, serves this scope?

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use matchit::Router as MatchitRouter;

use crate::application::Application;
use crate::error::BoxError;
use crate::handler::{BoxFuture, BoxedHandler, Handler};
use crate::method::Method;
use crate::request::Request;
use crate::resolver::{RouteMatch, RouteResolver};
use crate::response::Response;
use crate::scope::{Event, Inbound, Message, Outbound, Scope, ScopeKind};

/// The application router.
///
/// Build it once at startup; hand it to [`Server::serve`](crate::Server::serve),
/// usually wrapped in [`MetricsMiddleware`](crate::MetricsMiddleware).
/// Each [`Router::on`] call returns `self` so registrations chain naturally.
pub struct Router {
    table: Arc<RouteTable>,
}

#[derive(Clone, Default)]
struct RouteTable {
    trees: HashMap<Method, MatchitRouter<Route>>,
}

#[derive(Clone)]
struct Route {
    template: Arc<str>,
    handler: BoxedHandler,
}

enum Lookup<'a> {
    Found(&'a Route, HashMap<String, String>),
    MethodNotAllowed,
    NotFound,
}

impl Router {
    pub fn new() -> Self {
        Self { table: Arc::new(RouteTable::default()) }
    }

    /// Register a handler for a method + path pair. Returns `self` for chaining.
    ///
    /// Path parameters use `{name}` syntax; `req.param("name")` retrieves them:
    ///
    /// ```rust
    /// # use tsu_metrics::{Method, Request, Response, Router};
    /// # async fn get_user(_: Request) -> Response { Response::text("") }
    /// # async fn create_user(_: Request) -> Response { Response::text("") }
    /// Router::new()
    ///     .on(Method::Get,  "/users/{id}", get_user)
    ///     .on(Method::Post, "/users",      create_user);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if `path` is not a valid route or conflicts with one already
    /// registered for `method`. Routes are fixed at startup, so this is a
    /// programming error.
    pub fn on(mut self, method: Method, path: &str, handler: impl Handler) -> Self {
        let route = Route { template: Arc::from(path), handler: handler.into_boxed_handler() };
        Arc::make_mut(&mut self.table)
            .trees
            .entry(method)
            .or_default()
            .insert(path, route)
            .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"));
        self
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

impl RouteTable {
    fn lookup(&self, method: Method, path: &str) -> Lookup<'_> {
        if let Some(matched) = self.trees.get(&method).and_then(|tree| tree.at(path).ok()) {
            let params = matched.params.iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect();
            return Lookup::Found(matched.value, params);
        }
        if self.trees.values().any(|tree| tree.at(path).is_ok()) {
            Lookup::MethodNotAllowed
        } else {
            Lookup::NotFound
        }
    }
}

impl RouteResolver for RouteTable {
    fn match_route(&self, scope: &Scope) -> RouteMatch {
        if scope.kind() != ScopeKind::Http {
            return RouteMatch::None;
        }
        match self.lookup(scope.method(), scope.path()) {
            Lookup::Found(route, _) => RouteMatch::Full { template: Arc::clone(&route.template) },
            Lookup::MethodNotAllowed => RouteMatch::Partial,
            Lookup::NotFound => RouteMatch::None,
        }
    }
}

// ── Application ───────────────────────────────────────────────────────────────

impl Application for Router {
    fn call(&self, scope: Scope, receive: Inbound, send: Outbound)
        -> BoxFuture<'static, Result<(), BoxError>>
    {
        let table = Arc::clone(&self.table);
        Box::pin(async move {
            match scope.kind() {
                ScopeKind::Lifespan => lifespan(receive, send).await,
                ScopeKind::Http => dispatch(&table, scope, receive, send).await,
                // No WebSocket routes: refuse the handshake.
                ScopeKind::WebSocket => {
                    let mut send = send;
                    send.send(Message::Close { code: 1000 }).await
                }
            }
        })
    }

    fn route_resolver(&self) -> Option<Arc<dyn RouteResolver>> {
        let table: Arc<dyn RouteResolver> = self.table.clone();
        Some(table)
    }
}

/// Routes one request and emits one response.
///
/// Handler failures are returned as-is, without emitting anything: the
/// layers above decide what the client sees.
async fn dispatch(
    table: &RouteTable,
    scope: Scope,
    mut receive: Inbound,
    mut send: Outbound,
) -> Result<(), BoxError> {
    let body = read_body(&mut receive).await;

    let response = match table.lookup(scope.method(), scope.path()) {
        Lookup::Found(route, params) => {
            let Scope { method, path, headers, .. } = scope;
            route.handler.call(Request::new(method, path, headers, body, params)).await?
        }
        Lookup::MethodNotAllowed => Response::status(StatusCode::METHOD_NOT_ALLOWED),
        Lookup::NotFound => Response::status(StatusCode::NOT_FOUND),
    };

    for message in response.into_messages() {
        send.send(message).await?;
    }
    Ok(())
}

async fn read_body(receive: &mut Inbound) -> Bytes {
    let mut buf = BytesMut::new();
    loop {
        match receive.recv().await {
            Event::Body { data, more } => {
                buf.extend_from_slice(&data);
                if !more {
                    break;
                }
            }
            Event::Disconnect => break,
            _ => {}
        }
    }
    buf.freeze()
}

async fn lifespan(mut receive: Inbound, mut send: Outbound) -> Result<(), BoxError> {
    loop {
        match receive.recv().await {
            Event::Startup => send.send(Message::StartupComplete).await?,
            Event::Shutdown => return send.send(Message::ShutdownComplete).await,
            Event::Disconnect => return Ok(()),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get_user(req: Request) -> Response {
        Response::text(format!("user {}", req.param("id").unwrap_or("?")))
    }

    async fn broken(_req: Request) -> Result<Response, BoxError> {
        Err("handler exploded".into())
    }

    fn app() -> Router {
        Router::new()
            .on(Method::Get, "/users/{id}", get_user)
            .on(Method::Post, "/users", |_req: Request| async { StatusCode::CREATED })
            .on(Method::Get, "/broken", broken)
    }

    async fn run(router: &Router, scope: Scope) -> (Result<(), BoxError>, Vec<Message>) {
        let (send, mut rx) = Outbound::channel();
        let result = router.call(scope, Inbound::from_events([]), send).await;
        let mut messages = Vec::new();
        while let Ok(m) = rx.try_recv() {
            messages.push(m);
        }
        (result, messages)
    }

    fn status_of(messages: &[Message]) -> Option<u16> {
        messages.iter().find_map(|m| match m {
            Message::ResponseStart { status, .. } => Some(*status),
            _ => None,
        })
    }

    #[test]
    fn resolves_full_partial_and_missing() {
        let resolver = app().route_resolver().unwrap();

        let full = resolver.match_route(&Scope::http(Method::Get, "/users/42"));
        assert_eq!(full.template(), Some("/users/{id}"));

        let partial = resolver.match_route(&Scope::http(Method::Delete, "/users/42"));
        assert_eq!(partial, RouteMatch::Partial);

        let none = resolver.match_route(&Scope::http(Method::Get, "/nowhere"));
        assert_eq!(none, RouteMatch::None);
    }

    #[test]
    fn websocket_scopes_never_match_http_routes() {
        let resolver = app().route_resolver().unwrap();
        assert_eq!(resolver.match_route(&Scope::websocket("/users/42")), RouteMatch::None);
    }

    #[tokio::test]
    async fn dispatches_with_params() {
        let (result, messages) = run(&app(), Scope::http(Method::Get, "/users/7")).await;
        assert!(result.is_ok());
        assert_eq!(status_of(&messages), Some(200));
        assert_eq!(
            messages[1],
            Message::ResponseBody { data: Bytes::from_static(b"user 7"), more: false },
        );
    }

    #[tokio::test]
    async fn answers_404_and_405() {
        let router = app();
        let (_, missing) = run(&router, Scope::http(Method::Get, "/nope")).await;
        assert_eq!(status_of(&missing), Some(404));

        let (_, wrong_method) = run(&router, Scope::http(Method::Put, "/users")).await;
        assert_eq!(status_of(&wrong_method), Some(405));
    }

    #[tokio::test]
    async fn handler_errors_propagate_without_a_response() {
        let (result, messages) = run(&app(), Scope::http(Method::Get, "/broken")).await;
        assert_eq!(result.unwrap_err().to_string(), "handler exploded");
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn acknowledges_lifespan_events() {
        let (send, mut rx) = Outbound::channel();
        let receive = Inbound::from_events([Event::Startup, Event::Shutdown]);
        app().call(Scope::lifespan(), receive, send).await.unwrap();
        assert_eq!(rx.recv().await, Some(Message::StartupComplete));
        assert_eq!(rx.recv().await, Some(Message::ShutdownComplete));
    }

    #[tokio::test]
    async fn refuses_websockets() {
        let (_, messages) = run(&app(), Scope::websocket("/users/1")).await;
        assert_eq!(messages, vec![Message::Close { code: 1000 }]);
    }
}
