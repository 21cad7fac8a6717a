//! # tsu-metrics
//!
//! Request counters for HTTP services, recorded by a middleware that sits in
//! front of the application and never touches a route handler.
//!
//! ## What gets counted
//!
//! | Counter | Labels |
//! |---|---|
//! | `requests_total` | method, path |
//! | `responses_total` | method, path |
//! | `exceptions_total` | method, path |
//! | `status_codes_total` | method, path, status_code |
//!
//! Every request that is not excluded increments `requests_total` once on the
//! way in and `responses_total` / `status_codes_total` once on the way out,
//! whether the handler answered, returned an error, panicked, or was
//! cancelled. Errors are counted as status 500 and then returned unchanged.
//!
//! `path` is the route template (`/users/{id}`) when the router knows it and
//! the literal path otherwise. Counters live in a [`MetricsRegistry`] backed
//! by the `prometheus` crate.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use http::StatusCode;
//! use tsu_metrics::{Method, MetricsMiddleware, Request, Response, Router, Server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let router = Router::new()
//!         .on(Method::Get,  "/users/{id}", get_user)
//!         .on(Method::Post, "/users",      create_user);
//!
//!     let app = MetricsMiddleware::builder(router)
//!         .group_status_codes(true)
//!         .build();
//!
//!     Server::bind("0.0.0.0:3000").serve(app).await.unwrap();
//! }
//!
//! async fn get_user(req: Request) -> Response {
//!     let id = req.param("id").unwrap_or("unknown");
//!     Response::json(format!(r#"{{"id":"{id}"}}"#))
//! }
//!
//! async fn create_user(req: Request) -> Response {
//!     if req.body().is_empty() {
//!         return Response::status(StatusCode::BAD_REQUEST);
//!     }
//!     Response::builder()
//!         .status(StatusCode::CREATED)
//!         .header("location", "/users/99")
//!         .json(r#"{"id":"99"}"#)
//! }
//! ```

mod application;
mod error;
mod handler;
mod method;
mod registry;
mod request;
mod resolver;
mod response;
mod router;
mod scope;
mod server;

pub mod middleware;

pub use application::{Application, app_fn};
pub use error::{BoxError, Error};
pub use handler::{BoxFuture, Handler, IntoOutcome};
pub use method::{Method, UnknownMethod};
pub use middleware::{MetricsBuilder, MetricsConfig, MetricsMiddleware};
pub use registry::{Counter, CounterOpts, MetricsRegistry};
pub use request::Request;
pub use resolver::{RouteMatch, RouteResolver};
pub use response::{IntoResponse, Response, ResponseBuilder};
pub use router::Router;
pub use scope::{Event, Inbound, Message, Outbound, Scope, ScopeKind, Sink};
pub use server::Server;
