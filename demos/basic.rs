//! Minimal tsu-metrics example: a small JSON API with request counters and a
//! Prometheus scrape endpoint.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/users/42
//!   curl -X POST http://localhost:3000/users -d '{"name":"alice"}'
//!   curl http://localhost:3000/users/42/fail
//!   curl http://localhost:3000/metrics

use http::StatusCode;
use tsu_metrics::{
    BoxError, Method, MetricsMiddleware, MetricsRegistry, Request, Response, Router, Server,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let router = Router::new()
        .on(Method::Get,  "/users/{id}",      get_user)
        .on(Method::Post, "/users",           create_user)
        .on(Method::Get,  "/users/{id}/fail", fail)
        .on(Method::Get,  "/healthz",         |_req: Request| async { "ok" })
        .on(Method::Get,  "/metrics",         metrics);

    // `/metrics` is excluded by default; add the probe as well.
    let app = MetricsMiddleware::builder(router)
        .exclude_paths(["/metrics", "/healthz"])
        .const_labels([("service", "basic")])
        .build();

    if let Err(e) = Server::bind("0.0.0.0:3000").serve(app).await {
        tracing::error!(error = %e, "server error");
    }
}

// GET /users/{id} is recorded as path="/users/{id}", whatever the id.
async fn get_user(req: Request) -> Response {
    let id = req.param("id").unwrap_or("unknown");
    Response::json(format!(r#"{{"id":"{id}","name":"alice"}}"#))
}

async fn create_user(req: Request) -> Response {
    if req.body().is_empty() {
        return Response::status(StatusCode::BAD_REQUEST);
    }
    Response::builder()
        .status(StatusCode::CREATED)
        .header("location", "/users/99")
        .json(r#"{"id":"99","name":"new_user"}"#)
}

// Counted under exceptions_total and status_code="500".
async fn fail(_req: Request) -> Result<Response, BoxError> {
    Err("simulated failure".into())
}

async fn metrics(_req: Request) -> Result<Response, BoxError> {
    let text = MetricsRegistry::global().render()?;
    Ok(Response::builder().bytes("text/plain; version=0.0.4", text))
}
