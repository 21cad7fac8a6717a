//! End-to-end: a router behind the metrics middleware, served over TCP.

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tsu_metrics::{
    BoxError, CounterOpts, Error, Method, MetricsMiddleware, MetricsRegistry, Request, Response,
    Router, Server,
};

async fn get_order(req: Request) -> Response {
    Response::json(format!(r#"{{"id":"{}"}}"#, req.param("id").unwrap_or("?")))
}

async fn failing_order(_req: Request) -> Result<Response, BoxError> {
    Err("inventory service unavailable".into())
}

async fn echo(req: Request) -> Response {
    Response::builder().status(StatusCode::CREATED).text(String::from_utf8_lossy(req.body()))
}

struct Running {
    addr: std::net::SocketAddr,
    stop: oneshot::Sender<()>,
    server: JoinHandle<Result<(), Error>>,
}

async fn start(registry: Arc<MetricsRegistry>, root_path: &str) -> Running {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let router = Router::new()
        .on(Method::Get, "/orders/{id}", get_order)
        .on(Method::Get, "/failing", failing_order)
        .on(Method::Post, "/echo", echo)
        .on(Method::Get, "/health", |_req: Request| async { "ok" });

    let app = MetricsMiddleware::builder(router)
        .registry(registry)
        .exclude_paths(["/health"])
        .build();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(
        Server::from_listener(listener)
            .root_path(root_path)
            .serve_with_shutdown(app, async {
                let _ = stopped.await;
            }),
    );
    Running { addr, stop, server }
}

async fn request(addr: std::net::SocketAddr, method: &str, path: &str, body: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let raw = format!(
        "{method} {path} HTTP/1.1\r\nhost: test\r\nconnection: close\r\ncontent-length: {}\r\n\r\n{body}",
        body.len(),
    );
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

fn sample(registry: &MetricsRegistry, series: &str) -> Option<u64> {
    let text = registry.render().unwrap();
    text.lines()
        .find_map(|line| line.strip_prefix(series))
        .and_then(|rest| rest.trim().parse().ok())
}

#[tokio::test]
async fn counts_traffic_through_the_full_stack() {
    let registry = Arc::new(MetricsRegistry::new());
    let running = start(Arc::clone(&registry), "").await;

    for _ in 0..2 {
        let res = request(running.addr, "GET", "/orders/9", "").await;
        assert!(res.starts_with("HTTP/1.1 200"), "{res}");
        assert!(res.ends_with(r#"{"id":"9"}"#), "{res}");
    }

    let res = request(running.addr, "GET", "/failing", "").await;
    assert!(res.starts_with("HTTP/1.1 500"), "{res}");

    let res = request(running.addr, "POST", "/echo", "hello").await;
    assert!(res.starts_with("HTTP/1.1 201"), "{res}");
    assert!(res.ends_with("hello"), "{res}");

    let res = request(running.addr, "GET", "/health", "").await;
    assert!(res.starts_with("HTTP/1.1 200"), "{res}");

    let res = request(running.addr, "DELETE", "/orders/9", "").await;
    assert!(res.starts_with("HTTP/1.1 405"), "{res}");

    running.stop.send(()).unwrap();
    running.server.await.unwrap().unwrap();

    let orders = r#"{method="GET",path="/orders/{id}"}"#;
    assert_eq!(sample(&registry, &format!("requests_total{orders}")), Some(2));
    assert_eq!(sample(&registry, &format!("responses_total{orders}")), Some(2));
    assert_eq!(
        sample(&registry, r#"status_codes_total{method="GET",path="/orders/{id}",status_code="200"}"#),
        Some(2),
    );

    let failing = r#"{method="GET",path="/failing"}"#;
    assert_eq!(sample(&registry, &format!("exceptions_total{failing}")), Some(1));
    assert_eq!(sample(&registry, &format!("responses_total{failing}")), Some(1));
    assert_eq!(
        sample(&registry, r#"status_codes_total{method="GET",path="/failing",status_code="500"}"#),
        Some(1),
    );

    assert_eq!(
        sample(&registry, r#"status_codes_total{method="POST",path="/echo",status_code="201"}"#),
        Some(1),
    );

    // Excluded: served, never counted.
    assert_eq!(sample(&registry, r#"requests_total{method="GET",path="/health"}"#), None);

    // A 405 is only a partial route match, so it keeps its literal path.
    assert_eq!(sample(&registry, r#"requests_total{method="DELETE",path="/orders/9"}"#), Some(1));
    assert_eq!(
        sample(&registry, r#"status_codes_total{method="DELETE",path="/orders/9",status_code="405"}"#),
        Some(1),
    );
}

#[tokio::test]
async fn literal_paths_carry_the_root_path() {
    let registry = Arc::new(MetricsRegistry::new());
    let running = start(Arc::clone(&registry), "/shop").await;

    let res = request(running.addr, "GET", "/nowhere", "").await;
    assert!(res.starts_with("HTTP/1.1 404"), "{res}");

    running.stop.send(()).unwrap();
    running.server.await.unwrap().unwrap();

    assert_eq!(
        sample(&registry, r#"status_codes_total{method="GET",path="/shop/nowhere",status_code="404"}"#),
        Some(1),
    );
}

#[tokio::test]
async fn unknown_methods_never_reach_the_application() {
    let registry = Arc::new(MetricsRegistry::new());
    let running = start(Arc::clone(&registry), "").await;

    let res = request(running.addr, "MKCOL", "/orders/9", "").await;
    assert!(res.starts_with("HTTP/1.1 405"), "{res}");

    running.stop.send(()).unwrap();
    running.server.await.unwrap().unwrap();

    assert!(!registry.render().unwrap().contains("MKCOL"));
}

#[tokio::test]
async fn conflicting_registration_stops_the_server_at_startup() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let registry = Arc::new(MetricsRegistry::new());
    registry
        .counter(CounterOpts::new("requests_total", "Owned by someone else", &["method"]))
        .unwrap();

    let router = Router::new().on(Method::Get, "/a", |_req: Request| async { "a" });
    let app = MetricsMiddleware::builder(router).registry(Arc::clone(&registry)).build();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let serve = Server::from_listener(listener).serve_with_shutdown(app, std::future::pending());

    let err = tokio::time::timeout(Duration::from_secs(5), serve)
        .await
        .expect("server should give up during startup")
        .unwrap_err();
    assert!(matches!(err, Error::Startup(_)), "{err}");
    assert!(err.is_configuration());
}
