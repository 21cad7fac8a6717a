//! HTTP server and graceful shutdown.
//!
//! The server speaks HTTP/1.1 and HTTP/2 through hyper and translates every
//! request into the scope/event/message protocol an
//! [`Application`] understands. Whatever the application sends back is
//! assembled into one HTTP response.
//!
//! # Lifecycle
//!
//! 1. A lifespan scope is opened and `Startup` is sent; the server waits for
//!    the application to acknowledge (or to finish without doing so). If the
//!    application fails instead, [`Server::serve`] returns that error without
//!    accepting a single connection.
//! 2. Connections are accepted until SIGTERM / Ctrl-C, or until the future
//!    given to [`Server::serve_with_shutdown`] resolves.
//! 3. Accepting stops, every in-flight connection runs to completion.
//! 4. `Shutdown` is sent on the lifespan scope and [`Server::serve`] returns.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::application::Application;
use crate::error::{BoxError, Error};
use crate::method::Method;
use crate::resolver::RouteResolver;
use crate::scope::{Event, Inbound, Message, Outbound, Scope};

type HttpResponse = http::Response<Full<Bytes>>;

enum Listen {
    Addr(String),
    Listener(TcpListener),
}

/// The HTTP server.
pub struct Server {
    listen: Listen,
    root_path: Arc<str>,
}

impl Server {
    /// Configures the server to bind to `addr` (`host:port`) when
    /// [`serve`](Server::serve) is called.
    ///
    /// ```rust,no_run
    /// use tsu_metrics::Server;
    /// let server = Server::bind("0.0.0.0:3000");
    /// ```
    pub fn bind(addr: &str) -> Self {
        Self { listen: Listen::Addr(addr.to_owned()), root_path: Arc::from("") }
    }

    /// Serve on an already bound listener, e.g. one on port 0 in tests.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self { listen: Listen::Listener(listener), root_path: Arc::from("") }
    }

    /// Prefix the application is mounted under when a proxy strips it, e.g.
    /// `/api`. Reported to the application as the scope's `root_path`.
    pub fn root_path(mut self, root_path: &str) -> Self {
        self.root_path = Arc::from(root_path);
        self
    }

    /// Serve `app` until SIGTERM or Ctrl-C, then drain and return.
    pub async fn serve<A: Application>(self, app: A) -> Result<(), Error> {
        self.serve_with_shutdown(app, shutdown_signal()).await
    }

    /// Serve `app` until `signal` resolves, then drain and return.
    pub async fn serve_with_shutdown<A, F>(self, app: A, signal: F) -> Result<(), Error>
    where
        A: Application,
        F: Future<Output = ()> + Send,
    {
        let listener = match self.listen {
            Listen::Addr(addr) => TcpListener::bind(addr).await?,
            Listen::Listener(listener) => listener,
        };
        let addr = listener.local_addr()?;

        // Shared across connection tasks without copying the application.
        let app = Arc::new(app);
        let resolver = app.route_resolver();

        let lifespan = Lifespan::start(app.as_ref(), resolver.clone()).await?;

        info!(%addr, root_path = %self.root_path, "tsu listening");

        let mut tasks = tokio::task::JoinSet::new();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                // Check shutdown first so a signal stops accepting new
                // connections even if more are queued.
                biased;

                () = &mut signal => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let app = Arc::clone(&app);
                    let resolver = resolver.clone();
                    let root_path = Arc::clone(&self.root_path);
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        // Called once per request on the connection.
                        let svc = service_fn(move |req| {
                            let app = Arc::clone(&app);
                            let resolver = resolver.clone();
                            let root_path = Arc::clone(&root_path);
                            async move { dispatch(app.as_ref(), resolver, &root_path, req).await }
                        });

                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                // Reap finished connection tasks so the JoinSet does not grow
                // without bound on long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        lifespan.shutdown().await;
        info!("tsu stopped");
        Ok(())
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Runs one request through the application and assembles its response.
///
/// Never fails towards hyper: an unknown method is answered with 405, an
/// application error or a missing response start with 500.
async fn dispatch<A: Application>(
    app: &A,
    resolver: Option<Arc<dyn RouteResolver>>,
    root_path: &str,
    req: hyper::Request<hyper::body::Incoming>,
) -> Result<HttpResponse, Infallible> {
    let method = match Method::try_from(req.method()) {
        Ok(method) => method,
        Err(e) => {
            debug!(error = %e, "rejecting request");
            return Ok(empty(StatusCode::METHOD_NOT_ALLOWED));
        }
    };

    let mut scope = Scope::http(method, req.uri().path()).with_root_path(root_path);
    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            scope = scope.with_header(name.as_str(), value);
        }
    }
    if let Some(resolver) = resolver {
        scope = scope.with_app(resolver);
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            return Ok(empty(StatusCode::BAD_REQUEST));
        }
    };

    let path = scope.full_path();
    let receive = Inbound::from_events([Event::Body { data: body, more: false }]);
    let (send, mut messages) = Outbound::channel();

    if let Err(e) = app.call(scope, receive, send).await {
        error!(%method, %path, error = %e, "application error");
    }

    Ok(assemble(&mut messages))
}

/// Collapse the messages an application sent into one response.
fn assemble(messages: &mut mpsc::UnboundedReceiver<Message>) -> HttpResponse {
    let mut start = None;
    let mut body = BytesMut::new();

    while let Ok(message) = messages.try_recv() {
        match message {
            Message::ResponseStart { status, headers } if start.is_none() => {
                start = Some((status, headers));
            }
            Message::ResponseBody { data, .. } => body.extend_from_slice(&data),
            _ => {}
        }
    }

    let Some((status, headers)) = start else {
        return empty(StatusCode::INTERNAL_SERVER_ERROR);
    };

    let mut builder = http::Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder.body(Full::new(body.freeze())).unwrap_or_else(|e| {
        error!(status, error = %e, "application sent an invalid response head");
        empty(StatusCode::INTERNAL_SERVER_ERROR)
    })
}

fn empty(status: StatusCode) -> HttpResponse {
    let mut res = http::Response::new(Full::new(Bytes::new()));
    *res.status_mut() = status;
    res
}

// ── Lifespan ──────────────────────────────────────────────────────────────────

/// The long-lived lifespan call, open for as long as the server runs.
struct Lifespan {
    events: mpsc::UnboundedSender<Event>,
    messages: mpsc::UnboundedReceiver<Message>,
    /// `None` once the application has finished the lifespan call.
    task: Option<JoinHandle<Result<(), BoxError>>>,
}

impl Lifespan {
    /// Runs the startup exchange.
    ///
    /// An application that finishes without acknowledging is fine if it
    /// returned `Ok`; an error is fatal and is returned as [`Error::Startup`].
    async fn start<A: Application>(
        app: &A,
        resolver: Option<Arc<dyn RouteResolver>>,
    ) -> Result<Self, Error> {
        let (events, rx) = mpsc::unbounded_channel();
        let (send, messages) = Outbound::channel();

        let mut scope = Scope::lifespan();
        if let Some(resolver) = resolver {
            scope = scope.with_app(resolver);
        }
        let task = tokio::spawn(app.call(scope, Inbound::new(rx), send));

        let mut lifespan = Self { events, messages, task: Some(task) };
        if lifespan.exchange(Event::Startup, Message::StartupComplete).await {
            return Ok(lifespan);
        }

        if let Some(task) = lifespan.task.take() {
            match task.await {
                Ok(Ok(())) => debug!("application does not handle lifespan"),
                Ok(Err(e)) => {
                    error!(error = %e, "application failed during startup");
                    return Err(Error::Startup(e));
                }
                Err(e) => {
                    error!(error = %e, "lifespan task panicked");
                    return Err(Error::Startup(Box::new(e)));
                }
            }
        }
        Ok(lifespan)
    }

    async fn shutdown(mut self) {
        self.exchange(Event::Shutdown, Message::ShutdownComplete).await;
        drop(self.events);

        let Some(task) = self.task else { return };
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "lifespan failed"),
            Err(e) => error!(error = %e, "lifespan task panicked"),
        }
    }

    /// Send `event` and wait for `ack`. Returns `false` when the application
    /// stops listening first, which is how lifespan-unaware applications end.
    async fn exchange(&mut self, event: Event, ack: Message) -> bool {
        if self.events.send(event.clone()).is_err() {
            return false;
        }
        while let Some(message) = self.messages.recv().await {
            if message == ack {
                debug!(?event, "lifespan acknowledged");
                return true;
            }
        }
        false
    }
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both **SIGTERM** (sent by Kubernetes) and
/// **SIGINT** (Ctrl-C). On Windows only Ctrl-C is available. If a handler
/// cannot be installed, that signal source is simply never triggered.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
