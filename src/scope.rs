//! The connection protocol between a host and an [`Application`](crate::Application).
//!
//! Every call into an application carries three things:
//!
//! ```text
//! Scope     what this connection is: lifespan, HTTP request, or WebSocket
//! Inbound   events flowing from the client to the application
//! Outbound  messages flowing from the application back to the client
//! ```
//!
//! Middleware sees all three and may replace the outbound channel with one
//! that observes messages on their way out. That is how the metrics layer
//! learns which status code a request finished with without touching the
//! handler.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::BoxError;
use crate::handler::BoxFuture;
use crate::method::Method;
use crate::resolver::RouteResolver;

// ── Scope ─────────────────────────────────────────────────────────────────────

/// What kind of connection a [`Scope`] describes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScopeKind {
    /// Process lifecycle: startup and shutdown signals. Not a request.
    Lifespan,
    /// One HTTP request/response exchange.
    Http,
    /// One WebSocket session.
    WebSocket,
}

/// Description of a single connection, handed to the application once per call.
#[derive(Clone)]
pub struct Scope {
    pub(crate) kind: ScopeKind,
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) root_path: String,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) app: Option<Arc<dyn RouteResolver>>,
}

impl Scope {
    pub fn lifespan() -> Self {
        Self::new(ScopeKind::Lifespan, Method::Get, "")
    }

    pub fn http(method: Method, path: impl Into<String>) -> Self {
        Self::new(ScopeKind::Http, method, path)
    }

    /// A WebSocket session. The opening handshake is always a `GET`
    /// (RFC 6455 §4.1), so that is the method recorded for it.
    pub fn websocket(path: impl Into<String>) -> Self {
        Self::new(ScopeKind::WebSocket, Method::Get, path)
    }

    fn new(kind: ScopeKind, method: Method, path: impl Into<String>) -> Self {
        Self {
            kind,
            method,
            path: path.into(),
            root_path: String::new(),
            headers: Vec::new(),
            app: None,
        }
    }

    /// Prefix the application is mounted under, e.g. `/api` behind a proxy.
    pub fn with_root_path(mut self, root_path: impl Into<String>) -> Self {
        self.root_path = root_path.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach the route-matching capability of the hosted application.
    pub fn with_app(mut self, app: Arc<dyn RouteResolver>) -> Self {
        self.app = Some(app);
        self
    }

    pub fn kind(&self) -> ScopeKind { self.kind }
    pub fn method(&self) -> Method { self.method }
    pub fn path(&self) -> &str { &self.path }
    pub fn root_path(&self) -> &str { &self.root_path }
    pub fn headers(&self) -> &[(String, String)] { &self.headers }
    pub fn app(&self) -> Option<&Arc<dyn RouteResolver>> { self.app.as_ref() }

    /// `root_path` followed by `path`: the path as the client sent it.
    pub fn full_path(&self) -> String {
        format!("{}{}", self.root_path, self.path)
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("kind", &self.kind)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("root_path", &self.root_path)
            .field("headers", &self.headers)
            .field("app", &self.app.is_some())
            .finish()
    }
}

// ── Events and messages ───────────────────────────────────────────────────────

/// Client → application.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Startup,
    Shutdown,
    /// A chunk of the HTTP request body. `more` is false on the last chunk.
    Body { data: Bytes, more: bool },
    /// WebSocket handshake request.
    Connect,
    /// A WebSocket frame from the client.
    Receive(Bytes),
    /// The client went away, or there is nothing left to receive.
    Disconnect,
}

/// Application → client.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    StartupComplete,
    ShutdownComplete,
    /// Status line and headers. Exactly one per HTTP response.
    ResponseStart { status: u16, headers: Vec<(String, String)> },
    ResponseBody { data: Bytes, more: bool },
    /// Accept a WebSocket handshake.
    Accept,
    /// A WebSocket frame to the client.
    Send(Bytes),
    /// Close a WebSocket session, or refuse it before acceptance.
    Close { code: u16 },
}

// ── Inbound ───────────────────────────────────────────────────────────────────

/// Receiving half of a connection.
///
/// Once the host stops sending, every further `recv` yields
/// [`Event::Disconnect`].
pub struct Inbound(mpsc::UnboundedReceiver<Event>);

impl Inbound {
    pub fn new(rx: mpsc::UnboundedReceiver<Event>) -> Self {
        Self(rx)
    }

    /// An inbound stream that yields `events` in order, then disconnects.
    pub fn from_events(events: impl IntoIterator<Item = Event>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            // The receiver is alive in this scope, so this cannot fail.
            let _ = tx.send(event);
        }
        Self(rx)
    }

    pub async fn recv(&mut self) -> Event {
        self.0.recv().await.unwrap_or(Event::Disconnect)
    }
}

// ── Outbound ──────────────────────────────────────────────────────────────────

/// Anything that can carry [`Message`]s back towards the client.
pub trait Sink: Send + 'static {
    fn send(&mut self, message: Message) -> BoxFuture<'_, Result<(), BoxError>>;
}

impl Sink for mpsc::UnboundedSender<Message> {
    fn send(&mut self, message: Message) -> BoxFuture<'_, Result<(), BoxError>> {
        let result = mpsc::UnboundedSender::send(self, message)
            .map_err(|_| BoxError::from("client connection closed"));
        Box::pin(std::future::ready(result))
    }
}

/// Sending half of a connection: a boxed [`Sink`].
pub struct Outbound(Box<dyn Sink>);

impl Outbound {
    pub fn new(sink: impl Sink) -> Self {
        Self(Box::new(sink))
    }

    /// An outbound channel plus the receiver that collects what is sent on it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn send(&mut self, message: Message) -> impl Future<Output = Result<(), BoxError>> + Send + '_ {
        self.0.send(message)
    }
}

impl Sink for Outbound {
    fn send(&mut self, message: Message) -> BoxFuture<'_, Result<(), BoxError>> {
        self.0.send(message)
    }
}
