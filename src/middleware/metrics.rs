//! Request-counting middleware.
//!
//! Wraps any [`Application`] and maintains four counters:
//!
//! | Counter | Labels | Incremented when |
//! |---|---|---|
//! | `requests_total` | method, path | a request enters |
//! | `responses_total` | method, path | its response starts, or it fails |
//! | `status_codes_total` | method, path, status_code | same as `responses_total` |
//! | `exceptions_total` | method, path | the wrapped application fails |
//!
//! # Lifecycle of one request
//!
//! ```text
//! Idle ─▶ MetricsEnsured ─▶ Dispatched ─┬─▶ Completed   ResponseStart seen on the way out
//!                                       └─▶ Failed      Err, panic, or future dropped
//! ```
//!
//! Counters are created on the first call, not in the constructor: hosts may
//! build their middleware stack several times before serving anything, and
//! only one instance will ever register.
//!
//! Failure accounting lives in the `Drop` of an in-flight guard that is
//! disarmed only when the wrapped application returns `Ok`. An error, a
//! panic unwinding through the request, and the host cancelling the request
//! all take the same path, and the application's error is returned untouched.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::OnceCell;
use tracing::{debug, error};

use crate::application::Application;
use crate::error::{BoxError, Error};
use crate::handler::BoxFuture;
use crate::middleware::labels::{DEFAULT_EXCLUDE_PATHS, RequestLabels, bucket_status, classify_path};
use crate::registry::{Counter, CounterOpts, MetricsRegistry};
use crate::resolver::RouteResolver;
use crate::scope::{Inbound, Message, Outbound, Scope, ScopeKind, Sink};

pub const REQUESTS_TOTAL: &str = "requests_total";
pub const RESPONSES_TOTAL: &str = "responses_total";
pub const EXCEPTIONS_TOTAL: &str = "exceptions_total";
pub const STATUS_CODES_TOTAL: &str = "status_codes_total";

/// Status recorded for requests whose application failed.
const FAILURE_STATUS: u16 = 500;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Settings fixed at construction. See [`MetricsBuilder`] for defaults.
#[derive(Clone)]
pub struct MetricsConfig {
    pub(crate) registry: Arc<MetricsRegistry>,
    pub(crate) exclude_paths: Vec<String>,
    pub(crate) use_template_urls: bool,
    pub(crate) group_status_codes: bool,
    pub(crate) const_labels: BTreeMap<String, String>,
}

impl MetricsConfig {
    pub fn registry(&self) -> &Arc<MetricsRegistry> { &self.registry }
    pub fn exclude_paths(&self) -> &[String] { &self.exclude_paths }
    pub fn use_template_urls(&self) -> bool { self.use_template_urls }
    pub fn group_status_codes(&self) -> bool { self.group_status_codes }
    pub fn const_labels(&self) -> &BTreeMap<String, String> { &self.const_labels }

    /// Exact string match; no prefixes, no globs.
    pub fn is_excluded(&self, path: &str) -> bool {
        self.exclude_paths.iter().any(|p| p == path)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            registry: MetricsRegistry::global(),
            exclude_paths: DEFAULT_EXCLUDE_PATHS.iter().map(|p| (*p).to_owned()).collect(),
            use_template_urls: true,
            group_status_codes: false,
            const_labels: BTreeMap::new(),
        }
    }
}

/// Builder for [`MetricsMiddleware`]. Obtain via [`MetricsMiddleware::builder`].
///
/// | Option | Default |
/// |---|---|
/// | `registry` | [`MetricsRegistry::global`] |
/// | `exclude_paths` | [`DEFAULT_EXCLUDE_PATHS`] |
/// | `use_template_urls` | `true` |
/// | `group_status_codes` | `false` |
/// | `const_labels` | none |
pub struct MetricsBuilder<A> {
    next: A,
    config: MetricsConfig,
}

impl<A: Application> MetricsBuilder<A> {
    pub fn registry(mut self, registry: Arc<MetricsRegistry>) -> Self {
        self.config.registry = registry;
        self
    }

    /// Replace the exclusion set. Duplicates are dropped, order is kept.
    pub fn exclude_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.exclude_paths.clear();
        for path in paths {
            let path = path.into();
            if !self.config.exclude_paths.contains(&path) {
                self.config.exclude_paths.push(path);
            }
        }
        self
    }

    /// Label requests with their route template (`/users/{id}`) rather than
    /// the literal path, when the application can tell.
    pub fn use_template_urls(mut self, enabled: bool) -> Self {
        self.config.use_template_urls = enabled;
        self
    }

    /// Record `2xx`, `4xx`, … instead of individual status codes.
    pub fn group_status_codes(mut self, enabled: bool) -> Self {
        self.config.group_status_codes = enabled;
        self
    }

    /// Labels attached to every series of all four counters.
    pub fn const_labels<I, K, V>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.config.const_labels = labels.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    /// Finish. Registers nothing yet.
    pub fn build(self) -> MetricsMiddleware<A> {
        MetricsMiddleware {
            next: self.next,
            shared: Arc::new(Shared {
                config: self.config,
                metrics: OnceCell::new(),
                app: OnceCell::new(),
            }),
        }
    }
}

// ── Metric set ────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct MetricSet {
    requests: Counter,
    responses: Counter,
    exceptions: Counter,
    status_codes: Counter,
}

impl MetricSet {
    fn create(config: &MetricsConfig) -> Result<Self, Error> {
        let counter = |name: &str, help: &str, labels: &[&str]| {
            config.registry.counter(
                CounterOpts::new(name, help, labels).const_labels(config.const_labels.clone()),
            )
        };
        Ok(Self {
            requests: counter(REQUESTS_TOTAL, "Total number of requests received", &["method", "path"])?,
            responses: counter(RESPONSES_TOTAL, "Total number of responses sent", &["method", "path"])?,
            exceptions: counter(
                EXCEPTIONS_TOTAL,
                "Total number of requests which generated an exception",
                &["method", "path"],
            )?,
            status_codes: counter(
                STATUS_CODES_TOTAL,
                "Total number of response status codes",
                &["method", "path", "status_code"],
            )?,
        })
    }
}

// ── Middleware ────────────────────────────────────────────────────────────────

/// Counts requests, responses, failures and status codes of the wrapped
/// application.
///
/// ```rust
/// use std::sync::Arc;
/// use tsu_metrics::{Method, MetricsMiddleware, MetricsRegistry, Request, Router};
///
/// let registry = Arc::new(MetricsRegistry::new());
/// let router = Router::new().on(Method::Get, "/users/{id}", |_req: Request| async { "ok" });
///
/// let app = MetricsMiddleware::builder(router)
///     .registry(registry)
///     .group_status_codes(true)
///     .const_labels([("service", "users")])
///     .build();
/// ```
pub struct MetricsMiddleware<A> {
    next: A,
    shared: Arc<Shared>,
}

/// State shared by every in-flight request of one middleware instance.
struct Shared {
    config: MetricsConfig,
    metrics: OnceCell<MetricSet>,
    app: OnceCell<Arc<dyn RouteResolver>>,
}

impl<A: Application> MetricsMiddleware<A> {
    /// Wrap `next` with the default configuration.
    pub fn new(next: A) -> Self {
        Self::builder(next).build()
    }

    pub fn builder(next: A) -> MetricsBuilder<A> {
        MetricsBuilder { next, config: MetricsConfig::default() }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.shared.config
    }
}

impl Shared {
    /// Registers the counters on first use. Concurrent first requests block
    /// on the cell until one of them has registered; a failed attempt leaves
    /// the cell empty and surfaces the error to that request.
    fn ensure_metrics(&self) -> Result<&MetricSet, Error> {
        self.metrics.get_or_try_init(|| {
            let set = MetricSet::create(&self.config)?;
            debug!(const_labels = ?self.config.const_labels, "request metrics registered");
            Ok(set)
        })
    }

    /// Remember the first route resolver seen on any scope. Never replaced.
    fn capture_app(&self, scope: &Scope) {
        if self.app.get().is_some() {
            return;
        }
        if let Some(app) = scope.app() {
            if self.app.set(Arc::clone(app)).is_ok() {
                debug!(kind = ?scope.kind(), "route resolver captured");
            }
        }
    }

    fn request_labels(&self, scope: &Scope) -> RequestLabels {
        RequestLabels {
            method: scope.method().as_str(),
            path: classify_path(
                scope,
                self.app.get().map(|app| &**app),
                self.config.use_template_urls,
            ),
        }
    }
}

impl<A: Application> Application for MetricsMiddleware<A> {
    fn call(&self, scope: Scope, receive: Inbound, send: Outbound)
        -> BoxFuture<'static, Result<(), BoxError>>
    {
        let metrics = match self.shared.ensure_metrics() {
            Ok(metrics) => metrics.clone(),
            Err(e) => {
                error!(error = %e, "request metrics could not be registered");
                return Box::pin(std::future::ready(Err::<(), BoxError>(e.into())));
            }
        };
        self.shared.capture_app(&scope);

        if scope.kind() == ScopeKind::Lifespan {
            return self.next.call(scope, receive, send);
        }

        let labels = self.shared.request_labels(&scope);
        if self.shared.config.is_excluded(&labels.path) {
            return self.next.call(scope, receive, send);
        }

        metrics.requests.increment(&labels.values());

        let tally = Arc::new(Tally {
            metrics,
            labels,
            grouped: self.shared.config.group_status_codes,
            responded: AtomicBool::new(false),
        });
        let guard = InFlight { tally: Arc::clone(&tally), armed: true };
        let fut = self.next.call(scope, receive, Outbound::new(Intercept { inner: send, tally }));

        Box::pin(async move {
            let result = fut.await;
            if result.is_ok() {
                guard.disarm();
            }
            result
        })
    }

    fn route_resolver(&self) -> Option<Arc<dyn RouteResolver>> {
        self.next.route_resolver()
    }
}

// ── Per-request accounting ────────────────────────────────────────────────────

/// Closes out the counters of one request, at most once.
struct Tally {
    metrics: MetricSet,
    labels: RequestLabels,
    grouped: bool,
    responded: AtomicBool,
}

impl Tally {
    fn record_response(&self, status: u16) {
        if self.responded.swap(true, Ordering::AcqRel) {
            return;
        }
        let bucket = bucket_status(status, self.grouped);
        self.metrics.status_codes.increment(&self.labels.with_status(&bucket));
        self.metrics.responses.increment(&self.labels.values());
    }

    /// A failure after the response already started is still an exception,
    /// but the response was counted with its real status.
    fn record_failure(&self) {
        debug!(method = self.labels.method, path = %self.labels.path, "request failed");
        self.metrics.exceptions.increment(&self.labels.values());
        self.record_response(FAILURE_STATUS);
    }
}

/// Outbound channel that watches for the response start.
struct Intercept {
    inner: Outbound,
    tally: Arc<Tally>,
}

impl Sink for Intercept {
    fn send(&mut self, message: Message) -> BoxFuture<'_, Result<(), BoxError>> {
        if let Message::ResponseStart { status, .. } = &message {
            self.tally.record_response(*status);
        }
        Sink::send(&mut self.inner, message)
    }
}

/// Records a failure when dropped while armed.
struct InFlight {
    tally: Arc<Tally>,
    armed: bool,
}

impl InFlight {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.armed {
            self.tally.record_failure();
        }
    }
}
