//! Label derivation: which method, path and status bucket a request is
//! counted under.

use crate::resolver::RouteResolver;
use crate::scope::Scope;

/// Paths excluded from request metrics unless configured otherwise: the
/// metrics endpoint itself and the usual generated documentation routes.
pub const DEFAULT_EXCLUDE_PATHS: &[&str] = &[
    "/metrics",
    "/metrics/",
    "/docs",
    "/openapi.json",
    "/docs/oauth2-redirect",
    "/redoc",
    "/favicon.ico",
];

/// Status label for `code`: the literal code, or its class (`"4xx"`) when
/// `grouped`.
pub fn bucket_status(code: u16, grouped: bool) -> String {
    let literal = code.to_string();
    if grouped {
        format!("{}xx", &literal[..1])
    } else {
        literal
    }
}

/// The `path` label of a request.
///
/// The route template when template mode is on and the application reports
/// a full match; otherwise the literal `root_path + path`.
pub(crate) fn classify_path(
    scope: &Scope,
    resolver: Option<&dyn RouteResolver>,
    use_template_urls: bool,
) -> String {
    if use_template_urls {
        if let Some(template) = resolver.and_then(|r| r.match_route(scope).template().map(str::to_owned)) {
            return template;
        }
    }
    scope.full_path()
}

/// Base labels shared by all four counters for one request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct RequestLabels {
    pub(crate) method: &'static str,
    pub(crate) path: String,
}

impl RequestLabels {
    pub(crate) fn values(&self) -> [&str; 2] {
        [self.method, &self.path]
    }

    pub(crate) fn with_status<'a>(&'a self, status: &'a str) -> [&'a str; 3] {
        [self.method, &self.path, status]
    }
}
