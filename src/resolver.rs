//! Route-template lookup as an optional capability.
//!
//! Metrics labelled with literal paths explode in cardinality: every user id
//! becomes its own time series. Labelling with the route template
//! (`/users/{id}`) keeps one series per handler. Only the application knows
//! its templates, so it exposes them through [`RouteResolver`]; anything that
//! does not is simply labelled with literal paths.

use std::sync::Arc;

use crate::scope::Scope;

/// Outcome of matching a scope against an application's routes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RouteMatch {
    /// No route knows this path.
    None,
    /// A route knows the path but would not serve this request as-is,
    /// e.g. the path is registered under a different method.
    Partial,
    /// A route serves this exact request.
    Full { template: Arc<str> },
}

impl RouteMatch {
    /// The template of a full match. Partial matches yield nothing: a 405 on
    /// `/users/{id}` must not be reported as traffic to that route.
    pub fn template(&self) -> Option<&str> {
        match self {
            Self::Full { template } => Some(template),
            Self::None | Self::Partial => None,
        }
    }
}

pub trait RouteResolver: Send + Sync + 'static {
    fn match_route(&self, scope: &Scope) -> RouteMatch;
}
