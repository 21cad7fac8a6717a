//! Unified error type.

/// A type-erased error raised by an [`Application`](crate::Application).
///
/// The middleware never inspects or wraps these. Whatever an application
/// returns is handed back to the caller unchanged.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error type returned by tsu-metrics' fallible operations.
///
/// Application-level errors (404, 422, etc.) are expressed as HTTP
/// [`Response`](crate::Response) values, not as `Error`s. This type surfaces
/// configuration failures of the metrics layer and infrastructure failures of
/// the server: binding to a port, or an application that fails to start.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A metric with the same name but a different definition is already
    /// registered.
    #[error("metric `{name}` is already registered with a different definition")]
    DuplicateMetric { name: String },

    /// The underlying prometheus registry rejected a collector.
    #[error("registry: {0}")]
    Registry(#[from] prometheus::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The application failed while handling the lifespan startup event.
    #[error("application failed during startup: {0}")]
    Startup(#[source] BoxError),
}

impl Error {
    /// True for errors caused by how the metrics layer was set up, as opposed
    /// to runtime I/O.
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::DuplicateMetric { .. } | Self::Registry(_) => true,
            Self::Startup(e) => e.downcast_ref::<Error>().is_some_and(Error::is_configuration),
            Self::Io(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_failures_keep_their_configuration_cause() {
        let cause: BoxError = Error::DuplicateMetric { name: "requests_total".into() }.into();
        assert!(Error::Startup(cause).is_configuration());

        let other: BoxError = "database unreachable".into();
        assert!(!Error::Startup(other).is_configuration());
    }
}
