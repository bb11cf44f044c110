use std::sync::Arc;

/// Result type used throughout the Unleash client.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can be returned by the Unleash client.
///
/// Most of them never reach the caller of [`Client::is_enabled`](crate::Client::is_enabled):
/// network and encoding failures are absorbed while there is any data to serve. The single
/// error surfaced from flag evaluation is [`Error::NoDataAvailable`].
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// No feature data could be loaded from the server, the shared cache, or the backup.
    #[error("could not load feature data from anywhere (server, shared cache or backup)")]
    NoDataAvailable,

    /// The requested feature is not known.
    #[error("feature {0:?} not found")]
    UnknownFeature(String),

    /// The requested strategy has not been registered.
    #[error("strategy {0:?} is not registered")]
    UnknownStrategy(String),

    /// A strategy with the same name has already been registered.
    #[error("a strategy with the name {0:?} has already been registered")]
    DuplicateStrategy(String),

    /// A feature definition is invalid (no strategies, missing required fields).
    #[error("invalid feature: {0}")]
    InvalidFeature(String),

    /// Invalid `unleash_host` configuration.
    #[error("invalid unleash_host configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// Shared cache keys may only contain `A-Z`, `a-z`, `0-9`, `_`, `.` and `-`.
    #[error("invalid cache key {0:?}")]
    InvalidCacheKey(String),

    /// The server replied with a status code the client does not know how to handle.
    #[error("unexpected response status {0}")]
    UnexpectedStatus(u16),

    /// The metrics reporter thread panicked. This should normally never happen.
    #[error("metrics reporter thread panicked")]
    ReporterThreadPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Error encoding or decoding JSON.
    #[error(transparent)]
    Json(Arc<serde_json::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}
