//! # Error Module
//!
//! Error taxonomy of the crawl engine.
//!
//! Two layers exist:
//!
//! - [`FetchError`] is what a [`Transport`](crate::Transport) reports. Its
//!   [`Network`](FetchError::Network) variant is the transient kind that the
//!   network pool retries; anything else is fatal to the run.
//! - [`CrawlError`] is the only error that ever leaves
//!   [`Crawler::run`](crate::Crawler::run). Generator failures, handler
//!   failures, unclassified fetch failures and caught worker panics all end up
//!   here, carrying the original error whole.

use std::any::Any;
use thiserror::Error;

/// Result type alias used throughout the engine.
pub type Result<T, E = CrawlError> = std::result::Result<T, E>;

/// Failure reported by a transport for a single fetch attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level failure (timeout, DNS, connection reset). Retried.
    #[error("network error: {0}")]
    Network(#[source] anyhow::Error),

    /// Any other failure. Not retried; escalated as fatal.
    #[error("fetch failed: {0}")]
    Other(#[source] anyhow::Error),
}

impl FetchError {
    /// Builds a transient network error from any error value.
    pub fn network<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        FetchError::Network(err.into())
    }

    /// Builds a non-retryable fetch error from any error value.
    pub fn other<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        FetchError::Other(err.into())
    }

    /// Returns `true` when the failure is transient and the request may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Network(_))
    }
}

/// Fatal errors surfaced by a crawl run.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// The crawler was assembled with invalid settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The task source failed while producing the next request.
    #[error("task generator failed: {0}")]
    Generator(#[source] anyhow::Error),

    /// A transport failed with a non-transient error.
    #[error("fetch of {url} failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    /// A handler returned an error, either directly or while yielding requests.
    #[error("handler '{tag}' failed on {url}: {source}")]
    Handler {
        tag: String,
        url: String,
        #[source]
        source: anyhow::Error,
    },

    /// A request reached dispatch with a tag nobody registered.
    #[error("no handler registered for tag '{tag}'")]
    UnknownHandler { tag: String },

    /// A handler yielded something that is not a dispatchable request.
    #[error("handler '{tag}' yielded a malformed request: {source}")]
    MalformedRequest {
        tag: String,
        #[source]
        source: anyhow::Error,
    },

    /// A worker panicked inside a transport or handler call.
    #[error("{role} worker panicked: {message}")]
    WorkerPanic { role: &'static str, message: String },

    /// A request was offered after the crawl stopped accepting work.
    #[error("crawl no longer accepts work")]
    Stopped,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CrawlError {
    pub(crate) fn from_panic(role: &'static str, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        CrawlError::WorkerPanic { role, message }
    }
}
