//! Lifecycle hooks invoked by the crawler at well-defined points of a run.

use crate::error::FetchError;
use crate::request::{Request, Response};
use std::sync::Arc;

/// Callbacks around a crawl. Every method defaults to a no-op.
pub trait CrawlHooks: Send + Sync + 'static {
    /// Called once, before any worker is spawned.
    fn on_start(&self) {}

    /// Called when a request has exhausted its network retry budget.
    ///
    /// The rejection has already been counted in the crawl statistics.
    fn on_rejected(&self, _request: &Request, _response: Option<&Response>, _error: &FetchError) {}

    /// Called exactly once, after every worker has been joined and before
    /// [`Crawler::run`](crate::Crawler::run) returns.
    fn on_shutdown(&self) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl CrawlHooks for NoopHooks {}

impl<T: CrawlHooks + ?Sized> CrawlHooks for Arc<T> {
    fn on_start(&self) {
        (**self).on_start()
    }

    fn on_rejected(&self, request: &Request, response: Option<&Response>, error: &FetchError) {
        (**self).on_rejected(request, response, error)
    }

    fn on_shutdown(&self) {
        (**self).on_shutdown()
    }
}
