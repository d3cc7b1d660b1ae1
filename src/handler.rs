//! # Handler Module
//!
//! Defines the [`Handler`] trait and the tag-keyed [`HandlerRegistry`].
//!
//! ## Overview
//!
//! Every [`Request`] carries a `tag`. When its response arrives, a parser
//! worker looks the tag up in the registry and hands the request/response pair
//! to the bound handler. The handler returns a [`HandlerOutput`]: either
//! nothing, or a lazy sequence of follow-up requests that the parser feeds
//! back into the task queue one by one.
//!
//! The registry is filled before the crawl starts and frozen when the crawler
//! is built, so parser workers read it without any locking.
//!
//! ## Example
//!
//! ```rust,ignore
//! use crawl_engine::{HandlerOutput, HandlerRegistry, Request};
//!
//! let mut handlers = HandlerRegistry::new();
//! handlers.register_fn("listing", |_req, resp| {
//!     let links = extract_links(&resp.text());
//!     Ok(HandlerOutput::lazy(links.into_iter().map(|url| Request::parse(&url, "article").map_err(Into::into))))
//! })?;
//! handlers.register_fn("article", |_req, _resp| Ok(HandlerOutput::none()))?;
//! ```

use crate::error::CrawlError;
use crate::request::{Request, Response};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Processes the response of a request and optionally yields follow-up requests.
pub trait Handler: Send + Sync + 'static {
    /// Handles one fetched response.
    ///
    /// Errors returned here, or yielded from the output sequence, are fatal to
    /// the crawl.
    fn handle(&self, request: Request, response: Response) -> anyhow::Result<HandlerOutput>;
}

impl<F> Handler for F
where
    F: Fn(Request, Response) -> anyhow::Result<HandlerOutput> + Send + Sync + 'static,
{
    fn handle(&self, request: Request, response: Response) -> anyhow::Result<HandlerOutput> {
        self(request, response)
    }
}

type RequestIter = Box<dyn Iterator<Item = anyhow::Result<Request>> + Send>;

/// What a handler produced: nothing, or a lazy, finite sequence of requests.
#[derive(Default)]
pub struct HandlerOutput {
    requests: Option<RequestIter>,
}

impl HandlerOutput {
    /// The handler produced no further work.
    pub fn none() -> Self {
        Self::default()
    }

    /// A ready-made list of follow-up requests.
    pub fn requests<I>(requests: I) -> Self
    where
        I: IntoIterator<Item = Request>,
        I::IntoIter: Send + 'static,
    {
        Self::lazy(requests.into_iter().map(Ok))
    }

    /// A lazily evaluated sequence. Each element is pulled only after the
    /// previous one has been enqueued; an `Err` element aborts the sequence.
    pub fn lazy<I>(requests: I) -> Self
    where
        I: Iterator<Item = anyhow::Result<Request>> + Send + 'static,
    {
        HandlerOutput {
            requests: Some(Box::new(requests)),
        }
    }

    /// Returns `true` if the handler produced no sequence at all.
    pub fn is_none(&self) -> bool {
        self.requests.is_none()
    }

    pub(crate) fn into_requests(self) -> Option<RequestIter> {
        self.requests
    }
}

impl fmt::Debug for HandlerOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerOutput")
            .field("has_requests", &self.requests.is_some())
            .finish()
    }
}

/// Tag to handler bindings, built once before the crawl.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handler` to `tag`. Binding the same tag twice is rejected.
    pub fn register<H>(&mut self, tag: impl Into<String>, handler: H) -> Result<(), CrawlError>
    where
        H: Handler,
    {
        let tag = tag.into();
        if self.handlers.contains_key(&tag) {
            return Err(CrawlError::Configuration(format!(
                "handler for tag '{}' registered twice",
                tag
            )));
        }
        self.handlers.insert(tag, Arc::new(handler));
        Ok(())
    }

    /// Binds a closure to `tag`.
    ///
    /// Separate from [`register`](Self::register) so the closure's argument
    /// and return types are inferred at the call site.
    pub fn register_fn<F>(&mut self, tag: impl Into<String>, handler: F) -> Result<(), CrawlError>
    where
        F: Fn(Request, Response) -> anyhow::Result<HandlerOutput> + Send + Sync + 'static,
    {
        self.register(tag, handler)
    }

    /// Looks up the handler bound to `tag`.
    pub fn get(&self, tag: &str) -> Result<&Arc<dyn Handler>, CrawlError> {
        self.handlers
            .get(tag)
            .ok_or_else(|| CrawlError::UnknownHandler {
                tag: tag.to_string(),
            })
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered tags, in no particular order.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("tags", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
