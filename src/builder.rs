//! # Builder Module
//!
//! Provides the `CrawlerBuilder`, a fluent API for constructing and configuring
//! `Crawler` instances.
//!
//! ## Overview
//!
//! The builder collects the pieces a crawl needs: a transport, the handler
//! registry, an optional task source, lifecycle hooks and the concurrency
//! settings in [`CrawlerConfig`]. Registration mistakes are remembered and
//! reported by [`CrawlerBuilder::build`], so the chain itself never fails.
//!
//! ## Example
//!
//! ```rust,ignore
//! use crawl_engine::{CrawlerBuilder, HandlerOutput, Request};
//!
//! async fn crawl() -> Result<(), CrawlError> {
//!     let crawler = CrawlerBuilder::new()
//!         .network_workers(16)
//!         .network_try_limit(3)
//!         .transport(MyTransport::default())
//!         .start_requests(vec![Request::parse("https://example.com", "index")?])
//!         .handler_fn("index", |_req, resp| Ok(HandlerOutput::none()))
//!         .build()?;
//!
//!     crawler.run().await
//! }
//! ```

use crate::crawler::{Crawler, TaskSource};
use crate::error::CrawlError;
use crate::handler::{Handler, HandlerOutput, HandlerRegistry};
use crate::hooks::{CrawlHooks, NoopHooks};
use crate::queue::FatalChannel;
use crate::request::{Request, Response};
use crate::stats::StatCollector;
use crate::transport::Transport;
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Concurrency and retry settings of a crawl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// Size of the network worker pool; also the task queue capacity.
    #[serde(default = "default_network_worker_count")]
    pub network_worker_count: usize,

    /// Size of the parser worker pool; also the result queue capacity.
    #[serde(default = "default_parser_worker_count")]
    pub parser_worker_count: usize,

    /// Transient failures tolerated per request before it is rejected.
    #[serde(default = "default_try_limit")]
    pub network_try_limit: u32,

    /// Accepted for compatibility; not enforced by the engine.
    #[serde(default = "default_try_limit")]
    pub task_try_limit: u32,

    /// How long an idle parser waits for a result before checking for a pause
    /// request.
    #[serde(default = "default_parser_poll_timeout", with = "duration_millis")]
    pub parser_poll_timeout: Duration,

    /// How long the orchestrator waits on the fatal channel per loop iteration.
    #[serde(default = "default_control_poll_interval", with = "duration_millis")]
    pub control_poll_interval: Duration,

    /// Free-form crawler-level data, readable through
    /// [`Crawler::meta`] and [`TaskInjector::meta`](crate::TaskInjector::meta).
    #[serde(default)]
    pub meta: Map<String, Value>,
}

fn default_network_worker_count() -> usize {
    10
}

// Parsing is CPU-bound; half the logical cores leaves room for hyperthread siblings.
fn default_parser_worker_count() -> usize {
    (num_cpus::get() / 2).max(1)
}

fn default_try_limit() -> u32 {
    10
}

fn default_parser_poll_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_control_poll_interval() -> Duration {
    Duration::from_millis(100)
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        CrawlerConfig {
            network_worker_count: default_network_worker_count(),
            parser_worker_count: default_parser_worker_count(),
            network_try_limit: default_try_limit(),
            task_try_limit: default_try_limit(),
            parser_poll_timeout: default_parser_poll_timeout(),
            control_poll_interval: default_control_poll_interval(),
            meta: Map::new(),
        }
    }
}

impl CrawlerConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, CrawlError> {
        Ok(serde_json::from_str(json)?)
    }

    fn validate(&self) -> Result<(), CrawlError> {
        if self.network_worker_count == 0 {
            return Err(CrawlError::Configuration(
                "network_worker_count must be greater than 0.".to_string(),
            ));
        }
        if self.parser_worker_count == 0 {
            return Err(CrawlError::Configuration(
                "parser_worker_count must be greater than 0.".to_string(),
            ));
        }
        if self.parser_poll_timeout.is_zero() || self.control_poll_interval.is_zero() {
            return Err(CrawlError::Configuration(
                "poll intervals must be non-zero.".to_string(),
            ));
        }
        Ok(())
    }
}

// Durations are written as integer milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

pub struct CrawlerBuilder {
    crawler_config: CrawlerConfig,
    transport: Option<Arc<dyn Transport>>,
    handlers: HandlerRegistry,
    hooks: Arc<dyn CrawlHooks>,
    task_source: Option<TaskSource>,
    registration_error: Option<CrawlError>,
}

impl Default for CrawlerBuilder {
    fn default() -> Self {
        Self {
            crawler_config: CrawlerConfig::default(),
            transport: None,
            handlers: HandlerRegistry::new(),
            hooks: Arc::new(NoopHooks),
            task_source: None,
            registration_error: None,
        }
    }
}

impl CrawlerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every concurrency and retry setting at once.
    pub fn config(mut self, config: CrawlerConfig) -> Self {
        self.crawler_config = config;
        self
    }

    /// Sets the number of network workers.
    pub fn network_workers(mut self, count: usize) -> Self {
        self.crawler_config.network_worker_count = count;
        self
    }

    /// Sets the number of parser workers.
    pub fn parser_workers(mut self, count: usize) -> Self {
        self.crawler_config.parser_worker_count = count;
        self
    }

    /// Sets how many transient failures a request may suffer before rejection.
    pub fn network_try_limit(mut self, limit: u32) -> Self {
        self.crawler_config.network_try_limit = limit;
        self
    }

    pub fn task_try_limit(mut self, limit: u32) -> Self {
        self.crawler_config.task_try_limit = limit;
        self
    }

    pub fn parser_poll_timeout(mut self, timeout: Duration) -> Self {
        self.crawler_config.parser_poll_timeout = timeout;
        self
    }

    pub fn control_poll_interval(mut self, interval: Duration) -> Self {
        self.crawler_config.control_poll_interval = interval;
        self
    }

    /// Attaches a crawler-level meta value, replacing any previous value under `key`.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.crawler_config.meta.insert(key.into(), value.into());
        self
    }

    /// Sets the transport used by every network worker.
    pub fn transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Uses an already populated registry, replacing earlier registrations.
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Binds `handler` to `tag`.
    pub fn handler<H: Handler>(mut self, tag: impl Into<String>, handler: H) -> Self {
        if let Err(e) = self.handlers.register(tag, handler) {
            self.registration_error.get_or_insert(e);
        }
        self
    }

    /// Binds a closure to `tag`.
    pub fn handler_fn<F>(self, tag: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request, Response) -> anyhow::Result<HandlerOutput> + Send + Sync + 'static,
    {
        self.handler(tag, handler)
    }

    pub fn hooks<H: CrawlHooks>(mut self, hooks: H) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Sets the lazy, possibly infinite source of seed requests.
    pub fn task_source<S>(mut self, source: S) -> Self
    where
        S: Stream<Item = anyhow::Result<Request>> + Send + 'static,
    {
        self.task_source = Some(source.boxed());
        self
    }

    /// Seeds the crawl from a plain collection of requests.
    pub fn start_requests<I>(self, requests: I) -> Self
    where
        I: IntoIterator<Item = Request>,
        I::IntoIter: Send + 'static,
    {
        self.task_source(stream::iter(requests.into_iter().map(Ok)))
    }

    /// Builds the `Crawler`, validating the collected settings.
    pub fn build(self) -> Result<Crawler, CrawlError> {
        if let Some(e) = self.registration_error {
            return Err(e);
        }
        self.crawler_config.validate()?;
        let transport = self.transport.ok_or_else(|| {
            CrawlError::Configuration("Crawler must have a transport.".to_string())
        })?;
        if self.handlers.is_empty() {
            return Err(CrawlError::Configuration(
                "Crawler must have at least one handler.".to_string(),
            ));
        }

        Ok(Crawler::new(
            self.crawler_config,
            transport,
            Arc::new(self.handlers),
            self.hooks,
            self.task_source.unwrap_or_else(|| stream::empty().boxed()),
            Arc::new(StatCollector::new()),
            FatalChannel::new(),
        ))
    }
}
