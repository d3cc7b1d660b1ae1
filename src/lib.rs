//! # crawl-engine
//!
//! Concurrent crawl orchestration: a task generator, a pool of network
//! workers and a pool of parser workers connected by bounded queues, with an
//! orchestrator that detects when the crawl has run out of work.
//!
//! The engine owns no protocol and no parsing logic. Plug in a [`Transport`]
//! that performs fetches and [`Handler`]s that turn responses into further
//! requests.
//!
//! ## Example
//!
//! ```rust,ignore
//! use crawl_engine::prelude::*;
//!
//! struct HttpTransport;
//!
//! #[async_trait]
//! impl Transport for HttpTransport {
//!     async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
//!         todo!()
//!     }
//! }
//!
//! async fn run_crawler() -> Result<(), CrawlError> {
//!     let crawler = CrawlerBuilder::new()
//!         .transport(HttpTransport)
//!         .start_requests(vec![Request::parse("https://example.com", "index").unwrap()])
//!         .handler_fn("index", |_req, _resp| Ok(HandlerOutput::none()))
//!         .build()?;
//!     crawler.run().await
//! }
//! ```

pub mod builder;
pub mod crawler;
pub mod error;
pub mod handler;
pub mod hooks;
pub mod prelude;
pub(crate) mod queue;
pub mod request;
pub mod state;
pub mod stats;
pub mod transport;

pub use builder::{CrawlerBuilder, CrawlerConfig};
pub use crawler::{Crawler, TaskInjector, TaskSource};
pub use error::{CrawlError, FetchError};
pub use handler::{Handler, HandlerOutput, HandlerRegistry};
pub use hooks::{CrawlHooks, NoopHooks};
pub use request::{Request, Response};
pub use stats::StatCollector;
pub use transport::Transport;

pub use async_trait::async_trait;
pub use tokio;
