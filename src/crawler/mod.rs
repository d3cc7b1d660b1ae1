//! # Crawler Module
//!
//! Implements the crawling engine: three worker roles connected by bounded
//! queues, and the orchestrator that decides when the crawl is over.
//!
//! ## Key Components
//!
//! - **Crawler**: the orchestrator. Owns the quiescence check and the
//!   shutdown sequence; the only component that sees every worker's state.
//! - **Task generator**: drains the task source into the task queue.
//! - **Network workers**: fetch requests, retry transient failures, forward
//!   responses to the result queue.
//! - **Parser workers**: dispatch responses to handlers and enqueue the
//!   requests they yield.
//! - **TaskInjector**: lets code outside the workers add requests.
//!
//! ## Architecture
//!
//! ```text
//! task source -> [task queue] -> network pool -> [result queue] -> parser pool
//!                     ^                                                 |
//!                     +-------------------------------------------------+
//! ```
//!
//! Fatal errors from any worker travel over a separate unbounded channel to
//! the orchestrator, which stops the crawl on the first one.

mod core;
mod request_handler;
mod response_parser;
mod task_generator;
mod task_injector;

use crate::request::Request;
use futures_util::stream::BoxStream;

pub use self::core::Crawler;
pub(crate) use request_handler::spawn_network_worker;
pub(crate) use response_parser::spawn_parser_worker;
pub(crate) use task_generator::spawn_task_generator;
pub use task_injector::TaskInjector;

/// Lazy source of seed requests. An `Err` item is fatal to the crawl.
pub type TaskSource = BoxStream<'static, anyhow::Result<Request>>;
