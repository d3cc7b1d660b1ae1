//! A "prelude" for users of the `crawl-engine` crate.
//!
//! Re-exports the traits and types needed to assemble and run a crawl.
//!
//! # Example
//!
//! ```
//! use crawl_engine::prelude::*;
//! ```

pub use crate::{
    // Core structs
    Crawler,
    CrawlerBuilder,
    CrawlerConfig,
    HandlerOutput,
    HandlerRegistry,
    Request,
    Response,
    TaskInjector,
    // Core traits
    CrawlHooks,
    Handler,
    Transport,
    // Errors
    CrawlError,
    FetchError,
    // Essential re-exports for trait implementation
    async_trait,
};
