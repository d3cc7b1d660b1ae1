//! External entry point into the task queue.

use crate::error::CrawlError;
use crate::handler::HandlerRegistry;
use crate::request::Request;
use crate::state::CrawlContext;
use std::sync::Arc;
use tracing::trace;

/// Cloneable handle that adds requests to a crawl from outside its workers,
/// e.g. from a task spawned in [`CrawlHooks::on_start`](crate::CrawlHooks::on_start).
///
/// Obtained with [`Crawler::task_injector`](crate::Crawler::task_injector).
#[derive(Clone)]
pub struct TaskInjector {
    ctx: Arc<CrawlContext>,
    handlers: Arc<HandlerRegistry>,
}

impl TaskInjector {
    pub(crate) fn new(ctx: Arc<CrawlContext>, handlers: Arc<HandlerRegistry>) -> Self {
        TaskInjector { ctx, handlers }
    }

    /// Pushes `request` onto the task queue, waiting while the queue is full.
    ///
    /// Before the run starts at most `network_worker_count` requests fit;
    /// further calls wait for the network pool. Fails with
    /// [`CrawlError::UnknownHandler`] for an unregistered tag and with
    /// [`CrawlError::Stopped`] once the crawl no longer accepts work. A request
    /// accepted while the crawl is shutting down may still be discarded.
    pub async fn add_task(&self, request: Request) -> Result<(), CrawlError> {
        self.handlers.get(&request.tag)?;
        trace!(url = %request.url, tag = %request.tag, "Injecting request");
        self.ctx
            .tasks
            .push(request, &self.ctx.halt)
            .await
            .map_err(|_| CrawlError::Stopped)?;
        self.ctx.stats.increment_requests_enqueued();
        Ok(())
    }

    /// `false` once the crawl has stopped accepting work.
    pub fn is_accepting(&self) -> bool {
        self.ctx.work_allowed()
    }

    /// Looks up a crawler-level meta value.
    pub fn meta(&self, key: &str) -> Option<&serde_json::Value> {
        self.ctx.config.meta.get(key)
    }
}
