//! The task generator worker.
//!
//! Drains the external task source into the task queue. The queue's capacity
//! is the backpressure point: while it is full, the source is not polled.
//! The orchestrator treats this worker's termination as one of the
//! preconditions for shutdown.

use super::TaskSource;
use crate::error::CrawlError;
use crate::handler::HandlerRegistry;
use crate::state::CrawlContext;
use futures_util::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, trace};

pub(crate) fn spawn_task_generator(
    ctx: Arc<CrawlContext>,
    handlers: Arc<HandlerRegistry>,
    mut source: TaskSource,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        trace!("Task generator started");
        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.halt.cancelled() => {
                    debug!("Work disallowed, task generator stopping");
                    break;
                }
                next = AssertUnwindSafe(source.next()).catch_unwind() => next,
            };

            let request = match next {
                Ok(Some(Ok(request))) => request,
                Ok(None) => {
                    debug!("Task source exhausted");
                    break;
                }
                Ok(Some(Err(e))) => {
                    ctx.report_fatal(CrawlError::Generator(e)).await;
                    break;
                }
                Err(panic) => {
                    ctx.report_fatal(CrawlError::from_panic("generator", panic)).await;
                    break;
                }
            };

            if !ctx.work_allowed() {
                break;
            }
            if let Err(e) = handlers.get(&request.tag) {
                ctx.report_fatal(e).await;
                break;
            }

            trace!(url = %request.url, tag = %request.tag, "Enqueueing seed request");
            if ctx.tasks.push(request, &ctx.halt).await.is_err() {
                ctx.stats.increment_requests_discarded();
                break;
            }
            ctx.stats.increment_requests_enqueued();
        }
        trace!("Task generator finished");
    })
}
