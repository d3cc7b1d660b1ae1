//! Contains the network worker pool.
//!
//! Every worker competes for requests on the shared task queue and:
//!
//! - marks itself active, then acknowledges the pull, so the orchestrator
//!   never sees a request that is neither queued nor held by an active worker
//! - invokes the transport once per pull
//! - puts transient failures back on the task queue until the request's
//!   retry budget is spent, then rejects it
//! - escalates every other failure to the fatal channel and moves on
//! - forwards successful fetches to the result queue
//!
//! The worker exits when it pulls a sentinel.

use crate::error::{CrawlError, FetchError};
use crate::queue::Envelope;
use crate::request::Request;
use crate::state::{CrawlContext, WorkerRecord};
use crate::stats::NETWORK_TRY_LIMIT_KEY;
use crate::transport::Transport;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub(crate) fn spawn_network_worker(
    slot: usize,
    ctx: Arc<CrawlContext>,
    record: Arc<WorkerRecord>,
    transport: Arc<dyn Transport>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        trace!(slot, "Network worker started");
        loop {
            let request = match ctx.tasks.pull().await {
                Envelope::Item(request) => request,
                Envelope::Sentinel => break,
            };
            let _active = record.activate();
            ctx.tasks.ack();

            if !ctx.work_allowed() {
                trace!(slot, url = %request.url, "Discarding request after halt");
                ctx.stats.increment_requests_discarded();
                continue;
            }
            process_request(&ctx, transport.as_ref(), request).await;
        }
        trace!(slot, "Network worker finished");
    })
}

async fn process_request(ctx: &CrawlContext, transport: &dyn Transport, request: Request) {
    trace!(url = %request.url, attempt = request.network_try_count + 1, "Fetching");
    ctx.stats.increment_fetch_attempts();

    let outcome = AssertUnwindSafe(transport.fetch(&request))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(response)) => {
            ctx.stats.increment_fetches_succeeded();
            trace!(url = %request.url, status = response.status, "Fetch succeeded");
            if ctx.results.push((request, response), &ctx.halt).await.is_err() {
                ctx.stats.increment_requests_discarded();
            }
        }
        Ok(Err(err @ FetchError::Network(_))) => handle_transient(ctx, request, err).await,
        Ok(Err(FetchError::Other(source))) => {
            ctx.report_fatal(CrawlError::Fetch {
                url: request.url.to_string(),
                source,
            })
            .await;
        }
        Err(panic) => {
            ctx.report_fatal(CrawlError::from_panic("network", panic)).await;
        }
    }
}

async fn handle_transient(ctx: &CrawlContext, mut request: Request, err: FetchError) {
    let limit = ctx.config.network_try_limit;
    if request.network_try_count >= limit {
        warn!(
            url = %request.url,
            attempts = request.network_try_count + 1,
            error = %err,
            "Network retry limit reached, rejecting request"
        );
        ctx.stats.increment_requests_rejected();
        ctx.stats
            .store(NETWORK_TRY_LIMIT_KEY, format!("{}|{}", request.url, err));
        ctx.hooks.on_rejected(&request, None, &err);
        return;
    }

    request.network_try_count += 1;
    debug!(
        url = %request.url,
        retry = request.network_try_count,
        limit,
        error = %err,
        "Transient network error, re-queueing request"
    );
    ctx.stats.increment_requests_retried();
    if ctx.tasks.push(request, &ctx.halt).await.is_err() {
        ctx.stats.increment_requests_discarded();
    }
}
