//! # Response Parser Module
//!
//! Contains the parser worker pool.
//!
//! ## Overview
//!
//! Parser workers pull `(Request, Response)` pairs from the result queue,
//! dispatch them to the handler registered for the request's tag, and feed
//! every request the handler yields back into the task queue.
//!
//! The pull is bounded by `parser_poll_timeout`. When it times out and the
//! orchestrator has asked for a pause, the worker parks until resumed. A
//! parked worker can enqueue nothing, which is what lets the orchestrator
//! reason about quiescence. The same pull future is kept across timeouts, so
//! a pair handed over while the worker is parked stays counted as pending and
//! is processed after the resume.
//!
//! Handlers are synchronous and usually CPU-bound. Both the handler call and
//! every step of the sequence it yields run on tokio's blocking pool, keeping
//! the runtime threads free for fetches and supervision.
//!
//! Handler errors, malformed yields and handler panics are forwarded to the
//! fatal channel; the worker itself carries on with the next pair.

use crate::error::CrawlError;
use crate::handler::HandlerRegistry;
use crate::queue::Envelope;
use crate::request::{Request, Response};
use crate::state::{CrawlContext, WorkerRecord};
use std::pin::pin;
use std::sync::Arc;
use tracing::{debug, trace};

pub(crate) fn spawn_parser_worker(
    slot: usize,
    ctx: Arc<CrawlContext>,
    record: Arc<WorkerRecord>,
    handlers: Arc<HandlerRegistry>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        trace!(slot, "Parser worker started");
        let mut pull = pin!(ctx.results.pull());
        loop {
            let pulled =
                tokio::time::timeout(ctx.config.parser_poll_timeout, pull.as_mut()).await;
            let (request, response) = match pulled {
                Ok(Envelope::Item(pair)) => pair,
                Ok(Envelope::Sentinel) => break,
                Err(_) => {
                    if ctx.gate.is_requested() {
                        trace!(slot, "Parser pausing");
                        ctx.gate.park(&record).await;
                        trace!(slot, "Parser resumed");
                    }
                    continue;
                }
            };
            pull.set(ctx.results.pull());
            ctx.results.ack();

            if !ctx.work_allowed() {
                trace!(slot, url = %request.url, "Discarding response after halt");
                ctx.stats.increment_requests_discarded();
                continue;
            }
            if let Err(err) = dispatch(&ctx, &handlers, request, response).await {
                ctx.report_fatal(err).await;
            }
        }
        trace!(slot, "Parser worker finished");
    })
}

/// Runs `f` on the blocking pool. A panic inside `f` comes back as an error.
async fn off_runtime<F, T>(f: F) -> Result<T, CrawlError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        if e.is_panic() {
            CrawlError::from_panic("parser", e.into_panic())
        } else {
            CrawlError::WorkerPanic {
                role: "parser",
                message: e.to_string(),
            }
        }
    })
}

async fn dispatch(
    ctx: &CrawlContext,
    handlers: &HandlerRegistry,
    request: Request,
    response: Response,
) -> Result<(), CrawlError> {
    let tag = request.tag.clone();
    let url = request.url.to_string();
    let handler = Arc::clone(handlers.get(&tag)?);
    debug!(%url, %tag, "Dispatching response");

    let output = off_runtime(move || handler.handle(request, response))
        .await?
        .map_err(|source| CrawlError::Handler {
            tag: tag.clone(),
            url: url.clone(),
            source,
        })?;

    let Some(mut requests) = output.into_requests() else {
        ctx.stats.increment_responses_parsed();
        return Ok(());
    };

    let mut produced = 0usize;
    loop {
        let (rest, next) = off_runtime(move || {
            let next = requests.next();
            (requests, next)
        })
        .await?;
        requests = rest;
        let Some(next) = next else { break };

        let follow = next.map_err(|source| CrawlError::MalformedRequest {
            tag: tag.clone(),
            source,
        })?;
        if !handlers.contains(&follow.tag) {
            return Err(CrawlError::MalformedRequest {
                tag: tag.clone(),
                source: anyhow::anyhow!(
                    "request for {} carries unregistered tag '{}'",
                    follow.url,
                    follow.tag
                ),
            });
        }

        trace!(url = %follow.url, tag = %follow.tag, "Enqueueing follow-up request");
        if ctx.tasks.push(follow, &ctx.halt).await.is_err() {
            ctx.stats.increment_requests_discarded();
            return Ok(());
        }
        ctx.stats.increment_requests_enqueued();
        ctx.stats.increment_requests_followed();
        produced += 1;
    }

    ctx.stats.increment_responses_parsed();
    trace!(%url, %tag, produced, "Handler finished");
    Ok(())
}
