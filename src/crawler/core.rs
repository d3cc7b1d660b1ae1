//! The core Crawler implementation.
//!
//! This module defines the `Crawler` struct, the orchestrator of a crawl run.
//! It spawns the task generator and both worker pools, then supervises them
//! until the crawl either fails or goes quiet.
//!
//! Supervision is a small state machine:
//!
//! - **Running**: wait briefly on the fatal channel; a fatal error ends the
//!   run. Otherwise, once the generator has finished and both queues look
//!   empty, move on to draining. That first look is only a hint.
//! - **Draining**: ask the parsers to pause and wait until all of them are
//!   parked. A parked parser cannot enqueue, so the only possible producers
//!   left are network workers. Then run the precise check (see
//!   [`is_quiescent`]). If it holds, work is disallowed. If work shows up
//!   again before every parser has parked, the round is abandoned: a busy
//!   parser may need its parked peers to drain the result queue. Either way
//!   the parsers are resumed, and the machine stops or returns to running.
//! - **Stopped**: one sentinel per worker, join everything, drain the fatal
//!   channel a last time, call the shutdown hook.

use super::{
    TaskInjector, TaskSource, spawn_network_worker, spawn_parser_worker, spawn_task_generator,
};
use crate::builder::CrawlerConfig;
use crate::error::CrawlError;
use crate::handler::HandlerRegistry;
use crate::hooks::CrawlHooks;
use crate::queue::{FatalChannel, WorkQueue};
use crate::state::{CrawlContext, WorkerRoster};
use crate::stats::StatCollector;
use crate::transport::Transport;
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

/// The central orchestrator of a crawl run.
pub struct Crawler {
    ctx: Arc<CrawlContext>,
    transport: Arc<dyn Transport>,
    handlers: Arc<HandlerRegistry>,
    task_source: TaskSource,
}

impl Crawler {
    pub(crate) fn new(
        config: CrawlerConfig,
        transport: Arc<dyn Transport>,
        handlers: Arc<HandlerRegistry>,
        hooks: Arc<dyn CrawlHooks>,
        task_source: TaskSource,
        stats: Arc<StatCollector>,
        fatal: FatalChannel,
    ) -> Self {
        Crawler {
            ctx: Arc::new(CrawlContext::new(config, fatal, stats, hooks)),
            transport,
            handlers,
            task_source,
        }
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.ctx.config
    }

    /// Looks up a crawler-level meta value.
    pub fn meta(&self, key: &str) -> Option<&serde_json::Value> {
        self.ctx.config.meta.get(key)
    }

    /// Returns the shared statistics of this crawler.
    ///
    /// Take a handle before calling [`run`](Self::run) to inspect the counters
    /// afterwards.
    pub fn get_stats(&self) -> Arc<StatCollector> {
        Arc::clone(&self.ctx.stats)
    }

    /// Returns a handle that adds requests to this crawl's task queue, before
    /// or during [`run`](Self::run).
    pub fn task_injector(&self) -> TaskInjector {
        TaskInjector::new(Arc::clone(&self.ctx), Arc::clone(&self.handlers))
    }

    /// Runs the crawl to completion.
    ///
    /// Returns `Ok(())` once no component can produce further work, or the
    /// first fatal error. In both cases every worker has been joined and the
    /// shutdown hook has run before this returns.
    pub async fn run(self) -> Result<(), CrawlError> {
        let Crawler {
            ctx,
            transport,
            handlers,
            task_source,
        } = self;

        info!(
            network_workers = ctx.config.network_worker_count,
            parser_workers = ctx.config.parser_worker_count,
            network_try_limit = ctx.config.network_try_limit,
            "Crawler starting"
        );
        ctx.hooks.on_start();

        let roster = WorkerRoster::new(
            ctx.config.network_worker_count,
            ctx.config.parser_worker_count,
        );

        trace!("Spawning task generator");
        let generator = spawn_task_generator(Arc::clone(&ctx), Arc::clone(&handlers), task_source);

        trace!("Spawning network workers");
        let network: Vec<_> = roster
            .network
            .iter()
            .enumerate()
            .map(|(slot, record)| {
                spawn_network_worker(slot, Arc::clone(&ctx), Arc::clone(record), Arc::clone(&transport))
            })
            .collect();

        trace!("Spawning parser workers");
        let parsers: Vec<_> = roster
            .parsers
            .iter()
            .enumerate()
            .map(|(slot, record)| {
                spawn_parser_worker(slot, Arc::clone(&ctx), Arc::clone(record), Arc::clone(&handlers))
            })
            .collect();
        drop(transport);
        drop(handlers);

        let mut failure = supervise(&ctx, &roster, &generator).await;
        if let Some(err) = &failure {
            error!(error = %err, "Fatal error, shutting down crawl");
        }

        ctx.disallow_work();
        ctx.gate.resume();

        debug!("Sending sentinels");
        for _ in 0..network.len() {
            ctx.tasks.push_sentinel().await;
        }
        for _ in 0..parsers.len() {
            ctx.results.push_sentinel().await;
        }

        debug!("Waiting for task generator");
        let mut late = join_workers("generator", vec![generator]).await;
        debug!("Waiting for network workers");
        late.extend(join_workers("network", network).await);
        debug!("Waiting for parser workers");
        late.extend(join_workers("parser", parsers).await);

        // A worker may have failed while the pools were winding down.
        let mut late_errors = ctx.fatal.drain();
        late_errors.extend(late);
        for err in late_errors {
            if failure.is_none() {
                failure = Some(err);
            } else {
                error!(error = %err, "Additional fatal error during shutdown");
            }
        }

        ctx.hooks.on_shutdown();

        match failure {
            Some(err) => {
                info!("Crawl aborted. {}", ctx.stats);
                Err(err)
            }
            None => {
                info!("Crawl finished successfully. {}", ctx.stats);
                Ok(())
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn fatal_channel(&self) -> FatalChannel {
        self.ctx.fatal.clone()
    }
}

/// Running/draining loop. Returns the fatal error that ended the crawl, or
/// `None` once quiescence has been proven.
async fn supervise(
    ctx: &CrawlContext,
    roster: &WorkerRoster,
    generator: &JoinHandle<()>,
) -> Option<CrawlError> {
    let mut drain_rounds = 0usize;
    loop {
        if let Some(err) = ctx.fatal.recv_timeout(ctx.config.control_poll_interval).await {
            return Some(err);
        }
        if !generator.is_finished() || !ctx.tasks.is_empty() || !ctx.results.is_empty() {
            continue;
        }

        drain_rounds += 1;
        if drain(ctx, roster).await {
            debug!(drain_rounds, "Shutdown allowed");
            return None;
        }
    }
}

/// One pause, check, resume cycle. Returns `true` if work was disallowed.
async fn drain(ctx: &CrawlContext, roster: &WorkerRoster) -> bool {
    let recheck = ctx.config.control_poll_interval;

    debug!("Pausing parsers");
    ctx.gate.request_pause();
    ctx.gate
        .wait_until(|| roster.parsers_paused() || work_resurfaced(ctx, roster), recheck)
        .await;

    let quiescent = if roster.parsers_paused() {
        debug!("All parsers paused");
        is_quiescent(&ctx.tasks, &ctx.results, roster)
    } else {
        debug!("Work resurfaced while pausing, abandoning drain round");
        false
    };
    if quiescent {
        ctx.disallow_work();
    } else {
        debug!(
            tasks = ctx.tasks.pending(),
            results = ctx.results.pending(),
            network_idle = roster.network_idle(),
            "Work still in flight"
        );
    }

    debug!("Unpausing parsers");
    ctx.gate.resume();
    ctx.gate.wait_until(|| roster.parsers_running(), recheck).await;
    debug!("All parsers running");
    quiescent
}

/// Queued work, a busy network worker or a pending fatal error. Any of these
/// ends the wait for a full pause.
fn work_resurfaced(ctx: &CrawlContext, roster: &WorkerRoster) -> bool {
    !ctx.tasks.is_empty()
        || !ctx.results.is_empty()
        || !roster.network_idle()
        || !ctx.fatal.is_empty()
}

/// The precise termination condition.
///
/// Only meaningful while the generator has finished and every parser is
/// parked. Reads, in order: the push counters, both queues' occupancy, every
/// network worker's `active` flag, the push counters again. Equal counters
/// mean no push started during the check, so occupancy could only fall after
/// it was read as zero; a worker read as idle could then not have picked
/// anything up either.
pub(crate) fn is_quiescent<A, B>(
    tasks: &WorkQueue<A>,
    results: &WorkQueue<B>,
    roster: &WorkerRoster,
) -> bool
where
    A: Send + 'static,
    B: Send + 'static,
{
    let pushes_before = tasks.enqueued_total() + results.enqueued_total();
    let drained = tasks.is_empty() && results.is_empty();
    let idle = roster.network_idle();
    let pushes_after = tasks.enqueued_total() + results.enqueued_total();

    trace!(
        drained,
        idle,
        pushes_before,
        pushes_after,
        "Quiescence check"
    );
    drained && idle && pushes_before == pushes_after
}

async fn join_workers(role: &'static str, handles: Vec<JoinHandle<()>>) -> Vec<CrawlError> {
    join_all(handles)
        .await
        .into_iter()
        .filter_map(|result| match result {
            Ok(()) => None,
            Err(e) if e.is_panic() => {
                error!(role, "Worker task panicked");
                Some(CrawlError::from_panic(role, e.into_panic()))
            }
            Err(e) => {
                error!(role, error = %e, "Worker task failed");
                None
            }
        })
        .collect()
}
