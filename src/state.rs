//! Module for tracking the operational state of the crawler.
//!
//! This module holds the coordination state shared between the orchestrator
//! and its workers:
//!
//! - [`WorkerRecord`]: per-worker `active` / `paused` flags, written only by
//!   the worker that owns them and read by the orchestrator.
//! - [`WorkerRoster`]: the slot-indexed collection of records the orchestrator
//!   inspects when deciding whether the crawl has gone quiet.
//! - `PauseGate`: the pause/resume handshake used to freeze parser workers
//!   while the orchestrator checks for quiescence.
//! - `CrawlContext`: the handle threaded into every worker at spawn time,
//!   bundling queues, the fatal channel, the work-allowed token and stats.

use crate::builder::CrawlerConfig;
use crate::error::CrawlError;
use crate::hooks::CrawlHooks;
use crate::queue::{FatalChannel, WorkQueue};
use crate::request::{Request, Response};
use crate::stats::StatCollector;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Liveness flags of one worker.
#[derive(Debug, Default)]
pub struct WorkerRecord {
    active: AtomicBool,
    paused: AtomicBool,
}

impl WorkerRecord {
    /// `true` while the worker holds a request it has not finished with.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// `true` while the worker is parked by a pause request.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Marks the worker active until the returned guard is dropped.
    pub(crate) fn activate(&self) -> ActiveGuard<'_> {
        self.active.store(true, Ordering::SeqCst);
        ActiveGuard { record: self }
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }
}

/// Clears the `active` flag on drop, whichever way the work item ended.
pub(crate) struct ActiveGuard<'a> {
    record: &'a WorkerRecord,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.record.active.store(false, Ordering::SeqCst);
    }
}

/// Records of every pooled worker, indexed by spawn slot.
#[derive(Debug)]
pub struct WorkerRoster {
    pub(crate) network: Vec<Arc<WorkerRecord>>,
    pub(crate) parsers: Vec<Arc<WorkerRecord>>,
}

impl WorkerRoster {
    pub(crate) fn new(network_workers: usize, parser_workers: usize) -> Self {
        WorkerRoster {
            network: (0..network_workers).map(|_| Arc::default()).collect(),
            parsers: (0..parser_workers).map(|_| Arc::default()).collect(),
        }
    }

    /// `true` if no network worker is holding a request.
    pub fn network_idle(&self) -> bool {
        self.network.iter().all(|record| !record.is_active())
    }

    pub fn parsers_paused(&self) -> bool {
        self.parsers.iter().all(|record| record.is_paused())
    }

    pub fn parsers_running(&self) -> bool {
        self.parsers.iter().all(|record| !record.is_paused())
    }
}

/// Pause/resume handshake between the orchestrator and the parser pool.
pub(crate) struct PauseGate {
    requested: watch::Sender<bool>,
    transitions: Notify,
}

impl PauseGate {
    pub(crate) fn new() -> Self {
        let (requested, _) = watch::channel(false);
        PauseGate {
            requested,
            transitions: Notify::new(),
        }
    }

    pub(crate) fn is_requested(&self) -> bool {
        *self.requested.borrow()
    }

    pub(crate) fn request_pause(&self) {
        self.requested.send_replace(true);
    }

    pub(crate) fn resume(&self) {
        self.requested.send_replace(false);
    }

    /// Parks the calling parser until the pause is lifted.
    ///
    /// Returns at once if no pause is requested.
    pub(crate) async fn park(&self, record: &WorkerRecord) {
        let mut requested = self.requested.subscribe();
        if !*requested.borrow_and_update() {
            return;
        }
        record.set_paused(true);
        self.transitions.notify_waiters();

        // The sender lives as long as the gate, so this only ends on resume.
        let _ = requested.wait_for(|requested| !*requested).await;

        record.set_paused(false);
        self.transitions.notify_waiters();
    }

    /// Waits until `condition` holds, re-evaluating it whenever a parser parks
    /// or unparks, and at least every `recheck`.
    pub(crate) async fn wait_until(&self, condition: impl Fn() -> bool, recheck: Duration) {
        loop {
            let mut notified = pin!(self.transitions.notified());
            notified.as_mut().enable();
            if condition() {
                return;
            }
            let _ = tokio::time::timeout(recheck, notified).await;
        }
    }
}

/// Shared handle given to every worker of one run.
pub(crate) struct CrawlContext {
    pub(crate) config: CrawlerConfig,
    pub(crate) tasks: WorkQueue<Request>,
    pub(crate) results: WorkQueue<(Request, Response)>,
    pub(crate) fatal: FatalChannel,
    /// Cancelled once work is no longer allowed.
    pub(crate) halt: CancellationToken,
    pub(crate) gate: PauseGate,
    pub(crate) stats: Arc<StatCollector>,
    pub(crate) hooks: Arc<dyn CrawlHooks>,
}

impl CrawlContext {
    pub(crate) fn new(
        config: CrawlerConfig,
        fatal: FatalChannel,
        stats: Arc<StatCollector>,
        hooks: Arc<dyn CrawlHooks>,
    ) -> Self {
        CrawlContext {
            tasks: WorkQueue::new("tasks", config.network_worker_count),
            results: WorkQueue::new("results", config.parser_worker_count),
            config,
            fatal,
            halt: CancellationToken::new(),
            gate: PauseGate::new(),
            stats,
            hooks,
        }
    }

    pub(crate) fn work_allowed(&self) -> bool {
        !self.halt.is_cancelled()
    }

    pub(crate) fn disallow_work(&self) {
        self.halt.cancel();
    }

    /// Logs, counts and forwards a fatal error to the orchestrator.
    pub(crate) async fn report_fatal(&self, err: CrawlError) {
        error!(error = %err, "Fatal error in worker");
        self.stats.increment_fatal_errors();
        self.fatal.report(err).await;
    }
}
