//! # Statistics Module
//!
//! Collects counters about a crawl run.
//!
//! ## Overview
//!
//! The `StatCollector` is shared by every worker through an `Arc` and updated
//! with atomic operations only. Besides plain counters it keeps a keyed record
//! store: the network pool files every rejected request under the
//! `network_try_limit` key as `"<url>|<error>"`.
//!
//! ## Key Metrics Tracked
//!
//! - **Requests**: enqueued, fetch attempts, fetched, retried, rejected
//! - **Parsing**: responses parsed, follow-up requests produced
//! - **Failures**: fatal errors seen, items discarded after a halt
//!
//! ## Example
//!
//! ```rust,ignore
//! let crawler = CrawlerBuilder::new().transport(t).handler_fn("a", h).build()?;
//! let stats = crawler.get_stats();
//! crawler.run().await?;
//! println!("{}", stats);
//! println!("{}", stats.to_json_string_pretty()?);
//! ```

use crate::error::CrawlError;
use dashmap::DashMap;
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

/// Record key under which rejected requests are stored.
pub const NETWORK_TRY_LIMIT_KEY: &str = "network_try_limit";

// A consistent read of the counters, used by the presentation methods.
struct StatsSnapshot {
    requests_enqueued: usize,
    fetch_attempts: usize,
    fetches_succeeded: usize,
    requests_retried: usize,
    requests_rejected: usize,
    responses_parsed: usize,
    requests_followed: usize,
    fatal_errors: usize,
    requests_discarded: usize,
    elapsed_duration: Duration,
}

impl StatsSnapshot {
    fn fetches_per_second(&self) -> f64 {
        let total_seconds = self.elapsed_duration.as_secs_f64();
        if total_seconds > 0.0 {
            self.fetch_attempts as f64 / total_seconds
        } else {
            0.0
        }
    }
}

/// Counters describing a crawl run.
#[derive(Debug, serde::Serialize)]
pub struct StatCollector {
    #[serde(skip)]
    pub start_time: Instant,

    /// Requests accepted into the task queue (seeds and follow-ups, not retries).
    pub requests_enqueued: AtomicUsize,
    /// Calls made to the transport, retries included.
    pub fetch_attempts: AtomicUsize,
    pub fetches_succeeded: AtomicUsize,
    /// Requests put back on the task queue after a transient failure.
    pub requests_retried: AtomicUsize,
    /// Requests abandoned after exhausting their retry budget.
    pub requests_rejected: AtomicUsize,

    /// Handler dispatches that completed without error.
    pub responses_parsed: AtomicUsize,
    /// Requests yielded by handlers and enqueued.
    pub requests_followed: AtomicUsize,

    pub fatal_errors: AtomicUsize,
    /// Items dropped because the crawl had already been halted.
    pub requests_discarded: AtomicUsize,

    /// Free-form records, grouped by key.
    pub records: DashMap<String, Vec<String>>,
}

impl StatCollector {
    /// Creates a new `StatCollector` with all counters at zero.
    pub(crate) fn new() -> Self {
        StatCollector {
            start_time: Instant::now(),
            requests_enqueued: AtomicUsize::new(0),
            fetch_attempts: AtomicUsize::new(0),
            fetches_succeeded: AtomicUsize::new(0),
            requests_retried: AtomicUsize::new(0),
            requests_rejected: AtomicUsize::new(0),
            responses_parsed: AtomicUsize::new(0),
            requests_followed: AtomicUsize::new(0),
            fatal_errors: AtomicUsize::new(0),
            requests_discarded: AtomicUsize::new(0),
            records: DashMap::new(),
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_enqueued: self.requests_enqueued.load(Ordering::SeqCst),
            fetch_attempts: self.fetch_attempts.load(Ordering::SeqCst),
            fetches_succeeded: self.fetches_succeeded.load(Ordering::SeqCst),
            requests_retried: self.requests_retried.load(Ordering::SeqCst),
            requests_rejected: self.requests_rejected.load(Ordering::SeqCst),
            responses_parsed: self.responses_parsed.load(Ordering::SeqCst),
            requests_followed: self.requests_followed.load(Ordering::SeqCst),
            fatal_errors: self.fatal_errors.load(Ordering::SeqCst),
            requests_discarded: self.requests_discarded.load(Ordering::SeqCst),
            elapsed_duration: self.start_time.elapsed(),
        }
    }

    pub(crate) fn increment_requests_enqueued(&self) {
        self.requests_enqueued.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_fetch_attempts(&self) {
        self.fetch_attempts.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_fetches_succeeded(&self) {
        self.fetches_succeeded.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_retried(&self) {
        self.requests_retried.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_responses_parsed(&self) {
        self.responses_parsed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_followed(&self) {
        self.requests_followed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_fatal_errors(&self) {
        self.fatal_errors.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_discarded(&self) {
        self.requests_discarded.fetch_add(1, Ordering::SeqCst);
    }

    /// Appends `value` to the records kept under `key`.
    pub fn store(&self, key: impl Into<String>, value: impl Into<String>) {
        self.records.entry(key.into()).or_default().push(value.into());
    }

    /// Copies the records kept under `key`.
    pub fn records(&self, key: &str) -> Vec<String> {
        self.records
            .get(key)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn to_json_string(&self) -> Result<String, CrawlError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_string_pretty(&self) -> Result<String, CrawlError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl Default for StatCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StatCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();

        writeln!(f, "\nCrawl Statistics")?;
        writeln!(f, "----------------")?;
        writeln!(f, "  duration : {:?}", snapshot.elapsed_duration)?;
        writeln!(f, "  speed    : fetch/s: {:.2}", snapshot.fetches_per_second())?;
        writeln!(
            f,
            "  requests : enqueued: {}, attempts: {}, ok: {}, retry: {}, rejected: {}",
            snapshot.requests_enqueued,
            snapshot.fetch_attempts,
            snapshot.fetches_succeeded,
            snapshot.requests_retried,
            snapshot.requests_rejected
        )?;
        writeln!(
            f,
            "  parsing  : parsed: {}, followed: {}",
            snapshot.responses_parsed, snapshot.requests_followed
        )?;
        writeln!(
            f,
            "  failures : fatal: {}, discarded: {}\n",
            snapshot.fatal_errors, snapshot.requests_discarded
        )
    }
}
