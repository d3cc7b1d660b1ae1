//! # Queue Module
//!
//! Channel plumbing between the worker roles.
//!
//! ## Work queues
//!
//! [`WorkQueue`] wraps a bounded `kanal` channel. Capacity is the backpressure
//! point: a push waits while the queue is full. Besides real items the channel
//! carries [`Envelope::Sentinel`], one per consumer at shutdown, which wakes a
//! blocked consumer and tells it to exit.
//!
//! Each queue keeps two gauges next to the channel:
//!
//! - `pending` counts an item from just before its push starts until the
//!   consumer calls [`WorkQueue::ack`]. A request that a network worker has
//!   pulled but not yet claimed is therefore still visible as queued.
//! - `enqueued` is a monotonic push counter. The orchestrator reads it before
//!   and after its quiescence check to prove nothing was pushed in between.
//!
//! Sentinels are not counted by either gauge.
//!
//! ## Fatal channel
//!
//! [`FatalChannel`] is an unbounded multi-producer channel of
//! [`CrawlError`]. Any item in it stops the crawl.

use crate::error::CrawlError;
use kanal::{AsyncReceiver, AsyncSender};
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A queue slot: a unit of work or the "no more work" marker.
#[derive(Debug)]
pub(crate) enum Envelope<T> {
    Item(T),
    Sentinel,
}

/// Returned by [`WorkQueue::push`] when the crawl was halted before the item
/// could be enqueued. The item is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Halted;

/// Bounded, sentinel-aware queue with occupancy tracking.
pub(crate) struct WorkQueue<T> {
    name: &'static str,
    tx: AsyncSender<Envelope<T>>,
    rx: AsyncReceiver<Envelope<T>>,
    pending: AtomicUsize,
    enqueued: AtomicUsize,
}

impl<T: Send + 'static> WorkQueue<T> {
    pub(crate) fn new(name: &'static str, capacity: usize) -> Self {
        let (tx, rx) = kanal::bounded_async(capacity);
        WorkQueue {
            name,
            tx,
            rx,
            pending: AtomicUsize::new(0),
            enqueued: AtomicUsize::new(0),
        }
    }

    /// Enqueues `item`, waiting while the queue is full.
    ///
    /// Gives up as soon as `halt` is cancelled.
    pub(crate) async fn push(&self, item: T, halt: &CancellationToken) -> Result<(), Halted> {
        if halt.is_cancelled() {
            return Err(Halted);
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.enqueued.fetch_add(1, Ordering::SeqCst);

        let sent = tokio::select! {
            biased;
            res = self.tx.send(Envelope::Item(item)) => res.is_ok(),
            _ = halt.cancelled() => false,
        };
        if sent {
            trace!(queue = self.name, "Item enqueued");
            Ok(())
        } else {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            Err(Halted)
        }
    }

    /// Waits for the next envelope.
    ///
    /// A real item stays counted as pending until the consumer calls
    /// [`ack`](Self::ack). Not cancel-safe: a dropped future may lose an item
    /// the sender already handed over, so a consumer that needs a timeout must
    /// keep one pinned future alive across attempts.
    pub(crate) async fn pull(&self) -> Envelope<T> {
        // The queue owns a sender, so the channel only closes if it is dropped.
        self.rx.recv().await.unwrap_or(Envelope::Sentinel)
    }

    /// Marks one pulled item as taken over by its consumer.
    pub(crate) fn ack(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// Enqueues one shutdown marker. Not subject to the halt token.
    pub(crate) async fn push_sentinel(&self) {
        if self.tx.send(Envelope::Sentinel).await.is_err() {
            trace!(queue = self.name, "Queue closed before sentinel could be sent");
        }
    }

    /// `true` when no item is queued, being pushed, or pulled but unclaimed.
    pub(crate) fn is_empty(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Total pushes started over the queue's lifetime.
    pub(crate) fn enqueued_total(&self) -> usize {
        self.enqueued.load(Ordering::SeqCst)
    }
}

/// Unbounded channel of fatal errors, cloned into every worker.
///
/// The consumer never parks inside a kanal receive: a receive future dropped
/// by a timeout can swallow an item already handed to it. Waiting is done on
/// a [`Notify`] instead, and items are only ever taken with `try_recv`.
#[derive(Clone)]
pub(crate) struct FatalChannel {
    tx: AsyncSender<CrawlError>,
    rx: AsyncReceiver<CrawlError>,
    arrived: Arc<Notify>,
}

impl FatalChannel {
    pub(crate) fn new() -> Self {
        let (tx, rx) = kanal::unbounded_async();
        FatalChannel {
            tx,
            rx,
            arrived: Arc::new(Notify::new()),
        }
    }

    pub(crate) async fn report(&self, err: CrawlError) {
        // Unbounded: completes without waiting for a consumer.
        let _ = self.tx.send(err).await;
        self.arrived.notify_waiters();
    }

    /// Waits up to `timeout` for a fatal error. Cancel-safe.
    pub(crate) async fn recv_timeout(&self, timeout: Duration) -> Option<CrawlError> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut notified = pin!(self.arrived.notified());
            notified.as_mut().enable();
            if let Ok(Some(err)) = self.rx.try_recv() {
                return Some(err);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Removes and returns everything currently in the channel.
    pub(crate) fn drain(&self) -> Vec<CrawlError> {
        let mut errors = Vec::new();
        while let Ok(Some(err)) = self.rx.try_recv() {
            errors.push(err);
        }
        errors
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
