//! Bounded queue of pending visits plus the ever-admitted URL set.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Default buffer capacity of the visit channel.
pub const DEFAULT_FRONTIER_CAPACITY: usize = 1000;

/// One unit of crawl work: fetch `target`, attributing discovered links to it.
#[derive(Debug, Clone)]
pub struct Visit {
    /// Page whose HTML contained `target`; `None` for seeds.
    pub source: Option<Url>,
    /// URL to fetch.
    pub target: Url,
}

/// Why a visit could not be placed into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRejected {
    /// The cancellation signal fired while the channel was full.
    Cancelled,
    /// The queue was already closed.
    Closed,
}

/// Bounded visit channel shared by all workers, with the dedup set and a
/// lock-free length counter alongside.
///
/// The dedup set is monotonic: a canonical URL admitted once stays admitted
/// for the lifetime of the run. Test-and-insert happens in a single critical
/// section so two workers racing on the same URL yield exactly one admission.
pub struct Frontier {
    tx: mpsc::Sender<Visit>,
    rx: Mutex<mpsc::Receiver<Visit>>,
    seen: Mutex<HashSet<String>>,
    pending: AtomicUsize,
    closed: AtomicBool,
}

impl Frontier {
    /// Builds an empty frontier whose channel buffers up to `capacity` visits.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            seen: Mutex::new(HashSet::new()),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of visits currently waiting in the queue.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// True when no visit is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of canonical URLs ever admitted.
    pub async fn seen_len(&self) -> usize {
        self.seen.lock().await.len()
    }

    /// Atomically tests and records a canonical URL.
    ///
    /// Returns `true` iff the URL was newly admitted.
    pub async fn admit(&self, canonical: &str) -> bool {
        self.seen.lock().await.insert(canonical.to_string())
    }

    /// Sends one visit, aborting cleanly if `cancel` fires while the channel
    /// is full.
    pub async fn send(&self, visit: Visit, cancel: &CancellationToken) -> Result<(), SendRejected> {
        tokio::select! {
            _ = cancel.cancelled() => Err(SendRejected::Cancelled),
            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    self.pending.fetch_add(1, Ordering::Release);
                    permit.send(visit);
                    Ok(())
                }
                Err(_) => Err(SendRejected::Closed),
            },
        }
    }

    /// Awaits the next visit.
    ///
    /// Returns `None` once `cancel` fires or the queue is closed and drained.
    /// The receiver is shared across workers behind a mutex; the cancellation
    /// branch also preempts waiting on that mutex.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<Visit> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            visit = async { self.rx.lock().await.recv().await } => {
                if visit.is_some() {
                    self.pending.fetch_sub(1, Ordering::Release);
                }
                visit
            }
        }
    }

    /// Closes the queue so further sends fail. Idempotent.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.rx.lock().await.close();
        }
    }

    /// True once [`Frontier::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
