//! Fan-out of capture chunks to subscribers.
//!
//! One thread drains the queue fed by the capture process. The subscriber
//! list is a copy-on-write snapshot: registration swaps in a new list, and a
//! dispatch pass iterates whatever snapshot it loaded, so mutation never
//! races with delivery.

use arc_swap::ArcSwap;
use bytes::Bytes;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::worker::peak;
use crate::error::Result;

/// Pop timeout; also how quickly the stop flag is observed.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);
const LOG_EVERY: u64 = 50;

pub type ChunkCallback = dyn Fn(&Bytes) -> Result<()> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    callback: Arc<ChunkCallback>,
}

#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: ArcSwap<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Bytes) -> Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let callback: Arc<ChunkCallback> = Arc::new(callback);
        self.subscribers.rcu(|current| {
            let mut next = current.to_vec();
            next.push(Subscriber {
                id,
                callback: callback.clone(),
            });
            next
        });
        debug!("Subscribed {}", id);
        id
    }

    /// Returns false if `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        self.subscribers.rcu(|current| {
            let next: Vec<Subscriber> = current.iter().filter(|s| s.id != id).cloned().collect();
            removed = next.len() != current.len();
            next
        });
        if removed {
            debug!("Unsubscribed {}", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.subscribers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.load().is_empty()
    }

    /// Delivers `chunk` to every subscriber in the current snapshot.
    /// A subscriber that errors or panics is logged and skipped.
    /// Returns how many subscribers accepted the chunk.
    pub fn dispatch(&self, chunk: &Bytes) -> usize {
        let snapshot = self.subscribers.load();
        let mut delivered = 0;
        for subscriber in snapshot.iter() {
            match panic::catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(chunk))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!("Subscriber {} failed: {}", subscriber.id, e),
                Err(_) => error!("Subscriber {} panicked", subscriber.id),
            }
        }
        delivered
    }
}

/// Unsubscribes when dropped.
pub struct Subscription {
    registry: Arc<SubscriberRegistry>,
    id: SubscriptionId,
}

impl Subscription {
    pub fn new<F>(registry: Arc<SubscriberRegistry>, callback: F) -> Self
    where
        F: Fn(&Bytes) -> Result<()> + Send + Sync + 'static,
    {
        let id = registry.subscribe(callback);
        Self { registry, id }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unsubscribe(self.id);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub chunks: u64,
    /// Chunks discarded because the backlog exceeded the limit
    pub trimmed: u64,
}

/// Starts the dispatcher thread. It runs until `running` is cleared or the
/// sending side of `rx` disconnects, and clears `running` on the way out.
pub fn spawn(
    rx: Receiver<Bytes>,
    registry: Arc<SubscriberRegistry>,
    max_backlog: usize,
    running: Arc<AtomicBool>,
) -> io::Result<JoinHandle<DispatchStats>> {
    thread::Builder::new()
        .name("capture-dispatch".to_string())
        .spawn(move || {
            let stats = run(&rx, &registry, max_backlog, &running);
            running.store(false, Ordering::Release);
            info!(
                "Dispatcher stopped: {} chunks, {} trimmed",
                stats.chunks, stats.trimmed
            );
            stats
        })
}

fn run(
    rx: &Receiver<Bytes>,
    registry: &SubscriberRegistry,
    max_backlog: usize,
    running: &AtomicBool,
) -> DispatchStats {
    let mut stats = DispatchStats::default();

    while running.load(Ordering::Acquire) {
        let mut chunk = match rx.recv_timeout(RECV_TIMEOUT) {
            Ok(chunk) => chunk,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                info!("Capture stream ended");
                break;
            }
        };

        // Bound latency: skip ahead to the newest chunks.
        while rx.len() > max_backlog {
            match rx.try_recv() {
                Ok(newer) => {
                    chunk = newer;
                    stats.trimmed += 1;
                }
                Err(_) => break,
            }
        }

        stats.chunks += 1;
        let delivered = registry.dispatch(&chunk);

        if stats.chunks % LOG_EVERY == 1 {
            let samples = super::bytes_to_samples(&chunk);
            debug!(
                "chunk {}: {} bytes, peak {:.4}, {}/{} subscribers, {} trimmed",
                stats.chunks,
                chunk.len(),
                peak(&samples),
                delivered,
                registry.len(),
                stats.trimmed
            );
        }
    }

    stats
}
