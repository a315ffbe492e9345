//! Non-blocking fan-out of per-cycle summaries to live UI subscribers.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::projection::ProjectionResult;

/// Default per-subscriber queue depth.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 16;

/// Aggregate counts pushed to subscribers after a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveUpdate {
    pub new_notifications: usize,
    pub new_feed_items: usize,
    pub followers_changed: bool,
    pub comments_changed: bool,
}

impl From<ProjectionResult> for LiveUpdate {
    fn from(result: ProjectionResult) -> Self {
        Self {
            new_notifications: result.new_notifications,
            new_feed_items: result.new_feed_items,
            followers_changed: result.followers_changed,
            comments_changed: result.files_changed,
        }
    }
}

/// Receiving end of one subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<LiveUpdate>,
}

impl Subscription {
    /// Wait for the next update. `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<LiveUpdate> {
        self.rx.recv().await
    }

    /// Take an update if one is queued.
    pub fn try_recv(&mut self) -> Option<LiveUpdate> {
        self.rx.try_recv().ok()
    }

    /// Adapt into a `Stream`, e.g. for a server-sent-events body.
    pub fn into_stream(self) -> ReceiverStream<LiveUpdate> {
        ReceiverStream::new(self.rx)
    }
}

/// Multi-subscriber broadcaster with drop-if-not-ready delivery.
///
/// `publish` never waits: a subscriber whose queue is full misses that
/// update, and a subscriber that went away is pruned. Clone is cheap.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<LiveUpdate>>>>,
    capacity: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

impl Broadcaster {
    /// Create a broadcaster whose subscriber queues hold `capacity` updates.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    /// Open a new subscription.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.lock().push(tx);
        Subscription { rx }
    }

    /// Push `update` to every ready subscriber. Returns how many received it.
    pub fn publish(&self, update: LiveUpdate) -> usize {
        let mut subscribers = self.lock();
        let mut delivered = 0;
        subscribers.retain(|tx| match tx.try_send(update) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("subscriber not ready, dropping update");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        delivered
    }

    /// Number of open subscriptions, as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<mpsc::Sender<LiveUpdate>>> {
        // A panic while holding the lock cannot leave the Vec half-updated.
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
