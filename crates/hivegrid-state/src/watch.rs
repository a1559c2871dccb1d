//! Watch queue — fan-out of committed store events.
//!
//! Each subscriber owns a bounded buffer. Publishers never block: a
//! subscriber that falls more than a buffer behind is dropped and
//! observes a terminal `WatchError::Lagged` once it drains what it had.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::event::Event;

/// Default per-subscriber buffer capacity.
pub const WATCH_QUEUE_CAPACITY: usize = 1024;

/// Terminal conditions of a watch subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WatchError {
    /// The subscriber fell behind and missed events; it must resync.
    #[error("watch subscriber lagged behind the event stream")]
    Lagged,

    /// The queue (or the subscription) was closed.
    #[error("watch queue closed")]
    Closed,
}

struct Subscriber {
    tx: mpsc::Sender<Event>,
    lagged: Arc<AtomicBool>,
}

struct QueueState {
    next_id: u64,
    subscribers: HashMap<u64, Subscriber>,
}

/// Broadcast hub for committed store events.
#[derive(Clone)]
pub struct WatchQueue {
    state: Arc<Mutex<QueueState>>,
}

impl WatchQueue {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                next_id: 0,
                subscribers: HashMap::new(),
            })),
        }
    }

    /// Subscribe with the default buffer capacity.
    pub fn watch(&self) -> Watcher {
        self.watch_with_capacity(WATCH_QUEUE_CAPACITY)
    }

    /// Subscribe with an explicit buffer capacity.
    pub fn watch_with_capacity(&self, capacity: usize) -> Watcher {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let lagged = Arc::new(AtomicBool::new(false));
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(
            id,
            Subscriber {
                tx,
                lagged: lagged.clone(),
            },
        );
        Watcher {
            id,
            rx,
            lagged,
            queue: self.clone(),
        }
    }

    /// Deliver events, in order, to every live subscriber.
    ///
    /// Subscribers whose buffer is full are marked lagged and dropped;
    /// they receive no further events.
    pub(crate) fn publish(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let mut state = self.lock();
        let mut dropped = Vec::new();
        for event in events {
            for (id, subscriber) in state.subscribers.iter() {
                if dropped.contains(id) {
                    continue;
                }
                match subscriber.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(subscriber = *id, "watch subscriber lagged, dropping");
                        subscriber.lagged.store(true, Ordering::SeqCst);
                        dropped.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        dropped.push(*id);
                    }
                }
            }
        }
        for id in dropped {
            state.subscribers.remove(&id);
        }
    }

    fn remove(&self, id: u64) {
        self.lock().subscribers.remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for WatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A cancellable subscription to the event stream.
///
/// Dropping the watcher cancels the subscription.
pub struct Watcher {
    id: u64,
    rx: mpsc::Receiver<Event>,
    lagged: Arc<AtomicBool>,
    queue: WatchQueue,
}

impl Watcher {
    /// Receive the next event in commit order.
    ///
    /// Buffered events are still delivered after the subscription is
    /// dropped by the publisher; the terminal error follows.
    pub async fn next(&mut self) -> Result<Event, WatchError> {
        match self.rx.recv().await {
            Some(event) => Ok(event),
            None => {
                if self.lagged.load(Ordering::SeqCst) {
                    Err(WatchError::Lagged)
                } else {
                    Err(WatchError::Closed)
                }
            }
        }
    }

    /// Non-blocking receive, for synchronous consumers.
    pub fn try_next(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Cancel the subscription.
    pub fn cancel(&self) {
        self.queue.remove(self.id);
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.queue.remove(self.id);
    }
}
