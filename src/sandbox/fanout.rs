//! Per-entity event fan-out.
//!
//! Each sandbox and each execution owns one fan-out. Subscribers get a
//! snapshot of buffered history plus a channel of future events. The
//! per-subscriber buffer is bounded: a subscriber that falls behind is
//! dropped (and later observes `resource_exhausted`) without affecting
//! the producer or other subscribers.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use super::error::SandboxError;

/// Buffered history per entity. Older records fall off the front.
pub const HISTORY_CAPACITY: usize = 1024;

/// Per-subscriber buffer. Overflow drops the subscriber.
const SUBSCRIBER_BUFFER: usize = 256;

pub struct EventFanout<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    history: std::collections::VecDeque<T>,
    subscribers: Vec<SubscriberSlot<T>>,
    closed: bool,
}

struct SubscriberSlot<T> {
    tx: mpsc::Sender<T>,
    lagged: Arc<AtomicBool>,
}

/// Receiving side of one subscription.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    lagged: Arc<AtomicBool>,
}

impl<T: Clone> EventFanout<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                history: std::collections::VecDeque::new(),
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Append to history and deliver to live subscribers. Slow
    /// subscribers are dropped here; the publish itself never blocks.
    /// Publishing after `close` is a no-op.
    pub fn publish(&self, event: T) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return;
        }
        if inner.history.len() == HISTORY_CAPACITY {
            inner.history.pop_front();
        }
        inner.history.push_back(event.clone());

        inner.subscribers.retain(|slot| {
            match slot.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    slot.lagged.store(true, Ordering::SeqCst);
                    false
                }
                // Receiver went away: plain unsubscribe.
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Snapshot of history plus a live channel. Subscribing to a closed
    /// fan-out yields the history and an already-terminated channel.
    pub fn subscribe(&self) -> (Vec<T>, Subscription<T>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let history: Vec<T> = inner.history.iter().cloned().collect();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let lagged = Arc::new(AtomicBool::new(false));
        if !inner.closed {
            inner.subscribers.push(SubscriberSlot {
                tx,
                lagged: lagged.clone(),
            });
        }
        (history, Subscription { rx, lagged })
    }

    /// Terminate the stream: drops all senders so subscribers observe
    /// end-of-stream after draining. No events are delivered afterwards.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .closed
    }

    /// Publish the terminal event and close in one step, so nothing can
    /// interleave after it.
    pub fn publish_final(&self, event: T) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return;
        }
        if inner.history.len() == HISTORY_CAPACITY {
            inner.history.pop_front();
        }
        inner.history.push_back(event.clone());
        for slot in &inner.subscribers {
            if slot.tx.try_send(event.clone()).is_err() {
                slot.lagged.store(true, Ordering::SeqCst);
            }
        }
        inner.closed = true;
        inner.subscribers.clear();
    }
}

impl<T: Clone> Default for EventFanout<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Subscription<T> {
    /// Next live event. `Ok(None)` means the stream terminated normally;
    /// `resource_exhausted` means this subscriber was dropped for
    /// falling behind.
    pub async fn recv(&mut self) -> Result<Option<T>, SandboxError> {
        match self.rx.recv().await {
            Some(event) => Ok(Some(event)),
            None => {
                if self.lagged.load(Ordering::SeqCst) {
                    Err(SandboxError::ResourceExhausted(
                        "subscriber dropped: event buffer overflow".into(),
                    ))
                } else {
                    Ok(None)
                }
            }
        }
    }
}
