//! Bounded hand-off between a camera callback thread and the acquisition loop
//!
//! Capture callbacks must never block, so the producer side always succeeds:
//! when the queue is full the oldest entry is discarded and counted.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("frame queue closed")]
pub struct QueueClosed;

pub struct FrameQueue<T> {
    inner: Mutex<QueueInner<T>>,
    cv: Condvar,
}

struct QueueInner<T> {
    items: VecDeque<T>,
    capacity: usize,
    dropped: u64,
    closed: bool,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity.clamp(1, 64)),
                capacity: capacity.max(1),
                dropped: 0,
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Enqueue `item`, evicting the oldest entry when full.
    ///
    /// Returns `false` if the queue has been closed.
    pub fn push_latest(&self, item: T) -> bool {
        let mut g = self.inner.lock().expect("lock poisoned");
        if g.closed {
            return false;
        }

        if g.items.len() >= g.capacity {
            g.items.pop_front();
            g.dropped = g.dropped.saturating_add(1);
        }
        g.items.push_back(item);
        self.cv.notify_one();
        true
    }

    /// Wait up to `timeout` for an item.
    ///
    /// Items queued before `close` are still delivered; only an empty closed
    /// queue reports [`QueueClosed`].
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<T>, QueueClosed> {
        let mut g = self.inner.lock().expect("lock poisoned");

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = g.items.pop_front() {
                return Ok(Some(item));
            }
            if g.closed {
                return Err(QueueClosed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let (ng, _) = self
                .cv
                .wait_timeout(g, deadline - now)
                .expect("lock poisoned");
            g = ng;
        }
    }

    /// Entries evicted by `push_latest`
    pub fn dropped(&self) -> u64 {
        self.inner.lock().expect("lock poisoned").dropped
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("lock poisoned").closed
    }

    pub fn close(&self) {
        let mut g = self.inner.lock().expect("lock poisoned");
        g.closed = true;
        self.cv.notify_all();
    }
}
