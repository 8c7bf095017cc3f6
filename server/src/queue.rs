//! Bounded two-class work queue drained by a fixed worker pool.
//!
//! Interactive items go first, but after `interactive_burst` interactive
//! dequeues in a row one waiting background item is served, so background
//! work is never starved. Capacity is enforced with a semaphore: every
//! queued item carries a permit that is released when it is dequeued.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// A user is waiting on the result
    Interactive,
    Background,
}

/// What `enqueue` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueFullPolicy {
    /// Wait for a free slot
    #[default]
    Block,
    /// Fail with [`QueueError::Full`]
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("request queue is full")]
    Full,
    #[error("request queue is closed")]
    Closed,
}

struct Queued<T> {
    item: T,
    _slot: OwnedSemaphorePermit,
}

struct Lanes<T> {
    interactive: VecDeque<Queued<T>>,
    background: VecDeque<Queued<T>>,
    /// Interactive dequeues since the last background one
    streak: u32,
}

pub struct RequestQueue<T> {
    lanes: Mutex<Lanes<T>>,
    slots: Arc<Semaphore>,
    ready: Notify,
    closed: AtomicBool,
    policy: QueueFullPolicy,
    burst: u32,
}

impl<T> RequestQueue<T> {
    pub fn new(capacity: usize, policy: QueueFullPolicy, interactive_burst: u32) -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                interactive: VecDeque::new(),
                background: VecDeque::new(),
                streak: 0,
            }),
            slots: Arc::new(Semaphore::new(capacity.max(1))),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            policy,
            burst: interactive_burst.max(1),
        }
    }

    pub async fn enqueue(&self, item: T, priority: Priority) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let slot = match self.policy {
            QueueFullPolicy::Block => self
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| QueueError::Closed)?,
            QueueFullPolicy::Reject => self.try_slot()?,
        };
        self.push(item, priority, slot).await;
        Ok(())
    }

    /// Enqueue without ever waiting, whatever the configured policy.
    ///
    /// Used from inside workers, where blocking on a full queue would wait on
    /// the very workers that drain it.
    pub async fn offer(&self, item: T, priority: Priority) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let slot = self.try_slot()?;
        self.push(item, priority, slot).await;
        Ok(())
    }

    fn try_slot(&self) -> Result<OwnedSemaphorePermit, QueueError> {
        self.slots.clone().try_acquire_owned().map_err(|e| match e {
            TryAcquireError::Closed => QueueError::Closed,
            TryAcquireError::NoPermits => QueueError::Full,
        })
    }

    async fn push(&self, item: T, priority: Priority, slot: OwnedSemaphorePermit) {
        {
            let mut lanes = self.lanes.lock().await;
            let queued = Queued { item, _slot: slot };
            match priority {
                Priority::Interactive => lanes.interactive.push_back(queued),
                Priority::Background => lanes.background.push_back(queued),
            }
        }
        self.ready.notify_one();
    }

    async fn pop(&self) -> Option<T> {
        let mut lanes = self.lanes.lock().await;
        let background_due = lanes.streak >= self.burst && !lanes.background.is_empty();

        if !background_due {
            if let Some(queued) = lanes.interactive.pop_front() {
                lanes.streak += 1;
                return Some(queued.item);
            }
        }
        let queued = lanes.background.pop_front()?;
        lanes.streak = 0;
        Some(queued.item)
    }

    /// Next item by priority, or `None` once the queue is closed.
    pub async fn dequeue(&self) -> Option<T> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return None;
            }
            if let Some(item) = self.pop().await {
                return Some(item);
            }
            notified.await;
        }
    }

    /// Stop accepting and handing out work. Items still queued are dropped.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.slots.close();
        let mut lanes = self.lanes.lock().await;
        let dropped = lanes.interactive.len() + lanes.background.len();
        lanes.interactive.clear();
        lanes.background.clear();
        drop(lanes);
        self.ready.notify_waiters();
        if dropped > 0 {
            tracing::debug!(dropped, "Request queue closed with undispatched items");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn len(&self) -> usize {
        let lanes = self.lanes.lock().await;
        lanes.interactive.len() + lanes.background.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<T: Send + 'static> RequestQueue<T> {
    /// Spawn `workers` tasks that feed dequeued items to `handler` until the
    /// queue closes.
    pub fn drain<F, Fut>(self: &Arc<Self>, workers: usize, handler: F) -> Vec<JoinHandle<()>>
    where
        F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        (0..workers)
            .map(|worker| {
                let queue = Arc::clone(self);
                let handler = handler.clone();
                tokio::spawn(async move {
                    while let Some(item) = queue.dequeue().await {
                        handler(item).await;
                    }
                    tracing::debug!(worker, "Queue worker stopped");
                })
            })
            .collect()
    }
}
