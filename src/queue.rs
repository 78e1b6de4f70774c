//! A bounded FIFO whose overflow policy is a constructor parameter, not a
//! fixed choice. `tokio::sync::mpsc`'s bounded channel always fails closed
//! on a full queue (equivalent to `DropNewest`); the monitoring pipeline
//! needs the opposite (`DropOldest`), so both directions share one type.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropOldest,
    DropNewest,
}

struct Inner<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

/// Outcome of a push against a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// Accepted, but the oldest entry was evicted to make room.
    AcceptedDroppedOldest,
    /// Rejected; the queue was full and the policy is `DropNewest`.
    RejectedFull,
}

pub struct BoundedDropQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BoundedDropQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> BoundedDropQueue<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                notify: Notify::new(),
                capacity,
                policy,
            }),
        }
    }

    /// Non-blocking push, safe to call from a synchronous callback (e.g. an
    /// OPC UA subscription handler running on the client library's own
    /// thread).
    pub fn try_push(&self, item: T) -> PushOutcome {
        let mut items = self.inner.items.blocking_lock();
        let outcome = push_locked(&mut items, item, self.inner.capacity, self.inner.policy);
        drop(items);
        self.inner.notify.notify_one();
        outcome
    }

    pub async fn push(&self, item: T) -> PushOutcome {
        let mut items = self.inner.items.lock().await;
        let outcome = push_locked(&mut items, item, self.inner.capacity, self.inner.policy);
        drop(items);
        self.inner.notify.notify_one();
        outcome
    }

    /// Waits up to `timeout` for an item; returns `None` on timeout so
    /// callers can re-check a shutdown signal between waits.
    pub async fn pop_timeout(&self, timeout: std::time::Duration) -> Option<T> {
        loop {
            {
                let mut items = self.inner.items.lock().await;
                if let Some(item) = items.pop_front() {
                    return Some(item);
                }
            }
            let notified = self.inner.notify.notified();
            if tokio::time::timeout(timeout, notified).await.is_err() {
                return None;
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.items.lock().await.len()
    }
}

fn push_locked<T>(
    items: &mut VecDeque<T>,
    item: T,
    capacity: usize,
    policy: OverflowPolicy,
) -> PushOutcome {
    if items.len() < capacity {
        items.push_back(item);
        return PushOutcome::Accepted;
    }

    match policy {
        OverflowPolicy::DropOldest => {
            items.pop_front();
            items.push_back(item);
            PushOutcome::AcceptedDroppedOldest
        }
        OverflowPolicy::DropNewest => PushOutcome::RejectedFull,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drop_oldest_evicts_head_on_overflow() {
        let q = BoundedDropQueue::new(2, OverflowPolicy::DropOldest);
        assert_eq!(q.push(1).await, PushOutcome::Accepted);
        assert_eq!(q.push(2).await, PushOutcome::Accepted);
        assert_eq!(q.push(3).await, PushOutcome::AcceptedDroppedOldest);
        assert_eq!(q.len().await, 2);
        assert_eq!(q.pop_timeout(std::time::Duration::from_millis(10)).await, Some(2));
        assert_eq!(q.pop_timeout(std::time::Duration::from_millis(10)).await, Some(3));
    }

    #[tokio::test]
    async fn drop_newest_rejects_submission_on_overflow() {
        let q = BoundedDropQueue::new(1, OverflowPolicy::DropNewest);
        assert_eq!(q.push(1).await, PushOutcome::Accepted);
        assert_eq!(q.push(2).await, PushOutcome::RejectedFull);
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn pop_timeout_returns_none_when_empty() {
        let q: BoundedDropQueue<i32> = BoundedDropQueue::new(4, OverflowPolicy::DropOldest);
        let result = q.pop_timeout(std::time::Duration::from_millis(5)).await;
        assert_eq!(result, None);
    }
}
