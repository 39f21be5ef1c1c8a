//! In-memory FIFO of messages waiting for delivery.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mailspool_smtp::Address;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::stats::{Counters, Stats};

/// A queued message. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Sequence number assigned by the outbox.
    pub id: u64,
    /// Subject header.
    pub subject: String,
    /// Message body.
    pub body: String,
    /// Recipient.
    pub to: Address,
}

/// Handle to a shared message queue.
///
/// Cloning is cheap; every clone refers to the same queue. Enqueueing never
/// awaits and only holds the queue lock for a push, so it may be called from
/// any task or thread while a session is running.
#[derive(Debug, Clone)]
pub struct Outbox {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    queue: Mutex<VecDeque<Message>>,
    capacity: usize,
    default_to: Address,
    next_id: AtomicU64,
    /// New work for the worker.
    enqueued: Notify,
    /// A message left the queue.
    removed: Notify,
    counters: Arc<Counters>,
}

impl Outbox {
    /// Creates an empty outbox.
    #[must_use]
    pub fn new(default_to: Address, capacity: usize) -> Self {
        Self::with_counters(default_to, capacity, Arc::default())
    }

    pub(crate) fn with_counters(
        default_to: Address,
        capacity: usize,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                default_to,
                next_id: AtomicU64::new(1),
                enqueued: Notify::new(),
                removed: Notify::new(),
                counters,
            }),
        }
    }

    /// Queues a message and wakes the worker.
    ///
    /// `to` falls back to the default recipient when absent or empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] if the queue is at capacity (the new
    /// message is dropped), or an error if the recipient is not a valid
    /// address.
    pub fn enqueue(
        &self,
        subject: impl Into<String>,
        body: impl Into<String>,
        to: Option<&str>,
    ) -> Result<u64> {
        let subject = subject.into();
        let to = match to.map(str::trim) {
            Some(to) if !to.is_empty() => Address::new(to)?,
            _ => self.inner.default_to.clone(),
        };

        let id = {
            let mut queue = self.lock();
            if queue.len() >= self.inner.capacity {
                drop(queue);
                self.inner.counters.dropped();
                warn!(
                    subject = %subject,
                    capacity = self.inner.capacity,
                    "queue full, dropping message"
                );
                return Err(Error::QueueFull);
            }
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            queue.push_back(Message {
                id,
                subject,
                body: body.into(),
                to,
            });
            id
        };

        debug!(id, "message queued");
        self.inner.enqueued.notify_one();
        Ok(id)
    }

    /// Returns a copy of the message at the head of the queue.
    #[must_use]
    pub fn front(&self) -> Option<Message> {
        self.lock().front().cloned()
    }

    /// Removes the head of the queue after the server accepted it.
    ///
    /// Does nothing unless the head is still message `id`.
    pub fn commit(&self, id: u64) -> bool {
        let removed = {
            let mut queue = self.lock();
            if queue.front().is_some_and(|m| m.id == id) {
                queue.pop_front();
                true
            } else {
                false
            }
        };
        if removed {
            self.inner.counters.delivered();
            self.inner.removed.notify_waiters();
        }
        removed
    }

    /// Removes and returns every queued message.
    pub fn drain(&self) -> Vec<Message> {
        let drained: Vec<_> = self.lock().drain(..).collect();
        if !drained.is_empty() {
            self.inner.removed.notify_waiters();
        }
        drained
    }

    /// Returns the number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns the queue capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Returns the delivery counters.
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.inner.counters.snapshot()
    }

    /// Waits until the queue is empty.
    pub async fn wait_empty(&self) {
        loop {
            let removed = self.inner.removed.notified();
            if self.is_empty() {
                return;
            }
            removed.await;
        }
    }

    /// Waits for an enqueue. A permit stored by an earlier enqueue returns at once.
    pub(crate) async fn enqueued(&self) {
        self.inner.enqueued.notified().await;
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.inner.counters
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        // plain values: a poisoned queue is still consistent
        self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn outbox(capacity: usize) -> Outbox {
        Outbox::new(Address::new("owner@example.com").unwrap(), capacity)
    }

    #[test]
    fn test_enqueue_fifo() {
        let outbox = outbox(8);
        let a = outbox.enqueue("A", "a", None).unwrap();
        let b = outbox.enqueue("B", "b", None).unwrap();
        assert!(b > a);
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox.front().unwrap().subject, "A");

        assert!(outbox.commit(a));
        assert_eq!(outbox.front().unwrap().subject, "B");
    }

    #[test]
    fn test_default_recipient() {
        let outbox = outbox(8);
        outbox.enqueue("A", "", None).unwrap();
        outbox.enqueue("B", "", Some("  ")).unwrap();
        outbox.enqueue("C", "", Some("other@example.com")).unwrap();

        let to: Vec<_> = outbox.drain().into_iter().map(|m| m.to.to_string()).collect();
        assert_eq!(to, ["owner@example.com", "owner@example.com", "other@example.com"]);
    }

    #[test]
    fn test_invalid_recipient() {
        let outbox = outbox(8);
        assert!(matches!(
            outbox.enqueue("A", "", Some("nobody")),
            Err(Error::Smtp(_))
        ));
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_overflow_drops_newest() {
        let outbox = outbox(2);
        outbox.enqueue("A", "", None).unwrap();
        outbox.enqueue("B", "", None).unwrap();
        assert!(matches!(outbox.enqueue("C", "", None), Err(Error::QueueFull)));

        let subjects: Vec<_> = outbox.drain().into_iter().map(|m| m.subject).collect();
        assert_eq!(subjects, ["A", "B"]);
        assert_eq!(outbox.stats().dropped, 1);
    }

    #[test]
    fn test_commit_requires_head() {
        let outbox = outbox(8);
        let a = outbox.enqueue("A", "", None).unwrap();
        let b = outbox.enqueue("B", "", None).unwrap();

        assert!(!outbox.commit(b));
        assert_eq!(outbox.len(), 2);
        assert!(outbox.commit(a));
        assert!(!outbox.commit(a));
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_enqueue_wakes_waiter() {
        let outbox = outbox(8);
        let waiter = {
            let outbox = outbox.clone();
            tokio::spawn(async move { outbox.enqueued().await })
        };
        tokio::task::yield_now().await;

        outbox.enqueue("A", "", None).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_empty() {
        let outbox = outbox(8);
        let id = outbox.enqueue("A", "", None).unwrap();

        let waiter = {
            let outbox = outbox.clone();
            tokio::spawn(async move { outbox.wait_empty().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        outbox.commit(id);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
