//! Sequence-stamped pending buffer.
//!
//! Every message gets a sequence number when it enters the buffer and is
//! always popped lowest-sequence first. A message that failed to publish is
//! put back under its original number, so it goes out again before anything
//! that arrived after it. A message that keeps failing can be deferred: it is
//! restamped behind everything queued so far and stops blocking the head.
//! Capacity covers queued and in-flight messages.

use crate::notifier::message::OutboundMessage;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

/// A message taken out of the buffer for publishing.
///
/// Hand it back with [`PendingBuffer::requeue`] or settle it with
/// [`PendingBuffer::complete`].
#[derive(Debug)]
pub struct InFlight {
    pub seq: u64,
    pub message: OutboundMessage,
}

#[derive(Debug)]
pub struct PendingBuffer {
    entries: Mutex<BTreeMap<u64, OutboundMessage>>,
    next_seq: AtomicU64,
    slots: Arc<Semaphore>,
    capacity: usize,
    /// Slots handed out beyond capacity by `push_overflow`
    overflow: AtomicUsize,
    ready: Notify,
}

impl PendingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            next_seq: AtomicU64::new(0),
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            overflow: AtomicUsize::new(0),
            ready: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages waiting to be published (in-flight excluded)
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Queued plus in-flight messages
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.slots.available_permits())
            + self.overflow.load(Ordering::SeqCst)
    }

    /// Add a message, waiting for a free slot when the buffer is full
    pub async fn push(&self, message: OutboundMessage) -> u64 {
        self.reserve().await;
        self.insert_new(message)
    }

    /// Wait for a free slot and claim it; pair with [`PendingBuffer::insert_reserved`]
    pub async fn reserve(&self) {
        // The semaphore is never closed
        if let Ok(permit) = self.slots.acquire().await {
            permit.forget();
        }
    }

    /// Insert into a slot claimed by [`PendingBuffer::reserve`]
    pub fn insert_reserved(&self, message: OutboundMessage) -> u64 {
        self.insert_new(message)
    }

    /// Add a message without waiting for capacity
    pub fn push_overflow(&self, message: OutboundMessage) -> u64 {
        match self.slots.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(_) => {
                self.overflow.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.insert_new(message)
    }

    /// Take the oldest message, waiting until one is available
    pub async fn pop(&self) -> InFlight {
        loop {
            let oldest = self.entries.lock().pop_first();
            if let Some((seq, message)) = oldest {
                return InFlight { seq, message };
            }
            self.ready.notified().await;
        }
    }

    /// Put a failed message back under its original sequence number
    pub fn requeue(&self, in_flight: InFlight) {
        self.entries.lock().insert(in_flight.seq, in_flight.message);
        self.ready.notify_one();
    }

    /// Put a failed message back behind every queued message, keeping its slot.
    ///
    /// Returns the new sequence number.
    pub fn defer(&self, in_flight: InFlight) -> u64 {
        self.insert_new(in_flight.message)
    }

    /// Release the slot of a message that was published
    pub fn complete(&self, _in_flight: InFlight) {
        self.release(1);
    }

    /// Remove every queued message, oldest first
    pub fn drain(&self) -> Vec<OutboundMessage> {
        let drained = std::mem::take(&mut *self.entries.lock());
        self.release(drained.len());
        drained.into_values().collect()
    }

    fn release(&self, slots: usize) {
        let owed = self
            .overflow
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |owed| {
                Some(owed.saturating_sub(slots))
            })
            .unwrap_or(0);
        let repaid = owed.min(slots);
        if slots > repaid {
            self.slots.add_permits(slots - repaid);
        }
    }

    fn insert_new(&self, message: OutboundMessage) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().insert(seq, message);
        self.ready.notify_one();
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready};

    fn message(n: u32) -> OutboundMessage {
        OutboundMessage::new("q", format!("m{}", n))
    }

    #[tokio::test]
    async fn test_pops_in_arrival_order() {
        let buffer = PendingBuffer::new(10);
        for n in 0..3 {
            buffer.push(message(n)).await;
        }
        for n in 0..3 {
            let in_flight = buffer.pop().await;
            assert_eq!(in_flight.message, message(n));
            buffer.complete(in_flight);
        }
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_requeued_message_goes_first() {
        let buffer = PendingBuffer::new(10);
        buffer.push(message(0)).await;
        buffer.push(message(1)).await;

        let failed = buffer.pop().await;
        buffer.push(message(2)).await;
        buffer.requeue(failed);

        let order: Vec<_> = [buffer.pop().await, buffer.pop().await, buffer.pop().await]
            .into_iter()
            .map(|in_flight| in_flight.message)
            .collect();
        assert_eq!(order, vec![message(0), message(1), message(2)]);
    }

    #[tokio::test]
    async fn test_deferred_message_goes_last() {
        let buffer = PendingBuffer::new(3);
        buffer.push(message(0)).await;
        buffer.push(message(1)).await;

        let failing = buffer.pop().await;
        let old_seq = failing.seq;
        let new_seq = buffer.defer(failing);
        assert!(new_seq > old_seq);
        assert_eq!(buffer.in_use(), 2);

        buffer.push(message(2)).await;
        let order: Vec<_> = [buffer.pop().await, buffer.pop().await, buffer.pop().await]
            .into_iter()
            .map(|in_flight| in_flight.message)
            .collect();
        assert_eq!(order, vec![message(1), message(0), message(2)]);
    }

    #[tokio::test]
    async fn test_capacity_includes_in_flight() {
        let buffer = Arc::new(PendingBuffer::new(1));
        buffer.push(message(0)).await;
        let in_flight = buffer.pop().await;

        let mut blocked = tokio_test::task::spawn({
            let buffer = buffer.clone();
            async move { buffer.push(message(1)).await }
        });
        assert_pending!(blocked.poll());

        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.in_use(), 1);
        buffer.complete(in_flight);
        assert!(blocked.is_woken());
        assert_ready!(blocked.poll());
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_waits_for_push() {
        let buffer = Arc::new(PendingBuffer::new(4));
        let popper = tokio::spawn({
            let buffer = buffer.clone();
            async move { buffer.pop().await.message }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.push(message(7)).await;
        assert_eq!(popper.await.unwrap(), message(7));
    }

    #[tokio::test]
    async fn test_overflow_does_not_grow_capacity() {
        let buffer = PendingBuffer::new(1);
        buffer.push_overflow(message(0));
        buffer.push_overflow(message(1));
        assert_eq!(buffer.len(), 2);

        let first = buffer.pop().await;
        buffer.complete(first);
        let second = buffer.pop().await;
        buffer.complete(second);

        buffer.push(message(2)).await;
        let mut blocked = tokio_test::task::spawn(buffer.push(message(3)));
        assert_pending!(blocked.poll());
    }

    #[tokio::test]
    async fn test_drain_frees_capacity() {
        let buffer = PendingBuffer::new(2);
        buffer.push(message(0)).await;
        buffer.push(message(1)).await;

        assert_eq!(buffer.drain(), vec![message(0), message(1)]);
        assert!(buffer.is_empty());
        buffer.push(message(2)).await;
        buffer.push(message(3)).await;
        assert_eq!(buffer.len(), 2);
    }
}
