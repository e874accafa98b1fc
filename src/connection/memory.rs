//! In-process broker with fault injection.
//!
//! Behaves like a single RabbitMQ node for the operations the supervisor uses:
//! queues hold a FIFO backlog, consumers receive deliveries up to their
//! channel's prefetch limit, and unacknowledged deliveries go back to the
//! head of the queue (flagged as redelivered) when their link closes.

use crate::connection::delivery::{Delivery, DeliveryAcker, DeliveryFeed};
use crate::connection::transport::{BrokerChannel, BrokerConnector, BrokerLink, QueueInfo};
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// A message accepted by [`MemoryBroker`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub queue: String,
    pub payload: Vec<u8>,
    pub priority: u8,
}

#[derive(Debug, Default)]
struct Faults {
    dials: u32,
    channel_opens: u32,
    declares: u32,
    qos: u32,
    consumes: u32,
    publishes: u32,
}

fn take_fault(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

struct Ready {
    payload: Vec<u8>,
    redelivered: bool,
}

struct ConsumerSlot {
    id: u64,
    link_id: u64,
    prefetch: u16,
    unacked: usize,
    tx: mpsc::UnboundedSender<BrokerResult<Delivery>>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        (self.prefetch == 0 || self.unacked < self.prefetch as usize) && !self.tx.is_closed()
    }
}

struct Outstanding {
    consumer_id: u64,
    payload: Vec<u8>,
}

#[derive(Default)]
struct MemQueue {
    backlog: VecDeque<Ready>,
    consumers: Vec<ConsumerSlot>,
    unacked: HashMap<u64, Outstanding>,
    max_unacked: usize,
    next_consumer: usize,
}

struct Inner {
    available: bool,
    faults: Faults,
    refused: HashSet<String>,
    dial_count: u64,
    declare_count: u64,
    next_id: u64,
    links: HashMap<u64, Arc<watch::Sender<bool>>>,
    queues: HashMap<String, MemQueue>,
    published: Vec<PublishedMessage>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            available: true,
            faults: Faults::default(),
            refused: HashSet::new(),
            dial_count: 0,
            declare_count: 0,
            next_id: 0,
            links: HashMap::new(),
            queues: HashMap::new(),
            published: Vec::new(),
        }
    }
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn link_open(&self, link_id: u64) -> bool {
        self.links.contains_key(&link_id)
    }

    fn dispatch(&mut self, queue_name: &str, shared: &Arc<Mutex<Inner>>) {
        let mut issued: u64 = 0;
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        queue.consumers.retain(|slot| !slot.tx.is_closed());

        while !queue.backlog.is_empty() {
            let count = queue.consumers.len();
            let Some(offset) = (0..count)
                .map(|i| (queue.next_consumer + i) % count)
                .find(|&i| queue.consumers[i].has_capacity())
            else {
                break;
            };
            queue.next_consumer = (offset + 1) % count;

            let Some(ready) = queue.backlog.pop_front() else {
                break;
            };
            issued += 1;
            let tag = self.next_id + issued;

            let slot = &mut queue.consumers[offset];
            let acker: Arc<dyn DeliveryAcker> = Arc::new(MemoryAcker {
                shared: shared.clone(),
                link_id: slot.link_id,
                queue: queue_name.to_string(),
            });
            let delivery = Delivery::new(
                ready.payload.clone(),
                queue_name,
                queue_name,
                tag,
                ready.redelivered,
                acker,
            );
            slot.unacked += 1;
            let consumer_id = slot.id;
            if slot.tx.send(Ok(delivery)).is_err() {
                // Receiver vanished between the capacity check and the send
                slot.unacked -= 1;
                queue.backlog.push_front(ready);
                continue;
            }
            queue.unacked.insert(
                tag,
                Outstanding {
                    consumer_id,
                    payload: ready.payload,
                },
            );
            queue.max_unacked = queue.max_unacked.max(queue.unacked.len());
        }
        self.next_id += issued;
    }

    fn settle(&mut self, queue_name: &str, tag: u64, requeue: bool) -> BrokerResult<()> {
        let queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BrokerError::Ack(format!("unknown queue '{}'", queue_name)))?;
        let outstanding = queue
            .unacked
            .remove(&tag)
            .ok_or_else(|| BrokerError::Ack(format!("unknown delivery tag {}", tag)))?;
        if let Some(slot) = queue
            .consumers
            .iter_mut()
            .find(|slot| slot.id == outstanding.consumer_id)
        {
            slot.unacked = slot.unacked.saturating_sub(1);
        }
        if requeue {
            queue.backlog.push_front(Ready {
                payload: outstanding.payload,
                redelivered: true,
            });
        }
        Ok(())
    }

    fn close_link(&mut self, link_id: u64, shared: &Arc<Mutex<Inner>>) {
        let Some(closed_tx) = self.links.remove(&link_id) else {
            return;
        };
        let touched: Vec<String> = self
            .queues
            .iter_mut()
            .filter_map(|(name, queue)| {
                queue
                    .detach(|slot| slot.link_id == link_id)
                    .then(|| name.clone())
            })
            .collect();
        closed_tx.send_replace(true);
        for name in touched {
            self.dispatch(&name, shared);
        }
    }
}

impl MemQueue {
    /// Removes the matching consumers, ending their feeds, and puts their
    /// unacknowledged deliveries back at the head. Returns whether any
    /// consumer was removed.
    fn detach(&mut self, matches: impl Fn(&ConsumerSlot) -> bool) -> bool {
        let gone: Vec<u64> = self
            .consumers
            .iter()
            .filter(|slot| matches(slot))
            .map(|slot| slot.id)
            .collect();
        if gone.is_empty() {
            return false;
        }
        self.consumers.retain(|slot| !gone.contains(&slot.id));

        let mut returned: Vec<(u64, Vec<u8>)> = self
            .unacked
            .iter()
            .filter(|(_, outstanding)| gone.contains(&outstanding.consumer_id))
            .map(|(tag, outstanding)| (*tag, outstanding.payload.clone()))
            .collect();
        // Oldest delivery ends up at the head
        returned.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (tag, payload) in returned {
            self.unacked.remove(&tag);
            self.backlog.push_front(Ready {
                payload,
                redelivered: true,
            });
        }
        true
    }
}

/// In-memory broker; clones share state
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every dial while `false`
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
    }

    pub fn fail_next_dials(&self, n: u32) {
        self.inner.lock().faults.dials += n;
    }

    pub fn fail_next_channel_opens(&self, n: u32) {
        self.inner.lock().faults.channel_opens += n;
    }

    pub fn fail_next_declares(&self, n: u32) {
        self.inner.lock().faults.declares += n;
    }

    pub fn fail_next_qos(&self, n: u32) {
        self.inner.lock().faults.qos += n;
    }

    pub fn fail_next_consumes(&self, n: u32) {
        self.inner.lock().faults.consumes += n;
    }

    pub fn fail_next_publishes(&self, n: u32) {
        self.inner.lock().faults.publishes += n;
    }

    /// Refuse every declare of `queue` until [`MemoryBroker::accept_declares`]
    pub fn refuse_declares(&self, queue: &str) {
        self.inner.lock().refused.insert(queue.to_string());
    }

    pub fn accept_declares(&self, queue: &str) {
        self.inner.lock().refused.remove(queue);
    }

    /// Cancel every consumer of `queue` while leaving links open, as the
    /// broker does when a queue is deleted under its consumers
    pub fn cancel_consumers(&self, queue: &str) {
        let mut inner = self.inner.lock();
        let cancelled = inner
            .queues
            .get_mut(queue)
            .map(|declared| declared.detach(|_| true))
            .unwrap_or(false);
        debug!(queue, cancelled, "Cancelling memory broker consumers");
        if cancelled {
            inner.dispatch(queue, &self.inner);
        }
    }

    /// Close every open link, as a broker restart would
    pub fn drop_connections(&self) {
        let mut inner = self.inner.lock();
        let ids: Vec<u64> = inner.links.keys().copied().collect();
        debug!(links = ids.len(), "Dropping memory broker connections");
        for id in ids {
            inner.close_link(id, &self.inner);
        }
    }

    /// Dial attempts, failed ones included
    pub fn dial_count(&self) -> u64 {
        self.inner.lock().dial_count
    }

    pub fn declare_count(&self) -> u64 {
        self.inner.lock().declare_count
    }

    pub fn open_links(&self) -> usize {
        self.inner.lock().links.len()
    }

    /// Every message accepted so far, in publish order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.lock().published.clone()
    }

    pub fn published_count(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|message| message.queue == queue)
            .count()
    }

    /// Messages ready for delivery
    pub fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.backlog.len())
            .unwrap_or(0)
    }

    /// Deliveries handed out and not yet settled
    pub fn unacked(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    /// Highest number of unsettled deliveries ever observed on `queue`
    pub fn max_unacked(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.max_unacked)
            .unwrap_or(0)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Put a message on `queue` directly, declaring it if needed
    pub fn enqueue(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        let mut inner = self.inner.lock();
        inner
            .queues
            .entry(queue.to_string())
            .or_default()
            .backlog
            .push_back(Ready {
                payload: payload.into(),
                redelivered: false,
            });
        inner.dispatch(queue, &self.inner);
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryBroker")
            .field("available", &inner.available)
            .field("links", &inner.links.len())
            .field("queues", &inner.queues.len())
            .finish()
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self, _url: &str) -> BrokerResult<Arc<dyn BrokerLink>> {
        let mut inner = self.inner.lock();
        inner.dial_count += 1;
        if !inner.available {
            return Err(BrokerError::Dial("connection refused".to_string()));
        }
        if take_fault(&mut inner.faults.dials) {
            return Err(BrokerError::Dial("injected dial failure".to_string()));
        }

        let id = inner.next_id();
        let (closed_tx, _) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        inner.links.insert(id, closed_tx.clone());

        Ok(Arc::new(MemoryLink {
            id,
            shared: self.inner.clone(),
            closed_tx,
        }))
    }
}

struct MemoryLink {
    id: u64,
    shared: Arc<Mutex<Inner>>,
    closed_tx: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl BrokerLink for MemoryLink {
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let mut inner = self.shared.lock();
        if !inner.link_open(self.id) {
            return Err(BrokerError::ChannelOpen("connection closed".to_string()));
        }
        if take_fault(&mut inner.faults.channel_opens) {
            return Err(BrokerError::ChannelOpen(
                "injected channel failure".to_string(),
            ));
        }
        Ok(Arc::new(MemoryChannel {
            link_id: self.id,
            shared: self.shared.clone(),
            prefetch: AtomicU16::new(0),
        }))
    }

    async fn close(&self) {
        self.shared.lock().close_link(self.id, &self.shared);
    }

    async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn is_open(&self) -> bool {
        !*self.closed_tx.borrow()
    }
}

struct MemoryChannel {
    link_id: u64,
    shared: Arc<Mutex<Inner>>,
    prefetch: AtomicU16,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn queue_declare(&self, queue: &str) -> BrokerResult<QueueInfo> {
        let mut inner = self.shared.lock();
        let error = |message: &str| BrokerError::QueueDeclare {
            queue: queue.to_string(),
            message: message.to_string(),
        };
        if !inner.link_open(self.link_id) {
            return Err(error("channel closed"));
        }
        if take_fault(&mut inner.faults.declares) {
            return Err(error("injected declare failure"));
        }
        if inner.refused.contains(queue) {
            return Err(error("access refused"));
        }
        inner.declare_count += 1;
        let declared = inner.queues.entry(queue.to_string()).or_default();
        Ok(QueueInfo {
            name: queue.to_string(),
            messages: declared.backlog.len() as u32,
            consumers: declared.consumers.len() as u32,
        })
    }

    async fn basic_qos(&self, prefetch: u16) -> BrokerResult<()> {
        let mut inner = self.shared.lock();
        let error = |message: &str| BrokerError::Qos {
            prefetch,
            message: message.to_string(),
        };
        if !inner.link_open(self.link_id) {
            return Err(error("channel closed"));
        }
        if take_fault(&mut inner.faults.qos) {
            return Err(error("injected qos failure"));
        }
        self.prefetch.store(prefetch, Ordering::SeqCst);
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, _consumer_tag: &str) -> BrokerResult<DeliveryFeed> {
        let mut inner = self.shared.lock();
        let error = |message: &str| BrokerError::Consume {
            queue: queue.to_string(),
            message: message.to_string(),
        };
        if !inner.link_open(self.link_id) {
            return Err(error("channel closed"));
        }
        if take_fault(&mut inner.faults.consumes) {
            return Err(error("injected consume failure"));
        }
        if !inner.queues.contains_key(queue) {
            return Err(error("no such queue"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = inner.next_id();
        let slot = ConsumerSlot {
            id,
            link_id: self.link_id,
            prefetch: self.prefetch.load(Ordering::SeqCst),
            unacked: 0,
            tx,
        };
        if let Some(declared) = inner.queues.get_mut(queue) {
            declared.consumers.push(slot);
        }
        inner.dispatch(queue, &self.shared);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(DeliveryFeed::new(stream.boxed()))
    }

    async fn basic_publish(&self, queue: &str, payload: &[u8], priority: u8) -> BrokerResult<()> {
        let mut inner = self.shared.lock();
        let error = |message: &str| BrokerError::Publish {
            queue: queue.to_string(),
            message: message.to_string(),
        };
        if !inner.link_open(self.link_id) {
            return Err(error("channel closed"));
        }
        if take_fault(&mut inner.faults.publishes) {
            return Err(error("injected publish failure"));
        }

        inner.published.push(PublishedMessage {
            queue: queue.to_string(),
            payload: payload.to_vec(),
            priority,
        });
        // The default exchange drops messages for queues nobody declared
        if let Some(declared) = inner.queues.get_mut(queue) {
            declared.backlog.push_back(Ready {
                payload: payload.to_vec(),
                redelivered: false,
            });
            inner.dispatch(queue, &self.shared);
        }
        Ok(())
    }

    async fn queue_size(&self, queue: &str) -> BrokerResult<u32> {
        let inner = self.shared.lock();
        let error = |message: &str| BrokerError::Inspect {
            queue: queue.to_string(),
            message: message.to_string(),
        };
        if !inner.link_open(self.link_id) {
            return Err(error("channel closed"));
        }
        inner
            .queues
            .get(queue)
            .map(|declared| declared.backlog.len() as u32)
            .ok_or_else(|| error("no such queue"))
    }
}

struct MemoryAcker {
    shared: Arc<Mutex<Inner>>,
    link_id: u64,
    queue: String,
}

impl MemoryAcker {
    fn settle(&self, tag: u64, requeue: bool) -> BrokerResult<()> {
        let mut inner = self.shared.lock();
        if !inner.link_open(self.link_id) {
            return Err(BrokerError::Ack("channel closed".to_string()));
        }
        inner.settle(&self.queue, tag, requeue)?;
        inner.dispatch(&self.queue, &self.shared);
        Ok(())
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.settle(delivery_tag, false)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.settle(delivery_tag, requeue)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.settle(delivery_tag, requeue)
    }
}
