//! Inbound delivery handle and feed

use crate::error::BrokerResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Settles deliveries on the channel they arrived on
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;
}

/// One inbound message.
///
/// Settling methods take `self`, so a delivery is acknowledged or rejected at
/// most once. A delivery dropped without being settled stays unacknowledged
/// until its channel closes, at which point the broker redelivers it.
pub struct Delivery {
    payload: Vec<u8>,
    queue: String,
    routing_key: String,
    delivery_tag: u64,
    redelivered: bool,
    acker: Arc<dyn DeliveryAcker>,
    settled: bool,
}

impl Delivery {
    pub fn new(
        payload: Vec<u8>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        delivery_tag: u64,
        redelivered: bool,
        acker: Arc<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            payload,
            queue: queue.into(),
            routing_key: routing_key.into(),
            delivery_tag,
            redelivered,
            acker,
            settled: false,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the broker delivered this message before
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub async fn ack(mut self) -> BrokerResult<()> {
        self.settled = true;
        self.acker.ack(self.delivery_tag).await
    }

    pub async fn nack(mut self, requeue: bool) -> BrokerResult<()> {
        self.settled = true;
        self.acker.nack(self.delivery_tag, requeue).await
    }

    pub async fn reject(mut self, requeue: bool) -> BrokerResult<()> {
        self.settled = true;
        self.acker.reject(self.delivery_tag, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("bytes", &self.payload.len())
            .finish()
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                queue = %self.queue,
                delivery_tag = self.delivery_tag,
                "Delivery dropped without ack; broker will redeliver after channel close"
            );
        }
    }
}

/// Stream of deliveries from one consume session. Ends when the channel dies.
pub struct DeliveryFeed {
    inner: BoxStream<'static, BrokerResult<Delivery>>,
}

impl DeliveryFeed {
    pub fn new(stream: BoxStream<'static, BrokerResult<Delivery>>) -> Self {
        Self { inner: stream }
    }

    /// Next delivery; `None` once the feed is exhausted
    pub async fn next(&mut self) -> Option<BrokerResult<Delivery>> {
        self.inner.next().await
    }
}

impl fmt::Debug for DeliveryFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryFeed").finish_non_exhaustive()
    }
}
