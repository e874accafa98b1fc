//! Transport abstractions between the supervisor and a concrete broker client

use crate::connection::delivery::DeliveryFeed;
use crate::error::BrokerResult;
use async_trait::async_trait;
use std::sync::Arc;

/// Broker-reported queue properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    /// Messages ready for delivery
    pub messages: u32,
    pub consumers: u32,
}

/// Dials the broker
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Establish a new link to the broker at `url`
    async fn connect(&self, url: &str) -> BrokerResult<Arc<dyn BrokerLink>>;
}

/// One physical connection
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Open a logical channel on this link
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>>;

    /// Close the link; resolves [`BrokerLink::closed`] for every waiter
    async fn close(&self);

    /// Resolves once the link is closed, whether by the broker, the network or [`BrokerLink::close`]
    async fn closed(&self);

    fn is_open(&self) -> bool;
}

/// Queue operations on one logical channel
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Idempotent declare: non-durable, non-exclusive, no auto-delete
    async fn queue_declare(&self, queue: &str) -> BrokerResult<QueueInfo>;

    /// Cap the unacknowledged deliveries handed to consumers on this channel
    async fn basic_qos(&self, prefetch: u16) -> BrokerResult<()>;

    /// Start consuming with manual acknowledgement
    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryFeed>;

    /// Publish on the default exchange with `queue` as routing key
    async fn basic_publish(&self, queue: &str, payload: &[u8], priority: u8) -> BrokerResult<()>;

    /// Messages waiting in `queue`
    async fn queue_size(&self, queue: &str) -> BrokerResult<u32>;
}
