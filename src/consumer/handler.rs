//! Delivery handler abstraction

use crate::connection::Delivery;
use async_trait::async_trait;
use std::future::Future;

/// Processes one delivery at a time on a worker.
///
/// The handler owns the delivery and is responsible for settling it with
/// `ack`, `nack` or `reject`. A delivery dropped unsettled is redelivered by
/// the broker once the channel closes.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery);
}

#[async_trait]
impl<F, Fut> DeliveryHandler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) {
        (self)(delivery).await
    }
}
