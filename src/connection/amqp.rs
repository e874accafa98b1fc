//! RabbitMQ transport backed by `lapin`

use crate::connection::delivery::{Delivery, DeliveryAcker, DeliveryFeed};
use crate::connection::transport::{BrokerChannel, BrokerConnector, BrokerLink, QueueInfo};
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

const CLOSE_REPLY_CODE: u16 = 200;

/// Dials RabbitMQ over AMQP 0-9-1
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self, url: &str) -> BrokerResult<Arc<dyn BrokerLink>> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Dial(e.to_string()))?;

        let (closed_tx, _) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        let on_error_tx = closed_tx.clone();
        connection.on_error(move |err| {
            warn!(error = %err, "AMQP connection error");
            on_error_tx.send_replace(true);
        });

        Ok(Arc::new(AmqpLink {
            connection,
            closed_tx,
        }))
    }
}

struct AmqpLink {
    connection: Connection,
    closed_tx: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl BrokerLink for AmqpLink {
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ChannelOpen(e.to_string()))?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) {
        if self.connection.status().connected() {
            if let Err(e) = self.connection.close(CLOSE_REPLY_CODE, "closing").await {
                debug!(error = %e, "AMQP close returned an error");
            }
        }
        self.closed_tx.send_replace(true);
    }

    async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        // Sender is owned by the link, so wait_for only fails once the link is gone
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn is_open(&self) -> bool {
        !*self.closed_tx.borrow() && self.connection.status().connected()
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn queue_declare(&self, queue: &str) -> BrokerResult<QueueInfo> {
        let declared = self
            .channel
            .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map_err(|e| BrokerError::QueueDeclare {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;
        Ok(QueueInfo {
            name: declared.name().as_str().to_string(),
            messages: declared.message_count(),
            consumers: declared.consumer_count(),
        })
    }

    async fn basic_qos(&self, prefetch: u16) -> BrokerResult<()> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Qos {
                prefetch,
                message: e.to_string(),
            })
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryFeed> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;

        let acker: Arc<dyn DeliveryAcker> = Arc::new(AmqpAcker {
            channel: self.channel.clone(),
        });
        let queue = queue.to_string();
        let stream = consumer.map(move |item| match item {
            Ok(delivery) => Ok(Delivery::new(
                delivery.data,
                queue.clone(),
                delivery.routing_key.as_str(),
                delivery.delivery_tag,
                delivery.redelivered,
                acker.clone(),
            )),
            Err(e) => Err(BrokerError::Consume {
                queue: queue.clone(),
                message: e.to_string(),
            }),
        });

        Ok(DeliveryFeed::new(stream.boxed()))
    }

    async fn basic_publish(&self, queue: &str, payload: &[u8], priority: u8) -> BrokerResult<()> {
        let properties = BasicProperties::default()
            .with_content_type("text/plain".into())
            .with_priority(priority);

        let map_err = |e: lapin::Error| BrokerError::Publish {
            queue: queue.to_string(),
            message: e.to_string(),
        };
        self.channel
            .basic_publish("", queue, BasicPublishOptions::default(), payload, properties)
            .await
            .map_err(map_err)?
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn queue_size(&self, queue: &str) -> BrokerResult<u32> {
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        let declared = self
            .channel
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map_err(|e| BrokerError::Inspect {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;
        Ok(declared.message_count())
    }
}

struct AmqpAcker {
    channel: Channel,
}

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };
        self.channel
            .basic_nack(delivery_tag, options)
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}
