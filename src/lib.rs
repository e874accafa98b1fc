//! Resilient RabbitMQ publishing and consumption for billing services.
//!
//! The crate keeps one long-lived broker connection per component and hides
//! network failures from application code:
//!
//! - [`notifier::Notifier`] buffers outbound messages in two bounded stages and
//!   publishes them from a single loop, requeueing anything that fails
//! - [`consumer::Consumer`] declares a queue, applies a prefetch limit and fans
//!   deliveries out to a pool of async workers
//! - [`connection::ConnectionSupervisor`] owns the link for either of them and
//!   reconnects with an injectable [`connection::RetryPolicy`] guarded by a
//!   [`connection::ReconnectBreaker`]
//!
//! Components are ordinary values: each one takes its own configuration and
//! [`metrics::MetricsSink`], so any number of them can live in one process.
//!
//! # Example
//! ```no_run
//! use rbmq_link::config::NotifierConfig;
//! use rbmq_link::connection::AmqpConnector;
//! use rbmq_link::metrics::PrometheusSink;
//! use rbmq_link::notifier::{Notifier, OutboundMessage};
//! use std::sync::Arc;
//!
//! # async fn run() -> rbmq_link::error::BrokerResult<()> {
//! let notifier = Notifier::start(
//!     NotifierConfig::default(),
//!     Arc::new(AmqpConnector::new()),
//!     Arc::new(PrometheusSink::new("rbmq", "notifier")),
//! )
//! .await?;
//!
//! notifier
//!     .publish(OutboundMessage::new("sms_requests", "hello").with_priority(1))
//!     .await?;
//! notifier.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod metrics;
pub mod notifier;
pub mod queues;
pub mod telemetry;

pub use config::Settings;
pub use connection::{
    AmqpConnector, ConnectionState, ConnectionSupervisor, Delivery, MemoryBroker, RetryPolicy,
};
pub use consumer::{Consumer, ConsumerHandle, DeliveryHandler};
pub use error::{BrokerError, BrokerResult};
pub use metrics::{MemorySink, MetricsSink, PrometheusSink};
pub use notifier::{Notifier, OutboundMessage};
