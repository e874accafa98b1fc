//! Consumer side.
//!
//! ```text
//!  Disconnected ─connect()─▶ Connected ─announce_queue()─▶ Consuming
//!                                ▲                            │ link closed
//!                                └── reconnect + re-announce ◀┘
//! ```
//!
//! A [`Consumer`] owns one supervised connection. [`Consumer::handle`] fans
//! a delivery feed out to a pool of workers; whichever worker is free takes
//! the next delivery, so ordering across workers is not preserved. The
//! broker-side prefetch limit bounds how many deliveries are unacknowledged
//! at any moment.
//!
//! # Example
//! ```no_run
//! use rbmq_link::config::ConsumerConfig;
//! use rbmq_link::connection::{AmqpConnector, Delivery};
//! use rbmq_link::consumer::Consumer;
//! use rbmq_link::metrics::PrometheusSink;
//! use std::sync::Arc;
//!
//! # async fn run() -> rbmq_link::error::BrokerResult<()> {
//! let consumer = Consumer::new(
//!     ConsumerConfig::default(),
//!     "sms_requests",
//!     600,
//!     Arc::new(AmqpConnector::new()),
//!     Arc::new(PrometheusSink::new("rbmq", "consumer")),
//! )?;
//! let handle = consumer
//!     .init_queue(
//!         |delivery: Delivery| async move {
//!             let _ = delivery.ack().await;
//!         },
//!         60,
//!         "sms_requests",
//!         "",
//!     )
//!     .await?;
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod core;
mod handler;
mod pool;

pub use self::core::{Consumer, ConsumerHandle};
pub use handler::DeliveryHandler;
