//! Supervised broker connections.
//!
//! A [`ConnectionSupervisor`] owns exactly one link and one logical channel
//! and hides link failures from the component using it:
//!
//! ```text
//!  Disconnected ──connect()──▶ Connected ──link closed──▶ Connecting
//!                                  ▲                          │
//!                                  └──────reconnect()─────────┘
//! ```
//!
//! The broker itself sits behind the [`BrokerConnector`] / [`BrokerLink`] /
//! [`BrokerChannel`] traits. [`AmqpConnector`] talks to RabbitMQ through
//! `lapin`; [`MemoryBroker`] is an in-process broker with fault injection.
//!
//! Reconnect pacing comes from an injectable [`RetryPolicy`], gated by a
//! [`ReconnectBreaker`] that stops dialing for a cool-down period after a run
//! of consecutive failures.

mod amqp;
mod breaker;
mod delivery;
mod memory;
mod retry;
mod supervisor;
mod transport;

pub use amqp::AmqpConnector;
pub use breaker::{BreakerState, BreakerStats, ReconnectBreaker, StateTransition};
pub use delivery::{Delivery, DeliveryAcker, DeliveryFeed};
pub use memory::{MemoryBroker, PublishedMessage};
pub use retry::{policy_from_config, ExponentialBackoff, FixedDelay, RetryPolicy};
pub use supervisor::{ClosedEvent, ConnectionState, ConnectionSupervisor};
pub use transport::{BrokerChannel, BrokerConnector, BrokerLink, QueueInfo};
