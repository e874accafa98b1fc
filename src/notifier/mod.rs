//! Publisher side.
//!
//! ```text
//!  publish() ──▶ staging (mpsc) ──forwarder──▶ pending (seq-ordered) ──publish loop──▶ broker
//!                                                   ▲                        │
//!                                                   └──── requeue on error ──┘
//! ```
//!
//! Producers never see transient broker errors. They see backpressure when
//! both buffers are full, and a `Configuration` error for a message without a
//! destination queue. Delivery is at-least-once: a message whose publish call
//! failed is retried after reconnect, so duplicates are possible.

mod buffer;
mod message;
mod publisher;
mod snapshot;

pub use buffer::{InFlight, PendingBuffer};
pub use message::OutboundMessage;
pub use publisher::Notifier;
pub use snapshot::{read_snapshot, remove_snapshot, write_snapshot};
