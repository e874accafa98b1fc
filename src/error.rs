//! Error types for broker operations

use thiserror::Error;

/// Result type for broker operations
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Errors raised by the connection supervisor, the notifier and the consumer
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Dialing the broker failed
    #[error("Dial failed: {0}")]
    Dial(String),

    /// The connection came up but no channel could be opened on it
    #[error("Channel open failed: {0}")]
    ChannelOpen(String),

    /// Queue declaration was refused
    #[error("Queue declare failed for '{queue}': {message}")]
    QueueDeclare { queue: String, message: String },

    /// Setting the prefetch limit failed
    #[error("QoS failed (prefetch {prefetch}): {message}")]
    Qos { prefetch: u16, message: String },

    /// Opening the delivery feed failed
    #[error("Consume failed for '{queue}': {message}")]
    Consume { queue: String, message: String },

    /// Publishing a message failed
    #[error("Publish failed for '{queue}': {message}")]
    Publish { queue: String, message: String },

    /// Queue inspection failed
    #[error("Queue inspect failed for '{queue}': {message}")]
    Inspect { queue: String, message: String },

    /// Acknowledging a delivery failed
    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    /// Invalid configuration or caller input; never retried
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An operation was attempted without a live channel
    #[error("Not connected to broker")]
    NotConnected,

    /// The retry policy gave up
    #[error("Reconnect gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// The staging buffer has no free slot
    #[error("Staging buffer is full")]
    BufferFull,

    /// The component is shutting down
    #[error("Shutting down")]
    Shutdown,

    /// Reading or writing the buffer snapshot failed
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    /// Whether the supervisor should recover from this error by reconnecting
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Dial(_)
                | BrokerError::ChannelOpen(_)
                | BrokerError::QueueDeclare { .. }
                | BrokerError::Qos { .. }
                | BrokerError::Consume { .. }
                | BrokerError::Publish { .. }
                | BrokerError::Inspect { .. }
                | BrokerError::NotConnected
        )
    }

    /// Get error code string
    pub fn error_code(&self) -> &str {
        match self {
            BrokerError::Dial(_) => "DIAL_ERROR",
            BrokerError::ChannelOpen(_) => "CHANNEL_OPEN_ERROR",
            BrokerError::QueueDeclare { .. } => "QUEUE_DECLARE_ERROR",
            BrokerError::Qos { .. } => "QOS_ERROR",
            BrokerError::Consume { .. } => "CONSUME_ERROR",
            BrokerError::Publish { .. } => "PUBLISH_ERROR",
            BrokerError::Inspect { .. } => "INSPECT_ERROR",
            BrokerError::Ack(_) => "ACK_ERROR",
            BrokerError::Configuration(_) => "CONFIGURATION_ERROR",
            BrokerError::NotConnected => "NOT_CONNECTED",
            BrokerError::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            BrokerError::BufferFull => "BUFFER_FULL",
            BrokerError::Shutdown => "SHUTDOWN",
            BrokerError::Snapshot(_) => "SNAPSHOT_ERROR",
            BrokerError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

/// Conversion from config::ConfigError
impl From<config::ConfigError> for BrokerError {
    fn from(err: config::ConfigError) -> Self {
        BrokerError::Configuration(err.to_string())
    }
}
