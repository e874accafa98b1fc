//! Outbound message model

use crate::error::{BrokerError, BrokerResult};
use serde::{Deserialize, Serialize};

/// A message waiting to be published.
///
/// Serialized as `{queueName, priority, payload, eventTag}` in buffer snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    /// Destination queue, published through the default exchange
    pub queue_name: String,
    #[serde(default)]
    pub priority: u8,
    pub payload: Vec<u8>,
    /// Diagnostic label, only used in logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_tag: Option<String>,
}

impl OutboundMessage {
    pub fn new(queue_name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            queue_name: queue_name.into(),
            priority: 0,
            payload: payload.into(),
            event_tag: None,
        }
    }

    /// Serialize `value` as the JSON payload
    pub fn json<T: Serialize>(queue_name: impl Into<String>, value: &T) -> BrokerResult<Self> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(queue_name, payload))
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_event_tag(mut self, event_tag: impl Into<String>) -> Self {
        self.event_tag = Some(event_tag.into());
        self
    }

    /// Reject messages that can never be published
    pub fn validate(&self) -> BrokerResult<()> {
        if self.queue_name.is_empty() {
            return Err(BrokerError::Configuration(
                "outbound message has an empty destination queue".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn event_tag_or_empty(&self) -> &str {
        self.event_tag.as_deref().unwrap_or("")
    }
}
