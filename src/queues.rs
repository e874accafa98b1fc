//! Queue naming convention shared by the billing services.
//!
//! Every operator gets one queue per purpose, named `<operator><suffix>`, so
//! a single connection can serve all of an operator's queues.

use serde::{Deserialize, Serialize};

pub const NEW_SUBSCRIPTION_SUFFIX: &str = "_new_subscriptions";
pub const MO_TARIFFICATE_SUFFIX: &str = "_mo_tarifficate";
pub const REQUESTS_SUFFIX: &str = "_requests";
pub const RESPONSES_SUFFIX: &str = "_responses";
pub const SMS_REQUEST_SUFFIX: &str = "_sms_requests";
pub const SMS_RESPONSE_SUFFIX: &str = "_sms_responses";

pub fn new_subscription_queue(operator: &str) -> String {
    format!("{operator}{NEW_SUBSCRIPTION_SUFFIX}")
}

pub fn mo_queue(operator: &str) -> String {
    format!("{operator}{MO_TARIFFICATE_SUFFIX}")
}

pub fn requests_queue(operator: &str) -> String {
    format!("{operator}{REQUESTS_SUFFIX}")
}

pub fn responses_queue(operator: &str) -> String {
    format!("{operator}{RESPONSES_SUFFIX}")
}

pub fn sms_requests_queue(operator: &str) -> String {
    format!("{operator}{SMS_REQUEST_SUFFIX}")
}

pub fn sms_responses_queue(operator: &str) -> String {
    format!("{operator}{SMS_RESPONSE_SUFFIX}")
}

/// Per-operator settings carrying the queue naming helpers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    pub name: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl OperatorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
        }
    }

    pub fn new_subscription_queue(&self) -> String {
        new_subscription_queue(&self.name)
    }

    pub fn mo_queue(&self) -> String {
        mo_queue(&self.name)
    }

    pub fn requests_queue(&self) -> String {
        requests_queue(&self.name)
    }

    pub fn responses_queue(&self) -> String {
        responses_queue(&self.name)
    }

    pub fn sms_requests_queue(&self) -> String {
        sms_requests_queue(&self.name)
    }

    pub fn sms_responses_queue(&self) -> String {
        sms_responses_queue(&self.name)
    }

    /// All queues owned by this operator
    pub fn all_queues(&self) -> Vec<String> {
        vec![
            self.new_subscription_queue(),
            self.mo_queue(),
            self.requests_queue(),
            self.responses_queue(),
            self.sms_requests_queue(),
            self.sms_responses_queue(),
        ]
    }
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_names() {
        let op = OperatorConfig::new("mobilink");
        assert_eq!(op.new_subscription_queue(), "mobilink_new_subscriptions");
        assert_eq!(op.mo_queue(), "mobilink_mo_tarifficate");
        assert_eq!(op.requests_queue(), "mobilink_requests");
        assert_eq!(op.responses_queue(), "mobilink_responses");
        assert_eq!(op.sms_requests_queue(), "mobilink_sms_requests");
        assert_eq!(op.sms_responses_queue(), "mobilink_sms_responses");
    }

    #[test]
    fn test_all_queues_are_distinct() {
        let op = OperatorConfig::new("beeline");
        let mut queues = op.all_queues();
        queues.sort();
        queues.dedup();
        assert_eq!(queues.len(), 6);
        assert!(op.enabled);
    }
}
