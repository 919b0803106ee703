//! Types for delivery outcome reporting.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Final status of a delivery attempt for one or more targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Connector accepted the targets
    Delivered,
    /// Connector rejected the targets, or every retry tier was exhausted
    Failed,
    /// Message outlived its time to live
    Timeout,
    /// Message could not be classified or routed
    Unknown,
}

impl DeliveryStatus {
    /// Check if this indicates success.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    /// Check if this indicates failure.
    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    /// Convert to string for logging/metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status plus optional human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResponse {
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DeliveryResponse {
    pub fn new(status: DeliveryStatus) -> Self {
        Self {
            status,
            detail: None,
        }
    }

    pub fn with_detail(status: DeliveryStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: Some(detail.into()),
        }
    }
}

/// Outcome of one message for a set of its targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    /// Producer's message id; empty when the message carried none
    pub message_id: String,
    pub targets: BTreeSet<String>,
    pub response: DeliveryResponse,
    pub reported_at: DateTime<Utc>,
}

impl DeliveryOutcome {
    pub fn new(
        message_id: impl Into<String>,
        targets: BTreeSet<String>,
        response: DeliveryResponse,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            targets,
            response,
            reported_at: Utc::now(),
        }
    }

    pub fn status(&self) -> DeliveryStatus {
        self.response.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names() {
        assert_eq!(DeliveryStatus::Delivered.as_str(), "delivered");
        assert_eq!(DeliveryStatus::Timeout.to_string(), "timeout");
        assert!(DeliveryStatus::Delivered.is_success());
        assert!(DeliveryStatus::Unknown.is_failure());
    }

    #[test]
    fn test_outcome_serializes_without_empty_detail() {
        let outcome = DeliveryOutcome::new(
            "m1",
            ["a".to_string()].into(),
            DeliveryResponse::new(DeliveryStatus::Failed),
        );
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["response"]["status"], "failed");
        assert!(json["response"].get("detail").is_none());
    }
}
