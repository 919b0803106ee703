//! Delivery sink contract and a mock implementation.
//!
//! Real Email/SMS/Social connectors live outside this crate. Processors only
//! see [`Connector::deliver`], which answers per target.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::{ConnectorConfig, MockResponse};
use crate::message::OutputMessage;

/// Per-target answer from a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    /// Accepted by the downstream service
    Delivered,
    /// Rejected for good; will not be retried
    Failed,
    /// Temporary failure; try again on the next tier
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOutcome {
    pub target: String,
    pub status: TargetStatus,
    pub detail: Option<String>,
}

impl TargetOutcome {
    pub fn new(target: impl Into<String>, status: TargetStatus) -> Self {
        Self {
            target: target.into(),
            status,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Whole-call connector failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectorError {
    #[error("connector unavailable: {0}")]
    Unavailable(String),

    #[error("connector timed out")]
    Timeout,

    #[error("connector rejected the batch: {0}")]
    Rejected(String),
}

impl ConnectorError {
    /// Whether the targets should be retried on a later tier.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Timeout => "timeout",
            Self::Rejected(_) => "rejected",
        }
    }
}

/// Sends one output message to its targets.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn deliver(&self, message: &OutputMessage) -> Result<Vec<TargetOutcome>, ConnectorError>;
}

// =============================================================================
// MockConnector
// =============================================================================

/// One call seen by a [`MockConnector`].
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub message_id: Option<String>,
    pub delivery_count: u32,
    pub outcomes: Vec<TargetOutcome>,
}

/// Connector that answers from configuration instead of a downstream service.
#[derive(Debug)]
pub struct MockConnector {
    /// Response configuration
    response: MockResponse,
    /// Transient failure fraction in random mode
    error_rate: f32,
    /// Simulated latency
    latency: Duration,
    /// Targets that fail transiently until `recover_after` attempts
    flaky_targets: HashSet<String>,
    recover_after: u32,
    /// Total calls
    request_count: AtomicU64,
    /// Targets delivered
    success_count: AtomicU64,
    /// Targets or calls that failed
    error_count: AtomicU64,
    history: Mutex<Vec<DeliveryRecord>>,
}

impl MockConnector {
    pub fn new(config: &ConnectorConfig) -> Self {
        Self::with_response(config.response, config.error_rate).with_latency(config.latency)
    }

    fn with_response(response: MockResponse, error_rate: f32) -> Self {
        Self {
            response,
            error_rate,
            latency: Duration::ZERO,
            flaky_targets: HashSet::new(),
            recover_after: 0,
            request_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Delivers every target.
    pub fn success() -> Self {
        Self::with_response(MockResponse::Success, 0.0)
    }

    /// Rejects every target permanently.
    pub fn error() -> Self {
        Self::with_response(MockResponse::Error, 0.0)
    }

    /// Fails every target transiently.
    pub fn retry() -> Self {
        Self::with_response(MockResponse::Retry, 0.0)
    }

    /// Fails whole calls transiently at `error_rate`.
    pub fn random(error_rate: f32) -> Self {
        Self::with_response(MockResponse::Random, error_rate)
    }

    /// Set simulated latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make `targets` fail transiently until a message reaches
    /// `recover_after` prior attempts.
    pub fn with_flaky_targets<I, S>(mut self, targets: I, recover_after: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flaky_targets = targets.into_iter().map(Into::into).collect();
        self.recover_after = recover_after;
        self
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Every call made so far.
    pub fn history(&self) -> Vec<DeliveryRecord> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn answer(&self, message: &OutputMessage, target: &str) -> TargetOutcome {
        if self.flaky_targets.contains(target) && message.delivery_count < self.recover_after {
            return TargetOutcome::new(target, TargetStatus::Retry).with_detail("flaky target");
        }
        match self.response {
            MockResponse::Success | MockResponse::Random => TargetOutcome::new(target, TargetStatus::Delivered),
            MockResponse::Error => TargetOutcome::new(target, TargetStatus::Failed).with_detail("mock rejection"),
            MockResponse::Retry => TargetOutcome::new(target, TargetStatus::Retry).with_detail("mock transient failure"),
        }
    }

    fn record(&self, message: &OutputMessage, outcomes: Vec<TargetOutcome>) {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DeliveryRecord {
                id: message.id,
                message_id: message.message_id().map(str::to_string),
                delivery_count: message.delivery_count,
                outcomes,
            });
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn deliver(&self, message: &OutputMessage) -> Result<Vec<TargetOutcome>, ConnectorError> {
        let call = self.request_count.fetch_add(1, Ordering::Relaxed);

        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        if self.response == MockResponse::Random {
            // Deterministic spread: the call counter stands in for randomness
            let is_error = (call % 100) < (self.error_rate * 100.0) as u64;
            if is_error {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                debug!(id = %message.id, "mock random error");
                self.record(message, Vec::new());
                return Err(ConnectorError::Unavailable("mock random error".to_string()));
            }
        }

        let outcomes: Vec<TargetOutcome> = message
            .targets
            .iter()
            .map(|t| self.answer(message, t))
            .collect();

        let delivered = outcomes.iter().filter(|o| o.status == TargetStatus::Delivered).count() as u64;
        self.success_count.fetch_add(delivered, Ordering::Relaxed);
        self.error_count
            .fetch_add(outcomes.len() as u64 - delivered, Ordering::Relaxed);

        trace!(id = %message.id, targets = outcomes.len(), delivered, "mock delivery");
        self.record(message, outcomes.clone());
        Ok(outcomes)
    }
}
