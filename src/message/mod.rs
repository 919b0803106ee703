//! Messages flowing through the dispatch pipeline.
//!
//! Producers submit [`InputMessage`]s. The input filter validates them and
//! splits their targets into connector-sized [`OutputMessage`] batches, which
//! is what the connectors and the retry tiers work with.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity and content of an engagement notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub message_id: String,
    #[serde(default)]
    pub tenant: String,
    pub send_time: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl MessageInfo {
    pub fn new(message_id: impl Into<String>, send_time: DateTime<Utc>) -> Self {
        Self {
            message_id: message_id.into(),
            tenant: String::new(),
            send_time,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = tenant.into();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Which connector delivers a message and how many targets it takes per call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorCredential {
    pub connector_name: String,
    pub connector_id: String,
    pub service_uri: String,
    pub batch_size: usize,
}

/// Why a credential was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("credential field '{0}' is empty")]
    MissingField(&'static str),

    #[error("credential batch size must be positive")]
    ZeroBatchSize,
}

impl ConnectorCredential {
    pub fn new(
        connector_name: impl Into<String>,
        connector_id: impl Into<String>,
        service_uri: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            connector_name: connector_name.into(),
            connector_id: connector_id.into(),
            service_uri: service_uri.into(),
            batch_size,
        }
    }

    pub fn validate(&self) -> Result<(), CredentialError> {
        let fields = [
            ("connector_name", &self.connector_name),
            ("connector_id", &self.connector_id),
            ("service_uri", &self.service_uri),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(CredentialError::MissingField(*name));
        }
        if self.batch_size == 0 {
            return Err(CredentialError::ZeroBatchSize);
        }
        Ok(())
    }
}

// =============================================================================
// InputMessage
// =============================================================================

/// A message as submitted by a producer. Compared by message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputMessage {
    pub message_info: Option<MessageInfo>,
    #[serde(default)]
    pub targets: BTreeSet<String>,
    pub connector_credential: Option<ConnectorCredential>,
    #[serde(default)]
    pub reporting_service_uri: String,
}

impl InputMessage {
    pub fn new<I, S>(
        message_info: MessageInfo,
        targets: I,
        connector_credential: ConnectorCredential,
        reporting_service_uri: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            message_info: Some(message_info),
            targets: targets.into_iter().map(Into::into).collect(),
            connector_credential: Some(connector_credential),
            reporting_service_uri: reporting_service_uri.into(),
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_info.as_ref().map(|i| i.message_id.as_str())
    }
}

impl PartialEq for InputMessage {
    fn eq(&self, other: &Self) -> bool {
        self.message_id() == other.message_id()
    }
}

impl Eq for InputMessage {}

impl Hash for InputMessage {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.message_id().hash(state);
    }
}

// =============================================================================
// OutputMessage
// =============================================================================

/// Classification assigned by the filtering engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMessageState {
    Filtered,
    Nonfiltered,
    FilteredFailingDelivery,
    Unfilterable,
    TimeOut,
    /// Anything a newer writer produced that this build does not know.
    #[serde(other)]
    Unknown,
}

impl OutputMessageState {
    /// Never delivered; only reported.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::Unknown | Self::Unfilterable | Self::TimeOut)
    }

    /// Ready to hand to a connector.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Filtered | Self::FilteredFailingDelivery)
    }

    /// Classification failed and must be retried by the input filter.
    pub fn needs_refilter(&self) -> bool {
        matches!(self, Self::Nonfiltered)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Filtered => "filtered",
            Self::Nonfiltered => "nonfiltered",
            Self::FilteredFailingDelivery => "filtered_failing_delivery",
            Self::Unfilterable => "unfilterable",
            Self::TimeOut => "time_out",
        }
    }
}

/// A connector-sized unit of work. Compared by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputMessage {
    pub id: Uuid,
    pub message_info: Option<MessageInfo>,
    pub targets: BTreeSet<String>,
    pub connector_credential: Option<ConnectorCredential>,
    pub reporting_service_uri: String,
    #[serde(default)]
    pub delivered: bool,
    pub state: OutputMessageState,
    pub delivery_time: DateTime<Utc>,
    #[serde(default)]
    pub delivery_count: u32,
}

impl OutputMessage {
    /// New output carrying `input`'s fields with the given targets.
    pub fn from_input(
        input: &InputMessage,
        targets: BTreeSet<String>,
        state: OutputMessageState,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_info: input.message_info.clone(),
            targets,
            connector_credential: input.connector_credential.clone(),
            reporting_service_uri: input.reporting_service_uri.clone(),
            delivered: false,
            state,
            delivery_time: now,
            delivery_count: 0,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_info.as_ref().map(|i| i.message_id.as_str())
    }

    /// Back to producer shape, for another pass through the input filter.
    pub fn to_input(&self) -> InputMessage {
        InputMessage {
            message_info: self.message_info.clone(),
            targets: self.targets.clone(),
            connector_credential: self.connector_credential.clone(),
            reporting_service_uri: self.reporting_service_uri.clone(),
        }
    }

    /// Next delivery attempt for the targets that still need one.
    ///
    /// A retry of every target is the same unit of work and keeps `id`. A
    /// retry of a subset gets a fresh id, since the delivered targets now
    /// belong to a different unit.
    pub fn retry(&self, targets: BTreeSet<String>, delivery_time: DateTime<Utc>) -> Self {
        let id = if targets == self.targets { self.id } else { Uuid::new_v4() };
        Self {
            id,
            message_info: self.message_info.clone(),
            targets,
            connector_credential: self.connector_credential.clone(),
            reporting_service_uri: self.reporting_service_uri.clone(),
            delivered: false,
            state: OutputMessageState::FilteredFailingDelivery,
            delivery_time,
            delivery_count: self.delivery_count + 1,
        }
    }
}

impl PartialEq for OutputMessage {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for OutputMessage {}

impl Hash for OutputMessage {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
