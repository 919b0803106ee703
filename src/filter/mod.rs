//! Filtering engines.
//!
//! Classify messages on their way into and between queue tiers:
//!
//! ```text
//!   InputMessage ──▶ InputFilteringEngine ──┬──▶ Filtered (one per batch_size targets)
//!                          ▲                ├──▶ Nonfiltered (classification error)
//!                          │                └──▶ Unfilterable / TimeOut ──▶ reporter
//!                          │ to_input()
//!   OutputMessage ──▶ OutputFilteringEngine ─┬──▶ pass through (Filtered, FilteredFailingDelivery)
//!                                            ├──▶ TimeOut ──▶ reporter
//!                                            └──▶ drop (Unfilterable, Unknown)
//! ```
//!
//! Neither engine fails a batch: per-message errors are counted, logged and
//! expressed as a message state.

mod input;
mod output;

pub use input::InputFilteringEngine;
pub use output::OutputFilteringEngine;

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::message::{InputMessage, MessageInfo, OutputMessage};

/// Per-message classification errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("expiry of message '{message_id}' is out of range")]
    ExpiryOverflow { message_id: String },
}

/// Classification step run by a processor on every batch it reads.
pub trait FilteringEngine<T>: Send + Sync {
    fn filter_batch(&self, items: Vec<T>) -> Vec<OutputMessage>;
}

impl FilteringEngine<InputMessage> for InputFilteringEngine {
    fn filter_batch(&self, items: Vec<InputMessage>) -> Vec<OutputMessage> {
        self.filter(items)
    }
}

impl FilteringEngine<OutputMessage> for OutputFilteringEngine {
    fn filter_batch(&self, items: Vec<OutputMessage>) -> Vec<OutputMessage> {
        self.filter(items)
    }
}

/// Instant after which `info` is no longer deliverable.
pub(crate) fn expires_at(info: &MessageInfo, ttl: Duration) -> Result<DateTime<Utc>, FilterError> {
    let overflow = || FilterError::ExpiryOverflow {
        message_id: info.message_id.clone(),
    };
    let ttl = chrono::Duration::from_std(ttl).map_err(|_| overflow())?;
    info.send_time.checked_add_signed(ttl).ok_or_else(overflow)
}
