//! Input filtering: validate, expire and batch producer messages.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::feedback::{report_grouped, DeliveryOutcome, DeliveryResponse, DeliveryStatus, SharedReporter};
use crate::message::{InputMessage, OutputMessage, OutputMessageState};
use crate::telemetry::counters;

use super::{expires_at, FilterError};

const STAGE: &str = "input";

enum Verdict {
    Ready,
    Unfilterable(&'static str),
    TimeOut,
}

/// Turns producer messages into connector-sized [`OutputMessage`]s.
pub struct InputFilteringEngine {
    event_time_to_live: Duration,
    reporter: SharedReporter,
    failures: AtomicU64,
}

impl InputFilteringEngine {
    pub fn new(event_time_to_live: Duration, reporter: SharedReporter) -> Self {
        Self {
            event_time_to_live,
            reporter,
            failures: AtomicU64::new(0),
        }
    }

    /// Messages that failed classification since creation.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn filter(&self, messages: Vec<InputMessage>) -> Vec<OutputMessage> {
        self.filter_at(messages, Utc::now())
    }

    /// Filter against an explicit clock reading.
    pub fn filter_at(&self, messages: Vec<InputMessage>, now: DateTime<Utc>) -> Vec<OutputMessage> {
        let mut output = Vec::with_capacity(messages.len());
        let mut dropped = Vec::new();

        for message in messages {
            match self.classify(&message, now) {
                Ok(Verdict::Ready) => {
                    let batches = batch_targets(&message);
                    counters::messages_filtered(STAGE, batches.len() as u64);
                    output.extend(batches.into_iter().map(|targets| {
                        OutputMessage::from_input(&message, targets, OutputMessageState::Filtered, now)
                    }));
                }
                Ok(Verdict::Unfilterable(reason)) => {
                    debug!(message_id = message.message_id().unwrap_or(""), reason, "message unfilterable");
                    counters::message_dropped(STAGE, reason);
                    dropped.push(drop_outcome(&message, DeliveryStatus::Unknown, reason));
                }
                Ok(Verdict::TimeOut) => {
                    debug!(message_id = message.message_id().unwrap_or(""), "message expired");
                    counters::message_dropped(STAGE, "timeout");
                    dropped.push(drop_outcome(&message, DeliveryStatus::Timeout, "expired"));
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    counters::filter_failure(STAGE);
                    warn!(error = %e, "classification failed, keeping message as nonfiltered");
                    output.push(OutputMessage::from_input(
                        &message,
                        message.targets.clone(),
                        OutputMessageState::Nonfiltered,
                        now,
                    ));
                }
            }
        }

        if !dropped.is_empty() {
            report_grouped(self.reporter.as_ref(), dropped);
        }
        output
    }

    fn classify(&self, message: &InputMessage, now: DateTime<Utc>) -> Result<Verdict, FilterError> {
        let Some(info) = &message.message_info else {
            return Ok(Verdict::Unfilterable("missing_message_info"));
        };
        if message.targets.is_empty() {
            return Ok(Verdict::Unfilterable("no_targets"));
        }
        match &message.connector_credential {
            None => return Ok(Verdict::Unfilterable("missing_credential")),
            Some(credential) if credential.validate().is_err() => {
                return Ok(Verdict::Unfilterable("invalid_credential"))
            }
            Some(_) => {}
        }

        if expires_at(info, self.event_time_to_live)? < now {
            return Ok(Verdict::TimeOut);
        }
        Ok(Verdict::Ready)
    }
}

/// Consecutive chunks of `batch_size` targets. Only called on validated messages.
fn batch_targets(message: &InputMessage) -> Vec<BTreeSet<String>> {
    let batch_size = message
        .connector_credential
        .as_ref()
        .map_or(1, |c| c.batch_size.max(1));

    let targets: Vec<&String> = message.targets.iter().collect();
    targets
        .chunks(batch_size)
        .map(|chunk| chunk.iter().map(|t| (*t).clone()).collect())
        .collect()
}

fn drop_outcome(message: &InputMessage, status: DeliveryStatus, detail: &str) -> (String, DeliveryOutcome) {
    let outcome = DeliveryOutcome::new(
        message.message_id().unwrap_or_default(),
        message.targets.clone(),
        DeliveryResponse::with_detail(status, detail),
    );
    (message.reporting_service_uri.clone(), outcome)
}
