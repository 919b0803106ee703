//! Output filtering: re-check messages on every hop between tiers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::feedback::{outcome_for, report_grouped, DeliveryResponse, DeliveryStatus, SharedReporter};
use crate::message::{OutputMessage, OutputMessageState};
use crate::telemetry::counters;

use super::{expires_at, InputFilteringEngine};

const STAGE: &str = "output";

/// Expires stale messages, drops terminal ones and sends `Nonfiltered`
/// messages back through an [`InputFilteringEngine`].
pub struct OutputFilteringEngine {
    event_time_to_live: Duration,
    reporter: SharedReporter,
    input: InputFilteringEngine,
}

impl OutputFilteringEngine {
    pub fn new(event_time_to_live: Duration, reporter: SharedReporter) -> Self {
        Self {
            event_time_to_live,
            input: InputFilteringEngine::new(event_time_to_live, reporter.clone()),
            reporter,
        }
    }

    /// Classification failures seen while re-filtering.
    pub fn failure_count(&self) -> u64 {
        self.input.failure_count()
    }

    pub fn filter(&self, messages: Vec<OutputMessage>) -> Vec<OutputMessage> {
        self.filter_at(messages, Utc::now())
    }

    pub fn filter_at(&self, messages: Vec<OutputMessage>, now: DateTime<Utc>) -> Vec<OutputMessage> {
        let mut output = Vec::with_capacity(messages.len());
        let mut refilter = Vec::new();
        let mut expired = Vec::new();

        for message in messages {
            if self.is_expired(&message, now) {
                counters::message_dropped(STAGE, "timeout");
                expired.push((
                    message.reporting_service_uri.clone(),
                    outcome_for(&message, DeliveryResponse::with_detail(DeliveryStatus::Timeout, "expired")),
                ));
                continue;
            }

            match message.state {
                OutputMessageState::Unfilterable | OutputMessageState::Unknown | OutputMessageState::TimeOut => {
                    debug!(id = %message.id, state = message.state.name(), "dropping terminal message");
                    counters::message_dropped(STAGE, message.state.name());
                }
                OutputMessageState::Nonfiltered => refilter.push(message.to_input()),
                OutputMessageState::Filtered | OutputMessageState::FilteredFailingDelivery => {
                    output.push(message)
                }
            }
        }

        if !expired.is_empty() {
            report_grouped(self.reporter.as_ref(), expired);
        }

        if !refilter.is_empty() {
            debug!(count = refilter.len(), "re-filtering nonfiltered messages");
            output.extend(self.input.filter_at(refilter, now));
        }

        counters::messages_filtered(STAGE, output.len() as u64);
        output
    }

    fn is_expired(&self, message: &OutputMessage, now: DateTime<Utc>) -> bool {
        let Some(info) = &message.message_info else {
            return false;
        };
        match expires_at(info, self.event_time_to_live) {
            Ok(expiry) => expiry < now,
            Err(e) => {
                counters::filter_failure(STAGE);
                warn!(id = %message.id, error = %e, "expiry check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::feedback::MemoryReporter;
    use crate::message::{ConnectorCredential, InputMessage, MessageInfo};

    fn engine() -> (OutputFilteringEngine, Arc<MemoryReporter>) {
        let reporter = Arc::new(MemoryReporter::new());
        (
            OutputFilteringEngine::new(Duration::from_secs(600), reporter.clone()),
            reporter,
        )
    }

    fn output(id: &str, state: OutputMessageState, sent: DateTime<Utc>, targets: usize) -> OutputMessage {
        let input = InputMessage::new(
            MessageInfo::new(id, sent),
            (0..targets).map(|i| format!("t{i}")),
            ConnectorCredential::new("sms", "conn", "https://connector.local", 2),
            "https://reports.local",
        );
        OutputMessage::from_input(&input, input.targets.clone(), state, sent)
    }

    #[test]
    fn test_ready_states_pass_through() {
        let (engine, reporter) = engine();
        let now = Utc::now();
        let filtered = output("a", OutputMessageState::Filtered, now, 1);
        let failing = output("b", OutputMessageState::FilteredFailingDelivery, now, 1);

        let result = engine.filter_at(vec![filtered.clone(), failing.clone()], now);

        assert_eq!(result, vec![filtered, failing]);
        assert_eq!(reporter.call_count(), 0);
    }

    #[test]
    fn test_terminal_states_dropped_without_report() {
        let (engine, reporter) = engine();
        let now = Utc::now();

        let result = engine.filter_at(
            vec![
                output("a", OutputMessageState::Unfilterable, now, 1),
                output("b", OutputMessageState::Unknown, now, 1),
            ],
            now,
        );

        assert!(result.is_empty());
        assert_eq!(reporter.call_count(), 0);
    }

    #[test]
    fn test_expired_message_reported_on_hop() {
        let (engine, reporter) = engine();
        let now = Utc::now();
        let sent = now - chrono::Duration::minutes(30);

        let result = engine.filter_at(vec![output("late", OutputMessageState::FilteredFailingDelivery, sent, 3)], now);

        assert!(result.is_empty());
        let outcomes = reporter.outcomes_for("https://reports.local");
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status(), DeliveryStatus::Timeout);
        assert_eq!(outcomes[0].targets.len(), 3);
    }

    #[test]
    fn test_nonfiltered_goes_through_input_filter_once() {
        let (engine, reporter) = engine();
        let now = Utc::now();
        let pending = output("retry-me", OutputMessageState::Nonfiltered, now, 5);

        let result = engine.filter_at(vec![pending.clone()], now);

        assert_eq!(result.len(), 3);
        assert!(result.iter().all(|m| m.state == OutputMessageState::Filtered));
        assert!(result.iter().all(|m| m.id != pending.id));
        assert_eq!(result.iter().map(|m| m.targets.len()).sum::<usize>(), 5);
        assert_eq!(reporter.call_count(), 0);
    }

    #[test]
    fn test_nonfiltered_invalid_becomes_reported() {
        let (engine, reporter) = engine();
        let now = Utc::now();
        let mut pending = output("broken", OutputMessageState::Nonfiltered, now, 2);
        pending.connector_credential = None;

        let result = engine.filter_at(vec![pending], now);

        assert!(result.is_empty());
        assert_eq!(reporter.outcomes_with_status(DeliveryStatus::Unknown).len(), 1);
    }

    #[test]
    fn test_repeated_classification_failure_stays_nonfiltered() {
        let (engine, reporter) = engine();
        let now = Utc::now();
        let pending = output("overflow", OutputMessageState::Nonfiltered, DateTime::<Utc>::MAX_UTC, 2);

        let result = engine.filter_at(vec![pending], now);

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].state, OutputMessageState::Nonfiltered);
        assert_eq!(engine.failure_count(), 1);
        assert_eq!(reporter.call_count(), 0);
    }
}
