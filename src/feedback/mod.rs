//! Delivery outcome reporting.
//!
//! Every terminal outcome (delivered, failed, timed out, unclassifiable) is
//! handed to a [`ResultReporter`] together with the message's reporting URI.
//!
//! ```text
//! Filter ──┐
//!          ├──▶ ResultReporter::report_and_forget(uri, outcomes)
//! Tier ────┘            │
//!                       ├──▶ LoggingReporter  (daemon)
//!                       └──▶ MemoryReporter   (tests)
//! ```
//!
//! Reporting is best-effort: implementations must not block the caller and
//! never return errors.

mod memory;
pub mod types;

pub use memory::MemoryReporter;
pub use types::*;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::message::OutputMessage;
use crate::telemetry::counters;

/// Sink for delivery outcomes.
pub trait ResultReporter: Send + Sync {
    fn report_and_forget(&self, destination: &str, results: Vec<DeliveryOutcome>);
}

/// Shared reporter handle.
pub type SharedReporter = Arc<dyn ResultReporter>;

/// Reporter that emits one tracing event per outcome.
#[derive(Debug, Default)]
pub struct LoggingReporter;

impl ResultReporter for LoggingReporter {
    fn report_and_forget(&self, destination: &str, results: Vec<DeliveryOutcome>) {
        for outcome in results {
            info!(
                destination = %destination,
                message_id = %outcome.message_id,
                targets = outcome.targets.len(),
                status = %outcome.response.status,
                detail = outcome.response.detail.as_deref().unwrap_or(""),
                "delivery outcome"
            );
        }
    }
}

/// Outcome for the whole target set of `message`.
pub fn outcome_for(message: &OutputMessage, response: DeliveryResponse) -> DeliveryOutcome {
    DeliveryOutcome::new(
        message.message_id().unwrap_or_default(),
        message.targets.clone(),
        response,
    )
}

/// Group outcomes by reporting URI and send one report per URI.
pub fn report_grouped<I>(reporter: &dyn ResultReporter, outcomes: I)
where
    I: IntoIterator<Item = (String, DeliveryOutcome)>,
{
    let mut by_uri: BTreeMap<String, Vec<DeliveryOutcome>> = BTreeMap::new();
    for (uri, outcome) in outcomes {
        counters::delivery_outcome(outcome.status().as_str(), outcome.targets.len() as u64);
        by_uri.entry(uri).or_default().push(outcome);
    }
    for (uri, results) in by_uri {
        reporter.report_and_forget(&uri, results);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: &str, status: DeliveryStatus) -> DeliveryOutcome {
        DeliveryOutcome::new(id, ["t".to_string()].into(), DeliveryResponse::new(status))
    }

    #[test]
    fn test_report_grouped_one_call_per_uri() {
        let reporter = MemoryReporter::new();
        report_grouped(
            &reporter,
            vec![
                ("uri-a".to_string(), outcome("1", DeliveryStatus::Timeout)),
                ("uri-b".to_string(), outcome("2", DeliveryStatus::Unknown)),
                ("uri-a".to_string(), outcome("3", DeliveryStatus::Failed)),
            ],
        );

        assert_eq!(reporter.call_count(), 2);
        assert_eq!(reporter.outcomes_for("uri-a").len(), 2);
        assert_eq!(reporter.outcomes_for("uri-b").len(), 1);
    }

    #[test]
    fn test_logging_reporter_accepts_outcomes() {
        LoggingReporter.report_and_forget("uri", vec![outcome("1", DeliveryStatus::Delivered)]);
    }
}
