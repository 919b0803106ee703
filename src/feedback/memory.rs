//! In-memory reporter.
//!
//! Keeps every report it receives. Used by tests and by embedders that want
//! to inspect outcomes without a reporting service.

use std::sync::{PoisonError, RwLock};

use super::types::{DeliveryOutcome, DeliveryStatus};
use super::ResultReporter;

/// Reporter that records every call.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    reports: RwLock<Vec<(String, Vec<DeliveryOutcome>)>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(destination, outcomes)` call, in arrival order.
    pub fn reports(&self) -> Vec<(String, Vec<DeliveryOutcome>)> {
        self.reports.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn call_count(&self) -> usize {
        self.reports.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// All outcomes sent to `destination`, flattened.
    pub fn outcomes_for(&self, destination: &str) -> Vec<DeliveryOutcome> {
        self.reports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(uri, _)| uri == destination)
            .flat_map(|(_, outcomes)| outcomes.iter().cloned())
            .collect()
    }

    /// All outcomes with the given status, across destinations.
    pub fn outcomes_with_status(&self, status: DeliveryStatus) -> Vec<DeliveryOutcome> {
        self.reports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flat_map(|(_, outcomes)| outcomes.iter())
            .filter(|o| o.status() == status)
            .cloned()
            .collect()
    }

    /// Number of targets reported with the given status.
    pub fn target_count(&self, status: DeliveryStatus) -> usize {
        self.outcomes_with_status(status)
            .iter()
            .map(|o| o.targets.len())
            .sum()
    }

    pub fn clear(&self) {
        self.reports.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl ResultReporter for MemoryReporter {
    fn report_and_forget(&self, destination: &str, results: Vec<DeliveryOutcome>) {
        self.reports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((destination.to_string(), results));
    }
}
