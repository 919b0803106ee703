//! Pipeline metrics.
//!
//! Recording goes through the `metrics` facade. The library installs no
//! recorder; an embedder that wants export installs one before opening the
//! dispatcher, and until then every call is a no-op.

/// Named recording helpers so metric names and label sets live in one place.
pub mod counters {
    use metrics::{counter, gauge};

    // ============================================================================
    // QUEUE METRICS
    // ============================================================================

    pub fn queue_appended(queue: &str, records: u64) {
        counter!("dispatchd_queue_appended_total", "queue" => queue.to_string()).increment(records);
    }

    pub fn queue_append_failed(queue: &str, reason: &'static str) {
        counter!(
            "dispatchd_queue_append_failures_total",
            "queue" => queue.to_string(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn queue_length(queue: &str, length: i64) {
        gauge!("dispatchd_queue_length", "queue" => queue.to_string()).set(length as f64);
    }

    pub fn records_recovered(queue: &str, records: u64) {
        counter!("dispatchd_queue_records_recovered_total", "queue" => queue.to_string())
            .increment(records);
    }

    pub fn record_decode_failed(queue: &str) {
        counter!("dispatchd_queue_decode_failures_total", "queue" => queue.to_string()).increment(1);
    }

    pub fn checkpoint_mismatch(queue: &str) {
        counter!("dispatchd_checkpoint_mismatches_total", "queue" => queue.to_string()).increment(1);
    }

    // ============================================================================
    // FILTER METRICS
    // ============================================================================

    pub fn messages_dispatched(count: u64) {
        counter!("dispatchd_messages_dispatched_total").increment(count);
    }

    pub fn messages_filtered(stage: &'static str, count: u64) {
        counter!("dispatchd_messages_filtered_total", "stage" => stage).increment(count);
    }

    pub fn message_dropped(stage: &'static str, reason: &'static str) {
        counter!(
            "dispatchd_messages_dropped_total",
            "stage" => stage,
            "reason" => reason
        )
        .increment(1);
    }

    pub fn filter_failure(stage: &'static str) {
        counter!("dispatchd_filter_failures_total", "stage" => stage).increment(1);
    }

    // ============================================================================
    // DELIVERY METRICS
    // ============================================================================

    pub fn connector_call(queue: &str, result: &'static str) {
        counter!(
            "dispatchd_connector_calls_total",
            "queue" => queue.to_string(),
            "result" => result
        )
        .increment(1);
    }

    pub fn messages_retried(from_queue: &str, to_queue: &str, targets: u64) {
        counter!(
            "dispatchd_messages_retried_total",
            "from" => from_queue.to_string(),
            "to" => to_queue.to_string()
        )
        .increment(targets);
    }

    pub fn delivery_outcome(status: &'static str, targets: u64) {
        counter!("dispatchd_delivery_outcomes_total", "status" => status).increment(targets);
    }
}

#[cfg(test)]
mod tests {
    use super::counters;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        counters::queue_appended("q", 3);
        counters::queue_length("q", 3);
        counters::filter_failure("input");
        counters::delivery_outcome("delivered", 1);
    }
}
