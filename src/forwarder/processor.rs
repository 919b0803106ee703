//! Tier processors.
//!
//! Each processor drains one queue. A pass reads a batch, filters it,
//! delivers the ready messages, routes what failed and checkpoints the batch:
//!
//! ```text
//!   source.read ──▶ filter ──▶ connector (N in flight)
//!                     │            ├── delivered / failed ──▶ reporter
//!                     │            └── retry ──▶ next tier (delay = tier backoff)
//!                     └── nonfiltered ──▶ next tier, or reported at the last tier
//!   source.checkpoint(batch)
//! ```
//!
//! The checkpoint happens only after routing, so a crash mid-pass delivers
//! the batch again on restart.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream, FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::bootstrap::{run_loops, Runnable};
use crate::config::ProcessorConfig;
use crate::feedback::{outcome_for, report_grouped, DeliveryOutcome, DeliveryResponse, DeliveryStatus, SharedReporter};
use crate::filter::FilteringEngine;
use crate::message::{OutputMessage, OutputMessageState};
use crate::queue::{CheckpointInfo, Queue, QueueError};
use crate::telemetry::counters;

use super::connector::{Connector, ConnectorError, TargetOutcome, TargetStatus};

/// How often a processor logs its counters.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// The tier a processor escalates to.
#[derive(Clone)]
pub struct NextTier {
    pub queue: Arc<dyn Queue<OutputMessage>>,
    /// Visibility delay applied to messages appended to it
    pub delay: Duration,
}

/// Running totals for one processor.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    pub batches: AtomicU64,
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> ProcessorSnapshot {
        ProcessorSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorSnapshot {
    pub batches: u64,
    pub delivered: u64,
    pub failed: u64,
    pub retried: u64,
}

/// Where each delivered message's targets ended up.
#[derive(Default)]
struct Routing {
    reports: Vec<(String, DeliveryOutcome)>,
    escalate: Vec<OutputMessage>,
}

/// Moves messages out of one queue.
pub struct Processor<T> {
    source: Arc<dyn Queue<T>>,
    filter: Arc<dyn FilteringEngine<T>>,
    connector: Arc<dyn Connector>,
    reporter: SharedReporter,
    next: Option<NextTier>,
    config: ProcessorConfig,
    stats: ProcessorStats,
}

impl<T: Send + 'static> Processor<T> {
    pub fn new(
        source: Arc<dyn Queue<T>>,
        filter: Arc<dyn FilteringEngine<T>>,
        connector: Arc<dyn Connector>,
        reporter: SharedReporter,
        next: Option<NextTier>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            source,
            filter,
            connector,
            reporter,
            next,
            config,
            stats: ProcessorStats::default(),
        }
    }

    pub fn stats(&self) -> ProcessorSnapshot {
        self.stats.snapshot()
    }

    fn queue(&self) -> &str {
        self.source.name()
    }

    async fn process_loop(self: Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        info!(
            queue = %self.queue(),
            batch_size = self.config.read_batch_size,
            concurrency = self.config.delivery_concurrency,
            next = self.next.as_ref().map(|n| n.queue.name()).unwrap_or("none"),
            "processor started"
        );

        let mut cursor = self.source.start_cursor();
        while !cancel.is_cancelled() {
            let records = match self
                .source
                .read(cursor, self.config.read_batch_size, false, self.config.read_timeout, &cancel)
                .await
            {
                Ok(records) => records,
                Err(e) => {
                    warn!(queue = %self.queue(), error = %e, "read failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.read_timeout) => continue,
                    }
                }
            };

            let Some(checkpoint) = CheckpointInfo::for_records(&records) else {
                continue;
            };
            let items = records.into_iter().map(|r| r.item).collect();

            if let Err(e) = self.process_batch(items, &cancel).await {
                // leave the batch in place; it is read again after a restart
                info!(queue = %self.queue(), error = %e, "processor interrupted mid-batch");
                break;
            }

            let last = checkpoint.last_record_info;
            if let Err(e) = self.source.checkpoint(checkpoint).await {
                warn!(queue = %self.queue(), error = %e, "checkpoint failed");
            }
            cursor = last;
        }

        info!(queue = %self.queue(), "processor stopped");
        Ok(())
    }

    async fn stats_loop(self: Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(()),

                _ = interval.tick() => {
                    let s = self.stats();
                    info!(
                        queue = %self.queue(),
                        length = self.source.length(),
                        batches = s.batches,
                        delivered = s.delivered,
                        failed = s.failed,
                        retried = s.retried,
                        "processor stats"
                    );
                }
            }
        }
    }

    #[instrument(skip_all, fields(queue = %self.queue(), count = items.len()))]
    async fn process_batch(&self, items: Vec<T>, cancel: &CancellationToken) -> Result<(), QueueError> {
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        let filtered = self.filter.filter_batch(items);

        let (ready, pending): (Vec<_>, Vec<_>) = filtered.into_iter().partition(|m| m.state.is_ready());
        let mut routing = Routing::default();

        for message in pending {
            if message.state != OutputMessageState::Nonfiltered {
                continue;
            }
            if self.next.is_some() {
                routing.escalate.push(message);
            } else {
                routing.reports.push((
                    message.reporting_service_uri.clone(),
                    outcome_for(&message, DeliveryResponse::with_detail(DeliveryStatus::Unknown, "unclassifiable")),
                ));
            }
        }

        let connector = &self.connector;
        let mut deliveries = stream::iter(ready)
            .map(|message| async move {
                let result = connector.deliver(&message).await;
                (message, result)
            })
            .buffer_unordered(self.config.delivery_concurrency.max(1));

        while let Some((message, result)) = deliveries.next().await {
            self.route(message, result, &mut routing);
        }

        self.escalate(routing.escalate, &mut routing.reports, cancel).await?;

        if !routing.reports.is_empty() {
            report_grouped(self.reporter.as_ref(), routing.reports);
        }
        Ok(())
    }

    fn route(
        &self,
        message: OutputMessage,
        result: Result<Vec<TargetOutcome>, ConnectorError>,
        routing: &mut Routing,
    ) {
        let uri = message.reporting_service_uri.clone();
        let message_id = message.message_id().unwrap_or_default().to_string();

        let outcomes = match result {
            Ok(outcomes) => {
                counters::connector_call(self.queue(), "ok");
                outcomes
            }
            Err(e) => {
                counters::connector_call(self.queue(), e.as_str());
                debug!(id = %message.id, error = %e, "connector call failed");
                let status = if e.is_transient() { TargetStatus::Retry } else { TargetStatus::Failed };
                message
                    .targets
                    .iter()
                    .map(|t| TargetOutcome::new(t.clone(), status).with_detail(e.to_string()))
                    .collect()
            }
        };

        let mut delivered = BTreeSet::new();
        let mut retry: BTreeSet<String> = message.targets.clone();
        let mut failed: Vec<TargetOutcome> = Vec::new();

        for outcome in outcomes {
            if !retry.remove(&outcome.target) {
                continue;
            }
            match outcome.status {
                TargetStatus::Delivered => {
                    delivered.insert(outcome.target);
                }
                TargetStatus::Failed => failed.push(outcome),
                TargetStatus::Retry => {
                    retry.insert(outcome.target);
                }
            }
        }

        if !delivered.is_empty() {
            self.stats.delivered.fetch_add(delivered.len() as u64, Ordering::Relaxed);
            routing.reports.push((
                uri.clone(),
                DeliveryOutcome::new(message_id.clone(), delivered, DeliveryResponse::new(DeliveryStatus::Delivered)),
            ));
        }

        for outcome in failed {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            let response = match outcome.detail {
                Some(detail) => DeliveryResponse::with_detail(DeliveryStatus::Failed, detail),
                None => DeliveryResponse::new(DeliveryStatus::Failed),
            };
            routing.reports.push((
                uri.clone(),
                DeliveryOutcome::new(message_id.clone(), [outcome.target].into(), response),
            ));
        }

        if retry.is_empty() {
            return;
        }
        match &self.next {
            Some(next) => {
                routing.escalate.push(message.retry(retry, due_after(next.delay)));
            }
            None => {
                self.stats.failed.fetch_add(retry.len() as u64, Ordering::Relaxed);
                routing.reports.push((
                    uri,
                    DeliveryOutcome::new(
                        message_id,
                        retry,
                        DeliveryResponse::with_detail(DeliveryStatus::Failed, "retries exhausted"),
                    ),
                ));
            }
        }
    }

    async fn escalate(
        &self,
        messages: Vec<OutputMessage>,
        reports: &mut Vec<(String, DeliveryOutcome)>,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        let Some(next) = &self.next else {
            return Ok(());
        };
        if messages.is_empty() {
            return Ok(());
        }

        // A lenient tier would swallow a full queue, so failures must come
        // back here to be reported.
        let targets: u64 = messages.iter().map(|m| m.targets.len() as u64).sum();
        match next.queue.try_append(messages.clone(), cancel).await {
            Ok(()) => {
                self.stats.retried.fetch_add(targets, Ordering::Relaxed);
                counters::messages_retried(self.queue(), next.queue.name(), targets);
                Ok(())
            }
            Err(e @ (QueueError::Cancelled | QueueError::Closed)) => Err(e),
            Err(e) => {
                error!(queue = %self.queue(), next = %next.queue.name(), error = %e, "escalation failed");
                self.stats.failed.fetch_add(targets, Ordering::Relaxed);
                reports.extend(messages.iter().map(|m| {
                    (
                        m.reporting_service_uri.clone(),
                        outcome_for(m, DeliveryResponse::with_detail(DeliveryStatus::Failed, e.to_string())),
                    )
                }));
                Ok(())
            }
        }
    }
}

fn due_after(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl<T: Send + 'static> Runnable for Processor<T> {
    async fn run(self: Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        run_loops(vec![
            ("process", self.clone().process_loop(cancel.clone()).boxed()),
            ("stats", self.stats_loop(cancel).boxed()),
        ])
        .await
    }
}
