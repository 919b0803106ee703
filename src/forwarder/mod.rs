//! Message dispatcher.
//!
//! Wires the whole pipeline and supervises it as one component tree:
//!
//! ```text
//!   dispatch() ──▶ instant log ──▶ instant processor ──▶ connector
//!                                        │ retry
//!                                        ▼
//!                  delayed-0 (delay d0) ──▶ processor ──▶ connector
//!                                        │ retry
//!                                        ▼
//!                  delayed-N (delay dN) ──▶ processor ──▶ connector ──▶ failed
//! ```
//!
//! Tiers are built last-first so every processor's next tier already exists.
//! Logs are registered with the root manager before processors, so closing
//! stops every processor before any log.

mod connector;
mod processor;

pub use connector::{
    Connector, ConnectorError, DeliveryRecord, MockConnector, TargetOutcome, TargetStatus,
};
pub use processor::{NextTier, Processor, ProcessorSnapshot, ProcessorStats};

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::bootstrap::{
    Component, ComponentError, ComponentEvent, ComponentEvents, ComponentManager, ListenerId,
    RunAsyncComponent,
};
use crate::config::Config;
use crate::feedback::SharedReporter;
use crate::filter::{InputFilteringEngine, OutputFilteringEngine};
use crate::message::{InputMessage, OutputMessage};
use crate::queue::{DelayedReliableLog, Queue, QueueError, ReliableLog};
use crate::store::SharedStorage;
use crate::telemetry::counters;

/// Errors returned to producers.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Length of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub name: String,
    pub length: i64,
}

/// Queue lengths, instant queue first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub queues: Vec<QueueStats>,
}

impl DispatcherStats {
    pub fn total_length(&self) -> i64 {
        self.queues.iter().map(|q| q.length).sum()
    }
}

/// Entry point for producers and owner of the pipeline.
pub struct MessageDispatcher {
    instant: Arc<ReliableLog<InputMessage>>,
    tiers: Vec<Arc<ReliableLog<OutputMessage>>>,
    root: ComponentManager,
}

impl MessageDispatcher {
    pub fn build(
        config: &Config,
        storage: SharedStorage,
        connector: Arc<dyn Connector>,
        reporter: SharedReporter,
    ) -> Result<Self, DispatchError> {
        let root = ComponentManager::new("dispatcher");

        let instant = Arc::new(ReliableLog::<InputMessage>::new(
            config.instant_queue.clone(),
            storage.as_ref(),
        )?);

        let mut tiers = Vec::with_capacity(config.delayed_queues.len());
        let mut tier_processors: Vec<Arc<dyn Component>> = Vec::with_capacity(config.delayed_queues.len());
        let mut next: Option<NextTier> = None;

        for (i, tier) in config.delayed_queues.iter().enumerate().rev() {
            let log = Arc::new(ReliableLog::<OutputMessage>::new(tier.queue.clone(), storage.as_ref())?);
            let delayed: Arc<dyn Queue<OutputMessage>> = Arc::new(DelayedReliableLog::new(log.clone()));

            let processor = Processor::new(
                delayed.clone(),
                Arc::new(OutputFilteringEngine::new(tier.queue.event_time_to_live, reporter.clone())),
                connector.clone(),
                reporter.clone(),
                next.take(),
                config.processor.clone(),
            );
            tier_processors.push(Arc::new(RunAsyncComponent::new(
                format!("{}-processor", tier.queue.name),
                processor,
            )));

            next = Some(NextTier {
                queue: delayed,
                delay: config.tier_delay(i),
            });
            tiers.push(log);
        }
        tiers.reverse();
        tier_processors.reverse();

        let instant_processor = Processor::new(
            instant.clone() as Arc<dyn Queue<InputMessage>>,
            Arc::new(InputFilteringEngine::new(
                config.instant_queue.event_time_to_live,
                reporter.clone(),
            )),
            connector,
            reporter,
            next,
            config.processor.clone(),
        );

        root.add(instant.clone());
        for log in &tiers {
            root.add(log.clone());
        }
        for processor in tier_processors {
            root.add(processor);
        }
        root.add(Arc::new(RunAsyncComponent::new(
            format!("{}-processor", config.instant_queue.name),
            instant_processor,
        )));

        info!(
            instant = %config.instant_queue.name,
            tiers = tiers.len(),
            components = root.len(),
            "dispatcher built"
        );

        Ok(Self {
            instant,
            tiers,
            root,
        })
    }

    /// Append producer messages to the instant queue.
    ///
    /// Filtering and delivery outcomes are reported asynchronously; only a
    /// failure to enqueue is returned here, whatever the instant queue's
    /// `strict_append` setting.
    #[instrument(skip_all, fields(count = messages.len()))]
    pub async fn dispatch(&self, messages: Vec<InputMessage>) -> Result<(), DispatchError> {
        if messages.is_empty() {
            return Ok(());
        }
        let count = messages.len() as u64;
        self.instant.try_append(messages, &CancellationToken::new()).await?;
        counters::messages_dispatched(count);
        Ok(())
    }

    /// Call `listener` with the first fault of any component in the tree.
    pub fn subscribe_faults<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(Arc<anyhow::Error>) + Send + Sync + 'static,
    {
        self.root.events().subscribe(move |event| {
            if let ComponentEvent::Faulted(error) = event {
                listener(error.clone());
            }
        })
    }

    pub fn stats(&self) -> DispatcherStats {
        let mut queues = vec![QueueStats {
            name: Queue::name(self.instant.as_ref()).to_string(),
            length: self.instant.length(),
        }];
        queues.extend(self.tiers.iter().map(|t| QueueStats {
            name: Queue::name(t.as_ref()).to_string(),
            length: t.length(),
        }));
        DispatcherStats { queues }
    }

    /// Children still registered with the root manager.
    pub fn component_count(&self) -> usize {
        self.root.len()
    }
}

#[async_trait]
impl Component for MessageDispatcher {
    fn name(&self) -> &str {
        self.root.name()
    }

    fn events(&self) -> &ComponentEvents {
        self.root.events()
    }

    async fn open(&self, cancel: &CancellationToken) -> Result<(), ComponentError> {
        self.root.open(cancel).await
    }

    async fn close(&self, cancel: &CancellationToken) -> Result<(), ComponentError> {
        self.root.close(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DelayedQueueConfig, QueueConfig};
    use crate::feedback::MemoryReporter;
    use crate::store::MemoryStorage;
    use std::time::Duration;

    fn config(tiers: usize) -> Config {
        let mut config = Config::default();
        config.instant_queue = QueueConfig::new("instant", 32);
        config.delayed_queues = (0..tiers)
            .map(|i| DelayedQueueConfig::new(QueueConfig::new(format!("tier-{i}"), 32)))
            .collect();
        config.processor.read_timeout = Duration::from_millis(20);
        config
    }

    #[tokio::test]
    async fn test_build_registers_logs_and_processors() {
        let dispatcher = MessageDispatcher::build(
            &config(2),
            Arc::new(MemoryStorage::new()),
            Arc::new(MockConnector::success()),
            Arc::new(MemoryReporter::new()),
        )
        .unwrap();

        // 3 logs + 3 processors
        assert_eq!(dispatcher.component_count(), 6);
        let names: Vec<_> = dispatcher.stats().queues.into_iter().map(|q| q.name).collect();
        assert_eq!(names, vec!["instant", "tier-0", "tier-1"]);
    }

    #[tokio::test]
    async fn test_dispatch_before_open_is_rejected() {
        let dispatcher = MessageDispatcher::build(
            &config(0),
            Arc::new(MemoryStorage::new()),
            Arc::new(MockConnector::success()),
            Arc::new(MemoryReporter::new()),
        )
        .unwrap();

        assert!(dispatcher.dispatch(vec![]).await.is_ok());

        let message = InputMessage::new(
            crate::message::MessageInfo::new("m1", chrono::Utc::now()),
            ["a"],
            crate::message::ConnectorCredential::new("sms", "c1", "https://connector.local", 1),
            "https://reports.local",
        );
        let result = dispatcher.dispatch(vec![message]).await;
        assert!(matches!(result, Err(DispatchError::Queue(QueueError::Closed))));
        assert_eq!(dispatcher.stats().total_length(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_to_full_queue_is_rejected() {
        let mut config = config(0);
        config.instant_queue = QueueConfig::new("instant", 3);
        let dispatcher = MessageDispatcher::build(
            &config,
            Arc::new(MemoryStorage::new()),
            Arc::new(MockConnector::success()),
            Arc::new(MemoryReporter::new()),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        dispatcher.instant.open(&cancel).await.unwrap();

        let messages: Vec<_> = ["m1", "m2", "m3"]
            .into_iter()
            .map(|id| {
                InputMessage::new(
                    crate::message::MessageInfo::new(id, chrono::Utc::now()),
                    ["a"],
                    crate::message::ConnectorCredential::new("sms", "c1", "https://connector.local", 1),
                    "https://reports.local",
                )
            })
            .collect();
        let result = dispatcher.dispatch(messages).await;
        assert!(matches!(
            result,
            Err(DispatchError::Queue(QueueError::QueueSizeExceeded { .. }))
        ));
        assert_eq!(dispatcher.stats().total_length(), 0);
    }

    #[tokio::test]
    async fn test_close_empties_tree() {
        let dispatcher = MessageDispatcher::build(
            &config(1),
            Arc::new(MemoryStorage::new()),
            Arc::new(MockConnector::success()),
            Arc::new(MemoryReporter::new()),
        )
        .unwrap();
        let cancel = CancellationToken::new();

        dispatcher.open(&cancel).await.unwrap();
        dispatcher.close(&cancel).await.unwrap();

        assert_eq!(dispatcher.component_count(), 0);
    }
}
