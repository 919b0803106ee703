use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::types::{Config, QueueConfig};

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        debug!(path = %path.display(), "loading configuration");

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)
            .context("failed to parse YAML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let queues = std::iter::once(&self.instant_queue)
            .chain(self.delayed_queues.iter().map(|d| &d.queue));
        for queue in queues {
            validate_queue(queue)?;
            if !names.insert(queue.name.as_str()) {
                anyhow::bail!("duplicate queue name: {}", queue.name);
            }
        }

        if self.retry.base_delay.is_zero() {
            anyhow::bail!("retry.base_delay must be positive");
        }
        if self.retry.max_delay < self.retry.base_delay {
            anyhow::bail!("retry.max_delay must not be shorter than retry.base_delay");
        }

        if self.processor.read_batch_size == 0 {
            anyhow::bail!("processor.read_batch_size must be positive");
        }
        if self.processor.delivery_concurrency == 0 {
            anyhow::bail!("processor.delivery_concurrency must be positive");
        }

        if !(0.0..=1.0).contains(&self.connector.error_rate) {
            anyhow::bail!("connector.error_rate must be between 0 and 1");
        }

        info!(
            delayed_queues = self.delayed_queues.len(),
            backend = ?self.store.backend,
            "configuration validated successfully"
        );
        Ok(())
    }
}

fn validate_queue(queue: &QueueConfig) -> Result<()> {
    if queue.name.trim().is_empty() {
        anyhow::bail!("queue name must not be empty");
    }
    if queue.max_queue_length < 2 {
        anyhow::bail!(
            "queue '{}' max_queue_length must be at least 2, got {}",
            queue.name,
            queue.max_queue_length
        );
    }
    if queue.event_time_to_live.is_zero() {
        anyhow::bail!("queue '{}' event_time_to_live must be positive", queue.name);
    }
    Ok(())
}
