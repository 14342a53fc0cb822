use anyhow::{Context, Result};
use async_nats::jetstream::{self, stream};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{ensure_valid, EventPublisher};
use crate::config::NatsConfig;
use crate::event::PipelineEvent;

/// NATS client with JetStream
pub struct NatsClient {
    jetstream: jetstream::Context,
    config: NatsConfig,
}

impl NatsClient {
    /// Connect to NATS and make sure the event stream exists.
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        info!("Connecting to NATS at {}", config.url);

        let client = async_nats::connect(&config.url)
            .await
            .context("Failed to connect to NATS")?;

        let nats_client = Self {
            jetstream: jetstream::new(client),
            config,
        };

        nats_client.ensure_stream().await?;

        Ok(nats_client)
    }

    async fn ensure_stream(&self) -> Result<()> {
        if self.jetstream.get_stream(&self.config.stream_name).await.is_ok() {
            info!("Stream '{}' already exists", self.config.stream_name);
            return Ok(());
        }

        let stream_config = stream::Config {
            name: self.config.stream_name.clone(),
            subjects: vec![format!("{}.>", self.config.subject_prefix)],
            max_age: std::time::Duration::from_secs((self.config.max_age_days * 86400) as u64),
            storage: stream::StorageType::File,
            // Each event is handed to exactly one worker.
            retention: stream::RetentionPolicy::WorkQueue,
            ..Default::default()
        };

        self.jetstream
            .create_stream(stream_config)
            .await
            .context("Failed to create JetStream stream")?;

        info!("Created JetStream stream '{}'", self.config.stream_name);
        Ok(())
    }

    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    pub fn publisher(&self) -> NatsPublisher {
        NatsPublisher::new(self.jetstream.clone(), self.config.subject_prefix.clone())
    }
}

/// Event publisher for NATS JetStream
#[derive(Clone)]
pub struct NatsPublisher {
    jetstream: jetstream::Context,
    subject_prefix: String,
}

impl NatsPublisher {
    pub fn new(jetstream: jetstream::Context, subject_prefix: String) -> Self {
        Self {
            jetstream,
            subject_prefix,
        }
    }

    /// Subject format: `{prefix}.{event name}`, e.g. `elba.connect.sync.requested`
    pub fn subject_for(&self, event: &PipelineEvent) -> String {
        format!("{}.{}", self.subject_prefix, event.name())
    }
}

#[async_trait]
impl EventPublisher for NatsPublisher {
    async fn publish(&self, event: PipelineEvent) -> Result<()> {
        ensure_valid(&event)?;

        let subject = self.subject_for(&event);
        let payload = serde_json::to_vec(&event).context("Failed to serialize event to JSON")?;

        debug!(
            event_id = %event.event_id,
            organisation_id = %event.organisation_id(),
            subject = %subject,
            "Publishing event to NATS"
        );

        self.jetstream
            .publish(subject.clone(), payload.into())
            .await
            .with_context(|| format!("Failed to publish event to subject '{}'", subject))?
            .await
            .context("Failed to await publish ack")?;

        Ok(())
    }
}
