//! Event publishing seam.
//!
//! Producers (webhooks, install flow, pipeline functions) only see
//! [`EventPublisher`]. Production wires NATS JetStream; tests and
//! single-process mode use an in-memory or queue-backed implementation.

mod memory;
mod nats;

pub use memory::InMemoryPublisher;
pub use nats::{NatsClient, NatsPublisher};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::event::PipelineEvent;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes one event. Invalid events are rejected before they reach
    /// the bus.
    async fn publish(&self, event: PipelineEvent) -> Result<()>;

    /// Publishes events in order, stopping at the first failure.
    async fn publish_all(&self, events: Vec<PipelineEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// Shared pre-publish check for every implementation.
pub fn ensure_valid(event: &PipelineEvent) -> Result<()> {
    event
        .validate()
        .with_context(|| format!("Refusing to publish invalid '{}' event", event.name()))
}
