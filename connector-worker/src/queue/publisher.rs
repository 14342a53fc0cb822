use anyhow::Result;
use async_trait::async_trait;
use elba_connect::bus::EventPublisher;
use elba_connect::event::PipelineEvent;
use tracing::debug;

use super::JobQueue;

/// Publishes straight into the local [`JobQueue`].
///
/// Used when the worker runs without NATS: the webhook router and the
/// pipeline functions feed the same in-process queue.
#[derive(Clone)]
pub struct QueuePublisher {
    queue: JobQueue,
}

impl QueuePublisher {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl EventPublisher for QueuePublisher {
    async fn publish(&self, event: PipelineEvent) -> Result<()> {
        let name = event.name();
        let job_id = self.queue.enqueue(event)?;
        debug!(job_id = %job_id, event = name, "Event queued locally");
        Ok(())
    }
}
