//! JetStream intake: moves published events into the local job queue.
//!
//! The worker runs as a single replica. Per-organisation concurrency limits,
//! lifecycle cancellation and the sync scheduler all live in one process's
//! [`JobQueue`], so a second worker on the same consumer would break them.

use anyhow::{Context, Result};
use async_nats::jetstream::{self, consumer::pull, AckKind};
use elba_connect::config::NatsConfig;
use elba_connect::event::PipelineEvent;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::queue::{JobEnd, JobQueue, JobReceipt};

/// Durable consumer of the worker.
pub const CONSUMER_NAME: &str = "connector-worker";

/// Pulls events from the stream and enqueues them until the stream ends.
///
/// A message is acknowledged when its job ends, so events whose jobs had not
/// finished are redelivered after a restart. Malformed or invalid events are
/// acknowledged straight away and not redelivered.
pub async fn run_intake(
    jetstream: jetstream::Context,
    config: NatsConfig,
    queue: JobQueue,
) -> Result<()> {
    let stream = jetstream
        .get_stream(&config.stream_name)
        .await
        .with_context(|| format!("Failed to get stream '{}'", config.stream_name))?;

    let ack_wait = Duration::from_secs(config.ack_wait_secs);

    let consumer = stream
        .get_or_create_consumer(
            CONSUMER_NAME,
            pull::Config {
                durable_name: Some(CONSUMER_NAME.to_string()),
                filter_subject: format!("{}.>", config.subject_prefix),
                ack_wait,
                max_ack_pending: config.max_ack_pending,
                ..Default::default()
            },
        )
        .await
        .context("Failed to get or create consumer")?;

    info!(
        stream = %config.stream_name,
        consumer = CONSUMER_NAME,
        ack_wait_secs = config.ack_wait_secs,
        max_ack_pending = config.max_ack_pending,
        "Consuming pipeline events"
    );

    let mut messages = consumer.messages().await?;

    while let Some(next) = messages.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(e) => {
                error!(error = %e, "Error receiving message");
                continue;
            }
        };

        match serde_json::from_slice::<PipelineEvent>(&msg.payload) {
            Ok(event) => {
                let name = event.name();
                match queue.enqueue_tracked(event) {
                    Ok((job_id, receipt)) => {
                        debug!(job_id = %job_id, event = name, "Event received");
                        tokio::spawn(settle(msg, receipt, ack_wait / 2));
                        continue;
                    }
                    Err(e) => error!(event = name, error = %e, "Rejected event, dropping"),
                }
            }
            Err(e) => {
                error!(subject = %msg.subject, error = %e, "Failed to deserialize event, skipping");
            }
        }

        if let Err(e) = msg.ack().await {
            error!(error = %e, "Failed to acknowledge message");
        }
    }

    warn!("Event stream ended");
    Ok(())
}

/// Keeps the message in progress until its job ends, then settles it.
async fn settle(msg: jetstream::Message, mut receipt: JobReceipt, progress_every: Duration) {
    let mut progress = tokio::time::interval(progress_every);
    progress.tick().await;

    let end = loop {
        tokio::select! {
            end = &mut receipt => break end.ok(),
            _ = progress.tick() => {
                if let Err(e) = msg.ack_with(AckKind::Progress).await {
                    warn!(subject = %msg.subject, error = %e, "Failed to extend ack deadline");
                }
            }
        }
    };

    if let Err(e) = msg.ack_with(settlement(end)).await {
        error!(subject = %msg.subject, error = %e, "Failed to settle message");
    }
}

/// Every finished job is acknowledged; an aborted one is redelivered.
fn settlement(end: Option<JobEnd>) -> AckKind {
    match end {
        Some(JobEnd::Done | JobEnd::Dropped | JobEnd::Exhausted | JobEnd::Cancelled) => {
            AckKind::Ack
        }
        None => AckKind::Nak(None),
    }
}
