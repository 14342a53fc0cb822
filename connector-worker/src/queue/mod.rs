//! In-process job queue executing pipeline events.
//!
//! Each enqueued event becomes one tokio task that:
//! - waits until the event's `not_before`
//! - takes a permit from the (lane, organisation) semaphore
//! - runs the handler, retrying with jittered exponential backoff
//! - gives up after `max_attempts` and calls [`JobHandler::exhausted`]
//!
//! Lifecycle events cancel conflicting jobs of the same organisation at
//! enqueue time. Pending jobs are dropped and in-flight jobs are aborted
//! through their task handle:
//!
//! | enqueued                  | cancels                                   |
//! |---------------------------|-------------------------------------------|
//! | `app.installed`           | `app.uninstalled`                         |
//! | `app.uninstalled`         | installed, sync, delete and refresh jobs  |
//! | `token.refresh.requested` | refresh jobs that have not started yet    |
//!
//! [`JobQueue::enqueue_tracked`] hands back a [`JobReceipt`] that resolves
//! with the job's [`JobEnd`]. The receipt closes without a value when the
//! job is aborted by [`JobQueue::shutdown`].

mod backoff;
mod publisher;

pub use backoff::RetryPolicy;
pub use publisher::QueuePublisher;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use elba_connect::bus::ensure_valid;
use elba_connect::event::{EventKind, PipelineEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::functions::FunctionError;

/// Executes one job attempt.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, event: &PipelineEvent) -> Result<(), FunctionError>;

    /// Called once when a job fails its last attempt.
    async fn exhausted(&self, _event: &PipelineEvent, _error: &FunctionError) {}
}

/// How a job left the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobEnd {
    Done,
    /// Failed with a non-retriable error.
    Dropped,
    /// Failed its last attempt.
    Exhausted,
    /// Superseded by a later event, or cancelled by its handler.
    Cancelled,
}

/// Resolves once the job ends.
pub type JobReceipt = oneshot::Receiver<JobEnd>;

/// Concurrency lane. Jobs in the same lane for the same organisation share
/// one semaphore.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Lane {
    Sync,
    Delete,
    Lifecycle,
    Refresh,
}

impl From<EventKind> for Lane {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Sync => Lane::Sync,
            EventKind::Delete => Lane::Delete,
            EventKind::Installed | EventKind::Uninstalled => Lane::Lifecycle,
            EventKind::Refresh => Lane::Refresh,
        }
    }
}

/// True when enqueuing `new` cancels a tracked job of kind `queued`.
fn supersedes(new: EventKind, queued: EventKind, queued_started: bool) -> bool {
    use EventKind::*;
    match (new, queued) {
        (Installed, Uninstalled) => true,
        (Uninstalled, Installed | Sync | Delete | Refresh) => true,
        (Refresh, Refresh) => !queued_started,
        _ => false,
    }
}

struct TrackedJob {
    organisation_id: Uuid,
    kind: EventKind,
    started: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    waiters: Vec<oneshot::Sender<JobEnd>>,
}

impl TrackedJob {
    fn settle(self, end: JobEnd) {
        for waiter in self.waiters {
            let _ = waiter.send(end);
        }
    }
}

struct Inner {
    handler: OnceLock<Arc<dyn JobHandler>>,
    policy: RetryPolicy,
    limits: DashMap<(Lane, Uuid), Arc<Semaphore>>,
    jobs: Mutex<HashMap<Uuid, TrackedJob>>,
    active: watch::Sender<usize>,
}

impl Inner {
    fn jobs(&self) -> MutexGuard<'_, HashMap<Uuid, TrackedJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn limit(&self, lane: Lane, organisation_id: Uuid) -> Arc<Semaphore> {
        let permits = match lane {
            Lane::Delete => self.policy.delete_concurrency,
            _ => 1,
        };
        self.limits
            .entry((lane, organisation_id))
            .or_insert_with(|| Arc::new(Semaphore::new(permits)))
            .value()
            .clone()
    }

    /// Settles the job, unless the id was already reused by a newer job.
    fn finish(&self, job_id: Uuid, started: &Arc<AtomicBool>, end: JobEnd) {
        let mut jobs = self.jobs();
        if jobs
            .get(&job_id)
            .is_some_and(|job| Arc::ptr_eq(&job.started, started))
        {
            if let Some(job) = jobs.remove(&job_id) {
                job.settle(end);
            }
        }
        self.active.send_replace(jobs.len());
    }
}

/// Cloneable handle to the queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                handler: OnceLock::new(),
                policy,
                limits: DashMap::new(),
                jobs: Mutex::new(HashMap::new()),
                active,
            }),
        }
    }

    /// Installs the handler. Jobs can only be enqueued after this.
    pub fn start(&self, handler: Arc<dyn JobHandler>) -> Result<()> {
        self.inner
            .handler
            .set(handler)
            .map_err(|_| anyhow!("job queue already started"))
    }

    /// Schedules an event for execution and returns its job id.
    ///
    /// Conflicting jobs of the same organisation are cancelled before this
    /// returns. Enqueuing an event id that is already tracked is a no-op.
    pub fn enqueue(&self, event: PipelineEvent) -> Result<Uuid> {
        self.submit(event, None)
    }

    /// Like [`JobQueue::enqueue`], also returning a receipt for the job's end.
    ///
    /// Enqueuing a tracked event id again yields a second receipt for the
    /// same job.
    pub fn enqueue_tracked(&self, event: PipelineEvent) -> Result<(Uuid, JobReceipt)> {
        let (waiter, receipt) = oneshot::channel();
        let job_id = self.submit(event, Some(waiter))?;
        Ok((job_id, receipt))
    }

    fn submit(
        &self,
        event: PipelineEvent,
        waiter: Option<oneshot::Sender<JobEnd>>,
    ) -> Result<Uuid> {
        let handler = self
            .inner
            .handler
            .get()
            .cloned()
            .ok_or_else(|| anyhow!("job queue has no handler"))?;
        ensure_valid(&event)?;

        let job_id = event.event_id;
        let organisation_id = event.organisation_id();
        let kind = event.kind();

        let mut jobs = self.inner.jobs();
        if let Some(job) = jobs.get_mut(&job_id) {
            debug!(job_id = %job_id, kind = kind.name(), "Event already queued");
            job.waiters.extend(waiter);
            return Ok(job_id);
        }

        let cancelled: Vec<Uuid> = jobs
            .iter()
            .filter(|(_, job)| {
                job.organisation_id == organisation_id
                    && supersedes(kind, job.kind, job.started.load(Ordering::SeqCst))
            })
            .map(|(id, _)| *id)
            .collect();

        for id in cancelled {
            if let Some(job) = jobs.remove(&id) {
                job.handle.abort();
                info!(
                    job_id = %id,
                    organisation_id = %organisation_id,
                    cancelled = job.kind.name(),
                    by = kind.name(),
                    "Cancelled superseded job"
                );
                job.settle(JobEnd::Cancelled);
            }
        }

        let started = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run_job(
            Arc::clone(&self.inner),
            handler,
            event,
            Arc::clone(&started),
        ));

        jobs.insert(
            job_id,
            TrackedJob {
                organisation_id,
                kind,
                started,
                handle,
                waiters: waiter.into_iter().collect(),
            },
        );
        self.inner.active.send_replace(jobs.len());

        debug!(job_id = %job_id, organisation_id = %organisation_id, kind = kind.name(), "Job enqueued");
        Ok(job_id)
    }

    /// Jobs waiting, running or backing off.
    pub fn len(&self) -> usize {
        self.inner.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once no job is tracked.
    pub async fn wait_idle(&self) {
        let mut active = self.inner.active.subscribe();
        let _ = active.wait_for(|count| *count == 0).await;
    }

    /// Aborts every tracked job. Their receipts close unresolved.
    pub fn shutdown(&self) {
        let mut jobs = self.inner.jobs();
        for (_, job) in jobs.drain() {
            job.handle.abort();
        }
        self.inner.active.send_replace(0);
    }
}

async fn run_job(
    inner: Arc<Inner>,
    handler: Arc<dyn JobHandler>,
    event: PipelineEvent,
    started: Arc<AtomicBool>,
) {
    let job_id = event.event_id;
    let organisation_id = event.organisation_id();
    let kind = event.kind();

    if let Some(at) = event.not_before {
        if let Ok(wait) = (at - Utc::now()).to_std() {
            debug!(job_id = %job_id, kind = kind.name(), wait_secs = wait.as_secs(), "Job delayed");
            tokio::time::sleep(wait).await;
        }
    }

    let limit = inner.limit(Lane::from(kind), organisation_id);
    let max_attempts = inner.policy.max_attempts;
    let mut attempt = 0;

    let end = loop {
        attempt += 1;

        let result = {
            let Ok(_permit) = limit.acquire().await else {
                break JobEnd::Cancelled;
            };
            started.store(true, Ordering::SeqCst);
            handler.handle(&event).await
        };

        match result {
            Ok(()) => {
                debug!(job_id = %job_id, kind = kind.name(), attempt, "Job done");
                break JobEnd::Done;
            }
            Err(err @ FunctionError::Retryable { .. }) if attempt < max_attempts => {
                let delay = inner.policy.delay(attempt, err.retry_after());
                warn!(
                    job_id = %job_id,
                    organisation_id = %organisation_id,
                    kind = kind.name(),
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Job failed, will retry"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err @ FunctionError::Retryable { .. }) => {
                error!(
                    job_id = %job_id,
                    organisation_id = %organisation_id,
                    kind = kind.name(),
                    attempt,
                    error = %err,
                    "Job failed, attempts exhausted"
                );
                handler.exhausted(&event, &err).await;
                break JobEnd::Exhausted;
            }
            Err(FunctionError::NonRetriable(message)) => {
                warn!(
                    job_id = %job_id,
                    organisation_id = %organisation_id,
                    kind = kind.name(),
                    error = %message,
                    "Job dropped"
                );
                break JobEnd::Dropped;
            }
            Err(FunctionError::Cancelled) => {
                info!(job_id = %job_id, organisation_id = %organisation_id, kind = kind.name(), "Job cancelled");
                break JobEnd::Cancelled;
            }
        }
    };

    if kind == EventKind::Uninstalled {
        inner.limits.retain(|(_, org), _| *org != organisation_id);
    }
    inner.finish(job_id, &started, end);
}
