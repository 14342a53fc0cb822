use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use super::{ensure_valid, EventPublisher};
use crate::event::{EventKind, PipelineEvent};

/// Publisher that records events in memory.
#[derive(Clone, Default)]
pub struct InMemoryPublisher {
    events: Arc<Mutex<Vec<PipelineEvent>>>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, in order.
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn events_of(&self, kind: EventKind) -> Vec<PipelineEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.kind() == kind)
            .collect()
    }

    /// Drains the recorded events.
    pub fn take(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventPublisher for InMemoryPublisher {
    async fn publish(&self, event: PipelineEvent) -> Result<()> {
        ensure_valid(&event)?;
        self.events
            .lock()
            .map_err(|_| anyhow!("In-memory publisher lock poisoned"))?
            .push(event);
        Ok(())
    }
}
