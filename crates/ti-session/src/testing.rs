//! Test doubles shared by the session and orchestrator tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use ti_core::{ConsumptionMode, Cursor, TopicRef};

use crate::error::SourceError;
use crate::source::{FetchedBatch, MemorySource, MessageSource};

/// A source whose fetches block until the test releases them.
pub(crate) struct GatedSource {
    pub(crate) inner: MemorySource,
    gate: Semaphore,
    started: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl GatedSource {
    pub(crate) fn new(inner: MemorySource) -> Self {
        Self {
            inner,
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn release(&self, fetches: usize) {
        self.gate.add_permits(fetches);
    }

    pub(crate) fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl MessageSource for GatedSource {
    async fn fetch_batch(
        &self,
        topic: &TopicRef,
        cursor: Cursor,
        mode: ConsumptionMode,
    ) -> Result<FetchedBatch, SourceError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = match self.gate.acquire().await {
            Ok(permit) => {
                permit.forget();
                self.inner.fetch_batch(topic, cursor, mode).await
            }
            Err(_) => Err(SourceError::connection_lost("gate closed")),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
