//! Processing pipeline: transform -> enrich -> index.
//!
//! Also defines the event sink seam: the receiver hands decoded events to an
//! [`EventSink`] without caring whether a distributed queue or the in-process
//! batcher sits behind it.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error};

use crate::batcher::{BatchError, Batcher, FlushFn, PendingEvent};
use crate::client::{SearchClient, SearchError};
use crate::config::Settings;
use crate::enrich::Enricher;
use crate::event::RawEvent;
use crate::indexer::{IndexOutcome, Indexer, DEFAULT_CHUNK_SIZE};
use crate::metrics;
use crate::transform::Transformer;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("event sink at capacity")]
    AtCapacity,
    #[error("event sink unavailable: {0}")]
    Unavailable(String),
}

/// Anything that can accept a decoded event for eventual indexing.
///
/// The in-process batcher implements this; a distributed task queue can be
/// dropped in behind the same contract.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn submit(
        &self,
        event: RawEvent,
        project_id: u64,
        event_id: String,
    ) -> Result<(), SinkError>;
}

#[async_trait]
impl EventSink for Batcher {
    async fn submit(
        &self,
        event: RawEvent,
        project_id: u64,
        event_id: String,
    ) -> Result<(), SinkError> {
        Batcher::submit(self, event, project_id, event_id)
            .await
            .map_err(|e| match e {
                BatchError::BufferFull => SinkError::AtCapacity,
            })
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineSummary {
    pub processed: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Orchestrates the per-event processing steps.
pub struct Pipeline {
    transformer: Transformer,
    enricher: Enricher,
    indexer: Indexer,
}

impl Pipeline {
    pub fn new(transformer: Transformer, enricher: Enricher, indexer: Indexer) -> Self {
        Self {
            transformer,
            enricher,
            indexer,
        }
    }

    /// Wire the pipeline from settings and a shared client.
    pub fn from_settings(settings: &Settings, client: Arc<SearchClient>) -> Arc<Self> {
        let geoip_path = settings
            .enable_geoip
            .then(|| settings.geoip_database_path.as_deref())
            .flatten()
            .map(Path::new);

        Arc::new(Self::new(
            Transformer::new(),
            Enricher::new(geoip_path),
            Indexer::new(client, &settings.opensearch_index_prefix),
        ))
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    /// Process one event end to end.
    pub async fn process_event(
        &self,
        event: &RawEvent,
        project_id: u64,
    ) -> Result<IndexOutcome, SearchError> {
        let mut document = self.transformer.transform(event, project_id);
        self.enricher.enrich(&mut document, event);

        match self.indexer.index_one(&document).await {
            Ok(outcome) => {
                metrics::EVENTS_INDEXED.inc();
                debug!(event_id = %document.event_id, index = %outcome.index, "event indexed");
                Ok(outcome)
            }
            Err(e) => {
                metrics::EVENTS_FAILED.inc();
                error!(event_id = %document.event_id, error = %e, "failed to index event");
                Err(e)
            }
        }
    }

    /// Process a drained batch: transform and enrich every event, then write
    /// them in one bulk pass.
    pub async fn process_batch(&self, events: Vec<PendingEvent>) -> PipelineSummary {
        let mut documents = Vec::with_capacity(events.len());
        for pending in &events {
            let mut document = self.transformer.transform(&pending.event, pending.project_id);
            self.enricher.enrich(&mut document, &pending.event);
            documents.push(document);
        }

        let bulk = self.indexer.index_bulk(&documents, DEFAULT_CHUNK_SIZE).await;
        metrics::EVENTS_INDEXED.inc_by(bulk.success as u64);
        metrics::EVENTS_FAILED.inc_by(bulk.failed as u64);

        PipelineSummary {
            processed: bulk.success,
            failed: bulk.failed,
            errors: bulk.errors,
        }
    }

    /// Flush callback for the batcher. Indexing failures are logged; the
    /// batch is not re-enqueued.
    pub fn flush_handler(self: &Arc<Self>) -> FlushFn {
        let pipeline = Arc::clone(self);
        Arc::new(move |events| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                let count = events.len();
                let summary = pipeline.process_batch(events).await;
                if summary.failed > 0 {
                    error!(
                        submitted = count,
                        processed = summary.processed,
                        failed = summary.failed,
                        "batch processed with failures"
                    );
                } else {
                    debug!(processed = summary.processed, "batch processed");
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn batcher_implements_event_sink() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        let flush_fn: FlushFn = Arc::new(move |events| {
            let recorded = recorded.clone();
            Box::pin(async move {
                let mut guard = recorded.lock().await;
                guard.extend(events.into_iter().map(|e| e.event_id));
            })
        });

        let batcher = Arc::new(Batcher::new(1, Duration::from_secs(60), flush_fn));
        let sink: Arc<dyn EventSink> = batcher.clone();
        sink.submit(RawEvent::default(), 7, "evt-1".to_string())
            .await
            .unwrap();

        assert_eq!(*seen.lock().await, vec!["evt-1"]);
    }

    #[tokio::test]
    async fn full_sink_reports_capacity() {
        let flush_fn: FlushFn = Arc::new(|_| Box::pin(async {}));
        let batcher = Arc::new(Batcher::with_limits(
            100,
            Duration::from_secs(60),
            1,
            flush_fn,
        ));
        let sink: Arc<dyn EventSink> = batcher.clone();

        sink.submit(RawEvent::default(), 1, "a".to_string())
            .await
            .unwrap();
        let err = sink.submit(RawEvent::default(), 1, "b".to_string()).await;
        assert!(matches!(err, Err(SinkError::AtCapacity)));
    }
}
