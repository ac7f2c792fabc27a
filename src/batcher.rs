//! Event batching for bulk indexing.
//!
//! Events accumulate in an in-process buffer and are handed to the flush
//! callback when the buffer reaches `batch_size`, when the oldest buffered
//! event exceeds the batch timeout (checked by a 1 Hz background task), or on
//! shutdown. The callback runs outside the buffer lock so indexing round-trips
//! never block enqueueing.
//!
//! The buffer is not a durable queue: a crash loses whatever is buffered.
//! A hard upper bound rejects new submissions once the buffer is full.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};

use crate::event::RawEvent;
use crate::metrics;

/// How many batches the buffer may hold before rejecting submissions.
const MAX_BUFFERED_BATCHES: usize = 10;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("event buffer is full")]
    BufferFull,
}

/// An event waiting for the next flush.
pub struct PendingEvent {
    pub event: RawEvent,
    pub project_id: u64,
    pub event_id: String,
    pub queued_at: Instant,
}

/// The flush target: receives the drained buffer contents.
pub type FlushFn = Arc<dyn Fn(Vec<PendingEvent>) -> BoxFuture<'static, ()> + Send + Sync>;

struct BufferState {
    events: Vec<PendingEvent>,
    first_at: Option<Instant>,
}

pub struct Batcher {
    batch_size: usize,
    batch_timeout: Duration,
    max_buffered: usize,
    state: Mutex<BufferState>,
    flush_fn: FlushFn,
    running: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Batcher {
    pub fn new(batch_size: usize, batch_timeout: Duration, flush_fn: FlushFn) -> Self {
        let batch_size = batch_size.max(1);
        Self::with_limits(
            batch_size,
            batch_timeout,
            batch_size.saturating_mul(MAX_BUFFERED_BATCHES),
            flush_fn,
        )
    }

    pub fn with_limits(
        batch_size: usize,
        batch_timeout: Duration,
        max_buffered: usize,
        flush_fn: FlushFn,
    ) -> Self {
        Self {
            batch_size: batch_size.max(1),
            batch_timeout,
            max_buffered: max_buffered.max(1),
            state: Mutex::new(BufferState {
                events: Vec::new(),
                first_at: None,
            }),
            flush_fn,
            running: AtomicBool::new(false),
            timer: Mutex::new(None),
        }
    }

    /// Start the background timeout-flush task.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let batcher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if !batcher.running.load(Ordering::SeqCst) {
                    break;
                }

                let due = {
                    let state = batcher.state.lock().await;
                    state
                        .first_at
                        .map(|first| first.elapsed() >= batcher.batch_timeout)
                        .unwrap_or(false)
                };
                if due {
                    batcher.flush().await;
                }
            }
        });

        *self.timer.lock().await = Some(handle);
        info!(
            batch_size = self.batch_size,
            timeout_seconds = self.batch_timeout.as_secs(),
            "event batcher started"
        );
    }

    /// Stop the timer and flush whatever is buffered. Returns only after the
    /// final flush completed.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.timer.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }

        self.flush().await;
        info!("event batcher stopped");
    }

    /// Enqueue an event. Flushes inline when the buffer reaches `batch_size`;
    /// rejects the submission when the hard cap is hit.
    pub async fn submit(
        &self,
        event: RawEvent,
        project_id: u64,
        event_id: String,
    ) -> Result<(), BatchError> {
        let drained = {
            let mut state = self.state.lock().await;
            if state.events.len() >= self.max_buffered {
                error!(
                    pending = state.events.len(),
                    "event buffer full, rejecting submission"
                );
                return Err(BatchError::BufferFull);
            }

            state.events.push(PendingEvent {
                event,
                project_id,
                event_id,
                queued_at: Instant::now(),
            });
            if state.first_at.is_none() {
                state.first_at = Some(Instant::now());
            }
            metrics::BUFFER_PENDING.set(state.events.len() as i64);

            if state.events.len() >= self.batch_size {
                state.first_at = None;
                Some(std::mem::take(&mut state.events))
            } else {
                None
            }
        };

        if let Some(events) = drained {
            self.deliver(events).await;
        }
        Ok(())
    }

    /// Drain the buffer now. Returns the number of events handed off.
    pub async fn flush(&self) -> usize {
        let events = {
            let mut state = self.state.lock().await;
            if state.events.is_empty() {
                return 0;
            }
            state.first_at = None;
            std::mem::take(&mut state.events)
        };

        let count = events.len();
        self.deliver(events).await;
        count
    }

    async fn deliver(&self, events: Vec<PendingEvent>) {
        metrics::BUFFER_PENDING.set(self.pending_count().await as i64);
        metrics::BATCH_FLUSHES.inc();
        info!(count = events.len(), "flushing event batch");
        (self.flush_fn)(events).await;
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.events.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
