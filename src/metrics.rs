//! Prometheus metrics for the ingestion pipeline.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static EVENTS_RECEIVED: Lazy<IntCounter> = Lazy::new(|| {
    register_counter("sentrel_events_received_total", "Events accepted by the receiver")
});

pub static EVENTS_INDEXED: Lazy<IntCounter> = Lazy::new(|| {
    register_counter("sentrel_events_indexed_total", "Documents written to the index")
});

pub static EVENTS_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    register_counter("sentrel_events_failed_total", "Events that failed transformation or indexing")
});

pub static REQUESTS_RATE_LIMITED: Lazy<IntCounter> = Lazy::new(|| {
    register_counter("sentrel_requests_rate_limited_total", "Requests rejected by the rate limiter")
});

pub static BATCH_FLUSHES: Lazy<IntCounter> = Lazy::new(|| {
    register_counter("sentrel_batch_flushes_total", "Batch flushes handed to the indexer")
});

pub static BUFFER_PENDING: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("sentrel_buffer_pending_events", "Events waiting in the batch buffer")
        .expect("valid gauge definition");
    let _ = REGISTRY.register(Box::new(gauge.clone()));
    gauge
});

fn register_counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter definition");
    let _ = REGISTRY.register(Box::new(counter.clone()));
    counter
}

/// Render all registered metrics in the Prometheus text exposition format.
pub fn gather() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_in_exposition_format() {
        EVENTS_RECEIVED.inc();
        BUFFER_PENDING.set(4);

        let output = gather();
        assert!(output.contains("sentrel_events_received_total"));
        // Other tests may move the gauge concurrently; presence is enough.
        assert!(output.contains("sentrel_buffer_pending_events"));
    }
}
