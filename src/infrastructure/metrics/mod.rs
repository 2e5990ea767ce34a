//! Prometheus Metrics Module
//!
//! Application-wide metrics for the event backbone.
//!
//! # Metrics Collected
//! - Events published, by type and source
//! - Duplicate deliveries skipped by the idempotent-consumption layer
//! - Handler failures (left for redelivery)
//! - Broadcast traffic in and out, including dropped malformed payloads
//! - Event log append latency

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

/// Events durably published, by type and owning module
pub static EVENTS_PUBLISHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("events_published_total", "Total events durably published")
            .namespace("chat_backbone"),
        &["event_type", "source"],
    )
    .expect("Failed to create EVENTS_PUBLISHED_TOTAL metric")
});

/// Redeliveries skipped because the dedup key was already processed
pub static EVENTS_DUPLICATE_SKIPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "events_duplicate_skipped_total",
            "Redelivered events skipped by the idempotency guard",
        )
        .namespace("chat_backbone"),
        &["consumer", "event_type"],
    )
    .expect("Failed to create EVENTS_DUPLICATE_SKIPPED_TOTAL metric")
});

/// Listener failures, isolated and left for redelivery
pub static HANDLER_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "handler_failures_total",
            "Handler failures left for redelivery",
        )
        .namespace("chat_backbone"),
        &["consumer", "event_type"],
    )
    .expect("Failed to create HANDLER_FAILURES_TOTAL metric")
});

/// Broadcast messages published to the broker
pub static BROADCASTS_PUBLISHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "broadcasts_published_total",
            "Broadcast payloads published to the broker",
        )
        .namespace("chat_backbone"),
        &["channel_domain"],
    )
    .expect("Failed to create BROADCASTS_PUBLISHED_TOTAL metric")
});

/// Broadcast messages received from the broker
pub static BROADCASTS_RECEIVED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "broadcasts_received_total",
            "Broadcast payloads received from the broker",
        )
        .namespace("chat_backbone"),
        &["channel_domain"],
    )
    .expect("Failed to create BROADCASTS_RECEIVED_TOTAL metric")
});

/// Broadcast payloads dropped as malformed
pub static BROADCASTS_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(
        Opts::new(
            "broadcasts_dropped_total",
            "Broadcast payloads dropped (malformed or undecodable)",
        )
        .namespace("chat_backbone"),
    )
    .expect("Failed to create BROADCASTS_DROPPED_TOTAL metric")
});

/// Event log append latency histogram
pub static EVENT_APPEND_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5];
    HistogramVec::new(
        HistogramOpts::new(
            "event_append_duration_seconds",
            "Durable event append latency in seconds",
        )
        .namespace("chat_backbone")
        .buckets(buckets),
        &["source"],
    )
    .expect("Failed to create EVENT_APPEND_DURATION_SECONDS metric")
});

/// Register all metrics with the registry
fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(EVENTS_PUBLISHED_TOTAL.clone()))
        .expect("Failed to register EVENTS_PUBLISHED_TOTAL");
    registry
        .register(Box::new(EVENTS_DUPLICATE_SKIPPED_TOTAL.clone()))
        .expect("Failed to register EVENTS_DUPLICATE_SKIPPED_TOTAL");
    registry
        .register(Box::new(HANDLER_FAILURES_TOTAL.clone()))
        .expect("Failed to register HANDLER_FAILURES_TOTAL");
    registry
        .register(Box::new(BROADCASTS_PUBLISHED_TOTAL.clone()))
        .expect("Failed to register BROADCASTS_PUBLISHED_TOTAL");
    registry
        .register(Box::new(BROADCASTS_RECEIVED_TOTAL.clone()))
        .expect("Failed to register BROADCASTS_RECEIVED_TOTAL");
    registry
        .register(Box::new(BROADCASTS_DROPPED_TOTAL.clone()))
        .expect("Failed to register BROADCASTS_DROPPED_TOTAL");
    registry
        .register(Box::new(EVENT_APPEND_DURATION_SECONDS.clone()))
        .expect("Failed to register EVENT_APPEND_DURATION_SECONDS");
}

/// Collect and encode all metrics as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Metrics should be valid UTF-8")
}

/// `<domain>` half of a `<domain>:<routing key>` channel name.
fn channel_domain(channel: &str) -> &str {
    channel.split(':').next().unwrap_or(channel)
}

/// Record a durable publish and its append latency
pub fn record_publish(event_type: &str, source: &str, append_duration_secs: f64) {
    EVENTS_PUBLISHED_TOTAL
        .with_label_values(&[event_type, source])
        .inc();
    EVENT_APPEND_DURATION_SECONDS
        .with_label_values(&[source])
        .observe(append_duration_secs);
}

/// Record a redelivery skipped by the idempotency guard
pub fn record_duplicate_skip(consumer: &str, event_type: &str) {
    EVENTS_DUPLICATE_SKIPPED_TOTAL
        .with_label_values(&[consumer, event_type])
        .inc();
}

/// Record a handler failure left for redelivery
pub fn record_handler_failure(consumer: &str, event_type: &str) {
    HANDLER_FAILURES_TOTAL
        .with_label_values(&[consumer, event_type])
        .inc();
}

/// Record an outgoing broadcast
pub fn record_broadcast_published(channel: &str) {
    BROADCASTS_PUBLISHED_TOTAL
        .with_label_values(&[channel_domain(channel)])
        .inc();
}

/// Record an incoming broadcast
pub fn record_broadcast_received(channel: &str) {
    BROADCASTS_RECEIVED_TOTAL
        .with_label_values(&[channel_domain(channel)])
        .inc();
}

/// Record a dropped (malformed) broadcast payload
pub fn record_broadcast_dropped() {
    BROADCASTS_DROPPED_TOTAL.inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_domain_strips_routing_key() {
        assert_eq!(channel_domain("conversation:conv-1"), "conversation");
        assert_eq!(channel_domain("bare"), "bare");
    }

    #[test]
    fn gather_metrics_produces_text_format() {
        record_publish("MESSAGE_SENT", "messages", 0.002);
        let text = gather_metrics();
        assert!(text.contains("chat_backbone_events_published_total"));
    }
}
