//! Prometheus Metrics for the Deck Relay
//!
//! Connection, frame and broadcast counters, served on the status endpoint.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Relay metrics.
#[derive(Clone)]
pub struct RelayMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,

    // Connections
    /// WebSocket connections accepted on either listener.
    pub connections_total: IntCounter,
    /// Currently open WebSocket connections.
    pub connections_active: IntGauge,
    /// Currently open connections classified as primary.
    pub connections_primary: IntGauge,
    /// TLS or WebSocket handshake failures.
    pub connection_errors: IntCounter,

    // Frames
    pub frames_received: IntCounter,
    /// Frames that failed to decode.
    pub frames_malformed: IntCounter,
    /// Frames refused (oversized, bad classification secret).
    pub frames_rejected: IntCounter,
    pub frames_sent: IntCounter,
    /// Time spent handling one inbound frame.
    pub frame_duration: Histogram,

    // Broadcasts
    /// Broadcasts that had to wait for a primary connection.
    pub broadcast_deferred: IntCounter,
    /// Delivery attempts made by deferred broadcasts.
    pub broadcast_retries: IntCounter,
    /// Broadcasts dropped after exhausting their retries.
    pub broadcast_dropped: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::with_opts(Opts::new(name, help)).unwrap();
    registry.register(Box::new(metric.clone())).unwrap();
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::with_opts(Opts::new(name, help)).unwrap();
    registry.register(Box::new(metric.clone())).unwrap();
    metric
}

impl RelayMetrics {
    /// Creates a new metrics instance with all metrics registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = counter(
            &registry,
            "deck_relay_connections_total",
            "Total WebSocket connections accepted",
        );
        let connections_active = gauge(
            &registry,
            "deck_relay_connections_active",
            "Current open WebSocket connections",
        );
        let connections_primary = gauge(
            &registry,
            "deck_relay_connections_primary",
            "Current connections classified as primary",
        );
        let connection_errors = counter(
            &registry,
            "deck_relay_connection_errors_total",
            "Total handshake failures",
        );

        let frames_received = counter(
            &registry,
            "deck_relay_frames_received_total",
            "Total inbound frames",
        );
        let frames_malformed = counter(
            &registry,
            "deck_relay_frames_malformed_total",
            "Total inbound frames that failed to decode",
        );
        let frames_rejected = counter(
            &registry,
            "deck_relay_frames_rejected_total",
            "Total inbound frames refused",
        );
        let frames_sent = counter(
            &registry,
            "deck_relay_frames_sent_total",
            "Total outbound frames written",
        );

        let frame_duration = Histogram::with_opts(HistogramOpts::new(
            "deck_relay_frame_duration_seconds",
            "Inbound frame handling duration in seconds",
        ))
        .unwrap();
        registry.register(Box::new(frame_duration.clone())).unwrap();

        let broadcast_deferred = counter(
            &registry,
            "deck_relay_broadcast_deferred_total",
            "Total broadcasts deferred until a primary connects",
        );
        let broadcast_retries = counter(
            &registry,
            "deck_relay_broadcast_retries_total",
            "Total retry attempts made by deferred broadcasts",
        );
        let broadcast_dropped = counter(
            &registry,
            "deck_relay_broadcast_dropped_total",
            "Total broadcasts dropped after exhausting retries",
        );

        RelayMetrics {
            registry: Arc::new(registry),
            connections_total,
            connections_active,
            connections_primary,
            connection_errors,
            frames_received,
            frames_malformed,
            frames_rejected,
            frames_sent,
            frame_duration,
            broadcast_deferred,
            broadcast_retries,
            broadcast_dropped,
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
