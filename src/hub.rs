// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Hub
//!
//! The single long-lived service shared by both listeners and every widget.
//! Widgets subscribe to topics, send commands and watch primary availability
//! through it; listeners feed it connection lifecycle events and raw frames.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastOutcome, Broadcaster, RetryPolicy};
use crate::config::RelayConfig;
use crate::connection_registry::{ConnectionId, ConnectionRegistry, OutboundFrame, Transport};
use crate::metrics::RelayMetrics;
use crate::protocol::{decode_frame, Action, Event, Inbound, ProtocolError, Topic, STATE_REQUESTS};
use crate::router::Router;
use crate::settings_store::{ConnectionCounts, SettingsStore};

/// Greeting sent to every new connection.
pub const WELCOME_MESSAGE: &str = "Welcome to streamdeck";

/// What the hub did with a decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDisposition {
    /// Cached and delivered to subscribers of the topic.
    Dispatched(Topic),
    /// Classification accepted; `changed` is false for a repeated claim.
    Promoted { changed: bool },
    /// Classification refused (wrong or missing secret, or unknown connection).
    Rejected,
}

pub struct RelayHub {
    registry: Arc<ConnectionRegistry>,
    router: Router,
    broadcaster: Broadcaster,
    shared_secret: Option<String>,
    metrics: RelayMetrics,
}

impl RelayHub {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        policy: RetryPolicy,
        shared_secret: Option<String>,
        metrics: RelayMetrics,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(settings));
        let broadcaster = Broadcaster::new(registry.clone(), policy, metrics.clone());
        RelayHub {
            registry,
            router: Router::new(),
            broadcaster,
            shared_secret,
            metrics,
        }
    }

    pub fn from_config(
        config: &RelayConfig,
        settings: Arc<dyn SettingsStore>,
        metrics: RelayMetrics,
    ) -> Self {
        let policy = RetryPolicy {
            max_attempts: config.broadcast_max_attempts,
            interval: config.broadcast_retry_interval(),
        };
        Self::new(settings, policy, config.shared_secret.clone(), metrics)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    pub fn has_primary(&self) -> bool {
        self.registry.has_primary()
    }

    pub fn counts(&self) -> ConnectionCounts {
        self.registry.counts()
    }

    // ------------------------------------------------------------------
    // Widget-facing
    // ------------------------------------------------------------------

    /// Subscribes a widget to a topic. The callback fires immediately with
    /// the cached event (or `None`), then on every new event.
    pub fn subscribe<F>(&self, topic: Topic, subscriber_id: impl Into<String>, callback: F)
    where
        F: Fn(Option<&Event>) + Send + Sync + 'static,
    {
        self.router.on(topic, subscriber_id, callback);
    }

    pub fn unsubscribe(&self, topic: &Topic, subscriber_id: &str) {
        self.router.off(topic, subscriber_id);
    }

    /// Drops every topic binding of a widget, typically when it disappears.
    pub fn unsubscribe_all(&self, subscriber_id: &str) {
        self.router.off_all(subscriber_id);
    }

    /// Sends a command to the primary connection(s), retrying while none is
    /// connected.
    pub fn send(&self, action: &Action, data: Option<Value>) -> BroadcastOutcome {
        self.broadcaster.broadcast(action, data, None)
    }

    pub fn on_primary_availability_changed<F>(&self, subscriber_id: impl Into<String>, callback: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.registry.observe(subscriber_id, callback);
    }

    pub fn remove_availability_observer(&self, subscriber_id: &str) {
        self.registry.unobserve(subscriber_id);
    }

    /// Re-delivers every cached event to its subscribers.
    pub fn replay_all(&self) {
        self.router.replay_all();
    }

    /// Asks the primary connection(s) for a full state refresh.
    pub fn request_state_refresh(&self) {
        for action in &STATE_REQUESTS {
            let _ = self.broadcaster.broadcast(action, None, None);
        }
    }

    /// Last cached event for a topic.
    pub fn cached(&self, topic: &Topic) -> Option<Event> {
        self.router.cached(topic)
    }

    // ------------------------------------------------------------------
    // Listener-facing
    // ------------------------------------------------------------------

    /// Registers a freshly upgraded connection and queues the welcome frame.
    pub fn open_connection(&self, transport: Transport) -> (ConnectionId, mpsc::Receiver<OutboundFrame>) {
        let (id, rx) = self.registry.add(transport);
        self.metrics.connections_total.inc();
        self.metrics.connections_active.inc();

        let welcome = serde_json::json!({ "message": WELCOME_MESSAGE });
        let _ = self
            .broadcaster
            .broadcast(&Action::Connected, Some(welcome), Some(id));
        (id, rx)
    }

    /// Decodes one inbound text frame from `id` and acts on it.
    pub fn handle_frame(&self, id: ConnectionId, text: &str) -> Result<FrameDisposition, ProtocolError> {
        self.metrics.frames_received.inc();
        let inbound = match decode_frame(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                self.metrics.frames_malformed.inc();
                return Err(e);
            }
        };

        match inbound {
            Inbound::ClaimPrimary { secret } => Ok(self.claim_primary(id, secret)),
            Inbound::Event(event) => {
                let topic = event.topic();
                self.router.dispatch(event);
                Ok(FrameDisposition::Dispatched(topic))
            }
        }
    }

    /// Unregisters a closed connection.
    pub fn close_connection(&self, id: ConnectionId) {
        if !self.registry.remove(id) {
            return;
        }
        self.metrics.connections_active.dec();
        self.metrics
            .connections_primary
            .set(self.registry.primary_count() as i64);
    }

    fn claim_primary(&self, id: ConnectionId, secret: Option<String>) -> FrameDisposition {
        if let Some(expected) = &self.shared_secret {
            if secret.as_deref() != Some(expected.as_str()) {
                warn!("Rejected primary claim from {}: bad secret", id);
                self.metrics.frames_rejected.inc();
                return FrameDisposition::Rejected;
            }
        }

        if self.registry.class_of(id).is_none() {
            return FrameDisposition::Rejected;
        }

        let changed = self.registry.promote(id);
        if changed {
            info!("{} is now the primary instance", id);
            self.metrics
                .connections_primary
                .set(self.registry.primary_count() as i64);
        } else {
            debug!("{} repeated its primary claim", id);
        }

        for action in &STATE_REQUESTS {
            let _ = self.broadcaster.broadcast(action, None, Some(id));
        }
        FrameDisposition::Promoted { changed }
    }
}
