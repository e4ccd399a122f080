// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Broadcast Engine
//!
//! Sends `{action, data}` envelopes to the companion application. Widgets
//! usually fire commands before the application has connected (at host
//! startup every widget asks for its state), so an untargeted broadcast
//! issued while no primary connection exists is retried on a fixed interval
//! for a bounded number of attempts and then dropped.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection_registry::{ConnectionId, ConnectionRegistry, OutboundFrame};
use crate::metrics::RelayMetrics;
use crate::protocol::{Action, Envelope};

/// Retry schedule for broadcasts waiting on a primary connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 10,
            interval: Duration::from_millis(500),
        }
    }
}

/// Handle on a broadcast waiting for a primary connection. Dropping the
/// handle leaves the retry running.
#[derive(Debug)]
pub struct PendingBroadcast {
    task: JoinHandle<()>,
}

impl PendingBroadcast {
    /// Stops the retry. The envelope is not sent afterwards.
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// True while the retry is still waiting.
    pub fn is_pending(&self) -> bool {
        !self.task.is_finished()
    }
}

/// What happened to a broadcast. Callers are free to ignore it.
#[derive(Debug)]
pub enum BroadcastOutcome {
    /// Queued for this many connections.
    Delivered { recipients: usize },
    /// No primary connection yet; a retry task owns the envelope.
    Retrying(PendingBroadcast),
    /// The target is gone, or every primary queue refused the frame.
    Unreachable,
}

impl BroadcastOutcome {
    pub fn recipients(&self) -> usize {
        match self {
            BroadcastOutcome::Delivered { recipients } => *recipients,
            _ => 0,
        }
    }
}

/// Encodes and routes outbound envelopes through the connection registry.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    policy: RetryPolicy,
    metrics: RelayMetrics,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, policy: RetryPolicy, metrics: RelayMetrics) -> Self {
        Broadcaster {
            registry,
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Sends `action` with an optional payload.
    ///
    /// With a `target`, only that connection receives it and it is never
    /// retried. Otherwise every primary connection receives it, or a retry
    /// task is spawned if there is none.
    pub fn broadcast(
        &self,
        action: &Action,
        data: Option<Value>,
        target: Option<ConnectionId>,
    ) -> BroadcastOutcome {
        let frame = OutboundFrame {
            text: Envelope::new(action, data).encode(),
        };

        if let Some(id) = target {
            return if self.registry.send_to(id, frame) {
                BroadcastOutcome::Delivered { recipients: 1 }
            } else {
                debug!("Dropping {} for departed {}", action, id);
                BroadcastOutcome::Unreachable
            };
        }

        let recipients = self.registry.send_to_primaries(&frame);
        if recipients > 0 {
            return BroadcastOutcome::Delivered { recipients };
        }
        if self.registry.has_primary() {
            return BroadcastOutcome::Unreachable;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("No primary connection, deferring {}", action);
                self.metrics.broadcast_deferred.inc();
                let task = runtime.spawn(retry(
                    self.registry.clone(),
                    self.policy,
                    self.metrics.clone(),
                    action.to_string(),
                    frame,
                ));
                BroadcastOutcome::Retrying(PendingBroadcast { task })
            }
            Err(_) => {
                warn!("No runtime to defer {}, dropping", action);
                self.metrics.broadcast_dropped.inc();
                BroadcastOutcome::Unreachable
            }
        }
    }
}

async fn retry(
    registry: Arc<ConnectionRegistry>,
    policy: RetryPolicy,
    metrics: RelayMetrics,
    action: String,
    frame: OutboundFrame,
) {
    for attempt in 1..=policy.max_attempts {
        tokio::time::sleep(policy.interval).await;
        metrics.broadcast_retries.inc();
        if registry.has_primary() && registry.send_to_primaries(&frame) > 0 {
            debug!("Delivered deferred {} on attempt {}", action, attempt);
            return;
        }
    }

    warn!(
        "Dropping {} after {} attempts without a primary connection",
        action, policy.max_attempts
    );
    metrics.broadcast_dropped.inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_registry::Transport;
    use crate::protocol::{payload, ById};
    use crate::settings_store::MemorySettingsStore;

    fn setup() -> (Arc<ConnectionRegistry>, Broadcaster, RelayMetrics) {
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(MemorySettingsStore::new())));
        let metrics = RelayMetrics::new();
        let broadcaster = Broadcaster::new(registry.clone(), RetryPolicy::default(), metrics.clone());
        (registry, broadcaster, metrics)
    }

    #[tokio::test]
    async fn test_sends_to_primaries_only() {
        let (registry, broadcaster, _) = setup();
        let (primary, mut primary_rx) = registry.add(Transport::Plain);
        let (_other, mut other_rx) = registry.add(Transport::Plain);
        registry.promote(primary);

        let outcome = broadcaster.broadcast(&Action::GetTimerList, None, None);
        assert_eq!(outcome.recipients(), 1);
        assert_eq!(
            primary_rx.recv().await.unwrap().text,
            r#"{"action":"GET_TIMER_LIST"}"#
        );
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_payload_is_sent_as_data() {
        let (registry, broadcaster, _) = setup();
        let (primary, mut rx) = registry.add(Transport::Secure);
        registry.promote(primary);

        let data = payload(&ById { id: "t1".into() });
        broadcaster.broadcast(&Action::ExecuteTrigger, data, None);

        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap().text).unwrap();
        assert_eq!(frame["action"], "SET_EXECUTE_TRIGGER");
        assert_eq!(frame["data"]["id"], "t1");
    }

    #[tokio::test]
    async fn test_targeted_send_ignores_class() {
        let (registry, broadcaster, _) = setup();
        let (other, mut rx) = registry.add(Transport::Plain);

        let outcome = broadcaster.broadcast(&Action::GetGlobalStates, None, Some(other));
        assert_eq!(outcome.recipients(), 1);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_targeted_send_to_departed_is_not_retried() {
        let (registry, broadcaster, metrics) = setup();
        let (gone, _rx) = registry.add(Transport::Plain);
        registry.remove(gone);

        let outcome = broadcaster.broadcast(&Action::GetGlobalStates, None, Some(gone));
        assert!(matches!(outcome, BroadcastOutcome::Unreachable));
        assert_eq!(metrics.broadcast_deferred.get(), 0);
        assert_eq!(metrics.broadcast_retries.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_delivers_once_primary_arrives() {
        let (registry, broadcaster, metrics) = setup();

        let outcome = broadcaster.broadcast(&Action::GetAllCounters, None, None);
        let handle = match outcome {
            BroadcastOutcome::Retrying(handle) => handle,
            other => panic!("expected retry, got {:?}", other),
        };

        tokio::time::sleep(Duration::from_millis(1200)).await;
        let (primary, mut rx) = registry.add(Transport::Plain);
        registry.promote(primary);
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(rx.try_recv().unwrap().text, r#"{"action":"GET_ALL_COUNTERS"}"#);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
        assert!(!handle.is_pending());
        // failed at 500ms and 1000ms, delivered at 1500ms
        assert_eq!(metrics.broadcast_deferred.get(), 1);
        assert_eq!(metrics.broadcast_retries.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_primary_connections_do_not_satisfy_retry() {
        let (registry, broadcaster, metrics) = setup();
        let (_other, mut rx) = registry.add(Transport::Plain);

        let _ = broadcaster.broadcast(&Action::GetTriggerList, None, None);
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.broadcast_dropped.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_is_bounded() {
        let (registry, broadcaster, metrics) = setup();

        let handle = match broadcaster.broadcast(&Action::GetTimerList, None, None) {
            BroadcastOutcome::Retrying(handle) => handle,
            other => panic!("expected retry, got {:?}", other),
        };
        tokio::time::sleep(Duration::from_millis(10 * 500 + 100)).await;
        assert!(!handle.is_pending());
        assert_eq!(metrics.broadcast_deferred.get(), 1);
        assert_eq!(metrics.broadcast_retries.get(), 10);
        assert_eq!(metrics.broadcast_dropped.get(), 1);

        let (primary, mut rx) = registry.add(Transport::Plain);
        registry.promote(primary);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_retry_never_sends() {
        let (registry, broadcaster, metrics) = setup();

        let handle = match broadcaster.broadcast(&Action::GetTimerList, None, None) {
            BroadcastOutcome::Retrying(handle) => handle,
            other => panic!("expected retry, got {:?}", other),
        };
        handle.cancel();

        let (primary, mut rx) = registry.add(Transport::Plain);
        registry.promote(primary);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(rx.try_recv().is_err());
        assert!(!handle.is_pending());
        assert_eq!(metrics.broadcast_dropped.get(), 0);
    }

    #[test]
    fn test_without_runtime_is_dropped() {
        let (_, broadcaster, metrics) = setup();
        let outcome = broadcaster.broadcast(&Action::GetTimerList, None, None);
        assert!(matches!(outcome, BroadcastOutcome::Unreachable));
        assert_eq!(metrics.broadcast_dropped.get(), 1);
    }
}
