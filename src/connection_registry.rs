// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection Registry
//!
//! Tracks every live WebSocket connection on both listeners, its class
//! (primary companion instance or other peer) and the channel used to push
//! frames to it.
//!
//! Every effective mutation notifies the connection-state observers with the
//! current primary availability, and publishes the connection counts to the
//! host settings store. Both happen after the registry lock is released;
//! each mutation bumps a generation so that neither the store nor an
//! observer ever sees an older state after a newer one.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::mailbox::Mailbox;
use crate::settings_store::{ConnectionCounts, SettingsStore};

/// Capacity of each connection's outbound channel.
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Opaque identifier of one transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection classification. Starts as `Other`, may become `Primary` once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionClass {
    Primary,
    Other,
}

/// Listener a connection was accepted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Plain,
    Secure,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Plain => f.write_str("ws"),
            Transport::Secure => f.write_str("wss"),
        }
    }
}

/// A pre-encoded text frame queued for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub text: String,
}

/// Observer of primary availability, called with `has_primary()`.
pub type AvailabilityCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct ConnectionEntry {
    class: ConnectionClass,
    transport: Transport,
    sender: mpsc::Sender<OutboundFrame>,
}

#[derive(Default)]
struct Connections {
    entries: HashMap<ConnectionId, ConnectionEntry>,
    generation: u64,
}

impl Connections {
    fn counts(&self) -> ConnectionCounts {
        ConnectionCounts {
            client_count: self.entries.len(),
            main_app_count: self
                .entries
                .values()
                .filter(|e| e.class == ConnectionClass::Primary)
                .count(),
        }
    }

    /// Bumps the generation after a mutation and snapshots the result.
    fn changed(&mut self) -> Snapshot {
        self.generation += 1;
        Snapshot {
            generation: self.generation,
            counts: self.counts(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    generation: u64,
    counts: ConnectionCounts,
}

struct Observer {
    subscriber_id: String,
    callback: AvailabilityCallback,
    mailbox: Mailbox<bool>,
}

impl Observer {
    fn deliver(&self, generation: u64, has_primary: bool) {
        self.mailbox.deliver(generation, has_primary, false, |online| {
            if catch_unwind(AssertUnwindSafe(|| (self.callback)(online))).is_err() {
                error!("Availability observer {} panicked", self.subscriber_id);
            }
        });
    }
}

/// Thread-safe registry of live connections.
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: RwLock<Connections>,
    observers: RwLock<Vec<Arc<Observer>>>,
    /// Generation last written to the settings store.
    published: Mutex<u64>,
    settings: Arc<dyn SettingsStore>,
}

impl ConnectionRegistry {
    /// Creates an empty registry publishing counts to `settings`.
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        ConnectionRegistry {
            next_id: AtomicU64::new(1),
            connections: RwLock::new(Connections::default()),
            observers: RwLock::new(Vec::new()),
            published: Mutex::new(0),
            settings,
        }
    }

    /// Registers a new connection with class `Other`. Returns its id and the
    /// receiving end of its outbound channel.
    pub fn add(&self, transport: Transport) -> (ConnectionId, mpsc::Receiver<OutboundFrame>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let snapshot = {
            let mut connections = self.connections.write().unwrap();
            connections.entries.insert(
                id,
                ConnectionEntry {
                    class: ConnectionClass::Other,
                    transport,
                    sender,
                },
            );
            connections.changed()
        };
        debug!("Registered {} ({})", id, transport);
        self.notify(snapshot);
        (id, rx)
    }

    /// Promotes a connection to primary. Returns true when the class changed,
    /// false when it was already primary or is unknown.
    pub fn promote(&self, id: ConnectionId) -> bool {
        let snapshot = {
            let mut connections = self.connections.write().unwrap();
            match connections.entries.get_mut(&id) {
                Some(entry) if entry.class == ConnectionClass::Other => {
                    entry.class = ConnectionClass::Primary;
                    Some(connections.changed())
                }
                _ => None,
            }
        };
        match snapshot {
            Some(snapshot) => {
                debug!("Promoted {} to primary", id);
                self.notify(snapshot);
                true
            }
            None => false,
        }
    }

    /// Removes a connection. Returns false, and does nothing, if absent.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let snapshot = {
            let mut connections = self.connections.write().unwrap();
            match connections.entries.remove(&id) {
                Some(_) => Some(connections.changed()),
                None => None,
            }
        };
        match snapshot {
            Some(snapshot) => {
                debug!("Unregistered {}", id);
                self.notify(snapshot);
                true
            }
            None => false,
        }
    }

    /// Returns the class of a live connection.
    pub fn class_of(&self, id: ConnectionId) -> Option<ConnectionClass> {
        self.connections.read().unwrap().entries.get(&id).map(|e| e.class)
    }

    /// Returns the transport of a live connection.
    pub fn transport_of(&self, id: ConnectionId) -> Option<Transport> {
        self.connections
            .read()
            .unwrap()
            .entries
            .get(&id)
            .map(|e| e.transport)
    }

    pub fn has_primary(&self) -> bool {
        self.primary_count() > 0
    }

    /// Returns the number of live connections.
    pub fn count(&self) -> usize {
        self.connections.read().unwrap().entries.len()
    }

    /// Returns the number of live primary connections.
    pub fn primary_count(&self) -> usize {
        self.counts().main_app_count
    }

    /// Snapshot of both counts taken under one lock.
    pub fn counts(&self) -> ConnectionCounts {
        self.connections.read().unwrap().counts()
    }

    /// Queues a frame for one connection. Returns false if the connection is
    /// gone or its queue is full.
    pub fn send_to(&self, id: ConnectionId, frame: OutboundFrame) -> bool {
        let connections = self.connections.read().unwrap();
        match connections.entries.get(&id) {
            Some(entry) => match entry.sender.try_send(frame) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Outbound queue full for {}, frame dropped", id);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
            None => false,
        }
    }

    /// Queues a frame for every primary connection. Returns how many accepted it.
    pub fn send_to_primaries(&self, frame: &OutboundFrame) -> usize {
        let connections = self.connections.read().unwrap();
        connections
            .entries
            .iter()
            .filter(|(_, e)| e.class == ConnectionClass::Primary)
            .filter(|(id, e)| match e.sender.try_send(frame.clone()) {
                Ok(()) => true,
                Err(_) => {
                    warn!("Failed to queue frame for {}", id);
                    false
                }
            })
            .count()
    }

    /// Registers a primary-availability observer, replacing any observer with
    /// the same subscriber id. The callback is invoked once immediately with
    /// the current availability, unless a concurrent change already reached
    /// it. A panicking observer is logged and does not affect the others.
    pub fn observe<F>(&self, subscriber_id: impl Into<String>, callback: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let observer = Arc::new(Observer {
            subscriber_id: subscriber_id.into(),
            callback: Arc::new(callback),
            mailbox: Mailbox::new(),
        });
        // Registered and snapshotted under the connections lock, so every
        // later mutation both sees the observer and carries a newer generation.
        let snapshot = {
            let connections = self.connections.read().unwrap();
            let mut observers = self.observers.write().unwrap();
            match observers
                .iter_mut()
                .find(|o| o.subscriber_id == observer.subscriber_id)
            {
                Some(slot) => *slot = observer.clone(),
                None => observers.push(observer.clone()),
            }
            Snapshot {
                generation: connections.generation,
                counts: connections.counts(),
            }
        };
        observer.deliver(snapshot.generation, snapshot.counts.main_app_count > 0);
    }

    /// Removes an availability observer. No-op if absent.
    pub fn unobserve(&self, subscriber_id: &str) {
        self.observers
            .write()
            .unwrap()
            .retain(|o| o.subscriber_id != subscriber_id);
    }

    fn notify(&self, snapshot: Snapshot) {
        {
            let mut published = self.published.lock().unwrap();
            if snapshot.generation > *published {
                self.settings.publish_connection_counts(snapshot.counts);
                *published = snapshot.generation;
            }
        }

        let observers: Vec<Arc<Observer>> = self.observers.read().unwrap().clone();
        let has_primary = snapshot.counts.main_app_count > 0;
        for observer in observers {
            observer.deliver(snapshot.generation, has_primary);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings_store::MemorySettingsStore;
    use std::sync::Barrier;
    use std::thread;

    fn registry() -> (ConnectionRegistry, Arc<MemorySettingsStore>) {
        let settings = Arc::new(MemorySettingsStore::new());
        (ConnectionRegistry::new(settings.clone()), settings)
    }

    fn frame(text: &str) -> OutboundFrame {
        OutboundFrame {
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_add_and_send() {
        let (registry, _) = registry();
        let (id, mut rx) = registry.add(Transport::Plain);

        assert_eq!(registry.class_of(id), Some(ConnectionClass::Other));
        assert_eq!(registry.transport_of(id), Some(Transport::Plain));
        assert!(registry.send_to(id, frame("hello")));
        assert_eq!(rx.recv().await.unwrap().text, "hello");
    }

    #[tokio::test]
    async fn test_send_to_removed_connection() {
        let (registry, _) = registry();
        let (id, _rx) = registry.add(Transport::Plain);
        registry.remove(id);

        assert!(!registry.send_to(id, frame("hello")));
        assert_eq!(registry.class_of(id), None);
    }

    #[test]
    fn test_ids_are_unique() {
        let (registry, _) = registry();
        let (a, _ra) = registry.add(Transport::Plain);
        let (b, _rb) = registry.add(Transport::Secure);
        assert_ne!(a, b);
    }

    #[test]
    fn test_promote_is_idempotent() {
        let (registry, _) = registry();
        let (id, _rx) = registry.add(Transport::Secure);

        assert!(registry.promote(id));
        assert!(!registry.promote(id));
        assert_eq!(registry.class_of(id), Some(ConnectionClass::Primary));
        assert_eq!(registry.primary_count(), 1);
    }

    #[test]
    fn test_promote_unknown_connection() {
        let (registry, _) = registry();
        let (id, _rx) = registry.add(Transport::Plain);
        registry.remove(id);
        assert!(!registry.promote(id));
        assert!(!registry.has_primary());
    }

    #[test]
    fn test_remove_is_noop_when_absent() {
        let (registry, _) = registry();
        let (id, _rx) = registry.add(Transport::Plain);
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_counts_stay_consistent() {
        let (registry, settings) = registry();
        let mut ids = Vec::new();
        let mut receivers = Vec::new();
        for i in 0..6 {
            let (id, rx) = registry.add(Transport::Plain);
            if i % 2 == 0 {
                registry.promote(id);
            }
            ids.push(id);
            receivers.push(rx);
        }
        registry.remove(ids[0]);
        registry.remove(ids[1]);
        registry.remove(ids[1]);

        assert_eq!(registry.count(), 4);
        assert_eq!(registry.primary_count(), 2);
        assert!(registry.primary_count() <= registry.count());
        assert_eq!(
            settings.connection_counts(),
            ConnectionCounts {
                client_count: 4,
                main_app_count: 2
            }
        );
    }

    #[tokio::test]
    async fn test_send_to_primaries_skips_others() {
        let (registry, _) = registry();
        let (primary, mut primary_rx) = registry.add(Transport::Secure);
        let (_other, mut other_rx) = registry.add(Transport::Plain);
        registry.promote(primary);

        assert_eq!(registry.send_to_primaries(&frame("cmd")), 1);
        assert_eq!(primary_rx.recv().await.unwrap().text, "cmd");
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn test_send_to_full_queue_fails() {
        let (registry, _) = registry();
        let (id, _rx) = registry.add(Transport::Plain);
        for _ in 0..OUTBOUND_CHANNEL_CAPACITY {
            assert!(registry.send_to(id, frame("x")));
        }
        assert!(!registry.send_to(id, frame("overflow")));
    }

    #[test]
    fn test_observers_follow_primary_availability() {
        let (registry, _) = registry();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.observe("widget-1", move |online| sink.lock().unwrap().push(online));

        let (id, _rx) = registry.add(Transport::Plain);
        registry.promote(id);
        registry.remove(id);

        // initial replay, add, promote, remove
        assert_eq!(*seen.lock().unwrap(), vec![false, false, true, false]);
    }

    #[test]
    fn test_observer_replaced_and_removed() {
        let (registry, _) = registry();
        let first = Arc::new(Mutex::new(0));
        let second = Arc::new(Mutex::new(0));

        let counter = first.clone();
        registry.observe("widget-1", move |_| *counter.lock().unwrap() += 1);
        let counter = second.clone();
        registry.observe("widget-1", move |_| *counter.lock().unwrap() += 1);

        let (_id, _rx) = registry.add(Transport::Plain);
        assert_eq!(*first.lock().unwrap(), 1);
        assert_eq!(*second.lock().unwrap(), 2);

        registry.unobserve("widget-1");
        let (_id2, _rx2) = registry.add(Transport::Plain);
        assert_eq!(*second.lock().unwrap(), 2);
    }

    #[test]
    fn test_observer_may_query_registry() {
        let settings = Arc::new(MemorySettingsStore::new());
        let registry = Arc::new(ConnectionRegistry::new(settings));
        let counts = Arc::new(Mutex::new(Vec::new()));

        let inner = registry.clone();
        let sink = counts.clone();
        registry.observe("status", move |_| sink.lock().unwrap().push(inner.count()));
        let (_id, _rx) = registry.add(Transport::Plain);

        assert_eq!(*counts.lock().unwrap(), vec![0, 1]);
    }
    #[test]
    fn test_concurrent_mutations_publish_latest_counts() {
        let (registry, settings) = registry();
        let threads = 8;
        let barrier = Barrier::new(threads);

        thread::scope(|s| {
            for t in 0..threads {
                let registry = &registry;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    for i in 0..50 {
                        let (id, _rx) = registry.add(Transport::Plain);
                        if (t + i) % 3 == 0 {
                            registry.promote(id);
                        }
                        if i % 2 == 0 {
                            registry.remove(id);
                        }
                    }
                });
            }
        });

        assert_eq!(settings.connection_counts(), registry.counts());
        assert_eq!(registry.count(), threads * 25);
    }

    #[test]
    fn test_concurrent_observer_ends_on_current_availability() {
        let (registry, _) = registry();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let barrier = Barrier::new(2);

        thread::scope(|s| {
            s.spawn(|| {
                barrier.wait();
                for _ in 0..100 {
                    let (id, _rx) = registry.add(Transport::Plain);
                    registry.promote(id);
                    registry.remove(id);
                }
                let (id, _rx) = registry.add(Transport::Plain);
                registry.promote(id);
            });
            s.spawn(|| {
                barrier.wait();
                let sink = seen.clone();
                registry.observe("late", move |online| sink.lock().unwrap().push(online));
            });
        });

        assert!(registry.has_primary());
        assert_eq!(seen.lock().unwrap().last(), Some(&true));
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let (registry, settings) = registry();
        registry.observe("broken", |online| {
            if online {
                panic!("widget bug");
            }
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.observe("status", move |online| sink.lock().unwrap().push(online));

        let (id, _rx) = registry.add(Transport::Plain);
        assert!(registry.promote(id));
        registry.remove(id);

        assert_eq!(*seen.lock().unwrap(), vec![false, false, true, false]);
        assert_eq!(registry.count(), 0);
        assert_eq!(settings.connection_counts(), ConnectionCounts::default());
    }
}
