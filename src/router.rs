// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Topic Cache & Subscription Router
//!
//! Keeps the most recent event per topic and fans inbound events out to the
//! widgets subscribed to that topic. A widget subscribing after the companion
//! application already reported a state gets the cached value immediately,
//! so widgets never have to re-query the application when they appear.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tracing::{debug, error};

use crate::mailbox::Mailbox;
use crate::protocol::{Event, Topic};

/// Subscriber callback. Receives the event, or `None` on subscription when
/// nothing is cached yet for the topic.
pub type EventCallback = Arc<dyn Fn(Option<&Event>) + Send + Sync>;

/// Sequence used for the empty replay on subscription. Cached events are
/// numbered from 1.
const NOTHING_CACHED: u64 = 0;

/// One (topic, subscriber) binding.
struct Subscription {
    subscriber_id: String,
    callback: EventCallback,
    mailbox: Mailbox<Option<Arc<Event>>>,
}

impl Subscription {
    fn new(subscriber_id: String, callback: EventCallback) -> Self {
        Self {
            subscriber_id,
            callback,
            mailbox: Mailbox::new(),
        }
    }

    fn deliver(&self, seq: u64, event: Option<Arc<Event>>, redeliver: bool) {
        let delivered = self.mailbox.deliver(seq, event, redeliver, |event| {
            invoke(&self.subscriber_id, &self.callback, event.as_deref())
        });
        if !delivered {
            debug!("Dropping stale delivery to {}", self.subscriber_id);
        }
    }
}

#[derive(Default)]
struct RouterState {
    next_seq: u64,
    cache: HashMap<Topic, (u64, Arc<Event>)>,
    subscribers: HashMap<Topic, Vec<Arc<Subscription>>>,
}

/// Topic cache and subscriber table.
///
/// Callbacks run outside the table lock and may call back into the router.
/// Each subscriber sees the events of a topic in cache order: a replay that
/// loses a race against a newer dispatch is skipped for that subscriber.
#[derive(Default)]
pub struct Router {
    state: RwLock<RouterState>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `callback` to `topic` for `subscriber_id`, replacing a previous
    /// binding of the same pair in place. The callback is invoked once
    /// immediately with the cached event, if any.
    pub fn on<F>(&self, topic: Topic, subscriber_id: impl Into<String>, callback: F)
    where
        F: Fn(Option<&Event>) + Send + Sync + 'static,
    {
        let subscriber_id = subscriber_id.into();
        let subscription = Arc::new(Subscription::new(subscriber_id.clone(), Arc::new(callback)));

        let (seq, cached) = {
            let mut state = self.state.write().unwrap();
            let bindings = state.subscribers.entry(topic.clone()).or_default();
            match bindings
                .iter_mut()
                .find(|binding| binding.subscriber_id == subscriber_id)
            {
                Some(slot) => *slot = subscription.clone(),
                None => bindings.push(subscription.clone()),
            }
            match state.cache.get(&topic) {
                Some((seq, event)) => (*seq, Some(event.clone())),
                None => (NOTHING_CACHED, None),
            }
        };

        debug!("{} subscribed to {}", subscriber_id, topic);
        subscription.deliver(seq, cached, false);
    }

    /// Removes the binding of `subscriber_id` to `topic`. No-op if absent.
    pub fn off(&self, topic: &Topic, subscriber_id: &str) {
        let mut state = self.state.write().unwrap();
        if let Some(bindings) = state.subscribers.get_mut(topic) {
            bindings.retain(|binding| binding.subscriber_id != subscriber_id);
            if bindings.is_empty() {
                state.subscribers.remove(topic);
            }
        }
    }

    /// Removes every binding held by `subscriber_id`.
    pub fn off_all(&self, subscriber_id: &str) {
        let mut state = self.state.write().unwrap();
        state.subscribers.retain(|_, bindings| {
            bindings.retain(|binding| binding.subscriber_id != subscriber_id);
            !bindings.is_empty()
        });
    }

    /// Caches `event` under its topic, then delivers it to every subscriber
    /// of that topic in registration order.
    pub fn dispatch(&self, event: Event) {
        let topic = event.topic();
        let event = Arc::new(event);
        let (seq, bindings) = {
            let mut state = self.state.write().unwrap();
            state.next_seq += 1;
            let seq = state.next_seq;
            state.cache.insert(topic.clone(), (seq, event.clone()));
            let bindings = state.subscribers.get(&topic).cloned().unwrap_or_default();
            (seq, bindings)
        };

        debug!("Dispatching {} to {} subscriber(s)", topic, bindings.len());
        for binding in &bindings {
            binding.deliver(seq, Some(event.clone()), false);
        }
    }

    /// Re-delivers every cached event to the subscribers of its topic.
    pub fn replay_all(&self) {
        let deliveries: Vec<(u64, Arc<Event>, Vec<Arc<Subscription>>)> = {
            let state = self.state.read().unwrap();
            state
                .cache
                .iter()
                .filter_map(|(topic, (seq, event))| {
                    state
                        .subscribers
                        .get(topic)
                        .map(|bindings| (*seq, event.clone(), bindings.clone()))
                })
                .collect()
        };

        for (seq, event, bindings) in &deliveries {
            for binding in bindings {
                binding.deliver(*seq, Some(event.clone()), true);
            }
        }
    }

    /// Last event cached for `topic`.
    pub fn cached(&self, topic: &Topic) -> Option<Event> {
        self.state
            .read()
            .unwrap()
            .cache
            .get(topic)
            .map(|(_, event)| Event::clone(event))
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.state
            .read()
            .unwrap()
            .subscribers
            .get(topic)
            .map_or(0, Vec::len)
    }
}

fn invoke(subscriber_id: &str, callback: &EventCallback, event: Option<&Event>) {
    if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        error!("Subscriber {} panicked while handling an event", subscriber_id);
    }
}
