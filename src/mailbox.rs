// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Ordered delivery to one callback.
//!
//! Router subscriptions and availability observers are called outside the
//! locks that produced their values, from whichever thread made the change.
//! A mailbox keeps those calls in sequence order: values are tagged with the
//! sequence number they were produced under, a value older than one already
//! accepted is dropped, and only one thread at a time runs the callback. A
//! caller that finds the mailbox busy enqueues and returns; the thread that
//! is draining delivers for it. The same applies to a callback that re-enters
//! its own mailbox.

use std::collections::VecDeque;
use std::sync::Mutex;

struct State<T> {
    last_seq: Option<u64>,
    pending: VecDeque<T>,
    draining: bool,
}

pub(crate) struct Mailbox<T> {
    state: Mutex<State<T>>,
}

impl<T> Mailbox<T> {
    pub(crate) fn new() -> Self {
        Mailbox {
            state: Mutex::new(State {
                last_seq: None,
                pending: VecDeque::new(),
                draining: false,
            }),
        }
    }

    /// Offers `value` produced at `seq`. With `redeliver`, the last accepted
    /// sequence is accepted again. Returns false when the value was stale.
    ///
    /// `sink` must not unwind, and every caller of one mailbox must pass an
    /// equivalent sink: queued values are handed to the draining caller's.
    pub(crate) fn deliver(&self, seq: u64, value: T, redeliver: bool, sink: impl Fn(T)) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            let accepted = match state.last_seq {
                None => true,
                Some(last) => seq > last || (redeliver && seq == last),
            };
            if !accepted {
                return false;
            }
            state.last_seq = Some(seq);
            state.pending.push_back(value);
            if state.draining {
                return true;
            }
            state.draining = true;
        }

        loop {
            let next = {
                let mut state = self.state.lock().unwrap();
                match state.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        state.draining = false;
                        return true;
                    }
                }
            };
            sink(next);
        }
    }
}
