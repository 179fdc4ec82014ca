// Copyright 2024 The sshlogd Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The typed in-process pub/sub bus (C3). One subscriber list per
//! [`EventKind`]; delivery is synchronous to `publish`, in subscription
//! order, in the publishing thread.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use sshlogd_protocol::{Event, EventKind};
use tracing::{span, warn, Level};

use crate::tracker::Tracker;

/// Anything that wants to hear about events registers one of these. The
/// bus hands subscribers the already-filtered-and-enriched event together
/// with the kind it was published under.
pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, kind: EventKind, event: &Event);
}

/// Adapts a plain closure into an [`EventSubscriber`], for callers (mostly
/// tests and the WatchHandler) that would rather not define a one-off type.
pub struct FnSubscriber<F>(pub F)
where
    F: Fn(EventKind, &Event) + Send + Sync;

impl<F> EventSubscriber for FnSubscriber<F>
where
    F: Fn(EventKind, &Event) + Send + Sync,
{
    fn on_event(&self, kind: EventKind, event: &Event) {
        (self.0)(kind, event)
    }
}

#[derive(Default)]
struct Subscribers {
    by_kind: HashMap<EventKind, Vec<Arc<dyn EventSubscriber>>>,
}

/// The event bus. Holds a reference to the tracker purely to perform the
/// enrichment step of the filtering policy (username/tty_id lookup by
/// ptm_pid) — the bus does not otherwise depend on tracker internals.
pub struct EventBus {
    tracker: Arc<Tracker>,
    subscribers: Mutex<Subscribers>,
}

impl EventBus {
    pub fn new(tracker: Arc<Tracker>) -> EventBus {
        EventBus { tracker, subscribers: Mutex::new(Subscribers::default()) }
    }

    /// Registers `subscriber` for `kinds` (all kinds if `None`). Idempotent:
    /// a subscriber already registered (by `Arc` identity) for a kind is not
    /// added a second time, so a delivery is never duplicated.
    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>, kinds: Option<&[EventKind]>) {
        let kinds = kinds_or_all(kinds);
        let mut subs = self.subscribers.lock().unwrap();
        for kind in kinds {
            let list = subs.by_kind.entry(kind).or_default();
            if !list.iter().any(|existing| Arc::ptr_eq(existing, &subscriber)) {
                list.push(subscriber.clone());
            }
        }
    }

    pub fn unsubscribe(&self, subscriber: &Arc<dyn EventSubscriber>, kinds: Option<&[EventKind]>) {
        let kinds = kinds_or_all(kinds);
        let mut subs = self.subscribers.lock().unwrap();
        for kind in kinds {
            if let Some(list) = subs.by_kind.get_mut(&kind) {
                list.retain(|existing| !Arc::ptr_eq(existing, subscriber));
            }
        }
    }

    /// Applies the filtering/enrichment policy and fans `event` out to every
    /// subscriber of `kind`, synchronously, in subscription order.
    pub fn publish(&self, kind: EventKind, mut event: Event) {
        let _s = span!(Level::DEBUG, "event_bus_publish", kind = %kind).entered();

        // connection_new is reserved bookkeeping and is never propagated to
        // any subscriber, including built-in ones like the tracker.
        if kind == EventKind::ConnectionNew {
            return;
        }

        let is_command = matches!(kind, EventKind::CommandStart | EventKind::CommandFinish);
        if is_command || kind == EventKind::FileUpload {
            // always pulled from the tracker, not just when username is
            // missing: the tracer can send a populated username with a stale
            // tty_id (e.g. -1), and that still needs the session's real value.
            let (username, tty_id) = self.tracker.enrich(event.ptm_pid);
            event.username = username;
            event.tty_id = tty_id;
        }

        if is_command && event.username.is_empty() {
            // the shell has not attached yet; nothing downstream can use this
            return;
        }

        let snapshot: Vec<Arc<dyn EventSubscriber>> = {
            let subs = self.subscribers.lock().unwrap();
            subs.by_kind.get(&kind).cloned().unwrap_or_default()
        };

        for subscriber in snapshot {
            let result = panic::catch_unwind(AssertUnwindSafe(|| subscriber.on_event(kind, &event)));
            if result.is_err() {
                warn!("event subscriber panicked handling {kind}; isolated, fan-out continues");
            }
        }
    }
}

fn kinds_or_all(kinds: Option<&[EventKind]>) -> Vec<EventKind> {
    match kinds {
        Some(kinds) => kinds.to_vec(),
        None => sshlogd_protocol::ALL_SUBSCRIBABLE_EVENT_KINDS.to_vec(),
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn event(ptm_pid: i64) -> Event {
        Event { ptm_pid, ..Default::default() }
    }

    #[test]
    fn connection_new_is_never_delivered() {
        let bus = EventBus::new(Arc::new(Tracker::new()));
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let sub: Arc<dyn EventSubscriber> =
            Arc::new(FnSubscriber(move |_k, _e| { seen2.fetch_add(1, Ordering::SeqCst); }));
        bus.subscribe(sub, None);

        bus.publish(EventKind::ConnectionNew, event(1));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn command_start_with_empty_username_is_dropped_when_session_unknown() {
        let bus = EventBus::new(Arc::new(Tracker::new()));
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let sub: Arc<dyn EventSubscriber> =
            Arc::new(FnSubscriber(move |_k, _e| { seen2.fetch_add(1, Ordering::SeqCst); }));
        bus.subscribe(sub, None);

        bus.publish(EventKind::CommandStart, Event { ptm_pid: 55, args: "ls".to_string(), ..Default::default() });
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn command_start_is_enriched_from_tracker_and_delivered() {
        let tracker = Arc::new(Tracker::new());
        tracker.on_event(
            EventKind::ConnectionEstablished,
            &Event { ptm_pid: 42, username: "a".to_string(), tty_id: 7, ..Default::default() },
        );
        let bus = EventBus::new(tracker);

        let received: Arc<Mutex<Option<Event>>> = Arc::new(Mutex::new(None));
        let received2 = received.clone();
        let sub: Arc<dyn EventSubscriber> = Arc::new(FnSubscriber(move |_k, e: &Event| {
            *received2.lock().unwrap() = Some(e.clone());
        }));
        bus.subscribe(sub, None);

        bus.publish(
            EventKind::CommandStart,
            Event { ptm_pid: 42, args: "ls".to_string(), ..Default::default() },
        );

        let got = received.lock().unwrap().clone().expect("delivered");
        assert_eq!(got.username, "a");
        assert_eq!(got.tty_id, 7);
    }

    #[test]
    fn command_start_enrichment_overwrites_stale_tty_id_even_with_username_set() {
        let tracker = Arc::new(Tracker::new());
        tracker.on_event(
            EventKind::ConnectionEstablished,
            &Event { ptm_pid: 42, username: "a".to_string(), tty_id: 7, ..Default::default() },
        );
        let bus = EventBus::new(tracker);

        let received: Arc<Mutex<Option<Event>>> = Arc::new(Mutex::new(None));
        let received2 = received.clone();
        let sub: Arc<dyn EventSubscriber> = Arc::new(FnSubscriber(move |_k, e: &Event| {
            *received2.lock().unwrap() = Some(e.clone());
        }));
        bus.subscribe(sub, None);

        // the tracer sends a populated username but leaves tty_id at its
        // sentinel value; enrichment must still replace it with the
        // session's real tty_id rather than trusting the incoming one.
        bus.publish(
            EventKind::CommandStart,
            Event { ptm_pid: 42, args: "ls".to_string(), username: "a".to_string(), tty_id: -1, ..Default::default() },
        );

        let got = received.lock().unwrap().clone().expect("delivered");
        assert_eq!(got.username, "a");
        assert_eq!(got.tty_id, 7);
    }

    #[test]
    fn subscribing_same_callback_twice_yields_a_single_delivery() {
        let bus = EventBus::new(Arc::new(Tracker::new()));
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let sub: Arc<dyn EventSubscriber> =
            Arc::new(FnSubscriber(move |_k, _e| { seen2.fetch_add(1, Ordering::SeqCst); }));
        bus.subscribe(sub.clone(), None);
        bus.subscribe(sub, None);

        bus.publish(EventKind::TerminalUpdate, event(1));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(Arc::new(Tracker::new()));
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let sub: Arc<dyn EventSubscriber> =
            Arc::new(FnSubscriber(move |_k, _e| { seen2.fetch_add(1, Ordering::SeqCst); }));
        bus.subscribe(sub.clone(), None);
        bus.unsubscribe(&sub, None);

        bus.publish(EventKind::TerminalUpdate, event(1));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn a_panicking_subscriber_does_not_abort_fan_out() {
        let bus = EventBus::new(Arc::new(Tracker::new()));
        let panicking: Arc<dyn EventSubscriber> =
            Arc::new(FnSubscriber(|_k, _e| panic!("boom")));
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let healthy: Arc<dyn EventSubscriber> =
            Arc::new(FnSubscriber(move |_k, _e| { seen2.fetch_add(1, Ordering::SeqCst); }));

        bus.subscribe(panicking, None);
        bus.subscribe(healthy, None);

        bus.publish(EventKind::TerminalUpdate, event(1));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
