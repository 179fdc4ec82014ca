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

//! The session tracker (C2): a derived `ptm_pid -> Session` index, kept up
//! to date by subscribing itself to the event bus like any other
//! subscriber.

use std::collections::HashMap;
use std::sync::Mutex;

use sshlogd_protocol::{Event, EventKind, SessionDto};

use crate::event_bus::EventSubscriber;

/// A live SSH session, derived from `connection_established` plus whatever
/// activity has been observed for it since.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub ptm_pid: i64,
    pub pts_pid: i64,
    pub shell_pid: i64,
    pub tty_id: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub user_id: i64,
    pub username: String,
    pub client_ip: String,
    pub client_port: u16,
    pub server_ip: String,
    pub server_port: u16,
    pub last_activity_time: i64,
    pub last_command: String,
}

impl Session {
    fn from_established(event: &Event) -> Session {
        Session {
            ptm_pid: event.ptm_pid,
            pts_pid: event.pts_pid,
            shell_pid: event.shell_pid,
            tty_id: event.tty_id,
            start_time: event.start_time,
            end_time: event.end_time,
            user_id: event.user_id,
            username: event.username.clone(),
            client_ip: event.tcp_info.client_ip.clone(),
            client_port: event.tcp_info.client_port,
            server_ip: event.tcp_info.server_ip.clone(),
            server_port: event.tcp_info.server_port,
            last_activity_time: now_millis(),
            last_command: String::new(),
        }
    }

    pub fn to_dto(&self) -> SessionDto {
        SessionDto {
            ptm_pid: self.ptm_pid,
            pts_pid: self.pts_pid,
            shell_pid: self.shell_pid,
            tty_id: self.tty_id,
            start_time: self.start_time,
            end_time: self.end_time,
            last_activity_time: self.last_activity_time,
            last_command: self.last_command.clone(),
            user_id: self.user_id,
            username: self.username.clone(),
            client_ip: self.client_ip.clone(),
            client_port: self.client_port,
            server_ip: self.server_ip.clone(),
            server_port: self.server_port,
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The derived session directory. Subscribes itself to the bus for
/// `connection_new`, `connection_established`, `connection_close`,
/// `terminal_update`, and `command_start`.
#[derive(Default)]
pub struct Tracker {
    sessions: Mutex<HashMap<i64, Session>>,
}

impl Tracker {
    pub fn new() -> Tracker {
        Tracker { sessions: Mutex::new(HashMap::new()) }
    }

    pub fn get_session(&self, ptm_pid: i64) -> Option<Session> {
        self.sessions.lock().unwrap().get(&ptm_pid).cloned()
    }

    /// Returns a snapshot. Safe to iterate without holding any lock on the
    /// tracker, since mutations after this call never touch the returned
    /// Vec.
    pub fn list_sessions(&self) -> Vec<Session> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }

    /// `username`/`tty_id` lookup used by the bus's enrichment pass. Returns
    /// empty strings / -1 if the session is unknown, per the filtering
    /// policy's documented default.
    pub fn enrich(&self, ptm_pid: i64) -> (String, i64) {
        match self.get_session(ptm_pid) {
            Some(session) => (session.username, session.tty_id),
            None => (String::new(), -1),
        }
    }
}

impl EventSubscriber for Tracker {
    fn on_event(&self, kind: EventKind, event: &Event) {
        let mut sessions = self.sessions.lock().unwrap();
        match kind {
            EventKind::ConnectionNew => {
                sessions.insert(event.ptm_pid, Session::from_established(event));
            }
            EventKind::ConnectionEstablished => {
                sessions.insert(event.ptm_pid, Session::from_established(event));
            }
            EventKind::ConnectionClose => {
                sessions.remove(&event.ptm_pid);
            }
            EventKind::TerminalUpdate => {
                if let Some(session) = sessions.get_mut(&event.ptm_pid) {
                    session.last_activity_time = now_millis();
                }
            }
            EventKind::CommandStart => {
                if let Some(session) = sessions.get_mut(&event.ptm_pid) {
                    session.last_command = event.args.clone();
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn established(ptm_pid: i64, username: &str, tty_id: i64) -> Event {
        Event { ptm_pid, username: username.to_string(), tty_id, ..Default::default() }
    }

    #[test]
    fn established_then_closed_removes_session() {
        let tracker = Tracker::new();
        tracker.on_event(EventKind::ConnectionEstablished, &established(42, "a", 7));
        assert!(tracker.get_session(42).is_some());

        tracker.on_event(EventKind::ConnectionClose, &Event { ptm_pid: 42, ..Default::default() });
        assert!(tracker.get_session(42).is_none());
    }

    #[test]
    fn command_start_sets_last_command() {
        let tracker = Tracker::new();
        tracker.on_event(EventKind::ConnectionEstablished, &established(42, "a", 7));
        tracker.on_event(
            EventKind::CommandStart,
            &Event { ptm_pid: 42, args: "ls -la".to_string(), ..Default::default() },
        );
        assert_eq!(tracker.get_session(42).unwrap().last_command, "ls -la");
    }

    #[test]
    fn command_start_for_unknown_session_is_a_noop() {
        let tracker = Tracker::new();
        tracker.on_event(
            EventKind::CommandStart,
            &Event { ptm_pid: 99, args: "ls".to_string(), ..Default::default() },
        );
        assert!(tracker.get_session(99).is_none());
    }

    #[test]
    fn terminal_update_bumps_last_activity_time_monotonically() {
        let tracker = Tracker::new();
        tracker.on_event(EventKind::ConnectionEstablished, &established(42, "a", 7));
        let first = tracker.get_session(42).unwrap().last_activity_time;

        tracker.on_event(EventKind::TerminalUpdate, &Event { ptm_pid: 42, ..Default::default() });
        let second = tracker.get_session(42).unwrap().last_activity_time;

        assert!(second >= first);
    }

    #[test]
    fn reestablish_resets_last_command() {
        let tracker = Tracker::new();
        tracker.on_event(EventKind::ConnectionEstablished, &established(42, "a", 7));
        tracker.on_event(
            EventKind::CommandStart,
            &Event { ptm_pid: 42, args: "ls".to_string(), ..Default::default() },
        );
        assert_eq!(tracker.get_session(42).unwrap().last_command, "ls");

        tracker.on_event(EventKind::ConnectionEstablished, &established(42, "a", 7));
        assert_eq!(tracker.get_session(42).unwrap().last_command, "");
    }

    #[test]
    fn enrich_defaults_to_empty_for_unknown_session() {
        let tracker = Tracker::new();
        assert_eq!(tracker.enrich(7), (String::new(), -1));
    }
}
