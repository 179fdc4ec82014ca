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

//! The active-streams lease table (C4): keeps a Watch subscription alive
//! only while its client keeps refreshing it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use tracing::{info, span, Level};

use crate::consts::{ACTIVE_STREAM_EVICT_AFTER, ACTIVE_STREAM_SWEEP_INTERVAL};

#[derive(Default)]
pub struct ActiveStreams {
    last_seen: Mutex<HashMap<String, Instant>>,
}

impl ActiveStreams {
    pub fn new() -> ActiveStreams {
        ActiveStreams { last_seen: Mutex::new(HashMap::new()) }
    }

    pub fn refresh(&self, correlation_id: &str) {
        self.last_seen.lock().unwrap().insert(correlation_id.to_string(), Instant::now());
    }

    /// A lease is active iff it was seen no more than `MAX_LEASE` ago. The
    /// exact boundary instant still counts as live: the predicate is `<=`,
    /// not `<`.
    pub fn is_active(&self, correlation_id: &str) -> bool {
        match self.last_seen.lock().unwrap().get(correlation_id) {
            Some(last_seen) => last_seen.elapsed() <= crate::consts::MAX_LEASE,
            None => false,
        }
    }

    fn sweep(&self, evict_after: std::time::Duration) {
        let mut last_seen = self.last_seen.lock().unwrap();
        let before = last_seen.len();
        last_seen.retain(|_, seen| seen.elapsed() <= evict_after);
        let evicted = before - last_seen.len();
        if evicted > 0 {
            info!("active streams sweep evicted {} stale lease(s)", evicted);
        }
    }

    /// Spawns a background thread that periodically evicts leases idle for
    /// longer than `ACTIVE_STREAM_EVICT_AFTER`. Runs until `shutdown` is set.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: Arc<std::sync::atomic::AtomicBool>) {
        let this = self.clone();
        thread::spawn(move || {
            let _s = span!(Level::INFO, "active_streams_sweeper").entered();
            while !shutdown.load(std::sync::atomic::Ordering::SeqCst) {
                thread::sleep(ACTIVE_STREAM_SWEEP_INTERVAL);
                this.sweep(ACTIVE_STREAM_EVICT_AFTER);
            }
        });
    }
}
