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

use std::time::Duration;

/// A lease is alive iff `now - last_seen <= MAX_LEASE`; exactly `MAX_LEASE`
/// still counts as live.
pub const MAX_LEASE: Duration = Duration::from_secs(1);

/// WatchHandler loop sleep between lease/shutdown polls.
pub const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often the active-streams sweeper wakes up to evict stale leases.
pub const ACTIVE_STREAM_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// A lease idle for longer than this is reclaimed by the sweeper, well past
/// MAX_LEASE so the sweep never races a client that is still renewing.
pub const ACTIVE_STREAM_EVICT_AFTER: Duration = Duration::from_secs(60);

/// Bound on how long the router's accept/read loops block per iteration, so
/// shutdown stays observable without a literal control pipe.
pub const SOCK_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Multiplier applied to `std::thread::available_parallelism()` to size the
/// plugin runtime's action worker pool.
pub const ACTION_POOL_CPU_MULTIPLIER: usize = 16;

/// Debounce window for the config-root filesystem watcher.
pub const CONFIG_RELOAD_DEBOUNCE: Duration = Duration::from_millis(100);

/// Timeout used when acquiring the PID lockfile at startup.
pub const PID_LOCK_TIMEOUT: Duration = Duration::from_secs(3);
pub const PID_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/sshlogd.sock";
pub const DEFAULT_SOCKET_MODE: u32 = 0o660;
pub const DEFAULT_SOCKET_GROUP: &str = "sshlog";
pub const DEFAULT_PID_FILE_PATH: &str = "/var/run/sshlogd.pid";
pub const DEFAULT_CONFIG_ROOT: &str = "/etc/sshlogd";
pub const CONFIG_ROOT_FILE_NAME: &str = "sshlogd.yaml";
pub const CONFIG_CONF_D_DIR_NAME: &str = "conf.d";

pub const DEFAULT_DIAGNOSTIC_WEB_PORT: u16 = 8732;

/// Default path of the newline-delimited JSON pipe the native tracer (out of
/// scope for this crate) is expected to write tagged events to.
pub const DEFAULT_EVENT_SOURCE_PATH: &str = "/var/run/sshlogd-events.ndjson";

/// `ignore_existing_logins_filter` drops connection_* events whose
/// `start_time` predates daemon start by more than this, to suppress
/// synthetic replays of sessions the tracer re-announces on daemon restart.
pub const IGNORE_EXISTING_LOGIN_THRESHOLD: Duration = Duration::from_secs(10);

/// Below this `(major, minor)` the daemon logs a warning and keeps running;
/// this is advisory only, never a startup gate.
pub const MIN_KERNEL_VERSION: (u32, u32) = (5, 4);
