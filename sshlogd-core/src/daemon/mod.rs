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

//! Daemon orchestration (C9): root check, PID lockfile, plugin config
//! load/validate, wiring the bus/tracker/active-streams/plugin runtime
//! together, binding the control socket, and a shutdown sequence that drains
//! the router before shutting the action pool down last.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{bail, Context};
use signal_hook::{consts::TERM_SIGNALS, flag};
use tracing::{error, info, warn};

use crate::active_streams::ActiveStreams;
use crate::config_watcher::ConfigWatcher;
use crate::consts;
use crate::event_bus::{EventBus, EventSubscriber};
use crate::ingest::{self, EventSource};
use crate::ipc;
use crate::pidlock::PidLock;
use crate::plugins::PluginRuntime;
use crate::tracker::Tracker;
use crate::Args;

pub fn run(args: Args) -> anyhow::Result<()> {
    require_root()?;
    warn_if_kernel_too_old();

    let pid_file = args.pid_file_path();
    let _pid_lock = PidLock::acquire(&pid_file, consts::PID_LOCK_TIMEOUT)
        .with_context(|| format!("acquiring pid lock at {pid_file:?}"))?;
    info!("acquired pid lock at {:?}", pid_file);

    let config_root = args.config_root_path();
    let cfg = match PluginRuntime::load(&config_root) {
        Ok(cfg) => cfg,
        Err(errors) => {
            for err in &errors {
                error!("plugin config error: {err}");
            }
            bail!("refusing to start: {} plugin configuration error(s) under {:?}", errors.len(), config_root);
        }
    };

    let tracker = Arc::new(Tracker::new());
    let bus = Arc::new(EventBus::new(tracker.clone()));
    let tracker_subscriber: Arc<dyn EventSubscriber> = tracker.clone();
    bus.subscribe(tracker_subscriber, None);

    let active_streams = Arc::new(ActiveStreams::new());
    let shutdown = Arc::new(AtomicBool::new(false));
    active_streams.spawn_sweeper(shutdown.clone());

    let plugin_runtime = PluginRuntime::start(cfg, bus.clone()).context("starting plugin runtime")?;
    let plugin_runtime = Arc::new(Mutex::new(Some(plugin_runtime)));

    // kept alive for the lifetime of `run`; dropping it stops the reload thread.
    let _config_watcher = spawn_config_watcher(config_root.clone(), bus.clone(), plugin_runtime.clone())
        .context("starting plugin config watcher")?;

    let socket_path = args.socket_path();
    let listener = bind_socket(&socket_path, &args.socket_group_name()).context("binding control socket")?;

    register_shutdown_signals(shutdown.clone()).context("registering signal handlers")?;

    let router = ipc::Router::new(bus.clone(), tracker, active_streams, args.enable_session_injection, shutdown.clone());

    let ingest_shutdown = shutdown.clone();
    let ingest_bus = bus.clone();
    let event_source_path = args.event_source_path();
    let ingest_thread = thread::spawn(move || run_ingest(ingest_bus, ingest_shutdown, event_source_path));

    info!("\n\n======================== STARTING DAEMON ============================\n\n");
    router.serve(listener, socket_path)?;

    let _ = ingest_thread.join();
    // action pool is shut down last, after the router has drained and the
    // ingest loop has stopped publishing new events.
    if let Some(plugin_runtime) = plugin_runtime.lock().unwrap().take() {
        plugin_runtime.shutdown();
    }

    Ok(())
}

/// Watches the plugin config root for changes and, on a debounced change,
/// re-parses and re-validates it; only on success does it atomically swap a
/// freshly built [`PluginRuntime`] into `runtime`, shutting the previous one
/// down afterwards. A failed reload is logged and leaves the previously
/// running configuration untouched — unlike the startup-time `ConfigError`
/// path, a bad reload is non-fatal.
///
/// Only files present at startup are watched individually (the underlying
/// watcher tracks specific paths, not "whatever a directory contains");
/// `conf.d` itself is also watched so it rewatches if it is created, moved,
/// or removed. A `*.yaml` file added to `conf.d` after startup is picked up
/// on the next daemon restart, not hot-reloaded.
fn spawn_config_watcher(
    config_root: PathBuf,
    bus: Arc<EventBus>,
    runtime: Arc<Mutex<Option<PluginRuntime>>>,
) -> anyhow::Result<ConfigWatcher> {
    let reload_root = config_root.clone();
    let watcher = ConfigWatcher::with_debounce(
        move || reload_plugin_config(&reload_root, &bus, &runtime),
        consts::CONFIG_RELOAD_DEBOUNCE,
    )?;

    let root_file = config_root.join(consts::CONFIG_ROOT_FILE_NAME);
    if let Err(err) = watcher.watch(&root_file) {
        warn!("watching {:?} for plugin config changes: {:?}", root_file, err);
    }

    let conf_d = config_root.join(consts::CONFIG_CONF_D_DIR_NAME);
    if let Err(err) = watcher.watch(&conf_d) {
        warn!("watching {:?} for plugin config changes: {:?}", conf_d, err);
    }
    if conf_d.is_dir() {
        if let Ok(entries) = fs::read_dir(&conf_d) {
            for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
                let is_yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"));
                if is_yaml {
                    if let Err(err) = watcher.watch(&path) {
                        warn!("watching {:?} for plugin config changes: {:?}", path, err);
                    }
                }
            }
        }
    }

    Ok(watcher)
}

fn reload_plugin_config(config_root: &Path, bus: &Arc<EventBus>, runtime: &Arc<Mutex<Option<PluginRuntime>>>) {
    let cfg = match PluginRuntime::load(config_root) {
        Ok(cfg) => cfg,
        Err(errors) => {
            for err in &errors {
                error!("plugin config reload error: {err}");
            }
            warn!("plugin config reload under {:?} failed validation; keeping previous configuration", config_root);
            return;
        }
    };

    let new_runtime = match PluginRuntime::start(cfg, bus.clone()) {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to start reloaded plugin runtime: {:?}; keeping previous configuration", err);
            return;
        }
    };

    let old = runtime.lock().unwrap().replace(new_runtime);
    if let Some(old) = old {
        old.shutdown();
    }
    info!("plugin configuration reloaded from {:?}", config_root);
}

fn require_root() -> anyhow::Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        bail!("sshlogd must be run as root (effective uid 0)");
    }
    Ok(())
}

/// Advisory only: an old kernel is logged, never refused. Parses just the
/// leading `major.minor` out of `uname -r`, which is good enough to compare
/// against [`consts::MIN_KERNEL_VERSION`] and is not itself parsed strictly
/// (a release string this code doesn't understand is silently skipped).
fn warn_if_kernel_too_old() {
    let release = match read_kernel_release() {
        Some(release) => release,
        None => {
            warn!("could not read kernel release via uname(); skipping version check");
            return;
        }
    };

    let mut parts = release.split(|c: char| !c.is_ascii_digit()).filter(|s| !s.is_empty());
    let (Some(major), Some(minor)) = (
        parts.next().and_then(|s| s.parse::<u32>().ok()),
        parts.next().and_then(|s| s.parse::<u32>().ok()),
    ) else {
        warn!("could not parse kernel release '{}'; skipping version check", release);
        return;
    };

    let (min_major, min_minor) = consts::MIN_KERNEL_VERSION;
    if (major, minor) < (min_major, min_minor) {
        warn!(
            "running on kernel {}.{} (release '{}'), older than the recommended {}.{}; continuing anyway",
            major, minor, release, min_major, min_minor
        );
    }
}

/// Raw `uname(2)` via libc: reading `/proc/sys/kernel/osrelease` would be
/// simpler but is itself a Linux-only convention layered on top of the same
/// syscall, so this goes straight to the source.
fn read_kernel_release() -> Option<String> {
    // Safety: `uts` is zero-initialized and fully populated by a successful
    // `uname()` before any field is read.
    unsafe {
        let mut uts: libc::utsname = std::mem::zeroed();
        if libc::uname(&mut uts) != 0 {
            return None;
        }
        let cstr = std::ffi::CStr::from_ptr(uts.release.as_ptr());
        Some(cstr.to_string_lossy().into_owned())
    }
}

/// Binds the control socket, sets its mode to `0660`, and chowns it to the
/// configured group. A missing group is a soft failure: the socket is left
/// with its default group and a warning is logged, per the specification's
/// "startup fails soft" clause.
fn bind_socket(socket_path: &std::path::Path, group_name: &str) -> anyhow::Result<UnixListener> {
    if socket_path.exists() {
        fs::remove_file(socket_path).with_context(|| format!("removing stale socket {socket_path:?}"))?;
    }
    let listener = UnixListener::bind(socket_path).with_context(|| format!("binding socket {socket_path:?}"))?;
    fs::set_permissions(socket_path, fs::Permissions::from_mode(consts::DEFAULT_SOCKET_MODE))
        .with_context(|| format!("setting permissions on {socket_path:?}"))?;

    match nix::unistd::Group::from_name(group_name) {
        Ok(Some(group)) => {
            if let Err(err) = nix::unistd::chown(socket_path, None, Some(group.gid)) {
                warn!("chowning {:?} to group '{}': {}", socket_path, group_name, err);
            }
        }
        Ok(None) => {
            warn!("socket group '{}' does not exist; leaving {:?} with its default group", group_name, socket_path);
        }
        Err(err) => {
            warn!("looking up socket group '{}': {}", group_name, err);
        }
    }

    Ok(listener)
}

/// The first TERM/INT flips `shutdown` (arming the conditional exit below
/// too); a second one forces an immediate, non-graceful exit so a stuck
/// shutdown can still be killed.
fn register_shutdown_signals(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    for sig in TERM_SIGNALS {
        flag::register_conditional_shutdown(*sig, 1, shutdown.clone())?;
        flag::register(*sig, shutdown.clone())?;
    }
    Ok(())
}

fn run_ingest(bus: Arc<EventBus>, shutdown: Arc<AtomicBool>, source_path: std::path::PathBuf) {
    let mut source: Box<dyn EventSource> = match ingest::NdjsonEventSource::open(&source_path) {
        Ok(source) => Box::new(source),
        Err(err) => {
            error!("opening event source {:?}: {:?}; ingest loop is not running", source_path, err);
            return;
        }
    };

    while !shutdown.load(Ordering::SeqCst) {
        match source.poll(consts::SOCK_POLL_TIMEOUT) {
            Ok(Some(tagged)) => bus.publish(tagged.kind, tagged.event),
            // `poll`'s timeout is best-effort (see `ingest::NdjsonEventSource`),
            // so a `None` doesn't necessarily mean `timeout` has elapsed;
            // sleep here so a source sitting at EOF can't spin this thread.
            Ok(None) => thread::sleep(consts::SOCK_POLL_TIMEOUT),
            Err(err) => {
                warn!("polling event source: {:?}", err);
                thread::sleep(consts::SOCK_POLL_TIMEOUT);
            }
        }
    }
}
