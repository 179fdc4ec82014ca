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

//! Request handlers (C7). `ListSessionHandler` and `KillSessionHandler` are
//! one-shot: given a request, they build the one response envelope it
//! produces. `SendKeys` is an inline side effect with no response. The
//! `WatchHandler` is long-lived and lives on [`super::router::Router`]
//! itself, since it is intimately tied to the bus subscription and lease
//! table that only the router owns.

use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sshlogd_protocol::{
    encode_response, KillSessionResponseDto, ResponsePayload, SessionListResponseDto,
    ShellSendkeysRequestDto, WireEnvelope,
};
use tracing::warn;

use crate::tracker::Tracker;

pub fn list_sessions_response(
    client_id: &str,
    correlation_id: &str,
    tracker: &Tracker,
) -> anyhow::Result<WireEnvelope> {
    let sessions = tracker.list_sessions().into_iter().map(|s| s.to_dto()).collect();
    let payload = ResponsePayload::SessionList(SessionListResponseDto::new(sessions));
    encode_response(client_id, correlation_id, &payload)
}

pub fn kill_session_response(
    client_id: &str,
    correlation_id: &str,
    ptm_pid: i64,
) -> anyhow::Result<WireEnvelope> {
    let success = send_sigterm(ptm_pid);
    let payload = ResponsePayload::Kill(KillSessionResponseDto::new(success));
    encode_response(client_id, correlation_id, &payload)
}

/// Never retries, never escalates to SIGKILL: a session that ignores SIGTERM
/// is left for the operator to deal with.
fn send_sigterm(ptm_pid: i64) -> bool {
    if !Path::new(&format!("/proc/{ptm_pid}")).exists() {
        return false;
    }
    match signal::kill(Pid::from_raw(ptm_pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(err) => {
            warn!("sending SIGTERM to ptm_pid {ptm_pid}: {err}");
            false
        }
    }
}

nix::ioctl_write_ptr_bad!(tiocsti, libc::TIOCSTI, libc::c_char);

/// Resolves the session, optionally signals a redraw, then injects `keys`
/// into the session's pty. Produces no response; every failure path is a
/// logged drop per the SendKeys error taxonomy.
pub fn send_keys(dto: ShellSendkeysRequestDto, tracker: &Tracker, session_injection_enabled: bool) {
    if !session_injection_enabled {
        warn!("SHELL_SENDKEYS_REQUEST for ptm_pid {}: session injection is disabled; dropping", dto.ptm_pid);
        return;
    }

    let session = match tracker.get_session(dto.ptm_pid) {
        Some(session) if session.tty_id >= 0 => session,
        _ => {
            warn!("SendKeys for ptm_pid {}: no session or no tty; dropping", dto.ptm_pid);
            return;
        }
    };

    if dto.force_redraw {
        if let Err(err) = signal::kill(Pid::from_raw(session.shell_pid as i32), Signal::SIGWINCH) {
            warn!("SendKeys: signalling SIGWINCH to shell_pid {}: {}", session.shell_pid, err);
        }
    }

    if let Err(err) = inject_keys(session.tty_id, &dto.keys) {
        warn!("SendKeys: injecting keys into pty {}: {:?}", session.tty_id, err);
    }
}

fn inject_keys(tty_id: i64, keys: &str) -> anyhow::Result<()> {
    let path = format!("/dev/pts/{tty_id}");
    let file = std::fs::OpenOptions::new().write(true).open(&path)?;
    let fd = file.as_raw_fd();
    for byte in keys.bytes() {
        let c = byte as libc::c_char;
        // Safety: fd stays open for the duration of the call and c lives on
        // the stack for the call's lifetime.
        unsafe {
            tiocsti(fd, &c)?;
        }
    }
    Ok(())
}
