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

//! PID lockfile with a short acquire timeout (C9's "already running" guard).
//! No forking happens here — the daemonization step the specification
//! excludes is background-process forking, not the lockfile itself.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use nix::fcntl::{flock, FlockArg};
use nix::errno::Errno;

#[derive(thiserror::Error, Debug)]
pub enum LockError {
    #[error("{0} is already locked by another process")]
    AlreadyLocked(PathBuf),
    #[error("timed out waiting to acquire lock for {0}")]
    Timeout(PathBuf),
    #[error("i/o error acquiring lock for {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
}

/// Holds the lock for as long as it is alive; releases (unlocks, closes)
/// on drop.
pub struct PidLock {
    path: PathBuf,
    file: std::fs::File,
}

impl PidLock {
    /// Tries to acquire the lock for up to `timeout`, polling every
    /// `PID_LOCK_POLL_INTERVAL`. Writes the current pid into the file once
    /// acquired.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<PidLock, LockError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| LockError::Io { path: path.to_path_buf(), source })?;

        let deadline = Instant::now() + timeout;
        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => break,
                Err(Errno::EWOULDBLOCK) | Err(Errno::EAGAIN) => {
                    if Instant::now() >= deadline {
                        return Err(LockError::Timeout(path.to_path_buf()));
                    }
                    thread::sleep(crate::consts::PID_LOCK_POLL_INTERVAL);
                }
                Err(err) => {
                    return Err(LockError::Io { path: path.to_path_buf(), source: err.into() });
                }
            }
        }

        let mut file = file;
        file.set_len(0).map_err(|source| LockError::Io { path: path.to_path_buf(), source })?;
        file.seek(SeekFrom::Start(0)).map_err(|source| LockError::Io { path: path.to_path_buf(), source })?;
        writeln!(file, "{}", std::process::id())
            .map_err(|source| LockError::Io { path: path.to_path_buf(), source })?;
        file.flush().map_err(|source| LockError::Io { path: path.to_path_buf(), source })?;

        Ok(PidLock { path: path.to_path_buf(), file })
    }

    /// Returns the pid of the process currently holding the lock, if any.
    pub fn held_by(path: &Path) -> Option<i32> {
        let mut file = OpenOptions::new().read(true).open(path).ok()?;
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {
                let _ = flock(file.as_raw_fd(), FlockArg::Unlock);
                None
            }
            Err(Errno::EWOULDBLOCK) | Err(Errno::EAGAIN) => {
                let mut contents = String::new();
                file.read_to_string(&mut contents).ok()?;
                contents.trim().parse().ok()
            }
            Err(_) => None,
        }
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
        let _ = std::fs::remove_file(&self.path);
    }
}
