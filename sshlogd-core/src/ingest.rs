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

//! The boundary to the native event source. The tracer that actually
//! observes SSH sessions lives outside this crate (out of scope per the
//! specification); [`EventSource`] is the trait the daemon's ingest loop
//! polls, so any concrete tracer binding can be plugged in without touching
//! C2-C9.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use serde_derive::Deserialize;
use sshlogd_protocol::{Event, EventKind};

/// A single tagged event as read off the native source.
pub struct Tagged {
    pub kind: EventKind,
    pub event: Event,
}

/// Polled by the daemon's ingest loop. `poll` returns promptly: `Ok(None)`
/// means "nothing new within `timeout`", not an error.
pub trait EventSource: Send {
    fn poll(&mut self, timeout: Duration) -> anyhow::Result<Option<Tagged>>;
}

#[derive(Deserialize)]
struct Line {
    event_type: EventKind,
    #[serde(flatten)]
    event: Event,
}

/// A reference `EventSource` that reads newline-delimited JSON
/// `{event_type, ...event fields}` records from a path (ordinarily a named
/// pipe the native tracer writes to). `poll`'s timeout is best-effort: a
/// plain `BufReader` over a blocking file descriptor cannot be interrupted
/// mid-read, so this implementation is meant for tests and for tracer
/// bindings that themselves honor the timeout; a production tracer binding
/// would more likely hand the daemon an FFI callback than a file path.
pub struct NdjsonEventSource {
    reader: BufReader<File>,
}

impl NdjsonEventSource {
    pub fn open(path: &Path) -> anyhow::Result<NdjsonEventSource> {
        Ok(NdjsonEventSource { reader: BufReader::new(File::open(path)?) })
    }
}

impl EventSource for NdjsonEventSource {
    fn poll(&mut self, _timeout: Duration) -> anyhow::Result<Option<Tagged>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        let parsed: Line = serde_json::from_str(line.trim_end())?;
        Ok(Some(Tagged { kind: parsed.event_type, event: parsed.event }))
    }
}
