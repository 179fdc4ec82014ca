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

//! The declarative plugin/action engine (C8): `Filter`/`Action` capability
//! traits, a handful of built-in implementations, and the runtime that
//! subscribes one [`EventSubscription`](runtime::EventSubscription) per
//! configured event rule to the bus and fans passing events out to a shared
//! worker pool.

pub mod actions;
pub mod filters;
pub mod pool;
pub mod runtime;

pub use runtime::PluginRuntime;

/// Pulls a string value out of a declarative plugin config. `required`
/// parameters missing from the merged param map are a construction error;
/// substitution of `{{field}}` tokens happens later, at `execute` time, from
/// the event actually being processed.
pub(crate) fn template_substitute(template: &str, event: &sshlogd_protocol::Event) -> String {
    let fields: [(&str, String); 15] = [
        ("ptm_pid", event.ptm_pid.to_string()),
        ("user_id", event.user_id.to_string()),
        ("username", event.username.clone()),
        ("pts_pid", event.pts_pid.to_string()),
        ("shell_pid", event.shell_pid.to_string()),
        ("tty_id", event.tty_id.to_string()),
        ("start_time", event.start_time.to_string()),
        ("end_time", event.end_time.to_string()),
        ("filename", event.filename.clone()),
        ("args", event.args.clone()),
        ("pid", event.pid.to_string()),
        ("exit_code", event.exit_code.to_string()),
        ("stdout", event.stdout.clone()),
        ("target_path", event.target_path.clone()),
        ("file_mode", event.file_mode.to_string()),
    ];

    let mut out = template.to_string();
    for (key, value) in fields {
        let token = format!("{{{{{key}}}}}");
        if out.contains(&token) {
            out = out.replace(&token, &value);
        }
    }
    out
}
