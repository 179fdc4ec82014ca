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

//! Action plugins. Only two reference actions ship with the core — the
//! syslog/webhook/email/statsd bodies the original daemon carries are
//! external collaborators out of scope for this crate (see the
//! specification's purpose section); `run_command_action` is itself a
//! general escape hatch to any of them.

use std::fs::OpenOptions;
use std::io::Write;
use std::process::Command;
use std::sync::Mutex;

use serde_yaml::{Mapping, Value};
use sshlogd_protocol::Event;
use tracing::{info, warn};

use super::template_substitute;

pub trait Action: Send + Sync {
    fn execute(&self, event: &Event) -> anyhow::Result<()>;

    /// Releases any resources the action holds (open files, sockets). Called
    /// once when the plugin runtime shuts down. Default: nothing to do.
    fn shutdown(&self) {}
}

pub fn is_known_plugin(name: &str) -> bool {
    matches!(name, "logfile_action" | "run_command_action")
}

/// Builds the named action plugin from its fully-merged parameter map (named
/// action definition's params with the event-site's inline overrides already
/// applied on top).
pub fn build(plugin: &str, name: &str, params: &Mapping) -> anyhow::Result<Box<dyn Action>> {
    match plugin {
        "logfile_action" => Ok(Box::new(LogfileAction::new(name, params)?)),
        "run_command_action" => Ok(Box::new(RunCommandAction::new(name, params)?)),
        other => anyhow::bail!("unknown action plugin '{other}'"),
    }
}

fn string_param(params: &Mapping, key: &str) -> anyhow::Result<String> {
    params
        .get(Value::String(key.to_string()))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("missing required string parameter '{key}'"))
}

fn string_list_param(params: &Mapping, key: &str) -> Vec<String> {
    match params.get(Value::String(key.to_string())) {
        Some(Value::Sequence(items)) => {
            items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()
        }
        _ => Vec::new(),
    }
}

/// Appends `{event fields as JSON}` lines to a log file. Grounded on the
/// source's `logfile_action`, minus log rotation (the specification's
/// external logging-file-rotation non-goal covers the daemon's own log, and
/// this reference action follows the same lead: rotation is a deployment
/// concern, not this crate's).
struct LogfileAction {
    name: String,
    path: String,
    file: Mutex<std::fs::File>,
}

impl LogfileAction {
    fn new(name: &str, params: &Mapping) -> anyhow::Result<LogfileAction> {
        let path = string_param(params, "log_file_path")?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("initialized action {name} with log file path {path}");
        Ok(LogfileAction { name: name.to_string(), path, file: Mutex::new(file) })
    }
}

impl Action for LogfileAction {
    fn execute(&self, event: &Event) -> anyhow::Result<()> {
        let line = serde_json::to_string(event)?;
        let mut file = self.file.lock().unwrap();
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn shutdown(&self) {
        info!("shutting down action {} (log file {})", self.name, self.path);
    }
}

/// Runs an external command with `{{field}}` tokens in its arguments
/// substituted from the triggering event. Grounded on the source's
/// `run_command_action`; this is the uniform execution contract the
/// specification describes for invoking external collaborators (syslog,
/// webhooks, ...) without this crate implementing each one directly.
struct RunCommandAction {
    name: String,
    command: String,
    args: Vec<String>,
}

impl RunCommandAction {
    fn new(name: &str, params: &Mapping) -> anyhow::Result<RunCommandAction> {
        let command = string_param(params, "command")?;
        let args = string_list_param(params, "args");
        info!("initialized action {name} with command {command}");
        Ok(RunCommandAction { name: name.to_string(), command, args })
    }
}

impl Action for RunCommandAction {
    fn execute(&self, event: &Event) -> anyhow::Result<()> {
        let args: Vec<String> = self.args.iter().map(|a| template_substitute(a, event)).collect();
        match Command::new(&self.command).args(&args).status() {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => {
                warn!("action {} command {} exited with {:?}", self.name, self.command, status.code());
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn shutdown(&self) {
        info!("shutting down action {}", self.name);
    }
}
