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

use std::{fs, io, path::PathBuf, sync::Mutex};

use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod active_streams;
pub mod config;
pub mod config_watcher;
pub mod consts;
pub mod daemon;
pub mod event_bus;
pub mod ingest;
pub mod ipc;
pub mod pidlock;
pub mod plugins;
pub mod tracker;

/// The command line arguments sshlogd expects. These can be directly parsed
/// with clap or manually constructed, e.g. by a test harness.
#[derive(clap::Parser, Debug, Clone)]
#[clap(author, about)]
pub struct Args {
    #[clap(long, env = "SSHLOGD_LOGFILE", action, help = "file to write logs to (stderr if unset)")]
    pub logfile: Option<String>,

    #[clap(long, env = "SSHLOGD_DEBUG", action, help = "enable debug-level logging")]
    pub debug: bool,

    #[clap(long, action, help = "enable the diagnostic web surface (not served by this build)")]
    pub enable_diagnostic_web: bool,

    #[clap(long, action, default_value = "127.0.0.1")]
    pub diagnostic_web_ip: String,

    #[clap(long, action, default_value_t = consts::DEFAULT_DIAGNOSTIC_WEB_PORT)]
    pub diagnostic_web_port: u16,

    #[clap(long, action, help = "allow SendKeys requests to inject keystrokes into a pty")]
    pub enable_session_injection: bool,

    #[clap(long, env = "SSHLOGD_SOCKET", action, help = "path of the control socket to listen on")]
    pub socket: Option<String>,

    #[clap(long, env = "SSHLOGD_SOCKET_GROUP", action, help = "group that owns the control socket")]
    pub socket_group: Option<String>,

    #[clap(long, env = "SSHLOGD_PID_FILE", action, help = "path of the PID lockfile")]
    pub pid_file: Option<String>,

    #[clap(long, env = "SSHLOGD_CONFIG_ROOT", action, help = "directory holding the plugin config root file and conf.d/")]
    pub config_root: Option<String>,

    #[clap(long, env = "SSHLOGD_EVENT_SOURCE", action, help = "path of the newline-delimited JSON event pipe the native tracer writes to")]
    pub event_source: Option<String>,
}

impl Args {
    pub fn socket_path(&self) -> PathBuf {
        self.socket.clone().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(consts::DEFAULT_SOCKET_PATH))
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.pid_file.clone().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(consts::DEFAULT_PID_FILE_PATH))
    }

    pub fn socket_group_name(&self) -> String {
        self.socket_group.clone().unwrap_or_else(|| consts::DEFAULT_SOCKET_GROUP.to_string())
    }

    pub fn config_root_path(&self) -> PathBuf {
        self.config_root.clone().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(consts::DEFAULT_CONFIG_ROOT))
    }

    pub fn event_source_path(&self) -> PathBuf {
        self.event_source.clone().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(consts::DEFAULT_EVENT_SOURCE_PATH))
    }
}

/// Run the daemon with the given arguments. Blocks until shutdown.
pub fn run(args: Args) -> anyhow::Result<()> {
    init_logging(&args)?;

    if args.enable_diagnostic_web {
        tracing::warn!(
            "--enable-diagnostic-web was set, but the diagnostic web surface is an external \
             collaborator not implemented by this build; the flag is recorded and otherwise ignored"
        );
    }

    if let Err(err) = daemon::run(args) {
        error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let trace_level = if args.debug { tracing::Level::DEBUG } else { tracing::Level::INFO };

    if let Some(log_file) = args.logfile.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    Ok(())
}
