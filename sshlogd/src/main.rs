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
//! sshlogd is a host-local observability and control daemon for SSH
//! sessions. See the repository README for more info.

use clap::Parser;

fn main() -> anyhow::Result<()> {
    let args = sshlogd_core::Args::parse();
    sshlogd_core::run(args)
}
