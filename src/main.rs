// Copyright 2019 CoreOS, Inc.
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

use clap::Parser;

use libprovision::cmdline::{Cli, Cmd};
use libprovision::run;

fn main() {
    if let Err(e) = run_cmd() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run_cmd() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Run(cfg) => run::run(&cfg)?,
        Cmd::Sync(cfg) => run::sync(&cfg)?,
        Cmd::ListConfigs(cfg) => run::list_configs(&cfg)?,
        Cmd::ListLabels(cfg) => run::list_labels(&cfg)?,
    }
    Ok(())
}
