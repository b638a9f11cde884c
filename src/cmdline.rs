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

//! Command-line surface: one subcommand per top-level action an operator
//! or a bootstrap script would invoke, each lowered to its own `*Config`
//! struct consumed by the function of the same name in [`crate::run`].

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "netprovision", about = "Network-booted bare-metal provisioning client")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Compile and execute a recipe against a repository and local cache.
    Run(RunConfig),
    /// Sync the local image cache against the remote repository and print
    /// the resulting image table.
    Sync(SyncConfig),
    /// List recipe names available on the repository server.
    ListConfigs(RepositoryConfig),
    /// List volume-manifest names available on the repository server.
    ListLabels(RepositoryConfig),
}

#[derive(Debug, Parser)]
pub struct RunConfig {
    /// Path to the recipe file to compile and execute.
    pub recipe: PathBuf,
    /// Path to the volume manifest (YAML) describing volume-to-index bindings.
    pub volume_manifest: PathBuf,
    /// Root disk device to resolve volumes against, e.g. /dev/sda.
    pub root_device: String,
    /// Directory mirroring the remote image repository (bootstrap-mounted).
    #[arg(long, default_value = "/mnt/repo")]
    pub remote_path: PathBuf,
    /// Local image cache directory (bootstrap-mounted cache partition).
    #[arg(long, default_value = "/mnt/cache")]
    pub storage_path: PathBuf,
    /// Device path of the partition backing the local cache, protected
    /// from ever being bound as a recipe volume.
    #[arg(long)]
    pub cache_device: Option<String>,
    /// Treat instructions this core doesn't recognize as fatal compile
    /// errors instead of skipping them with a warning.
    #[arg(long)]
    pub strict: bool,
}

#[derive(Debug, Parser)]
pub struct SyncConfig {
    pub remote_path: PathBuf,
    pub storage_path: PathBuf,
}

#[derive(Debug, Parser)]
pub struct RepositoryConfig {
    /// Repository server host. When omitted, read from the `host` kernel
    /// command-line parameter, the way a PXE-booted client would discover
    /// it without an operator typing it in.
    pub host: Option<String>,
    /// Repository server port. When omitted, read from the `port` kernel
    /// command-line parameter, defaulting to 2021 if that's absent too.
    #[arg(long)]
    pub port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_internally_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_subcommand_parses_positional_and_flags() {
        let cli = Cli::parse_from([
            "netprovision",
            "run",
            "recipe.rp",
            "volumes.yaml",
            "/dev/sda",
            "--strict",
        ]);
        match cli.cmd {
            Cmd::Run(cfg) => {
                assert_eq!(cfg.recipe, PathBuf::from("recipe.rp"));
                assert_eq!(cfg.root_device, "/dev/sda");
                assert!(cfg.strict);
                assert_eq!(cfg.remote_path, PathBuf::from("/mnt/repo"));
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn list_configs_subcommand_leaves_host_and_port_unset_by_default() {
        let cli = Cli::parse_from(["netprovision", "list-configs", "10.0.0.1"]);
        match cli.cmd {
            Cmd::ListConfigs(cfg) => {
                assert_eq!(cfg.host.as_deref(), Some("10.0.0.1"));
                assert_eq!(cfg.port, None);
            }
            other => panic!("expected ListConfigs, got {other:?}"),
        }
    }

    #[test]
    fn list_configs_subcommand_accepts_explicit_port() {
        let cli = Cli::parse_from(["netprovision", "list-configs", "10.0.0.1", "--port", "9000"]);
        match cli.cmd {
            Cmd::ListConfigs(cfg) => assert_eq!(cfg.port, Some(9000)),
            other => panic!("expected ListConfigs, got {other:?}"),
        }
    }
}
