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

//! One function per subcommand in [`crate::cmdline::Cmd`], each consuming
//! the `*Config` struct clap built for it.

use std::fs;

use crate::blockdev::Disk;
use crate::cache::ImageCache;
use crate::cmdline::{RepositoryConfig, RunConfig, SyncConfig};
use crate::compiler;
use crate::config::{BootConfig, KernelCmdline};
use crate::errors::Result;
use crate::executor;
use crate::progress::parse_line;
use crate::recipe::Recipe;
use crate::repository::RepositoryClient;
use crate::volumes::VolumeResolver;

/// Resolves the repository host/port an operator can either pass explicitly
/// or leave for this core to discover from its own kernel command line, the
/// way a PXE-booted client would.
fn resolve_repository(cfg: &RepositoryConfig) -> Result<(String, u16)> {
    match (&cfg.host, cfg.port) {
        (Some(host), Some(port)) => Ok((host.clone(), port)),
        (Some(host), None) => Ok((host.clone(), crate::config::DEFAULT_PORT)),
        (None, port) => {
            let boot = BootConfig::from_cmdline(&KernelCmdline::from_proc()?)?;
            Ok((boot.host, port.unwrap_or(boot.port)))
        }
    }
}

pub fn run(cfg: &RunConfig) -> Result<()> {
    let mut cache = ImageCache::new(&cfg.remote_path, &cfg.storage_path)?;
    cache.sync();

    let root = Disk::from_device(&cfg.root_device)?;
    let cache_partition = cfg
        .cache_device
        .as_deref()
        .and_then(|dev| root.partitions.iter().find(|p| p.path == dev))
        .cloned();

    let manifest = fs::read_to_string(&cfg.volume_manifest)?;
    let resolver = VolumeResolver::sync(&root, cache_partition.as_ref(), &manifest)?;

    let source = fs::read_to_string(&cfg.recipe)?;
    let recipe = Recipe::parse(&source)?;

    plog_info!("run", "compiling {} instruction(s)", recipe.instructions.len());
    let operations = compiler::compile(&recipe, &cache, &resolver, !cfg.strict)?;

    plog_info!("run", "executing {} operation(s)", operations.len());
    executor::execute(&operations, &mut cache, |line| report_progress(line))?;

    plog_info!("run", "done");
    Ok(())
}

fn report_progress(line: &str) {
    match parse_line(line) {
        Some(progress) if progress.is_finalizing() => plog_info!("ocs-sr", "cleaning up"),
        Some(progress) => plog_info!(
            "ocs-sr",
            "remaining {:?}, rate {:.2} GB/min, progress {:.1}%",
            progress.remaining,
            progress.rate_gb_per_min,
            progress.completed_pct
        ),
        None => plog_info!("ocs-sr", "{line}"),
    }
}

pub fn sync(cfg: &SyncConfig) -> Result<()> {
    let mut cache = ImageCache::new(&cfg.remote_path, &cfg.storage_path)?;
    cache.sync();

    println!("{:<24} {:>8} {:>8} {:>10}", "NAME", "LOCAL", "REMOTE", "SIZE");
    for image in cache.all() {
        let size = image.size().map(|s| s.to_string()).unwrap_or_else(|_| "-".into());
        println!(
            "{:<24} {:>8} {:>8} {:>10}",
            image.name,
            if image.available_local() { "yes" } else { "no" },
            if image.available_remote() { "yes" } else { "no" },
            size,
        );
    }
    Ok(())
}

pub fn list_configs(cfg: &RepositoryConfig) -> Result<()> {
    let (host, port) = resolve_repository(cfg)?;
    let client = RepositoryClient::new(&host, port)?;
    for name in client.list_configs()? {
        println!("{name}");
    }
    Ok(())
}

pub fn list_labels(cfg: &RepositoryConfig) -> Result<()> {
    let (host, port) = resolve_repository(cfg)?;
    let client = RepositoryClient::new(&host, port)?;
    for name in client.list_labels()? {
        println!("{name}");
    }
    Ok(())
}
