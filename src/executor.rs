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

//! Runs a compiled operation list sequentially.
//!
//! Every operation's failure is fatal and aborts the run, with one
//! exception: a [`crate::compiler::Operation::Pull`] that fails because the
//! cache is out of space is logged and skipped, since a later `DEPLOY` of
//! the same image can still fall back to the remote copy directly.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::archive;
use crate::blockdev::TempMount;
use crate::cache::ImageCache;
use crate::compiler::Operation;
use crate::errors::{Error, Result};
use crate::ocs;

/// Runs `operations` in order against `cache`, reporting external-tool
/// progress lines through `on_progress` as they arrive.
pub fn execute(
    operations: &[Operation],
    cache: &mut ImageCache,
    mut on_progress: impl FnMut(&str),
) -> Result<()> {
    let mut executed_pulls: Vec<String> = Vec::new();

    for (i, op) in operations.iter().enumerate() {
        plog_info!("executor", "executing operation {} of {}: {}", i + 1, operations.len(), op_label(op));
        match op {
            Operation::Deploy { image_name, image_volume, target } => {
                let image = cache
                    .get(image_name)
                    .cloned()
                    .ok_or_else(|| Error::Resolution(format!("image '{image_name}' unavailable")))?;
                let best_path = image
                    .best_path()
                    .ok_or_else(|| Error::Resolution(format!("image '{image_name}' unavailable")))?
                    .to_path_buf();
                let mut target = target.clone();
                ocs::deploy(&best_path, &mut target, image_volume.as_deref(), &mut on_progress)?;
            }
            Operation::Pull { image_name } => {
                let disallowed: Vec<&str> = executed_pulls.iter().map(String::as_str).collect();
                match cache.pull(image_name, false, true, &disallowed) {
                    Ok(()) => {}
                    Err(Error::Resource(msg)) => {
                        plog_warn!("executor", "cannot pull image {image_name}, insufficient space: {msg}");
                    }
                    Err(e) => return Err(e),
                }
                executed_pulls.push(image_name.clone());
            }
            Operation::Copy { image_name, target, path } => {
                let image = cache
                    .get(image_name)
                    .cloned()
                    .ok_or_else(|| Error::Resolution(format!("image '{image_name}' unavailable")))?;
                let best_path = image
                    .best_path()
                    .ok_or_else(|| Error::Resolution(format!("image '{image_name}' unavailable")))?
                    .to_path_buf();

                let mount = TempMount::mount(&target.path)
                    .with_context(|| format!("mounting {}", target.path))
                    .map_err(Error::from)?;
                let destination = resolve_destination(mount.path(), path)?;
                fs::copy(&best_path, &destination)?;
            }
            Operation::Unpack { image_name, target, path } => {
                let image = cache
                    .get(image_name)
                    .cloned()
                    .ok_or_else(|| Error::Resolution(format!("image '{image_name}' unavailable")))?;
                let best_path = image
                    .best_path()
                    .ok_or_else(|| Error::Resolution(format!("image '{image_name}' unavailable")))?
                    .to_path_buf();
                let name = best_path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                let format = archive::detect(name)
                    .ok_or_else(|| Error::Resolution(format!("unsupported archive format for '{image_name}'")))?;

                let mount = TempMount::mount(&target.path)
                    .with_context(|| format!("mounting {}", target.path))
                    .map_err(Error::from)?;
                let destination = resolve_destination(mount.path(), path)?;
                fs::create_dir_all(&destination)?;
                archive::extract(&best_path, format, &destination).map_err(Error::from)?;
            }
            Operation::Format { fstype, target } => {
                ocs::format_partition(fstype, &target.path)?;
            }
        }
    }

    Ok(())
}

fn op_label(op: &Operation) -> &'static str {
    match op {
        Operation::Deploy { .. } => "DEPLOY",
        Operation::Pull { .. } => "PULL",
        Operation::Copy { .. } => "COPY",
        Operation::Unpack { .. } => "UNPACK",
        Operation::Format { .. } => "FORMAT",
    }
}

/// Resolves a recipe-relative destination path (e.g. `/etc/motd`) against
/// a mounted volume's root, verifying the containing directory already
/// exists on that volume.
fn resolve_destination(mount_root: &Path, volume_path: &str) -> Result<PathBuf> {
    let relative = volume_path.trim_start_matches('/');
    let destination = mount_root.join(relative);
    let parent = destination.parent().unwrap_or(mount_root);
    if !parent.is_dir() {
        return Err(Error::Resolution(format!(
            "path '{}' does not exist in the target volume",
            parent.strip_prefix(mount_root).unwrap_or(parent).display()
        )));
    }
    Ok(destination)
}
