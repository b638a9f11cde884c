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

//! Compiles a parsed [`Recipe`] into an ordered list of [`Operation`]s.
//!
//! Compilation validates every reference a recipe makes — images, volumes,
//! archive formats, filesystem types — against the cache and the resolved
//! volume set, and performs no side effects of its own. Either the whole
//! recipe compiles, or none of it runs.

use crate::archive;
use crate::blockdev::Partition;
use crate::cache::ImageCache;
use crate::errors::{Error, Result};
use crate::ocs::MKFS_FILESYSTEMS;
use crate::recipe::{Instruction, Recipe};
use crate::volumes::VolumeResolver;

/// A single resolved, ready-to-run step. Each variant carries only the
/// image *name* (not a cached [`crate::cache::Image`] snapshot) because an
/// earlier `Pull` step in the same recipe can change an image's local
/// availability between compile time and the moment this operation
/// actually runs; the executor re-reads current state from the cache by
/// name immediately before acting on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Deploy {
        image_name: String,
        image_volume: Option<String>,
        target: Partition,
    },
    Pull {
        image_name: String,
    },
    Copy {
        image_name: String,
        target: Partition,
        path: String,
    },
    Unpack {
        image_name: String,
        target: Partition,
        path: String,
    },
    Format {
        fstype: String,
        target: Partition,
    },
}

/// Validates and lowers every instruction in `recipe`. When `skip_unsupported`
/// is true, [`Instruction::Opaque`] entries are dropped with a warning
/// rather than rejected, so a recipe written for a newer instruction set
/// still compiles as far as this core understands it.
pub fn compile(
    recipe: &Recipe,
    cache: &ImageCache,
    resolver: &VolumeResolver,
    skip_unsupported: bool,
) -> Result<Vec<Operation>> {
    let mut operations = Vec::with_capacity(recipe.instructions.len());

    for (i, instruction) in recipe.instructions.iter().enumerate() {
        plog_info!("compiler", "[{}/{}] {instruction}", i + 1, recipe.instructions.len());
        match instruction {
            Instruction::Deploy { image, image_volume, volume } => {
                operations.push(compile_deploy(cache, resolver, image, image_volume.as_deref(), volume)?);
            }
            Instruction::Pull { image } => {
                operations.push(compile_pull(cache, image)?);
            }
            Instruction::Copy { image, volume, path } => {
                operations.push(compile_copy(cache, resolver, image, volume, path)?);
            }
            Instruction::Unpack { image, volume, path } => {
                operations.push(compile_unpack(cache, resolver, image, volume, path)?);
            }
            Instruction::Format { volume, fstype } => {
                operations.push(compile_format(resolver, volume, fstype)?);
            }
            Instruction::Opaque { keyword, .. } => {
                if skip_unsupported {
                    plog_warn!("compiler", "skipping unsupported instruction: {keyword}");
                    continue;
                }
                return Err(Error::Resolution(format!("unsupported instruction type: {keyword}")));
            }
        }
    }

    Ok(operations)
}

fn require_image(cache: &ImageCache, name: &str) -> Result<()> {
    let image = cache
        .get(name)
        .ok_or_else(|| Error::Resolution(format!("image '{name}' unavailable")))?;
    if !image.available_local() && !image.available_remote() {
        return Err(Error::Resolution(format!("image '{name}' unavailable")));
    }
    Ok(())
}

fn require_volume<'a>(resolver: &'a VolumeResolver, name: &str) -> Result<&'a Partition> {
    let volume = resolver
        .get(name)
        .ok_or_else(|| Error::Resolution(format!("volume '{name}' is not defined")))?;
    volume
        .target
        .as_ref()
        .ok_or_else(|| Error::Resolution(format!("volume '{name}' is unavailable on this system")))
}

fn compile_deploy(
    cache: &ImageCache,
    resolver: &VolumeResolver,
    image: &str,
    image_volume: Option<&str>,
    volume: &str,
) -> Result<Operation> {
    require_image(cache, image)?;
    let target = require_volume(resolver, volume)?.clone();
    Ok(Operation::Deploy {
        image_name: image.to_string(),
        image_volume: image_volume.map(str::to_string),
        target,
    })
}

fn compile_pull(cache: &ImageCache, image: &str) -> Result<Operation> {
    require_image(cache, image)?;
    Ok(Operation::Pull { image_name: image.to_string() })
}

fn compile_copy(
    cache: &ImageCache,
    resolver: &VolumeResolver,
    image: &str,
    volume: &str,
    path: &str,
) -> Result<Operation> {
    require_image(cache, image)?;
    let target = require_volume(resolver, volume)?.clone();
    Ok(Operation::Copy {
        image_name: image.to_string(),
        target,
        path: path.to_string(),
    })
}

fn compile_unpack(
    cache: &ImageCache,
    resolver: &VolumeResolver,
    image: &str,
    volume: &str,
    path: &str,
) -> Result<Operation> {
    require_image(cache, image)?;
    let source = cache.get(image).expect("just validated by require_image");
    let best = source
        .best_path()
        .ok_or_else(|| Error::Resolution(format!("image '{image}' is unavailable")))?;
    let name = best
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if archive::detect(name).is_none() {
        return Err(Error::Resolution(format!(
            "image archive format for '{image}' is not supported for unpacking"
        )));
    }

    let target = require_volume(resolver, volume)?.clone();
    Ok(Operation::Unpack {
        image_name: image.to_string(),
        target,
        path: path.to_string(),
    })
}

fn compile_format(resolver: &VolumeResolver, volume: &str, fstype: &str) -> Result<Operation> {
    if !MKFS_FILESYSTEMS.contains(&fstype) {
        return Err(Error::Resolution(format!(
            "unsupported filesystem provided: '{fstype}', supported filesystems: {}",
            MKFS_FILESYSTEMS.join(", ")
        )));
    }
    which::which(format!("mkfs.{fstype}"))
        .map_err(|_| Error::Resource(format!("mkfs.{fstype} not found on PATH")))?;

    let target = require_volume(resolver, volume)?.clone();
    Ok(Operation::Format { fstype: fstype.to_string(), target })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::Disk;

    fn test_partition(path: &str) -> Partition {
        Partition {
            path: path.to_string(),
            size: 1024,
            removable: false,
            partuuid: None,
            fsuuid: None,
            fstype: Some("ext4".into()),
            partlabel: None,
            fslabel: None,
            mountpoint: None,
            partn: Some(1),
        }
    }

    fn resolver_with(volume: &str, partition_path: &str) -> VolumeResolver {
        let disk = Disk {
            path: "/dev/sda".into(),
            size: 1 << 40,
            removable: false,
            partitions: vec![test_partition(partition_path)],
        };
        let yaml = format!("volumes:\n  {volume}:\n    index: 1\n");
        VolumeResolver::sync(&disk, None, &yaml).unwrap()
    }

    fn cache_with_remote_image(name: &str) -> (tempfile::TempDir, tempfile::TempDir, ImageCache) {
        let remote = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        std::fs::write(remote.path().join(name), b"bytes").unwrap();
        let mut cache = ImageCache::new(remote.path(), storage.path()).unwrap();
        cache.sync();
        (remote, storage, cache)
    }

    #[test]
    fn compiles_a_deploy_instruction() {
        let (_remote, _storage, cache) = cache_with_remote_image("base.img");
        let resolver = resolver_with("root", "/dev/sda1");
        let recipe = Recipe::parse(r#"DEPLOY "base.img" "root""#).unwrap();
        let ops = compile(&recipe, &cache, &resolver, true).unwrap();
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], Operation::Deploy { image_name, .. } if image_name == "base.img"));
    }

    #[test]
    fn unknown_image_fails_compilation() {
        let (_remote, _storage, cache) = cache_with_remote_image("base.img");
        let resolver = resolver_with("root", "/dev/sda1");
        let recipe = Recipe::parse(r#"DEPLOY "missing.img" "root""#).unwrap();
        let err = compile(&recipe, &cache, &resolver, true).unwrap_err();
        assert!(matches!(err, Error::Resolution(_)));
    }

    #[test]
    fn unknown_volume_fails_compilation() {
        let (_remote, _storage, cache) = cache_with_remote_image("base.img");
        let resolver = resolver_with("root", "/dev/sda1");
        let recipe = Recipe::parse(r#"DEPLOY "base.img" "nope""#).unwrap();
        let err = compile(&recipe, &cache, &resolver, true).unwrap_err();
        assert!(matches!(err, Error::Resolution(_)));
    }

    #[test]
    fn unsupported_archive_format_fails_unpack_compilation() {
        let (_remote, _storage, cache) = cache_with_remote_image("base.qcow2");
        let resolver = resolver_with("root", "/dev/sda1");
        let recipe = Recipe::parse(r#"UNPACK "base.qcow2" "root""#).unwrap();
        let err = compile(&recipe, &cache, &resolver, true).unwrap_err();
        assert!(matches!(err, Error::Resolution(_)));
    }

    #[test]
    fn opaque_instruction_is_skipped_when_allowed() {
        let (_remote, _storage, cache) = cache_with_remote_image("base.img");
        let resolver = resolver_with("root", "/dev/sda1");
        let recipe = Recipe::parse(r#"REBOOT "now""#).unwrap();
        let ops = compile(&recipe, &cache, &resolver, true).unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn opaque_instruction_fails_compilation_when_disallowed() {
        let (_remote, _storage, cache) = cache_with_remote_image("base.img");
        let resolver = resolver_with("root", "/dev/sda1");
        let recipe = Recipe::parse(r#"REBOOT "now""#).unwrap();
        let err = compile(&recipe, &cache, &resolver, false).unwrap_err();
        assert!(matches!(err, Error::Resolution(_)));
    }
}
