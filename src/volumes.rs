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

//! Binds the symbolic volume names used by recipes to concrete partitions
//! on the root disk.
//!
//! A volume manifest is a small YAML document naming each volume and the
//! 1-based partition index it lives at:
//!
//! ```yaml
//! volumes:
//!   root:
//!     index: 1
//!   data:
//!     index: 2
//! ```
//!
//! Resolution binds each declared volume to a partition on the root disk by
//! partition number (`PARTN`, not the partition's position in the device's
//! path) so the mapping holds on both `/dev/sdaN` and `/dev/nvme0n1pN`
//! naming schemes.

use std::collections::HashMap;

use serde::Deserialize;

use crate::blockdev::{Disk, Partition};
use crate::errors::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    pub index: u32,
    pub target: Option<Partition>,
}

impl Volume {
    pub fn is_available(&self) -> bool {
        self.target.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    volumes: HashMap<String, ManifestVolume>,
}

#[derive(Debug, Deserialize)]
struct ManifestVolume {
    index: Option<u32>,
}

/// Parses a volume manifest, failing if any entry is missing its required
/// `index`. A manifest with no `volumes` key at all parses as an empty set,
/// rather than an error, so a recipe with no volume-scoped instructions
/// doesn't need one.
pub fn parse_manifest(yaml: &str) -> Result<Vec<Volume>> {
    let parsed: ManifestFile = serde_yaml::from_str(yaml)
        .map_err(|e| Error::Config(format!("parsing volume manifest: {e}")))?;
    let mut volumes = Vec::with_capacity(parsed.volumes.len());
    for (name, entry) in parsed.volumes {
        let index = entry
            .index
            .ok_or_else(|| Error::Config(format!("volume {name} is missing required 'index' property")))?;
        volumes.push(Volume { name, index, target: None });
    }
    volumes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(volumes)
}

/// Resolves a parsed set of volumes against a root disk's partition table.
#[derive(Debug, Clone, Default)]
pub struct VolumeResolver {
    volumes: HashMap<String, Volume>,
}

impl VolumeResolver {
    /// Binds each volume to the partition on `root` whose `PARTN` matches
    /// the volume's declared index. If `cache_partition` is given and a
    /// volume would resolve to it, resolution fails: running recipe
    /// operations against the partition backing the local image cache
    /// would corrupt the cache mid-operation.
    pub fn sync(root: &Disk, cache_partition: Option<&Partition>, yaml: &str) -> Result<Self> {
        let volumes = parse_manifest(yaml)?;
        let mut resolved = HashMap::with_capacity(volumes.len());
        for mut volume in volumes {
            let target = root
                .partitions
                .iter()
                .find(|p| p.partn == Some(volume.index))
                .cloned();
            if let (Some(target), Some(cache)) = (&target, cache_partition) {
                if target.path == cache.path {
                    return Err(Error::Resource(format!(
                        "volume {} targets the local image cache; refusing to bind it",
                        volume.name
                    )));
                }
            }
            volume.target = target;
            resolved.insert(volume.name.clone(), volume);
        }
        Ok(VolumeResolver { volumes: resolved })
    }

    pub fn get(&self, name: &str) -> Option<&Volume> {
        self.volumes.get(name)
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.volumes.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(path: &str, partn: u32) -> Partition {
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
            partn: Some(partn),
        }
    }

    fn disk(partitions: Vec<Partition>) -> Disk {
        Disk {
            path: "/dev/sda".into(),
            size: 1 << 40,
            removable: false,
            partitions,
        }
    }

    #[test]
    fn missing_volumes_key_is_empty() {
        let volumes = parse_manifest("other_key: true").unwrap();
        assert!(volumes.is_empty());
    }

    #[test]
    fn missing_index_is_an_error() {
        let err = parse_manifest("volumes:\n  root: {}\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn resolves_by_partition_number_not_path_suffix() {
        let yaml = "volumes:\n  root:\n    index: 1\n  data:\n    index: 2\n";
        let root = disk(vec![partition("/dev/sda1", 1), partition("/dev/sda2", 2)]);
        let resolver = VolumeResolver::sync(&root, None, yaml).unwrap();
        assert_eq!(resolver.get("root").unwrap().target.as_ref().unwrap().path, "/dev/sda1");
        assert_eq!(resolver.get("data").unwrap().target.as_ref().unwrap().path, "/dev/sda2");
    }

    #[test]
    fn unresolved_volume_is_unavailable() {
        let yaml = "volumes:\n  missing:\n    index: 9\n";
        let root = disk(vec![partition("/dev/sda1", 1)]);
        let resolver = VolumeResolver::sync(&root, None, yaml).unwrap();
        assert!(!resolver.get("missing").unwrap().is_available());
    }

    #[test]
    fn refuses_to_bind_the_cache_partition() {
        let yaml = "volumes:\n  root:\n    index: 2\n";
        let cache = partition("/dev/sda2", 2);
        let root = disk(vec![partition("/dev/sda1", 1), cache.clone()]);
        let err = VolumeResolver::sync(&root, Some(&cache), yaml).unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }
}
