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

//! Content-addressed local image cache.
//!
//! Images live in two places: a remote directory (typically an NFS export
//! mounted read-only by the bootstrap script before this core runs) and a
//! local cache directory backed by a dedicated partition. Each file is
//! paired with a sidecar `<name>.sha256` hash file; an image present
//! locally without one gets its hash computed and written on first sync, so
//! every subsequent sync is a cheap file read instead of a re-hash.

use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{Error, Result};
use crate::util::sha256_file;

const HASH_SUFFIX: &str = ".sha256";

/// One named image, tracked across its possible remote and local locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub name: String,
    pub remote_path: Option<PathBuf>,
    pub local_path: Option<PathBuf>,
    pub remote_hash: Option<String>,
    pub local_hash: Option<String>,
}

impl Image {
    pub fn available_remote(&self) -> bool {
        self.remote_path.is_some() && self.remote_hash.is_some()
    }

    pub fn available_local(&self) -> bool {
        self.local_path.is_some()
    }

    /// Preferred path to read the image from: local cache first, remote
    /// second.
    pub fn best_path(&self) -> Option<&Path> {
        self.local_path
            .as_deref()
            .or(self.remote_path.as_deref())
    }

    /// True when both copies exist and their hashes disagree, meaning the
    /// cached copy is stale with respect to the remote.
    pub fn outdated(&self) -> bool {
        self.available_remote() && self.available_local() && self.remote_hash != self.local_hash
    }

    pub fn size(&self) -> Result<u64> {
        let path = self
            .best_path()
            .ok_or_else(|| Error::Resolution(format!("image {} is not available in any repo", self.name)))?;
        Ok(fs::metadata(path)?.len())
    }

    /// Removes the locally cached copy and its sidecar hash, if any.
    pub fn delete_local(&mut self) -> Result<()> {
        if let Some(path) = &self.local_path {
            if path.exists() {
                fs::remove_file(path)?;
                remove_hash_file(path)?;
            }
        }
        self.local_path = None;
        self.local_hash = None;
        Ok(())
    }
}

fn hash_path(image_path: &Path) -> PathBuf {
    let mut p = image_path.as_os_str().to_owned();
    p.push(HASH_SUFFIX);
    PathBuf::from(p)
}

fn read_hash_file(image_path: &Path) -> Option<String> {
    fs::read_to_string(hash_path(image_path))
        .ok()
        .map(|s| s.trim().to_string())
}

fn write_hash_file(image_path: &Path, hash: &str) -> Result<()> {
    fs::write(hash_path(image_path), hash)?;
    Ok(())
}

fn remove_hash_file(image_path: &Path) -> Result<()> {
    let hp = hash_path(image_path);
    if hp.exists() {
        fs::remove_file(hp)?;
    }
    Ok(())
}

/// Lists regular files in `dir`, excluding sidecar hash files.
fn list_images(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.ends_with(HASH_SUFFIX) {
            continue;
        }
        if entry.file_type()?.is_file() {
            names.push(file_name);
        }
    }
    Ok(names)
}

/// The local cache directory plus the remote directory it mirrors.
#[derive(Debug)]
pub struct ImageCache {
    pub remote_path: PathBuf,
    pub storage_path: PathBuf,
    images: Vec<Image>,
}

impl ImageCache {
    pub fn new(remote_path: impl Into<PathBuf>, storage_path: impl Into<PathBuf>) -> Result<Self> {
        let remote_path = remote_path.into();
        let storage_path = storage_path.into();
        if !remote_path.exists() {
            return Err(Error::Config(format!(
                "non-existent repository path: {}",
                remote_path.display()
            )));
        }
        if !storage_path.exists() {
            return Err(Error::Config(format!(
                "non-existent image storage path: {}",
                storage_path.display()
            )));
        }
        Ok(ImageCache {
            remote_path,
            storage_path,
            images: Vec::new(),
        })
    }

    /// Rebuilds the image list from both directories. A single image that
    /// fails to sync (unreadable hash file, permissions) is skipped with a
    /// warning rather than aborting the whole sync.
    pub fn sync(&mut self) {
        let mut names: Vec<String> = list_images(&self.storage_path).unwrap_or_default();
        names.extend(list_images(&self.remote_path).unwrap_or_default());
        names.sort();
        names.dedup();

        let mut images = Vec::with_capacity(names.len());
        for name in names {
            match self.sync_one(&name) {
                Ok(image) => images.push(image),
                Err(e) => plog_warn!("cache", "failed to sync image {name}: {e}"),
            }
        }
        self.images = images;
    }

    fn sync_one(&self, name: &str) -> Result<Image> {
        let local_path = self.storage_path.join(name);
        let remote_path = self.remote_path.join(name);
        let local_exists = local_path.is_file();
        let remote_exists = remote_path.is_file();

        let mut local_hash = if local_exists { read_hash_file(&local_path) } else { None };
        let remote_hash = if remote_exists { read_hash_file(&remote_path) } else { None };

        if local_exists && local_hash.is_none() {
            let computed = sha256_file(&local_path)?;
            write_hash_file(&local_path, &computed)?;
            local_hash = Some(computed);
        }

        Ok(Image {
            name: name.to_string(),
            remote_path: remote_exists.then_some(remote_path),
            local_path: local_exists.then_some(local_path),
            remote_hash,
            local_hash,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Image> {
        self.images.iter().find(|i| i.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn all(&self) -> &[Image] {
        &self.images
    }

    fn free_storage(&self) -> Result<u64> {
        Ok(fs2::available_space(&self.storage_path)?)
    }

    /// Evicts locally cached images, largest first, until more than
    /// `required_free` bytes are free or there's nothing left to evict.
    /// Images named in `disallowed` are never evicted, even if evicting
    /// everything else still leaves the cache short of `required_free`.
    ///
    /// Feasibility is checked up front: if the evictable images couldn't
    /// reach `required_free` even if all of them were deleted, nothing is
    /// deleted at all.
    pub fn shrink(&mut self, required_free: u64, disallowed: &[&str]) -> Result<bool> {
        let free_space = self.free_storage()?;

        let mut candidates: Vec<usize> = self
            .images
            .iter()
            .enumerate()
            .filter(|(_, img)| img.available_local() && !disallowed.contains(&img.name.as_str()))
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by_key(|&i| std::cmp::Reverse(self.images[i].size().unwrap_or(0)));

        let shrinkable: u64 = candidates.iter().map(|&i| self.images[i].size().unwrap_or(0)).sum();
        if free_space + shrinkable < required_free {
            return Ok(false);
        }

        let mut free_space = free_space;
        for idx in candidates {
            let size = self.images[idx].size().unwrap_or(0);
            self.images[idx].delete_local()?;
            free_space += size;
            if free_space > required_free {
                break;
            }
        }

        Ok(free_space > required_free)
    }

    /// Pulls `name` from the remote directory into the local cache,
    /// evicting other cached images if necessary and permitted. After the
    /// copy, the freshly written file is re-hashed and compared against the
    /// sidecar hash recorded for the remote copy; a mismatch removes the
    /// just-written file and fails with `Error::Integrity` rather than
    /// leaving a corrupt image marked as cached.
    pub fn pull(
        &mut self,
        name: &str,
        force: bool,
        allow_deletion: bool,
        disallowed: &[&str],
    ) -> Result<()> {
        let idx = self
            .images
            .iter()
            .position(|i| i.name == name)
            .ok_or_else(|| Error::Resolution(format!("image {name} unavailable in repo")))?;

        if !self.images[idx].available_remote() {
            return Err(Error::Resolution(format!("image {name} unavailable in repo")));
        }

        if self.images[idx].available_local() {
            if !self.images[idx].outdated() && !force {
                return Ok(());
            }
            self.images[idx].delete_local()?;
        }

        let remote_path = self.images[idx].remote_path.clone().unwrap();
        let remote_hash = self.images[idx].remote_hash.clone();
        let image_size = fs::metadata(&remote_path)?.len();

        let free_space = self.free_storage()?;
        if free_space < image_size {
            if !allow_deletion || !self.shrink(image_size, disallowed)? {
                return Err(Error::Resource(format!(
                    "insufficient storage space to save image {name}"
                )));
            }
        }

        let destination = self.storage_path.join(name);
        fs::copy(&remote_path, &destination)?;

        let computed = sha256_file(&destination)?;
        if let Some(expected) = &remote_hash {
            if &computed != expected {
                fs::remove_file(&destination)?;
                return Err(Error::Integrity {
                    name: name.to_string(),
                    expected: expected.clone(),
                    computed,
                });
            }
        }
        write_hash_file(&destination, &computed)?;

        self.images[idx].local_path = Some(destination);
        self.images[idx].local_hash = Some(computed);
        Ok(())
    }

    /// Removes an image from local storage without requiring a subsequent
    /// pull to happen; distinct from the eviction performed by `shrink`
    /// in that it's explicit rather than space-driven.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        let idx = self
            .images
            .iter()
            .position(|i| i.name == name)
            .ok_or_else(|| Error::Resolution(format!("image {name} unavailable in repo")))?;
        self.images[idx].delete_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(path: &Path, contents: &[u8]) {
        let mut f = fs::File::create(path).unwrap();
        f.write_all(contents).unwrap();
    }

    #[test]
    fn sync_discovers_remote_and_local_images() {
        let remote = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        write_file(&remote.path().join("base.img"), b"remote-bytes");

        let mut cache = ImageCache::new(remote.path(), storage.path()).unwrap();
        cache.sync();

        let image = cache.get("base.img").unwrap();
        assert!(image.available_remote());
        assert!(!image.available_local());
    }

    #[test]
    fn pull_copies_and_hashes_then_resync_sees_local() {
        let remote = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        write_file(&remote.path().join("base.img"), b"remote-bytes");

        let mut cache = ImageCache::new(remote.path(), storage.path()).unwrap();
        cache.sync();
        cache.pull("base.img", false, true, &[]).unwrap();

        let image = cache.get("base.img").unwrap();
        assert!(image.available_local());
        assert!(!image.outdated());
        assert!(storage.path().join("base.img.sha256").exists());
    }

    #[test]
    fn pull_is_a_noop_when_already_current() {
        let remote = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        write_file(&remote.path().join("base.img"), b"remote-bytes");

        let mut cache = ImageCache::new(remote.path(), storage.path()).unwrap();
        cache.sync();
        cache.pull("base.img", false, true, &[]).unwrap();
        // Pulling again without force should not error and should leave
        // the local copy untouched.
        cache.pull("base.img", false, true, &[]).unwrap();
        assert!(cache.get("base.img").unwrap().available_local());
    }

    #[test]
    fn pull_unknown_image_is_a_resolution_error() {
        let remote = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        let mut cache = ImageCache::new(remote.path(), storage.path()).unwrap();
        cache.sync();
        let err = cache.pull("nope.img", false, true, &[]).unwrap_err();
        assert!(matches!(err, Error::Resolution(_)));
    }

    #[test]
    fn shrink_evicts_largest_first_and_protects_disallowed() {
        let remote = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        write_file(&remote.path().join("small.img"), &vec![0u8; 10]);
        write_file(&remote.path().join("big.img"), &vec![0u8; 100]);

        let mut cache = ImageCache::new(remote.path(), storage.path()).unwrap();
        cache.sync();
        cache.pull("small.img", false, true, &[]).unwrap();
        cache.pull("big.img", false, true, &[]).unwrap();

        // Ask for just a little more than what's already free; evicting
        // big.img alone covers it, so small.img should survive untouched.
        let free = fs2::available_space(storage.path()).unwrap();
        let freed = cache.shrink(free + 50, &["small.img"]).unwrap();
        assert!(freed, "evicting big.img should clear the requested headroom");
        assert!(!cache.get("big.img").unwrap().available_local());
        assert!(cache.get("small.img").unwrap().available_local());
    }

    #[test]
    fn shrink_is_infeasible_without_deleting_anything() {
        let remote = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        write_file(&remote.path().join("small.img"), &vec![0u8; 10]);
        write_file(&remote.path().join("big.img"), &vec![0u8; 100]);

        let mut cache = ImageCache::new(remote.path(), storage.path()).unwrap();
        cache.sync();
        cache.pull("small.img", false, true, &[]).unwrap();
        cache.pull("big.img", false, true, &[]).unwrap();

        // Disallowing small.img leaves only 100 evictable bytes, nowhere
        // near enough to reach an effectively unbounded requirement; the
        // upfront feasibility check should refuse without evicting big.img.
        let freed = cache.shrink(u64::MAX, &["small.img"]).unwrap();
        assert!(!freed, "can't free unbounded space while small.img is protected");
        assert!(cache.get("big.img").unwrap().available_local(), "infeasible shrink must not delete anything");
        assert!(cache.get("small.img").unwrap().available_local());
    }

    #[test]
    fn delete_removes_local_copy_but_not_remote() {
        let remote = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        write_file(&remote.path().join("base.img"), b"remote-bytes");

        let mut cache = ImageCache::new(remote.path(), storage.path()).unwrap();
        cache.sync();
        cache.pull("base.img", false, true, &[]).unwrap();
        cache.delete("base.img").unwrap();

        let image = cache.get("base.img").unwrap();
        assert!(!image.available_local());
        assert!(image.available_remote());
    }
}
