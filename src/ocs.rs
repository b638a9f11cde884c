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

//! Wraps `/usr/sbin/ocs-sr`, the block-level partition cloning engine, and
//! the `mkfs.*` family used to format volumes.
//!
//! Both are invoked as external processes with fixed, non-interactive
//! flags; this module's job is building the right argument list, streaming
//! output as it's produced (cloning a large partition can take tens of
//! minutes, so the whole point is to not buffer it), and turning a non-zero
//! exit into a typed [`Error::External`].

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result as AnyResult};

use crate::blockdev::{Partition, TempMount};
use crate::errors::{Error, Result};
use crate::progress::{parse_line, strip_ansi};

const OCS_SR_PATH: &str = "/usr/sbin/ocs-sr";
const PARTS_SIDECAR: &str = "parts";

/// The outcome of reading an image's `parts` sidecar file: the set of
/// partition names the image contains, in declaration order.
fn read_parts_file(image_root: &Path) -> AnyResult<Vec<String>> {
    let parts_path = image_root.join(PARTS_SIDECAR);
    if !parts_path.is_file() {
        bail!(
            "could not find image parts definition at {}; image may be corrupted",
            parts_path.display()
        );
    }
    let contents = std::fs::read_to_string(&parts_path)
        .with_context(|| format!("reading {}", parts_path.display()))?;
    Ok(contents
        .split_whitespace()
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .collect())
}

/// Clones `image_volume` (or the image's sole partition, if it only has
/// one) from `image_path` onto `target`.
///
/// The image is mounted read-only as a loopback-style container; its
/// `parts` sidecar lists the partitions it holds. `ocs-sr` is invoked in
/// restore-parts mode against that mount, writing progress lines that are
/// forwarded to `on_progress` as they arrive.
pub fn deploy(
    image_path: &Path,
    target: &mut Partition,
    image_volume: Option<&str>,
    mut on_progress: impl FnMut(&str),
) -> Result<()> {
    if target.is_mounted() {
        target.umount()?;
    }

    let mount = TempMount::mount(image_path.to_str().ok_or_else(|| {
        Error::Resource(format!("non-UTF-8 image path: {}", image_path.display()))
    })?)
    .map_err(anyhow_to_error)?;

    let all_parts = read_parts_file(mount.path()).map_err(anyhow_to_error)?;
    if all_parts.is_empty() {
        return Err(Error::Resolution(
            "image does not contain any restorable partitions".into(),
        ));
    }
    if all_parts.len() > 1 && image_volume.is_none() {
        return Err(Error::Resolution(
            "image contains multiple partitions; a source partition must be specified".into(),
        ));
    }
    let source_part = match image_volume {
        Some(p) => {
            if !all_parts.iter().any(|p2| p2 == p) {
                return Err(Error::Resolution(format!(
                    "image does not contain a partition called {p}, available: {}",
                    all_parts.join(" ")
                )));
            }
            p.to_string()
        }
        None => all_parts[0].clone(),
    };

    run_restoreparts(mount.path(), &source_part, &target.path, &mut on_progress)
}

fn run_restoreparts(
    mount_path: &Path,
    source_part: &str,
    target_device: &str,
    on_progress: &mut impl FnMut(&str),
) -> Result<()> {
    let source_dir = mount_path
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| Error::Resource("mount point has no basename".into()))?;
    let root_dir = mount_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"));
    let target_basename = Path::new(target_device)
        .file_name()
        .ok_or_else(|| Error::Resource(format!("invalid target device path: {target_device}")))?;

    let mut cmd = Command::new(OCS_SR_PATH);
    cmd.arg("-e1")
        .arg("auto")
        .arg("-e2")
        .arg("-t")
        .arg("-r")
        .arg("-k")
        .arg("-scr")
        .arg("-nogui")
        .arg("-or")
        .arg(&root_dir)
        .arg("-f")
        .arg(source_part)
        .arg("restoreparts")
        .arg(&source_dir)
        .arg(target_basename)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    run_streaming(&mut cmd, on_progress)
}

/// Runs `cmd`, forwarding each line of combined stdout/stderr to
/// `on_progress` as it arrives rather than buffering the whole run.
fn run_streaming(cmd: &mut Command, on_progress: &mut impl FnMut(&str)) -> Result<()> {
    let cmdline = format!("{cmd:?}");
    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Io(format!("spawning {cmdline}: {e}")))?;

    let stdout = child.stdout.take();
    if let Some(stdout) = stdout {
        for line in BufReader::new(stdout).lines().map_while(std::result::Result::ok) {
            on_progress(&strip_ansi(&line));
        }
    }

    let status = child
        .wait()
        .map_err(|e| Error::Io(format!("waiting for {cmdline}: {e}")))?;
    if !status.success() {
        let mut stderr_tail = String::new();
        if let Some(mut stderr) = child.stderr.take() {
            use std::io::Read;
            let _ = stderr.read_to_string(&mut stderr_tail);
        }
        return Err(Error::external(cmdline, status, stderr_tail.as_bytes()));
    }
    Ok(())
}

fn anyhow_to_error(e: anyhow::Error) -> Error {
    Error::from(e)
}

/// Per-filesystem non-interactive `mkfs` flags. `-F`/`-f` forces creation
/// without prompting even when the target looks like it already holds a
/// filesystem, which is always true here since formatting only ever
/// targets an existing partition.
const MKFS_FORCE_FLAG: &[(&str, &str)] = &[
    ("ext2", "-F"),
    ("ext3", "-F"),
    ("ext4", "-F"),
    ("xfs", "-f"),
    ("btrfs", "-f"),
    ("vfat", "-I"),
];

/// Filesystem types this core knows how to format, in the order checked.
/// Kept separate from [`MKFS_FORCE_FLAG`] so the compiler can validate a
/// `FORMAT` instruction's fstype without needing to know the flag.
pub const MKFS_FILESYSTEMS: &[&str] = &["ext2", "ext3", "ext4", "xfs", "btrfs", "vfat"];

pub fn format_partition(fstype: &str, device_path: &str) -> Result<()> {
    let flag = MKFS_FORCE_FLAG
        .iter()
        .find(|(fs, _)| *fs == fstype)
        .map(|(_, flag)| *flag)
        .ok_or_else(|| Error::Resolution(format!("unsupported filesystem: {fstype}")))?;

    which::which(format!("mkfs.{fstype}"))
        .map_err(|_| Error::Resource(format!("mkfs.{fstype} not found on PATH")))?;

    let mut cmd = Command::new(format!("mkfs.{fstype}"));
    cmd.arg(flag).arg(device_path);
    crate::util::run_external(&mut cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_file_splits_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PARTS_SIDECAR), "sda1 sda2\nsda3\n").unwrap();
        let parts = read_parts_file(dir.path()).unwrap();
        assert_eq!(parts, vec!["sda1", "sda2", "sda3"]);
    }

    #[test]
    fn missing_parts_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_parts_file(dir.path()).is_err());
    }

    #[test]
    fn format_partition_rejects_unknown_filesystem() {
        let err = format_partition("zfs", "/dev/sda1").unwrap_err();
        assert!(matches!(err, Error::Resolution(_)));
    }

    #[test]
    fn progress_lines_round_trip_through_parser() {
        let line = "Elapsed: 00:00:05 | Remaining: 00:00:55 | Completed: 8.0% | 2.00GB/min | \
                     current block: 1,000 total block: 12,500 Complete: 8.0%";
        assert!(parse_line(line).is_some());
    }
}
