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

//! Block-device inventory and mount management.
//!
//! Disks and partitions are enumerated by shelling out to `lsblk -J -b -p -n`
//! (machine-readable JSON) rather than linking against libblkid; mounting and
//! unmounting go through the `mount`/`umount` binaries rather than the
//! `mount(2)` syscall, matching the set of external binaries this system is
//! specified to invoke.

use anyhow::{anyhow, Context, Result as AnyResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::errors::{Error, Result};
use crate::util::run_external;

const LSBLK_COLUMNS: &str =
    "NAME,SIZE,RM,PARTUUID,UUID,FSTYPE,PARTLABEL,LABEL,MOUNTPOINT,TYPE,PARTN";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disk {
    pub path: String,
    pub size: u64,
    pub removable: bool,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub path: String,
    pub size: u64,
    pub removable: bool,
    pub partuuid: Option<String>,
    pub fsuuid: Option<String>,
    pub fstype: Option<String>,
    pub partlabel: Option<String>,
    pub fslabel: Option<String>,
    pub mountpoint: Option<String>,
    /// Partition number as reported by the kernel/lsblk (`PARTN`), used to
    /// bind volumes to partitions (see `crate::volumes`). Preferred over
    /// deriving the number from the device path, which is ambiguous between
    /// naming schemes like `sda3` and `nvme0n1p3`.
    pub partn: Option<u32>,
}

impl Disk {
    /// Enumerates every disk on the system, each with its child partitions.
    pub fn list_all() -> Result<Vec<Disk>> {
        let devices = lsblk(None)?;
        Ok(devices
            .into_iter()
            .filter(|d| d.kind.as_deref() == Some("disk"))
            .map(Disk::from_raw)
            .collect())
    }

    /// Enumerates a single disk by device path.
    pub fn from_device(path: &str) -> Result<Disk> {
        let devices = lsblk(Some(path))?;
        devices
            .into_iter()
            .find(|d| d.name == path && d.kind.as_deref() == Some("disk"))
            .map(Disk::from_raw)
            .ok_or_else(|| Error::Resource(format!("not a disk: {path}")))
    }

    fn from_raw(raw: RawDevice) -> Disk {
        let partitions = raw
            .children
            .iter()
            .filter(|c| c.kind.as_deref() == Some("part"))
            .map(|c| Partition::from_raw(c, &raw.name))
            .collect();
        Disk {
            path: raw.name,
            size: raw.size.unwrap_or(0),
            removable: raw.rm.unwrap_or(false),
            partitions,
        }
    }
}

impl Partition {
    fn from_raw(raw: &RawDevice, parent: &str) -> Partition {
        let partn = raw.partn.or_else(|| derive_partition_number(&raw.name, parent));
        Partition {
            path: raw.name.clone(),
            size: raw.size.unwrap_or(0),
            removable: raw.rm.unwrap_or(false),
            partuuid: raw.partuuid.clone(),
            fsuuid: raw.uuid.clone(),
            fstype: raw.fstype.clone(),
            partlabel: raw.partlabel.clone(),
            fslabel: raw.label.clone(),
            mountpoint: raw.mountpoint.clone(),
            partn,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mountpoint.is_some()
    }

    /// Sets the filesystem label via `e2label`. Only meaningful for
    /// ext2/3/4 filesystems, which is the only labeling tool this system
    /// invokes (mirrors the original's sole use of `e2label`).
    pub fn set_fslabel(&mut self, label: &str) -> Result<()> {
        let mut cmd = Command::new("e2label");
        cmd.arg(&self.path).arg(label);
        run_external(&mut cmd)?;
        self.fslabel = Some(label.to_string());
        Ok(())
    }

    pub fn mount(&mut self, mountpoint: &Path) -> Result<()> {
        let mut cmd = Command::new("mount");
        cmd.arg(&self.path).arg(mountpoint);
        run_external(&mut cmd)?;
        self.mountpoint = Some(mountpoint.display().to_string());
        Ok(())
    }

    pub fn umount(&mut self) -> Result<()> {
        if self.mountpoint.is_none() {
            return Ok(());
        }
        let mut cmd = Command::new("umount");
        cmd.arg(&self.path);
        run_external(&mut cmd)?;
        self.mountpoint = None;
        Ok(())
    }
}

/// Strips the disk-path prefix from a partition's device path and parses
/// whatever numeric suffix remains. Used only as a fallback when lsblk
/// doesn't report `PARTN` (older util-linux).
fn derive_partition_number(partition_path: &str, disk_path: &str) -> Option<u32> {
    let suffix = partition_path.strip_prefix(disk_path)?;
    let digits: String = suffix.chars().rev().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.chars().rev().collect::<String>().parse().ok()
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<RawDevice>,
}

#[derive(Debug, Deserialize)]
struct RawDevice {
    name: String,
    #[serde(default, deserialize_with = "de_opt_u64")]
    size: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_bool")]
    rm: Option<bool>,
    partuuid: Option<String>,
    uuid: Option<String>,
    fstype: Option<String>,
    partlabel: Option<String>,
    label: Option<String>,
    mountpoint: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default, deserialize_with = "de_opt_u32")]
    partn: Option<u32>,
    #[serde(default)]
    children: Vec<RawDevice>,
}

fn de_opt_u64<'de, D>(d: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<serde_json::Value>::deserialize(d)?.and_then(|v| match v {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }))
}

fn de_opt_u32<'de, D>(d: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<serde_json::Value>::deserialize(d)?.and_then(|v| match v {
        serde_json::Value::Number(n) => n.as_u64().map(|n| n as u32),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }))
}

fn de_opt_bool<'de, D>(d: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<serde_json::Value>::deserialize(d)?.and_then(|v| match v {
        serde_json::Value::Bool(b) => Some(b),
        serde_json::Value::String(s) => Some(s == "1" || s.eq_ignore_ascii_case("true")),
        serde_json::Value::Number(n) => n.as_u64().map(|n| n != 0),
        _ => None,
    }))
}

fn lsblk(device: Option<&str>) -> Result<Vec<RawDevice>> {
    let mut cmd = Command::new("lsblk");
    cmd.arg("-o").arg(LSBLK_COLUMNS).arg("-J").arg("-b").arg("-p").arg("-n");
    if let Some(dev) = device {
        cmd.arg(dev);
    }
    let output = cmd
        .output()
        .map_err(|e| Error::Io(format!("running lsblk: {e}")))?;
    if !output.status.success() {
        return Err(Error::external("lsblk", output.status, &output.stderr));
    }
    let parsed: LsblkOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| Error::Io(format!("parsing lsblk output: {e}")))?;
    Ok(parsed.blockdevices)
}

/// RAII guard around a freshly created, freshly mounted temporary directory.
/// Used by the executor for `COPY`/`UNPACK`/`DEPLOY` targets and image
/// containers: a recipe step mounts a filesystem just long enough to
/// perform its operation, and this guard guarantees the mount and the
/// directory are both cleaned up on every exit path, including one caused
/// by an error partway through the operation.
#[derive(Debug)]
pub struct TempMount {
    mountpoint: PathBuf,
}

impl TempMount {
    pub fn mount(device: &str) -> AnyResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("netprovision-")
            .tempdir()
            .context("creating temporary mount directory")?
            // take ownership so Drop order is unmount-then-rmdir, not the
            // other way around
            .into_path();
        let mut cmd = Command::new("mount");
        cmd.arg(device).arg(&dir);
        run_external(&mut cmd).map_err(|e| anyhow!(e))?;
        Ok(TempMount { mountpoint: dir })
    }

    pub fn path(&self) -> &Path {
        &self.mountpoint
    }
}

impl Drop for TempMount {
    fn drop(&mut self) {
        // Unmount sometimes fails immediately after closing the last open
        // file on the partition. Retry several times before giving up.
        for retries in (0..20).rev() {
            match Command::new("umount").arg(&self.mountpoint).status() {
                Ok(s) if s.success() => break,
                _ if retries == 0 => {
                    eprintln!("[blockdev] WARNING: failed to unmount {}", self.mountpoint.display());
                    return;
                }
                _ => std::thread::sleep(Duration::from_millis(100)),
            }
        }
        if let Err(err) = std::fs::remove_dir(&self.mountpoint) {
            eprintln!(
                "[blockdev] WARNING: removing {}: {}",
                self.mountpoint.display(),
                err
            );
        }
    }
}
