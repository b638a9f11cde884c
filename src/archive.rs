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

//! Archive extraction for `UNPACK` recipe steps.
//!
//! Format is determined purely by file extension, matched longest-suffix
//! first so `.tar.gz` isn't mistaken for a bare `.gz`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{anyhow, Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Zip,
    Tar,
    TarGz,
    TarBz2,
    TarXz,
}

/// Extensions recognized for `UNPACK`, longest suffix first so
/// `.tar.gz`/`.tar.bz2`/`.tar.xz` are checked before the bare `.gz`
/// equivalents they'd otherwise be confused with.
const FORMATS: &[(&str, Format)] = &[
    (".tar.gz", Format::TarGz),
    (".tar.bz2", Format::TarBz2),
    (".tar.xz", Format::TarXz),
    (".tgz", Format::TarGz),
    (".tbz2", Format::TarBz2),
    (".txz", Format::TarXz),
    (".tar", Format::Tar),
    (".zip", Format::Zip),
];

pub fn detect(name: &str) -> Option<Format> {
    let lower = name.to_ascii_lowercase();
    FORMATS
        .iter()
        .find(|(suffix, _)| lower.ends_with(suffix))
        .map(|(_, fmt)| *fmt)
}

/// Extracts `archive` into `dest`, which must already exist.
pub fn extract(archive: &Path, format: Format, dest: &Path) -> Result<()> {
    match format {
        Format::Zip => extract_zip(archive, dest),
        Format::Tar => extract_tar(Box::new(BufReader::new(open(archive)?)), dest),
        Format::TarGz => {
            let decoder = flate2::read::GzDecoder::new(open(archive)?);
            extract_tar(Box::new(decoder), dest)
        }
        Format::TarBz2 => {
            let decoder = bzip2::read::BzDecoder::new(open(archive)?);
            extract_tar(Box::new(decoder), dest)
        }
        Format::TarXz => {
            let decoder = xz2::read::XzDecoder::new(open(archive)?);
            extract_tar(Box::new(decoder), dest)
        }
    }
}

fn open(path: &Path) -> Result<File> {
    File::open(path).with_context(|| format!("opening archive {}", path.display()))
}

fn extract_tar(reader: Box<dyn std::io::Read>, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive
        .unpack(dest)
        .with_context(|| format!("extracting tar archive into {}", dest.display()))
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file = open(archive)?;
    let mut zip = zip::ZipArchive::new(file)
        .with_context(|| format!("reading zip archive {}", archive.display()))?;
    zip.extract(dest)
        .map_err(|e| anyhow!("extracting zip archive into {}: {e}", dest.display()))
}
