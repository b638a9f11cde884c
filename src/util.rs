// Copyright 2020 CoreOS, Inc.
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

use anyhow::{bail, Context, Result};
use openssl::sha::Sha256;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::Command;

use crate::errors::Error;

/// Runs the provided command. The first macro argument is the executable, and following arguments
/// are passed to the command. Returns a Result<()> describing whether the command failed. Errors
/// are adequately prefixed with the full command.
#[macro_export]
macro_rules! runcmd {
    ($cmd:expr) => (runcmd!($cmd,));
    ($cmd:expr, $($args:expr),*) => {{
        let mut cmd = std::process::Command::new($cmd);
        $( cmd.arg($args); )*
        let status = cmd.status().with_context(|| format!("running {:#?}", cmd))?;
        if !status.success() {
            anyhow::bail!("{:#?} failed with {}", cmd, status)
        } else {
            anyhow::Result::<()>::Ok(())
        }
    }}
}

/// Runs the provided command, captures its stdout, and swallows its stderr except on failure.
/// The first macro argument is the executable, and following arguments are passed to the command.
/// Returns a Result<String> describing whether the command failed, and if not, its standard
/// output. Output is assumed to be UTF-8. Errors are adequately prefixed with the full command.
#[macro_export]
macro_rules! runcmd_output {
    ($cmd:expr) => (runcmd_output!($cmd,));
    ($cmd:expr, $($args:expr),*) => {{
        let mut cmd = std::process::Command::new($cmd);
        $( cmd.arg($args); )*
        // NB: cmd_output already prefixes with cmd in all error paths
        $crate::util::cmd_output(&mut cmd)
    }}
}

/// Runs the provided Command object, captures its stdout, and swallows its stderr except on
/// failure. Returns a Result<String> describing whether the command failed, and if not, its
/// standard output. Output is assumed to be UTF-8. Errors are adequately prefixed with the full
/// command.
pub fn cmd_output(cmd: &mut Command) -> Result<String> {
    let result = cmd
        .output()
        .with_context(|| format!("running {:#?}", cmd))?;
    if !result.status.success() {
        eprint!("{}", String::from_utf8_lossy(&result.stderr));
        bail!("{:#?} failed with {}", cmd, result.status);
    }
    String::from_utf8(result.stdout)
        .with_context(|| format!("decoding as UTF-8 output of `{:#?}`", cmd))
}

/// Runs a command to completion and converts a non-zero exit into a typed
/// [`Error::External`], attaching stderr. Used by the external-tool adapters
/// (`mount`, `umount`, `mkfs.*`, `ocs-sr`) where the executor needs to
/// distinguish "external command failed" from other error kinds.
pub fn run_external(cmd: &mut Command) -> std::result::Result<(), Error> {
    let result = cmd
        .output()
        .map_err(|e| Error::Io(format!("running {cmd:#?}: {e}")))?;
    if !result.status.success() {
        return Err(Error::external(
            format!("{cmd:#?}"),
            result.status,
            &result.stderr,
        ));
    }
    Ok(())
}

/// Computes the hex-encoded SHA-256 digest of a file, reading it in fixed
/// blocks so hashing a large cached image doesn't require reading it
/// entirely into memory.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finish()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hashes_known_content() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"hello world").unwrap();
        let digest = sha256_file(f.path()).unwrap();
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn cmd_output_captures_stdout() {
        let mut cmd = Command::new("echo");
        cmd.arg("hi");
        assert_eq!(cmd_output(&mut cmd).unwrap().trim(), "hi");
    }

    #[test]
    fn run_external_reports_failure() {
        let mut cmd = Command::new("false");
        let err = run_external(&mut cmd).unwrap_err();
        assert!(matches!(err, Error::External { .. }));
    }
}
