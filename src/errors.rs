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

//! Error taxonomy for the provisioning core.
//!
//! Every fallible operation in the cache, resolver, compiler and executor
//! returns this crate's [`Result`]. Lower-level adapters (external-tool
//! invocation, HTTP) use `anyhow::Result` internally for context-rich
//! plumbing and convert to a specific [`Error`] variant at the boundary.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad kernel cmdline, missing required `host`/`repo`, malformed manifest.
    #[error("configuration error: {0}")]
    Config(String),

    /// Recipe syntax violation; carries the offending line number.
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Unknown image or volume name at compile time; unavailable volume;
    /// multi-part image without selector.
    #[error("{0}")]
    Resolution(String),

    /// Insufficient cache space after eviction attempt; missing partition;
    /// cache partition would be overwritten.
    #[error("{0}")]
    Resource(String),

    /// Hash mismatch of a pulled file against its sidecar.
    #[error("integrity error: {name}: expected {expected}, computed {computed}")]
    Integrity {
        name: String,
        expected: String,
        computed: String,
    },

    /// Non-zero exit from `mount`, `umount`, `mkfs.*`, `ocs-sr`, or `lsblk`.
    #[error("`{command}` failed with {status}{}", ExternalDetail(stderr))]
    External {
        command: String,
        status: String,
        stderr: Option<String>,
    },

    /// Unexpected read/write failures on the cache or mount points.
    #[error("I/O error: {0}")]
    Io(String),
}

/// Formats the optional stderr tail of an `External` error without forcing
/// every call site to pre-format the `": ..."` suffix.
struct ExternalDetail<'a>(&'a Option<String>);

impl fmt::Display for ExternalDetail<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(s) if !s.trim().is_empty() => write!(f, ": {}", s.trim()),
            _ => Ok(()),
        }
    }
}

impl Error {
    pub fn external(command: impl Into<String>, status: impl fmt::Display, stderr: &[u8]) -> Self {
        let stderr = String::from_utf8_lossy(stderr).trim().to_string();
        Error::External {
            command: command.into(),
            status: status.to_string(),
            stderr: if stderr.is_empty() { None } else { Some(stderr) },
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Io(format!("{e:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_without_stderr() {
        let err = Error::external("mount", "exit status: 1", b"");
        assert_eq!(err.to_string(), "`mount` failed with exit status: 1");
    }

    #[test]
    fn external_with_stderr() {
        let err = Error::external("mount", "exit status: 32", b"mount: special device not found\n");
        assert_eq!(
            err.to_string(),
            "`mount` failed with exit status: 32: mount: special device not found"
        );
    }
}
