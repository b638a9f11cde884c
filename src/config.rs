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

//! Kernel command-line configuration surface.
//!
//! `/proc/cmdline` is a flat bag of `key=value` (or bare-key) tokens; this
//! module turns it into one record with defaults applied, instead of
//! scattering `cmdline.get("...")` lookups across the core.

use std::collections::HashMap;
use std::fs;

use crate::errors::{Error, Result};

pub const DEFAULT_PORT: u16 = 2021;
const DEFAULT_REMOTE_MOUNTPOINT: &str = "/mnt/repo";
const DEFAULT_CACHE_MOUNTPOINT: &str = "/mnt/cache";
const DEFAULT_CACHE_LABEL: &str = "FAILRP_CACHE";

/// Raw view of the kernel command line: every `key=value` token, with
/// bare keys mapping to the literal string `"true"` and repeated keys
/// accumulating into a list, in the order encountered.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KernelCmdline {
    data: HashMap<String, Vec<String>>,
}

impl KernelCmdline {
    pub fn from_proc() -> Result<Self> {
        let raw = fs::read_to_string("/proc/cmdline")
            .map_err(|e| Error::Config(format!("reading /proc/cmdline: {e}")))?;
        Ok(Self::parse(&raw))
    }

    pub fn parse(raw: &str) -> Self {
        let mut data: HashMap<String, Vec<String>> = HashMap::new();
        for token in raw.trim().split_whitespace() {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (token.to_string(), "true".to_string()),
            };
            data.entry(key).or_default().push(value);
        }
        Self { data }
    }

    /// Returns the single value for `key`, or the last one if it was
    /// repeated (matching the Python original, which returns the whole
    /// list only when there's more than one value).
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.last()).map(String::as_str)
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.data.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }
}

/// Flat, defaulted view of the boot configuration recognized by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    pub host: String,
    pub port: u16,
    pub repo: String,
    pub remote_mountpoint: String,
    pub cache_mountpoint: String,
    pub cache_label: String,
}

impl BootConfig {
    pub fn from_cmdline(cmdline: &KernelCmdline) -> Result<Self> {
        let host = cmdline
            .get("host")
            .ok_or_else(|| Error::Config("missing required boot parameter: host".into()))?
            .to_string();
        let repo = cmdline
            .get("repo")
            .ok_or_else(|| Error::Config("missing required boot parameter: repo".into()))?
            .to_string();
        let port = match cmdline.get("port") {
            Some(p) => p
                .parse()
                .map_err(|_| Error::Config(format!("invalid port: {p}")))?,
            None => DEFAULT_PORT,
        };

        Ok(BootConfig {
            host,
            port,
            repo,
            remote_mountpoint: cmdline
                .get("remote_mountpoint")
                .unwrap_or(DEFAULT_REMOTE_MOUNTPOINT)
                .to_string(),
            cache_mountpoint: cmdline
                .get("cache_mountpoint")
                .unwrap_or(DEFAULT_CACHE_MOUNTPOINT)
                .to_string(),
            cache_label: cmdline
                .get("cache_label")
                .unwrap_or(DEFAULT_CACHE_LABEL)
                .to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_and_bare_keys() {
        let cl = KernelCmdline::parse("host=10.0.0.1 repo=/export/images quiet nomodeset");
        assert_eq!(cl.get("host"), Some("10.0.0.1"));
        assert_eq!(cl.get("repo"), Some("/export/images"));
        assert_eq!(cl.get("quiet"), Some("true"));
        assert!(cl.contains("nomodeset"));
        assert_eq!(cl.get("missing"), None);
    }

    #[test]
    fn repeated_keys_form_a_list() {
        let cl = KernelCmdline::parse("console=ttyS0 console=tty0");
        assert_eq!(cl.get_all("console"), &["ttyS0", "tty0"]);
        // get() returns the last value, matching the single-valued lookups
        // used for host/port/repo/etc.
        assert_eq!(cl.get("console"), Some("tty0"));
    }

    #[test]
    fn boot_config_applies_defaults() {
        let cl = KernelCmdline::parse("host=server repo=/srv/images");
        let cfg = BootConfig::from_cmdline(&cl).unwrap();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.remote_mountpoint, DEFAULT_REMOTE_MOUNTPOINT);
        assert_eq!(cfg.cache_mountpoint, DEFAULT_CACHE_MOUNTPOINT);
        assert_eq!(cfg.cache_label, DEFAULT_CACHE_LABEL);
    }

    #[test]
    fn boot_config_requires_host_and_repo() {
        let cl = KernelCmdline::parse("port=2021");
        assert!(BootConfig::from_cmdline(&cl).is_err());

        let cl = KernelCmdline::parse("host=server");
        assert!(BootConfig::from_cmdline(&cl).is_err());
    }

    #[test]
    fn boot_config_overrides_port() {
        let cl = KernelCmdline::parse("host=server repo=/srv port=9000");
        let cfg = BootConfig::from_cmdline(&cl).unwrap();
        assert_eq!(cfg.port, 9000);
    }
}
