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

//! Parses the progress lines `ocs-sr` writes to stdout while cloning a
//! partition, e.g.:
//!
//! ```text
//! Elapsed: 00:00:12 | Remaining: 00:01:03 | Completed: 15.2% ... 1.3GB/min
//! current block: 12,345 total block: 98,765 ... Complete: 16.0%
//! ```
//!
//! A line missing any of the expected fields simply isn't progress output
//! (banner text, warnings) and is ignored rather than treated as an error.

use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ANSI_ESCAPE: Regex = Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").unwrap();
    static ref ELAPSED: Regex = Regex::new(r"Elapsed: ([\d:]+)").unwrap();
    static ref REMAINING: Regex = Regex::new(r"Remaining: ([\d:]+)").unwrap();
    static ref COMPLETED: Regex = Regex::new(r"Completed: +([\d.]+)%").unwrap();
    static ref RATE: Regex = Regex::new(r"([\d.]+)GB/min").unwrap();
    static ref CURRENT_BLOCK: Regex = Regex::new(r"current block: +([\d,]+)").unwrap();
    static ref TOTAL_BLOCK: Regex = Regex::new(r"total block: +([\d,]+)").unwrap();
    static ref COMPLETE_BLOCK: Regex = Regex::new(r"Complete: +([\d.]+)%").unwrap();
}

/// Strips ANSI escape sequences (`ocs-sr` colors its output) and trims
/// whitespace, leaving output suitable both for regex matching and for
/// re-displaying in a non-interactive log.
pub fn strip_ansi(line: &str) -> String {
    ANSI_ESCAPE.replace_all(line, "").trim().to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloneProgress {
    pub elapsed: Duration,
    pub remaining: Duration,
    pub completed_pct: f64,
    pub rate_gb_per_min: f64,
    pub current_block: u64,
    pub total_block: u64,
    pub complete_pct: f64,
}

impl CloneProgress {
    /// `ocs-sr` reports 100% completion, then spends additional time
    /// flushing buffers and updating the partition table before exiting.
    /// Callers use this to switch their status line from "cloning" to
    /// "cleaning up" without waiting for the process to actually exit.
    pub fn is_finalizing(&self) -> bool {
        self.complete_pct >= 100.0
    }
}

fn parse_hms(s: &str) -> Option<Duration> {
    let mut parts = s.splitn(3, ':');
    let h: u64 = parts.next()?.parse().ok()?;
    let m: u64 = parts.next()?.parse().ok()?;
    let sec: u64 = parts.next()?.parse().ok()?;
    Some(Duration::from_secs(h * 3600 + m * 60 + sec))
}

/// Attempts to parse a single line of `ocs-sr` output as a progress update.
/// Returns `None` for any line that doesn't carry the full set of fields
/// (anything other than an actual progress line).
pub fn parse_line(line: &str) -> Option<CloneProgress> {
    let line = strip_ansi(line);

    let elapsed = parse_hms(ELAPSED.captures(&line)?.get(1)?.as_str())?;
    let remaining = parse_hms(REMAINING.captures(&line)?.get(1)?.as_str())?;
    let completed_pct: f64 = COMPLETED.captures(&line)?.get(1)?.as_str().parse().ok()?;
    let rate_gb_per_min: f64 = RATE.captures(&line)?.get(1)?.as_str().parse().ok()?;
    let current_block: u64 = CURRENT_BLOCK
        .captures(&line)?
        .get(1)?
        .as_str()
        .replace(',', "")
        .parse()
        .ok()?;
    let total_block: u64 = TOTAL_BLOCK
        .captures(&line)?
        .get(1)?
        .as_str()
        .replace(',', "")
        .parse()
        .ok()?;
    let complete_pct: f64 = COMPLETE_BLOCK.captures(&line)?.get(1)?.as_str().parse().ok()?;

    Some(CloneProgress {
        elapsed,
        remaining,
        completed_pct,
        rate_gb_per_min,
        current_block,
        total_block,
        complete_pct,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_progress_line() {
        let line = "Elapsed: 00:00:12 | Remaining: 00:01:03 | Completed: 15.2% | 1.30GB/min | \
                     current block: 12,345 total block: 98,765 Complete: 16.0%";
        let progress = parse_line(line).unwrap();
        assert_eq!(progress.elapsed, Duration::from_secs(12));
        assert_eq!(progress.remaining, Duration::from_secs(63));
        assert_eq!(progress.completed_pct, 15.2);
        assert_eq!(progress.rate_gb_per_min, 1.30);
        assert_eq!(progress.current_block, 12345);
        assert_eq!(progress.total_block, 98765);
        assert_eq!(progress.complete_pct, 16.0);
        assert!(!progress.is_finalizing());
    }

    #[test]
    fn non_progress_line_is_none() {
        assert!(parse_line("Starting Clonezilla image restoring...").is_none());
    }

    #[test]
    fn strips_ansi_color_codes() {
        let colored = "\x1b[1;32mComplete: 100.0%\x1b[0m";
        assert_eq!(strip_ansi(colored), "Complete: 100.0%");
    }

    #[test]
    fn hundred_percent_is_finalizing() {
        let line = "Elapsed: 00:05:00 | Remaining: 00:00:00 | Completed: 100.0% | 0.50GB/min | \
                     current block: 98,765 total block: 98,765 Complete: 100.0%";
        let progress = parse_line(line).unwrap();
        assert!(progress.is_finalizing());
    }
}
