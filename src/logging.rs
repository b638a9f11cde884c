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

//! Minimal structured logging.
//!
//! There is no interactive TUI in this crate (the picker, progress bars and
//! status line are the bootstrap script's job), but operations still need
//! to report what they're doing. These macros are thin `println!`/`eprintln!`
//! wrappers that prefix every line with the component that emitted it, so
//! output stays greppable without pulling in a logging framework.

/// Logs an informational line to stdout, tagged with the emitting component.
#[macro_export]
macro_rules! plog_info {
    ($tag:expr, $($arg:tt)*) => {
        println!("[{}] {}", $tag, format_args!($($arg)*))
    };
}

/// Logs a warning line to stderr, tagged with the emitting component.
#[macro_export]
macro_rules! plog_warn {
    ($tag:expr, $($arg:tt)*) => {
        eprintln!("[{}] WARNING: {}", $tag, format_args!($($arg)*))
    };
}
