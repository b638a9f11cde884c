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

#[macro_use]
pub mod logging;

pub mod archive;
pub mod blockdev;
pub mod cache;
pub mod cmdline;
pub mod compiler;
pub mod config;
pub mod errors;
pub mod executor;
pub mod ocs;
pub mod progress;
pub mod recipe;
pub mod repository;
pub mod run;
pub mod util;
pub mod volumes;
