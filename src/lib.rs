// Copyright 2024 CoreOS, Inc.
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

//! Composes signed over-the-air (OTA) update packages from one or two
//! target-files archives: metadata inference and permission compaction
//! (`tree`), system tree loading (`loader`), incremental file diffing
//! (`diff`), bootable image planning (`image`), installer-script
//! generation (`script`), full/incremental orchestration (`compose`), and
//! archive assembly plus whole-file signing (`assemble`).

pub mod archive;
pub mod assemble;
pub mod blob;
pub mod buildinfo;
pub mod cli;
pub mod compose;
pub mod config;
pub mod diff;
pub mod error;
pub mod external;
pub mod image;
pub mod loader;
pub mod script;
pub mod tree;
pub mod util;

pub use error::OtaError;
