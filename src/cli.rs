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

//! CLI surface (spec.md §6.4, ambient C0). Parses flags with `clap`'s
//! derive API into `Cli`, then resolves them (plus the `OTA_ROLLBACK`
//! environment override) into a `CompositionOptions` the core consumes.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use crate::config::CompositionOptions;
use crate::diff::{DEFAULT_PATCH_THRESHOLD, DEFAULT_WORKER_THREADS};
use crate::external::load_package_key_passphrase;

/// Composes a signed OTA update package from one or two target-files
/// archives.
#[derive(Debug, Parser)]
#[clap(name = "ota_from_target_files", version, author, about)]
pub struct Cli {
    /// Path to the package-signing key (without its `.x509.pem`/`.pk8` suffix)
    #[clap(short = 'k', long = "package_key")]
    pub package_key: String,

    /// Generate an incremental OTA from this source target-files archive
    #[clap(short = 'i', long = "incremental_from")]
    pub incremental_from: Option<PathBuf>,

    /// Format /data on install, wiping all user data
    #[clap(short = 'w', long = "wipe_user_data")]
    pub wipe_user_data: bool,

    /// Skip the assert_older_build prerequisite check
    #[clap(short = 'n', long = "no_prereq")]
    pub no_prereq: bool,

    /// Path to a script fragment appended near the end of the installer script
    #[clap(short = 'e', long = "extra_script")]
    pub extra_script: Option<PathBuf>,

    /// Retouch binaries under lib/ to perturb ASLR layout
    #[clap(short = 'a', long = "aslr_mode", value_name = "on|off")]
    pub aslr_mode: Option<String>,

    /// Number of worker threads used to compute binary patches
    #[clap(long = "worker_threads", default_value_t = DEFAULT_WORKER_THREADS)]
    pub worker_threads: usize,

    /// Enable Intel-specific OTA extensions (chaabi token, ifwi/capsule, partitioning)
    #[clap(long = "intel_ota")]
    pub intel_ota: bool,

    /// Accepted and ignored, for compatibility with older callers
    #[clap(short = 'b', hide = true)]
    pub compat_b: Option<String>,

    /// Dump the metadata manifest as JSON to this path, for diagnostics
    #[clap(long = "dump_manifest")]
    pub dump_manifest: Option<PathBuf>,

    /// Input target-files archive (source when -i is also given: the target)
    pub target_files: PathBuf,

    /// Output OTA package path
    pub output_ota: PathBuf,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Builds the engine-facing options record (spec.md §9, "dynamic
    /// options object"), applying the `OTA_ROLLBACK=off` environment
    /// override.
    pub fn to_composition_options(&self) -> Result<CompositionOptions> {
        let extra_script = match &self.extra_script {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("reading extra script {}", path.display()))?,
            ),
            None => None,
        };
        let no_prereq =
            self.no_prereq || std::env::var("OTA_ROLLBACK").as_deref() == Ok("off");
        let package_key_passphrase = load_package_key_passphrase(&self.package_key)?;
        Ok(CompositionOptions {
            package_key: self.package_key.clone(),
            package_key_passphrase,
            wipe_user_data: self.wipe_user_data,
            no_prereq,
            extra_script,
            worker_threads: self.worker_threads.max(1),
            patch_threshold: DEFAULT_PATCH_THRESHOLD,
            require_verbatim: HashSet::new(),
            prohibit_verbatim: HashSet::new(),
            exclude_patch_paths: HashSet::new(),
            retouch_aslr: self.aslr_mode.as_deref() == Some("on"),
            intel_ota: self.intel_ota,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_full_ota_invocation() {
        let cli = Cli::parse_from([
            "ota_from_target_files",
            "-k",
            "keys/releasekey",
            "target-files.zip",
            "ota.zip",
        ]);
        assert_eq!(cli.package_key, "keys/releasekey");
        assert!(cli.incremental_from.is_none());
        assert_eq!(cli.worker_threads, DEFAULT_WORKER_THREADS);
    }

    #[test]
    fn parses_incremental_and_wipe_flags() {
        let cli = Cli::parse_from([
            "ota_from_target_files",
            "-k",
            "keys/releasekey",
            "-i",
            "source.zip",
            "-w",
            "target.zip",
            "ota.zip",
        ]);
        assert_eq!(cli.incremental_from, Some(PathBuf::from("source.zip")));
        assert!(cli.wipe_user_data);
    }

    #[test]
    fn accepts_and_ignores_legacy_b_flag() {
        let cli = Cli::parse_from([
            "ota_from_target_files",
            "-k",
            "keys/releasekey",
            "-b",
            "legacy-value",
            "target-files.zip",
            "ota.zip",
        ]);
        assert_eq!(cli.compat_b, Some("legacy-value".to_string()));
    }
}
