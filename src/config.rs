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

//! Composition-wide configuration: the interpreted `META/misc_info.txt`
//! dictionary, and the options record a caller builds up from the CLI
//! (spec.md §6.4) and passes into the composer by reference (spec.md §9,
//! "Dynamic options object").

use std::collections::{BTreeMap, HashSet};

use crate::diff::{DEFAULT_PATCH_THRESHOLD, DEFAULT_WORKER_THREADS};
use crate::image::FirmwareUpdateImage;

fn is_truthy(value: Option<&String>) -> bool {
    matches!(value.map(|s| s.as_str()), Some("1") | Some("true") | Some("yes"))
}

/// The subset of `META/misc_info.txt` the core reads (spec.md §6.1).
#[derive(Debug, Clone)]
pub struct MiscInfo {
    pub recovery_api_version: Option<u32>,
    pub default_system_dev_certificate: Option<String>,
    pub intel_capsule: bool,
    pub intel_ulpmc: bool,
    pub intel_chaabi_token: bool,
    pub do_partitioning: bool,
    pub bios_type: Option<String>,
    pub has_silentlake: bool,
    pub tool_extensions: Option<String>,
    /// The full parsed dictionary, kept around for per-partition lookups
    /// (`<name>_size`) that aren't worth promoting to a named field.
    raw: BTreeMap<String, String>,
}

impl MiscInfo {
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        Self {
            recovery_api_version: map.get("recovery_api_version").and_then(|v| v.parse().ok()),
            default_system_dev_certificate: map.get("default_system_dev_certificate").cloned(),
            intel_capsule: is_truthy(map.get("intel_capsule")),
            intel_ulpmc: is_truthy(map.get("intel_ulpmc")),
            intel_chaabi_token: is_truthy(map.get("intel_chaabi_token")),
            do_partitioning: is_truthy(map.get("do_partitioning")),
            bios_type: map.get("bios_type").cloned(),
            has_silentlake: is_truthy(map.get("has_silentlake")),
            tool_extensions: map.get("tool_extensions").cloned(),
            raw: map.clone(),
        }
    }

    pub fn is_iafw(&self) -> bool {
        self.bios_type.as_deref() == Some("iafw")
    }

    /// The declared size limit, in bytes, for the named image's partition
    /// (`<name>_size` in `misc_info.txt`), if the build declares one.
    /// Backs `check_size` (spec.md §7's `SizeViolation` kind).
    pub fn partition_size_limit(&self, name: &str) -> Option<u64> {
        self.raw.get(&format!("{name}_size")).and_then(|v| v.trim().parse().ok())
    }

    pub fn firmware_update_image(&self) -> FirmwareUpdateImage {
        if self.intel_capsule {
            FirmwareUpdateImage::Capsule
        } else {
            FirmwareUpdateImage::Ifwi
        }
    }

    /// Masks every Intel-specific extension field, used when the CLI's
    /// `--intel_ota` gate is off even though the archive's
    /// `misc_info.txt` carries Intel keys (spec.md §6.4 lists the flag
    /// without describing its effect; we treat it as the on/off switch
    /// for the Intel-only ordering steps spec.md §4.5 names).
    pub fn without_intel_extensions(mut self) -> Self {
        self.intel_capsule = false;
        self.intel_ulpmc = false;
        self.intel_chaabi_token = false;
        self.do_partitioning = false;
        self.bios_type = None;
        self.has_silentlake = false;
        self
    }
}

/// Configuration for one composition run, built by the CLI layer from flags
/// and environment (spec.md §6.4) and passed by reference into the
/// composer -- never a process-global singleton.
#[derive(Debug, Clone)]
pub struct CompositionOptions {
    pub package_key: String,
    pub package_key_passphrase: String,
    pub wipe_user_data: bool,
    pub no_prereq: bool,
    pub extra_script: Option<String>,
    pub worker_threads: usize,
    pub patch_threshold: f64,
    pub require_verbatim: HashSet<String>,
    pub prohibit_verbatim: HashSet<String>,
    /// Paths the diff planner skips entirely, always sending them verbatim
    /// (supplement to spec.md §4.3, populated by the device-specific
    /// extension hook rather than invented configuration).
    pub exclude_patch_paths: HashSet<String>,
    /// ASLR retouch emission gate (spec.md §9): the capability is retained
    /// in the DSL vocabulary but, per the current default, never emitted.
    pub retouch_aslr: bool,
    /// Gates `misc_info.txt`'s Intel-specific fields (spec.md §6.4's
    /// `--intel_ota` flag). Off by default: an AOSP-style build's
    /// `misc_info.txt` may carry stray Intel keys that should be ignored.
    pub intel_ota: bool,
}

impl Default for CompositionOptions {
    fn default() -> Self {
        Self {
            package_key: String::new(),
            package_key_passphrase: String::new(),
            wipe_user_data: false,
            no_prereq: false,
            extra_script: None,
            worker_threads: DEFAULT_WORKER_THREADS,
            patch_threshold: DEFAULT_PATCH_THRESHOLD,
            require_verbatim: HashSet::new(),
            prohibit_verbatim: HashSet::new(),
            exclude_patch_paths: HashSet::new(),
            retouch_aslr: false,
            intel_ota: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn misc_info_reads_known_keys() {
        let mut map = BTreeMap::new();
        map.insert("intel_capsule".to_string(), "1".to_string());
        map.insert("bios_type".to_string(), "iafw".to_string());
        map.insert("do_partitioning".to_string(), "0".to_string());
        let info = MiscInfo::from_map(&map);
        assert!(info.intel_capsule);
        assert!(info.is_iafw());
        assert!(!info.do_partitioning);
        assert!(matches!(info.firmware_update_image(), FirmwareUpdateImage::Capsule));
    }

    #[test]
    fn firmware_image_defaults_to_ifwi() {
        let info = MiscInfo::from_map(&BTreeMap::new());
        assert!(matches!(info.firmware_update_image(), FirmwareUpdateImage::Ifwi));
    }

    #[test]
    fn partition_size_limit_reads_declared_key() {
        let mut map = BTreeMap::new();
        map.insert("boot_size".to_string(), "8388608".to_string());
        let info = MiscInfo::from_map(&map);
        assert_eq!(info.partition_size_limit("boot"), Some(8_388_608));
        assert_eq!(info.partition_size_limit("recovery"), None);
    }
}
