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

//! Seams for the capabilities spec.md declares out of scope for the
//! composition engine itself: the binary-diff algorithm, the `fs_config`
//! metadata helper, the whole-archive signer, and the device-specific
//! extension hook. Each is a small trait with a default implementation that
//! shells out to an external helper process, following the same
//! `Command`-spawning idiom used elsewhere in this codebase (piped stdio,
//! inherited stderr, non-zero exit mapped to an error).

use std::process::Command;

use anyhow::{Context, Result};

use crate::error::OtaError;
use crate::script::InstallerScript;
use crate::util::cmd_pipe;

/// Computes a binary patch transforming `source` into `target`.
pub trait PatchEngine: Sync {
    fn compute_patch(&self, target: &[u8], source: &[u8]) -> Result<Vec<u8>>;
}

/// Resolves (uid, gid, mode) for archive paths when the archive doesn't
/// carry a `META/filesystem_config.txt`.
pub trait FsConfigHelper: Sync {
    /// `query` is one entry per known path, directories suffixed with `/`.
    /// Returns lines of `path uid gid octal_mode` in the same format.
    fn resolve(&self, query: &[String]) -> Result<Vec<crate::tree::FsConfigRecord>>;
}

/// Rewrites an archive in place with an appended whole-file signature.
pub trait ArchiveSigner: Sync {
    fn sign_whole_archive(&self, archive_path: &std::path::Path, key: &str, passphrase: &str) -> Result<()>;
}

/// Device-specific pre/post hooks spliced into the installer script around
/// the rest of the ordering contract.
pub trait DeviceExtensions {
    fn pre_hook(&self, script: &mut InstallerScript) -> Result<()> {
        let _ = script;
        Ok(())
    }
    fn post_hook(&self, script: &mut InstallerScript) -> Result<()> {
        let _ = script;
        Ok(())
    }
    /// Whether an `ifwi` image blob is considered meaningfully different from
    /// its source counterpart. `ifwi` images carry signing/versioning bytes
    /// a plain byte comparison shouldn't be fooled by; the default is a
    /// conservative byte comparison, which devices with a smarter firmware
    /// comparator can override.
    fn ifwi_differs(&self, source: &[u8], target: &[u8]) -> bool {
        source != target
    }
}

/// No-op hook set used when a device doesn't need one.
pub struct NullDeviceExtensions;
impl DeviceExtensions for NullDeviceExtensions {}

/// Invokes an external `bsdiff`-compatible binary-diff tool as a child
/// process: `<program> <source> <target> <patch>`.
pub struct ExternalPatchEngine {
    pub program: String,
}

impl ExternalPatchEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl PatchEngine for ExternalPatchEngine {
    fn compute_patch(&self, target: &[u8], source: &[u8]) -> Result<Vec<u8>> {
        let src_file = tempfile::NamedTempFile::new().context("creating source scratch file")?;
        let tgt_file = tempfile::NamedTempFile::new().context("creating target scratch file")?;
        let patch_file = tempfile::NamedTempFile::new().context("creating patch scratch file")?;
        std::fs::write(src_file.path(), source).context("writing source scratch file")?;
        std::fs::write(tgt_file.path(), target).context("writing target scratch file")?;
        let mut cmd = Command::new(&self.program);
        cmd.arg(src_file.path()).arg(tgt_file.path()).arg(patch_file.path());
        let status = cmd
            .status()
            .with_context(|| format!("running {:#?}", cmd))?;
        if !status.success() {
            return Err(OtaError::External(format!("{} exited with {}", self.program, status)).into());
        }
        std::fs::read(patch_file.path()).context("reading patch scratch file")
    }
}

/// Invokes the `fs_config` helper program: one known path per line on
/// stdin (directories suffixed with `/`), matching records read back from
/// stdout.
pub struct ExternalFsConfigHelper {
    pub program: String,
}

impl ExternalFsConfigHelper {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl FsConfigHelper for ExternalFsConfigHelper {
    fn resolve(&self, query: &[String]) -> Result<Vec<crate::tree::FsConfigRecord>> {
        let mut input = String::new();
        for path in query {
            input.push_str(path);
            input.push('\n');
        }
        let mut cmd = Command::new(&self.program);
        let output = cmd_pipe(&mut cmd, input.as_bytes()).context("invoking fs_config helper")?;
        let text = String::from_utf8(output).context("decoding fs_config output as UTF-8")?;
        crate::tree::parse_filesystem_config(&text)
    }
}

/// A helper that always reports "no metadata known", for archives that
/// don't need one (tests, or all-metadata-present archives).
pub struct NullFsConfigHelper;
impl FsConfigHelper for NullFsConfigHelper {
    fn resolve(&self, _query: &[String]) -> Result<Vec<crate::tree::FsConfigRecord>> {
        Ok(Vec::new())
    }
}

/// Retrieves the passphrase protecting the package-signing private key
/// (spec.md §1: "does not manage key material beyond retrieving a
/// passphrase"). Checked in order: the `OTA_PACKAGE_KEY_PASSPHRASE`
/// environment variable, then a `<key>.pw` sidecar file next to the key
/// itself, falling back to an empty passphrase for unencrypted test keys.
pub fn load_package_key_passphrase(key: &str) -> Result<String> {
    if let Ok(value) = std::env::var("OTA_PACKAGE_KEY_PASSPHRASE") {
        return Ok(value);
    }
    let sidecar = format!("{key}.pw");
    match std::fs::read_to_string(&sidecar) {
        Ok(text) => Ok(text.trim_end_matches('\n').to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).with_context(|| format!("reading {sidecar}")),
    }
}

/// Invokes an external signing tool: `<program> <key> <archive>`, feeding
/// the passphrase on stdin, matching the Command-spawning/piped-stdio
/// pattern used for GPG invocations elsewhere in this codebase.
pub struct ExternalArchiveSigner {
    pub program: String,
}

impl ExternalArchiveSigner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ArchiveSigner for ExternalArchiveSigner {
    fn sign_whole_archive(&self, archive_path: &std::path::Path, key: &str, passphrase: &str) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-k").arg(key).arg(archive_path);
        cmd_pipe(&mut cmd, passphrase.as_bytes())
            .map(|_| ())
            .map_err(|e| OtaError::External(e.to_string()).into())
    }
}
