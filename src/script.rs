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

//! The device-side installer DSL: an append-only sequence of typed
//! primitives, plus the cumulative-progress accumulator that the ordering
//! contract in spec.md §4.5 is built out of.

use crate::error::OtaError;

/// One primitive of the installer script. Encoding to the on-device script
/// format is deliberately out of scope here (spec.md §1): this type is the
/// engine's contract with whatever renders it (shell script, binary
/// bytecode, …).
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    AssertDevice { models: Vec<String> },
    AssertCompatibleProduct { product: String },
    AssertOlderBuild { timestamp: u64 },
    AssertSomeFingerprint { source: String, target: String },
    Mount { path: String },
    Unmount { path: String },
    UnmountAll,
    FormatPartition { path: String },
    ShowProgress { fraction: f64, duration_secs: f64 },
    SetProgress { value: f64 },
    Print { text: String },
    Comment { text: String },
    PackageExtract { name: String },
    UnpackPackageDir { src: String, dst: String },
    DeleteFiles { paths: Vec<String> },
    DeleteTmpImage { name: String },
    ExtractImage { name: String },
    PatchCheck { path: String, target_sha1: String, source_sha1: String },
    CacheFreeSpaceCheck { bytes: u64 },
    ApplyPatch {
        path: String,
        target_size: u64,
        target_sha1: String,
        source_sha1: String,
        patch_path: String,
    },
    MakeSymlinks { links: Vec<(String, String)> },
    SetPerm { path: String, uid: u32, gid: u32, mode: u32 },
    SetPermRecursive { path: String, uid: u32, gid: u32, dmode: u32, fmode: u32 },
    FlashOsImage { name: String, partition: Option<String> },
    FlashImageAtOffset { name: String, byte_offset: u64 },
    FlashEspUpdate,
    FlashIfwi,
    FlashCapsule,
    FlashUlpmc,
    FlashPartitionScheme,
    FlashBomToken,
    InvalidateOs { name: String },
    RestoreOs { name: String },
    StartUpdate,
    FinalizeUpdate,
    AppendExtra { text: String },
    AppendScript { script: Vec<Primitive> },
    /// ASLR retouch of a `lib/` binary (spec.md §9): retained in the DSL
    /// vocabulary but only ever pushed when the caller's configuration
    /// turns retouching on (current default: never emit).
    Retouch { path: String, sha1: String },
}

/// Append-only accumulator of primitives, tracking cumulative progress.
#[derive(Debug, Default)]
pub struct InstallerScript {
    primitives: Vec<Primitive>,
    cur_progress: f64,
}

impl InstallerScript {
    pub fn new() -> Self {
        Self {
            primitives: Vec::new(),
            cur_progress: 0.0,
        }
    }

    pub fn cur_progress(&self) -> f64 {
        self.cur_progress
    }

    pub fn primitives(&self) -> &[Primitive] {
        &self.primitives
    }

    pub fn push(&mut self, primitive: Primitive) {
        self.primitives.push(primitive);
    }

    pub fn extend(&mut self, primitives: impl IntoIterator<Item = Primitive>) {
        self.primitives.extend(primitives);
    }

    /// Emits `show_progress` and advances the cumulative progress
    /// accumulator by `fraction`.
    pub fn show_progress(&mut self, fraction: f64, duration_secs: f64) {
        self.cur_progress += fraction;
        self.push(Primitive::ShowProgress {
            fraction,
            duration_secs,
        });
    }

    /// Splices a temporary sub-script into the main sequence, in order,
    /// without affecting `cur_progress` again (the sub-script's own
    /// `show_progress` calls, if any, already accounted for it when it was
    /// being built against a standalone accumulator -- see
    /// `InstallerScript::sub_script`).
    pub fn append_script(&mut self, sub: InstallerScript) {
        self.push(Primitive::AppendScript {
            script: sub.primitives,
        });
        self.cur_progress += sub.cur_progress;
    }

    /// Builds a detached sub-script sharing no state with `self`, used to
    /// materialize the permission phase early and splice it back in after
    /// symlinks are created (spec.md §4.5).
    pub fn sub_script() -> InstallerScript {
        InstallerScript::new()
    }

    /// Fails with `ProgressUnderrun` unless cumulative progress has reached
    /// `minimum` (spec.md invariant 5; default minimum is 0.9).
    pub fn require_progress(&self, minimum: f64) -> Result<(), OtaError> {
        if self.cur_progress < minimum {
            Err(OtaError::ProgressUnderrun(self.cur_progress))
        } else {
            Ok(())
        }
    }
}

/// Escapes a string for embedding inside a double-quoted edify-style string
/// literal.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Renders one primitive as a single edify-style function call line. The
/// concrete on-device encoding is out of scope for the engine (spec.md
/// §1/§6.2); this rendering exists so the installer script is an
/// inspectable, deterministic text blob embedded in the output archive
/// (spec.md §6.3, invariant 1).
fn render_primitive(p: &Primitive, out: &mut String) {
    match p {
        Primitive::AssertDevice { models } => {
            let list = models.iter().map(|m| quote(m)).collect::<Vec<_>>().join(", ");
            out.push_str(&format!("assert_device({list});\n"));
        }
        Primitive::AssertCompatibleProduct { product } => {
            out.push_str(&format!("assert_compatible_product({});\n", quote(product)));
        }
        Primitive::AssertOlderBuild { timestamp } => {
            out.push_str(&format!("assert_older_build({timestamp});\n"));
        }
        Primitive::AssertSomeFingerprint { source, target } => {
            out.push_str(&format!(
                "assert_some_fingerprint({}, {});\n",
                quote(source),
                quote(target)
            ));
        }
        Primitive::Mount { path } => out.push_str(&format!("mount({});\n", quote(path))),
        Primitive::Unmount { path } => out.push_str(&format!("unmount({});\n", quote(path))),
        Primitive::UnmountAll => out.push_str("unmount_all();\n"),
        Primitive::FormatPartition { path } => {
            out.push_str(&format!("format_partition({});\n", quote(path)))
        }
        Primitive::ShowProgress {
            fraction,
            duration_secs,
        } => out.push_str(&format!("show_progress({fraction}, {duration_secs});\n")),
        Primitive::SetProgress { value } => out.push_str(&format!("set_progress({value});\n")),
        Primitive::Print { text } => out.push_str(&format!("ui_print({});\n", quote(text))),
        Primitive::Comment { text } => out.push_str(&format!("# {text}\n")),
        Primitive::PackageExtract { name } => {
            out.push_str(&format!("package_extract_file({});\n", quote(name)))
        }
        Primitive::UnpackPackageDir { src, dst } => out.push_str(&format!(
            "package_extract_dir({}, {});\n",
            quote(src),
            quote(dst)
        )),
        Primitive::DeleteFiles { paths } => {
            let list = paths.iter().map(|p| quote(p)).collect::<Vec<_>>().join(", ");
            out.push_str(&format!("delete({list});\n"));
        }
        Primitive::DeleteTmpImage { name } => {
            out.push_str(&format!("delete_tmp_image({});\n", quote(name)))
        }
        Primitive::ExtractImage { name } => out.push_str(&format!("extract_image({});\n", quote(name))),
        Primitive::PatchCheck {
            path,
            target_sha1,
            source_sha1,
        } => out.push_str(&format!(
            "patch_check({}, {}, {});\n",
            quote(path),
            quote(target_sha1),
            quote(source_sha1)
        )),
        Primitive::CacheFreeSpaceCheck { bytes } => {
            out.push_str(&format!("cache_free_space_check({bytes});\n"))
        }
        Primitive::ApplyPatch {
            path,
            target_size,
            target_sha1,
            source_sha1,
            patch_path,
        } => out.push_str(&format!(
            "apply_patch({}, \"-\", {target_size}, {}, {}, {});\n",
            quote(path),
            quote(target_sha1),
            quote(source_sha1),
            quote(patch_path)
        )),
        Primitive::MakeSymlinks { links } => {
            let list = links
                .iter()
                .map(|(target, link)| format!("{}, {}", quote(target), quote(link)))
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!("symlink({list});\n"));
        }
        Primitive::SetPerm {
            path,
            uid,
            gid,
            mode,
        } => out.push_str(&format!(
            "set_perm({uid}, {gid}, 0{mode:o}, {});\n",
            quote(path)
        )),
        Primitive::SetPermRecursive {
            path,
            uid,
            gid,
            dmode,
            fmode,
        } => out.push_str(&format!(
            "set_perm_recursive({uid}, {gid}, 0{dmode:o}, 0{fmode:o}, {});\n",
            quote(path)
        )),
        Primitive::FlashOsImage { name, partition } => match partition {
            Some(p) => out.push_str(&format!(
                "flash_os_image({}, {});\n",
                quote(name),
                quote(p)
            )),
            None => out.push_str(&format!("flash_os_image({});\n", quote(name))),
        },
        Primitive::FlashImageAtOffset { name, byte_offset } => out.push_str(&format!(
            "flash_image_at_offset({}, {byte_offset});\n",
            quote(name)
        )),
        Primitive::FlashEspUpdate => out.push_str("flash_esp_update();\n"),
        Primitive::FlashIfwi => out.push_str("flash_ifwi();\n"),
        Primitive::FlashCapsule => out.push_str("flash_capsule();\n"),
        Primitive::FlashUlpmc => out.push_str("flash_ulpmc();\n"),
        Primitive::FlashPartitionScheme => out.push_str("flash_partition_scheme();\n"),
        Primitive::FlashBomToken => out.push_str("flash_bom_token();\n"),
        Primitive::InvalidateOs { name } => out.push_str(&format!("invalidate_os({});\n", quote(name))),
        Primitive::RestoreOs { name } => out.push_str(&format!("restore_os({});\n", quote(name))),
        Primitive::StartUpdate => out.push_str("start_update();\n"),
        Primitive::FinalizeUpdate => out.push_str("finalize_update();\n"),
        Primitive::AppendExtra { text } => out.push_str(text),
        Primitive::AppendScript { script } => {
            for p in script {
                render_primitive(p, out);
            }
        }
        Primitive::Retouch { path, sha1 } => out.push_str(&format!(
            "retouch_binaries({}, {});\n",
            quote(path),
            quote(sha1)
        )),
    }
}

impl InstallerScript {
    /// Renders the full primitive sequence to edify-style script text.
    /// Deterministic given the same primitive sequence (testable property 1).
    pub fn render(&self) -> String {
        let mut out = String::new();
        for p in &self.primitives {
            render_primitive(p, &mut out);
        }
        out
    }
}
