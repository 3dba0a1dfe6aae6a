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

//! Archive assembler and signer (spec.md §4.7/§6.3): drives a full or
//! incremental composition against a real output ZIP, embeds the metadata
//! manifest and the rendered installer script, closes the archive, and
//! invokes the whole-archive signing capability. No partial output archive
//! survives an error (spec.md §7): `ZipOutputArchive`'s `Drop` impl removes
//! the scratch file on any exit path that doesn't reach `finish`.

use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::archive::{TargetFilesArchive, ZipOutputArchive};
use crate::compose::{
    compose_full_ota, compose_incremental_ota, manifest_to_json, render_manifest, Collaborators,
};
use crate::config::CompositionOptions;

const MANIFEST_PATH: &str = "META-INF/com/android/metadata";
const UPDATER_SCRIPT_PATH: &str = "META-INF/com/google/android/updater-script";

/// Assembles and signs a full OTA package from a single target archive.
pub fn assemble_full_ota<R: Read + Seek>(
    target: &mut TargetFilesArchive<R>,
    options: &CompositionOptions,
    collaborators: &Collaborators,
    output_path: impl Into<PathBuf>,
    dump_manifest_path: Option<&Path>,
) -> Result<PathBuf> {
    let mut sink = ZipOutputArchive::create(output_path).context("creating output archive")?;
    let composed = compose_full_ota(target, options, collaborators, &mut sink)?;
    write_manifest_and_script(&mut sink, &composed)?;
    if let Some(path) = dump_manifest_path {
        dump_manifest(path, &composed)?;
    }
    let final_path = sink.finish().context("closing output archive")?;
    sign(&final_path, options, collaborators)?;
    Ok(final_path)
}

/// Assembles and signs an incremental OTA package from a source/target
/// archive pair.
pub fn assemble_incremental_ota<R1: Read + Seek, R2: Read + Seek>(
    source: &mut TargetFilesArchive<R1>,
    target: &mut TargetFilesArchive<R2>,
    options: &CompositionOptions,
    collaborators: &Collaborators,
    output_path: impl Into<PathBuf>,
    dump_manifest_path: Option<&Path>,
) -> Result<PathBuf> {
    let mut sink = ZipOutputArchive::create(output_path).context("creating output archive")?;
    let composed = compose_incremental_ota(source, target, options, collaborators, &mut sink)?;
    write_manifest_and_script(&mut sink, &composed)?;
    if let Some(path) = dump_manifest_path {
        dump_manifest(path, &composed)?;
    }
    let final_path = sink.finish().context("closing output archive")?;
    sign(&final_path, options, collaborators)?;
    Ok(final_path)
}

/// Writes the metadata manifest as pretty JSON to `path`, for the CLI's
/// `--dump-manifest` diagnostic flag (not part of the signed archive).
fn dump_manifest(path: &Path, composed: &crate::compose::ComposedOta) -> Result<()> {
    let json = manifest_to_json(&composed.manifest)?;
    std::fs::write(path, json).with_context(|| format!("writing manifest dump to {}", path.display()))
}

fn write_manifest_and_script(
    sink: &mut ZipOutputArchive,
    composed: &crate::compose::ComposedOta,
) -> Result<()> {
    sink.write_text(MANIFEST_PATH, &render_manifest(&composed.manifest))
        .context("writing metadata manifest")?;
    sink.write_text(UPDATER_SCRIPT_PATH, &composed.script.render())
        .context("writing installer script")?;
    Ok(())
}

fn sign(final_path: &Path, options: &CompositionOptions, collaborators: &Collaborators) -> Result<()> {
    collaborators
        .signer
        .sign_whole_archive(final_path, &options.package_key, &options.package_key_passphrase)
        .context("signing output archive")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_support::build_archive_with_symlinks;
    use crate::external::{ExternalArchiveSigner, NullDeviceExtensions, NullFsConfigHelper, PatchEngine};
    use std::io::Cursor;

    struct FixedPatchEngine;
    impl PatchEngine for FixedPatchEngine {
        fn compute_patch(&self, _target: &[u8], _source: &[u8]) -> anyhow::Result<Vec<u8>> {
            Ok(vec![0u8; 1])
        }
    }

    /// A signer that just verifies the archive exists and is non-empty,
    /// standing in for a real detached-signature tool in this test.
    struct RecordingSigner;
    impl crate::external::ArchiveSigner for RecordingSigner {
        fn sign_whole_archive(&self, archive_path: &Path, _key: &str, _passphrase: &str) -> Result<()> {
            let meta = std::fs::metadata(archive_path)?;
            assert!(meta.len() > 0);
            Ok(())
        }
    }

    #[test]
    fn full_ota_assembly_produces_a_signed_archive_on_disk() {
        let bytes = build_archive_with_symlinks(
            &[
                ("SYSTEM/bin/sh", b"#!/bin/sh\n"),
                ("META/build.prop", b""),
                ("SYSTEM/build.prop", b"ro.product.device=walleye\nro.build.product=walleye\nro.build.fingerprint=fp\n"),
            ],
            &[],
        );
        let mut target = TargetFilesArchive::open(Cursor::new(bytes)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let output_path = dir.path().join("ota.zip");

        let options = CompositionOptions::default();
        let patch_engine = FixedPatchEngine;
        let fs_config = NullFsConfigHelper;
        let signer = RecordingSigner;
        let device = NullDeviceExtensions;
        let collaborators = Collaborators {
            patch_engine: &patch_engine,
            fs_config_helper: &fs_config,
            signer: &signer,
            device: &device,
        };

        let result_path =
            assemble_full_ota(&mut target, &options, &collaborators, &output_path, None).unwrap();
        assert_eq!(result_path, output_path);
        assert!(output_path.exists());

        let mut zip = zip::ZipArchive::new(std::fs::File::open(&output_path).unwrap()).unwrap();
        assert!(zip.by_name(MANIFEST_PATH).is_ok());
        assert!(zip.by_name(UPDATER_SCRIPT_PATH).is_ok());
        assert!(zip.by_name("system/bin/sh").is_ok());
        let _ = ExternalArchiveSigner::new("true");
    }

    #[test]
    fn incremental_ota_assembly_produces_a_signed_archive_on_disk() {
        let source_bytes = build_archive_with_symlinks(
            &[
                ("SYSTEM/bin/sh", b"#!/bin/sh\n"),
                ("META/build.prop", b""),
                (
                    "SYSTEM/build.prop",
                    b"ro.product.device=walleye\nro.build.product=walleye\nro.build.fingerprint=fp-old\n",
                ),
            ],
            &[],
        );
        let target_bytes = build_archive_with_symlinks(
            &[
                ("SYSTEM/bin/sh", b"#!/bin/sh\necho updated\n"),
                ("META/build.prop", b""),
                (
                    "SYSTEM/build.prop",
                    b"ro.product.device=walleye\nro.build.product=walleye\nro.build.fingerprint=fp-new\n",
                ),
            ],
            &[],
        );
        let mut source = TargetFilesArchive::open(Cursor::new(source_bytes)).unwrap();
        let mut target = TargetFilesArchive::open(Cursor::new(target_bytes)).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let output_path = dir.path().join("incremental.zip");
        let manifest_path = dir.path().join("manifest.json");

        let options = CompositionOptions::default();
        let patch_engine = FixedPatchEngine;
        let fs_config = NullFsConfigHelper;
        let signer = RecordingSigner;
        let device = NullDeviceExtensions;
        let collaborators = Collaborators {
            patch_engine: &patch_engine,
            fs_config_helper: &fs_config,
            signer: &signer,
            device: &device,
        };

        let result_path = assemble_incremental_ota(
            &mut source,
            &mut target,
            &options,
            &collaborators,
            &output_path,
            Some(&manifest_path),
        )
        .unwrap();
        assert_eq!(result_path, output_path);
        assert!(output_path.exists());
        assert!(manifest_path.exists());

        let mut zip = zip::ZipArchive::new(std::fs::File::open(&output_path).unwrap()).unwrap();
        assert!(zip.by_name(MANIFEST_PATH).is_ok());
        assert!(zip.by_name(UPDATER_SCRIPT_PATH).is_ok());
        assert!(zip.by_name("patch/system/bin/sh.p").is_ok());

        let dump = std::fs::read_to_string(&manifest_path).unwrap();
        assert!(dump.contains("pre-build"));
    }
}
