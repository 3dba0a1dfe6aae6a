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

//! OTA composer (spec.md §4.6): drives the tree, loader, diff planner,
//! image planner, and script builder for both full and incremental
//! composition, owning the ordering and progress-budget contract of
//! spec.md §4.5.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Read, Seek};

use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;

use crate::archive::{OutputSink, TargetFilesArchive};
use crate::blob::FileBlob;
use crate::buildinfo::BuildInfo;
use crate::config::{CompositionOptions, MiscInfo};
use crate::diff::{plan_diffs, DiffOptions, PatchDecision};
use crate::external::{ArchiveSigner, DeviceExtensions, FsConfigHelper, PatchEngine};
use crate::image::{
    build_roster, check_size, derive_recovery_from_boot, plan_image, ImageDecision, ImageName,
    ImagePlanContext, DEFAULT_FIXED_SIGNATURE_REGION,
};
use crate::loader::{load_system, Substitutions};
use crate::script::{InstallerScript, Primitive};
use crate::tree::Tree;

const BUILD_PROP_PATH: &str = "system/build.prop";

pub struct Collaborators<'a> {
    pub patch_engine: &'a dyn PatchEngine,
    pub fs_config_helper: &'a dyn FsConfigHelper,
    pub signer: &'a dyn ArchiveSigner,
    pub device: &'a dyn DeviceExtensions,
}

pub struct ComposedOta {
    pub script: InstallerScript,
    pub manifest: BTreeMap<String, String>,
}

lazy_static! {
    static ref LBA_OFFSET_RE: Regex = Regex::new(r"-b (\d+)").unwrap();
}

/// Flash dispatch rules (spec.md §6.2).
fn flash_dispatch(name: &str, partition_table: Option<&str>) -> Primitive {
    match name {
        "esp" => Primitive::FlashEspUpdate,
        "ifwi" => Primitive::FlashIfwi,
        "capsule" => Primitive::FlashCapsule,
        "ulpmc" => Primitive::FlashUlpmc,
        _ => match partition_table.and_then(|table| find_lba_offset(table, name)) {
            Some(lba) => Primitive::FlashImageAtOffset {
                name: name.to_string(),
                byte_offset: lba * 512,
            },
            None => Primitive::FlashOsImage {
                name: name.to_string(),
                partition: None,
            },
        },
    }
}

fn find_lba_offset(table: &str, name: &str) -> Option<u64> {
    let needle = format!("-l {name}").to_lowercase();
    table
        .lines()
        .find(|line| line.to_lowercase().contains(&needle))
        .and_then(|line| LBA_OFFSET_RE.captures(line))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn fetch_roster_blobs<R: Read + Seek>(
    archive: &mut TargetFilesArchive<R>,
    roster: &[ImageName],
) -> Result<HashMap<ImageName, FileBlob>> {
    let mut map = HashMap::new();
    for name in roster {
        if let Some(blob) = archive.get_bootable_image(name.as_str(), name.extension())? {
            map.insert(*name, blob);
        }
    }
    Ok(map)
}

fn manifest_full(build: &BuildInfo) -> BTreeMap<String, String> {
    let mut m = BTreeMap::new();
    m.insert("post-build".to_string(), build.fingerprint.clone());
    m.insert("pre-device".to_string(), build.device_models.join(","));
    m.insert(
        "post-timestamp".to_string(),
        build.timestamp.unwrap_or(0).to_string(),
    );
    m
}

fn manifest_incremental(source: &BuildInfo, target: &BuildInfo) -> BTreeMap<String, String> {
    let mut m = manifest_full(target);
    m.insert("pre-device".to_string(), source.device_models.join(","));
    m.insert("pre-build".to_string(), source.fingerprint.clone());
    m.insert("fromgb".to_string(), source.is_gingerbread().to_string());
    m
}

/// Composes a full OTA (spec.md §4.5, full ordering contract) from a single
/// target archive, writing the system tree and image/patch artifacts into
/// `sink`.
pub fn compose_full_ota<R: Read + Seek>(
    target: &mut TargetFilesArchive<R>,
    options: &CompositionOptions,
    collaborators: &Collaborators,
    sink: &mut dyn OutputSink,
) -> Result<ComposedOta> {
    let mut misc_info = MiscInfo::from_map(&target.misc_info()?);
    if !options.intel_ota {
        misc_info = misc_info.without_intel_extensions();
    }
    let build = BuildInfo::from_build_prop(&target.build_prop()?)?;
    let filesystem_config = target.filesystem_config()?;
    let partition_table = target.partition_table()?;

    let mut tree = Tree::new();
    let entries = target.system_entries()?;
    let loaded = load_system(entries, &Substitutions::new(), &mut tree, Some(sink))?;

    let roster = build_roster(
        misc_info.firmware_update_image(),
        misc_info.intel_ulpmc,
        misc_info.has_silentlake,
    );
    let blobs = fetch_roster_blobs(target, &roster)?;

    let mut script = InstallerScript::new();
    script.push(Primitive::AssertDevice {
        models: build.device_models.clone(),
    });
    script.push(Primitive::AssertCompatibleProduct {
        product: build.compatible_product.clone(),
    });
    if !options.no_prereq {
        if let Some(timestamp) = build.timestamp {
            script.push(Primitive::AssertOlderBuild { timestamp });
        }
    }
    collaborators.device.pre_hook(&mut script)?;
    script.show_progress(0.5, 0.0);

    if misc_info.intel_chaabi_token {
        script.push(Primitive::Mount {
            path: "/system".into(),
        });
        script.push(Primitive::StartUpdate);
        script.push(Primitive::Unmount {
            path: "/system".into(),
        });
    }
    if misc_info.do_partitioning {
        script.push(Primitive::ExtractImage {
            name: "partition-table".into(),
        });
        script.push(Primitive::FlashPartitionScheme);
    }
    if misc_info.is_iafw() {
        script.push(Primitive::InvalidateOs { name: "boot".into() });
    }
    if misc_info.intel_chaabi_token {
        script.push(Primitive::PackageExtract {
            name: "ifwi.zip".into(),
        });
        script.push(Primitive::FlashBomToken);
    }
    if options.wipe_user_data {
        script.push(Primitive::FormatPartition {
            path: "/data".into(),
        });
    }
    script.push(Primitive::FormatPartition {
        path: "/system".into(),
    });
    script.push(Primitive::Mount {
        path: "/system".into(),
    });
    script.push(Primitive::UnpackPackageDir {
        src: "recovery".into(),
        dst: "/system".into(),
    });
    script.push(Primitive::UnpackPackageDir {
        src: "system".into(),
        dst: "/system".into(),
    });

    if !loaded.symlinks.is_empty() {
        script.push(Primitive::MakeSymlinks {
            links: loaded.symlinks.clone(),
        });
    }

    let ctx = ImagePlanContext {
        do_partitioning: misc_info.do_partitioning,
        fromgb: false,
        device: collaborators.device,
        fixed_signature_region: DEFAULT_FIXED_SIGNATURE_REGION,
    };
    let roster_decisions: Vec<(ImageName, ImageDecision)> = roster
        .iter()
        .map(|name| (*name, plan_image(*name, None, blobs.get(name), &ctx)))
        .collect();
    let images_processed = roster_decisions
        .iter()
        .filter(|(_, d)| !matches!(d, ImageDecision::Skip))
        .count();
    // spec.md §4.5: "allocate 0.4/N of progress" for each image actually
    // processed -- skipped images (e.g. an empty roster with no blobs at
    // all) don't consume any of the 0.4 budget.
    let per_image_progress = if images_processed > 0 {
        0.4 / images_processed as f64
    } else {
        0.0
    };
    for (name, decision) in roster_decisions {
        match decision {
            ImageDecision::Skip => continue,
            ImageDecision::RecoveryFromBoot => {
                if let (Some(boot), Some(recovery)) = (blobs.get(&ImageName::Boot), blobs.get(&name)) {
                    let plan = derive_recovery_from_boot(
                        boot,
                        recovery,
                        collaborators.patch_engine,
                        ctx.fixed_signature_region,
                    )?;
                    tree.register_recovery_patch_paths();
                    sink.write_file("recovery/recovery-from-boot.p", &plan.patch_data)?;
                    sink.write_file(
                        "recovery/etc/install-recovery.sh",
                        plan.install_recovery_sh.as_bytes(),
                    )?;
                }
            }
            ImageDecision::FullFlash(blob) => {
                check_size(name, &blob, misc_info.partition_size_limit(name.as_str()))?;
                sink.write_file(&format!("{}{}", name.as_str(), name.extension()), blob.data())?;
                script.push(Primitive::ExtractImage {
                    name: name.as_str().to_string(),
                });
                script.push(flash_dispatch(name.as_str(), partition_table.as_deref()));
                script.push(Primitive::DeleteTmpImage {
                    name: name.as_str().to_string(),
                });
            }
            ImageDecision::IncrementalPatch { .. } => {
                unreachable!("full OTA never has a source image to diff against")
            }
        }
        script.show_progress(per_image_progress, 0.0);
    }

    tree.resolve(filesystem_config.as_deref(), collaborators.fs_config_helper)?;
    let mut perm_script = InstallerScript::sub_script();
    perm_script.extend(tree.emit_permissions("system"));
    script.append_script(perm_script);
    script.show_progress(0.1, 0.0);

    if options.retouch_aslr {
        for (path, sha1) in &loaded.retouch {
            script.push(Primitive::Retouch {
                path: path.clone(),
                sha1: sha1.clone(),
            });
        }
    }

    if let Some(extra) = &options.extra_script {
        script.push(Primitive::AppendExtra { text: extra.clone() });
    }
    if misc_info.intel_chaabi_token {
        script.push(Primitive::FinalizeUpdate);
    }
    script.push(Primitive::UnmountAll);
    if misc_info.is_iafw() {
        script.push(Primitive::RestoreOs { name: "boot".into() });
    }
    collaborators.device.post_hook(&mut script)?;

    script.require_progress(0.9)?;

    Ok(ComposedOta {
        script,
        manifest: manifest_full(&build),
    })
}

/// Composes an incremental OTA (spec.md §4.5, incremental ordering
/// contract) from a source and target archive pair.
pub fn compose_incremental_ota<R1: Read + Seek, R2: Read + Seek>(
    source: &mut TargetFilesArchive<R1>,
    target: &mut TargetFilesArchive<R2>,
    options: &CompositionOptions,
    collaborators: &Collaborators,
    sink: &mut dyn OutputSink,
) -> Result<ComposedOta> {
    let mut misc_info = MiscInfo::from_map(&target.misc_info()?);
    if !options.intel_ota {
        misc_info = misc_info.without_intel_extensions();
    }
    let source_build = BuildInfo::from_build_prop(&source.build_prop()?)?;
    let target_build = BuildInfo::from_build_prop(&target.build_prop()?)?;
    let target_filesystem_config = target.filesystem_config()?;
    let partition_table = target.partition_table()?;

    let mut source_tree = Tree::new();
    let source_loaded = load_system(
        source.system_entries()?,
        &Substitutions::new(),
        &mut source_tree,
        None,
    )?;

    let mut target_tree = Tree::new();
    let target_loaded = load_system(
        target.system_entries()?,
        &Substitutions::new(),
        &mut target_tree,
        None,
    )?;

    let diff_options = DiffOptions {
        require_verbatim: options.require_verbatim.clone(),
        prohibit_verbatim: options.prohibit_verbatim.clone(),
        exclude_patch_paths: options.exclude_patch_paths.clone(),
        patch_threshold: options.patch_threshold,
        worker_threads: options.worker_threads,
    };
    let plan = plan_diffs(
        &source_loaded.files,
        &target_loaded.files,
        &diff_options,
        collaborators.patch_engine,
    )?;

    let roster = build_roster(
        misc_info.firmware_update_image(),
        misc_info.intel_ulpmc,
        misc_info.has_silentlake,
    );
    let source_blobs = fetch_roster_blobs(source, &roster)?;
    let target_blobs = fetch_roster_blobs(target, &roster)?;
    let image_ctx = ImagePlanContext {
        do_partitioning: misc_info.do_partitioning,
        fromgb: source_build.is_gingerbread(),
        device: collaborators.device,
        fixed_signature_region: DEFAULT_FIXED_SIGNATURE_REGION,
    };
    let image_decisions: Vec<(ImageName, ImageDecision)> = roster
        .iter()
        .map(|name| {
            let decision = plan_image(
                *name,
                source_blobs.get(name),
                target_blobs.get(name),
                &image_ctx,
            );
            (*name, decision)
        })
        .collect();

    let mut script = InstallerScript::new();
    script.push(Primitive::AssertDevice {
        models: source_build.device_models.clone(),
    });
    script.push(Primitive::AssertCompatibleProduct {
        product: source_build.compatible_product.clone(),
    });
    script.push(Primitive::AssertSomeFingerprint {
        source: source_build.fingerprint.clone(),
        target: target_build.fingerprint.clone(),
    });
    if !options.no_prereq {
        if let Some(timestamp) = target_build.timestamp {
            script.push(Primitive::AssertOlderBuild { timestamp });
        }
    }
    collaborators.device.pre_hook(&mut script)?;

    // --- verify phase (0.1 budget) ---
    let patched_files: Vec<(&String, &FileBlob, &FileBlob)> = plan
        .decisions
        .iter()
        .filter_map(|(path, d)| match d {
            PatchDecision::Patched { target, source, .. } => Some((path, target, source)),
            _ => None,
        })
        .collect();
    let patched_images: Vec<(ImageName, &FileBlob, &FileBlob)> = image_decisions
        .iter()
        .filter_map(|(name, d)| match d {
            ImageDecision::IncrementalPatch { source, target } => Some((*name, target, source)),
            _ => None,
        })
        .collect();

    let total_verify_bytes: u64 = patched_files
        .iter()
        .map(|(_, _, s)| s.size())
        .chain(patched_images.iter().map(|(_, _, s)| s.size()))
        .sum();

    for (path, target_blob, source_blob) in &patched_files {
        script.push(Primitive::PatchCheck {
            path: (*path).clone(),
            target_sha1: target_blob.sha1_hex().to_string(),
            source_sha1: source_blob.sha1_hex().to_string(),
        });
        if total_verify_bytes > 0 {
            script.show_progress(0.1 * (source_blob.size() as f64) / (total_verify_bytes as f64), 0.0);
        }
    }
    for (name, target_blob, source_blob) in &patched_images {
        script.push(Primitive::ExtractImage {
            name: format!("{}.img", name.as_str()),
        });
        script.push(Primitive::PatchCheck {
            path: name.as_str().to_string(),
            target_sha1: target_blob.sha1_hex().to_string(),
            source_sha1: source_blob.sha1_hex().to_string(),
        });
        script.push(Primitive::CacheFreeSpaceCheck {
            bytes: target_blob.size(),
        });
        if total_verify_bytes > 0 {
            script.show_progress(0.1 * (source_blob.size() as f64) / (total_verify_bytes as f64), 0.0);
        }
    }
    let largest_source_size = plan
        .largest_source_size
        .max(patched_images.iter().map(|(_, _, s)| s.size()).max().unwrap_or(0));
    if !patched_files.is_empty() || !patched_images.is_empty() {
        script.push(Primitive::CacheFreeSpaceCheck {
            bytes: largest_source_size,
        });
    }

    // --- mutate phase (0.8 budget) ---
    let removed_paths: Vec<String> = source_loaded
        .files
        .keys()
        .filter(|p| !target_loaded.files.contains_key(*p))
        .map(|p| format!("/{p}"))
        .collect();
    if !removed_paths.is_empty() {
        script.push(Primitive::DeleteFiles {
            paths: removed_paths,
        });
    }

    for (name, decision) in &image_decisions {
        if let ImageDecision::FullFlash(blob) = decision {
            check_size(*name, blob, misc_info.partition_size_limit(name.as_str()))?;
            sink.write_file(&format!("{}{}", name.as_str(), name.extension()), blob.data())?;
            script.push(Primitive::ExtractImage {
                name: name.as_str().to_string(),
            });
            script.push(flash_dispatch(name.as_str(), partition_table.as_deref()));
            script.push(Primitive::DeleteTmpImage {
                name: name.as_str().to_string(),
            });
        }
    }

    let mut deferred_build_prop: Option<(String, u64, String, String)> = None;
    for (path, decision) in &plan.decisions {
        let PatchDecision::Patched {
            target,
            source,
            target_size,
            patch_sha1,
            patch_data,
            ..
        } = decision
        else {
            if let PatchDecision::Verbatim { path: p, .. } = decision {
                if let Some(blob) = target_loaded.files.get(p) {
                    sink.write_file(&format!("/{p}"), blob.data())?;
                }
            }
            continue;
        };
        if path == BUILD_PROP_PATH {
            deferred_build_prop = Some((
                patch_sha1.clone(),
                *target_size,
                target.sha1_hex().to_string(),
                source.sha1_hex().to_string(),
            ));
            sink.write_file(&format!("patch/{path}.p"), patch_data)?;
            continue;
        }
        sink.write_file(&format!("patch/{path}.p"), patch_data)?;
        script.push(Primitive::ApplyPatch {
            path: format!("/{path}"),
            target_size: *target_size,
            target_sha1: target.sha1_hex().to_string(),
            source_sha1: source.sha1_hex().to_string(),
            patch_path: format!("patch/{path}.p"),
        });
    }

    for (name, target_blob, source_blob) in &patched_images {
        // The on-device result is the full target image regardless of
        // whether it arrives as a patch or a full blob, so the declared
        // partition limit applies either way.
        check_size(*name, target_blob, misc_info.partition_size_limit(name.as_str()))?;
        let patch_data = collaborators
            .patch_engine
            .compute_patch(target_blob.data(), source_blob.data())?;
        if (patch_data.len() as f64) > options.patch_threshold * (target_blob.size() as f64) {
            sink.write_file(&format!("{}{}", name.as_str(), name.extension()), target_blob.data())?;
            script.push(Primitive::ExtractImage {
                name: name.as_str().to_string(),
            });
            script.push(flash_dispatch(name.as_str(), partition_table.as_deref()));
            script.push(Primitive::DeleteTmpImage {
                name: name.as_str().to_string(),
            });
            continue;
        }
        let patch_path = format!("patch/{}.img.p", name.as_str());
        sink.write_file(&patch_path, &patch_data)?;
        script.push(Primitive::ApplyPatch {
            path: name.as_str().to_string(),
            target_size: target_blob.size(),
            target_sha1: target_blob.sha1_hex().to_string(),
            source_sha1: source_blob.sha1_hex().to_string(),
            patch_path,
        });
    }

    let recovery_was_updated = image_decisions
        .iter()
        .any(|(name, d)| *name == ImageName::Recovery && matches!(d, ImageDecision::RecoveryFromBoot));
    if recovery_was_updated {
        if let (Some(boot), Some(recovery)) = (
            target_blobs.get(&ImageName::Boot),
            target_blobs.get(&ImageName::Recovery),
        ) {
            let plan = derive_recovery_from_boot(
                boot,
                recovery,
                collaborators.patch_engine,
                image_ctx.fixed_signature_region,
            )?;
            target_tree.register_recovery_patch_paths();
            sink.write_file("recovery/recovery-from-boot.p", &plan.patch_data)?;
            sink.write_file(
                "recovery/etc/install-recovery.sh",
                plan.install_recovery_sh.as_bytes(),
            )?;
        }
    }

    script.show_progress(0.8, 0.0);

    // --- tail phase (0.1 budget) ---
    target_tree.resolve(
        target_filesystem_config.as_deref(),
        collaborators.fs_config_helper,
    )?;
    let mut perm_script = InstallerScript::sub_script();
    perm_script.extend(target_tree.emit_permissions("system"));
    script.append_script(perm_script);

    if options.retouch_aslr {
        let source_retouch: HashSet<(String, String)> = source_loaded.retouch.iter().cloned().collect();
        for (path, sha1) in &target_loaded.retouch {
            if !source_retouch.contains(&(path.clone(), sha1.clone())) {
                script.push(Primitive::Retouch {
                    path: path.clone(),
                    sha1: sha1.clone(),
                });
            }
        }
    }

    let source_links: HashSet<(String, String)> = source_loaded.symlinks.iter().cloned().collect();
    let target_link_paths: HashSet<&String> = target_loaded.symlinks.iter().map(|(_, l)| l).collect();
    let to_delete: Vec<String> = source_loaded
        .symlinks
        .iter()
        .filter(|(_, link)| !target_link_paths.contains(link))
        .map(|(_, link)| link.clone())
        .collect();
    let to_create: Vec<(String, String)> = target_loaded
        .symlinks
        .iter()
        .filter(|pair| !source_links.contains(*pair))
        .cloned()
        .collect();
    if !to_delete.is_empty() {
        script.push(Primitive::DeleteFiles { paths: to_delete });
    }
    if !to_create.is_empty() {
        script.push(Primitive::MakeSymlinks { links: to_create });
    }

    if let Some(extra) = &options.extra_script {
        script.push(Primitive::AppendExtra { text: extra.clone() });
    }

    if let Some((patch_sha1, target_size, target_sha1, source_sha1)) = deferred_build_prop {
        let patch_path = format!("patch/{BUILD_PROP_PATH}.p");
        let _ = patch_sha1;
        script.push(Primitive::ApplyPatch {
            path: format!("/{BUILD_PROP_PATH}"),
            target_size,
            target_sha1,
            source_sha1,
            patch_path,
        });
    }
    script.push(Primitive::SetPerm {
        path: format!("/{BUILD_PROP_PATH}"),
        uid: 0,
        gid: 0,
        mode: 0o644,
    });

    script.show_progress(0.1, 0.0);

    if misc_info.intel_chaabi_token {
        script.push(Primitive::FinalizeUpdate);
    }
    script.push(Primitive::UnmountAll);
    if misc_info.is_iafw() {
        script.push(Primitive::RestoreOs { name: "boot".into() });
    }
    collaborators.device.post_hook(&mut script)?;

    script.require_progress(0.9)?;

    Ok(ComposedOta {
        script,
        manifest: manifest_incremental(&source_build, &target_build),
    })
}

/// Wrapper serialized for the CLI's `--dump-manifest` diagnostic flag; not
/// part of the output archive.
#[derive(serde::Serialize)]
struct ManifestDump<'a> {
    entries: &'a BTreeMap<String, String>,
}

/// Serializes a metadata manifest as pretty JSON, for the CLI's
/// `--dump-manifest` diagnostic flag; not part of the output archive.
pub fn manifest_to_json(manifest: &BTreeMap<String, String>) -> Result<String> {
    let dump = ManifestDump { entries: manifest };
    serde_json::to_string_pretty(&dump).map_err(Into::into)
}

/// Serializes a metadata manifest to `META-INF/com/android/metadata`'s
/// `key=value\n` format, keys sorted (spec.md §4.6).
pub fn render_manifest(manifest: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in manifest {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_renders_sorted_key_value_lines() {
        let mut m = BTreeMap::new();
        m.insert("post-build".to_string(), "fp".to_string());
        m.insert("pre-device".to_string(), "walleye".to_string());
        let text = render_manifest(&m);
        assert_eq!(text, "post-build=fp\npre-device=walleye\n");
    }

    #[test]
    fn manifest_dumps_as_json_for_diagnostics() {
        let m: BTreeMap<String, String> = maplit::btreemap! {
            "post-build".to_string() => "fp".to_string(),
            "pre-device".to_string() => "walleye".to_string(),
        };
        let json = manifest_to_json(&m).unwrap();
        assert!(json.contains("\"entries\""));
        assert!(json.contains("\"post-build\": \"fp\""));
    }

    #[test]
    fn full_manifest_has_no_incremental_keys() {
        let build = BuildInfo {
            device_models: vec!["walleye".to_string()],
            compatible_product: "walleye".to_string(),
            timestamp: Some(100),
            fingerprint: "fp".to_string(),
            build_id: "QQ1A".to_string(),
        };
        let m = manifest_full(&build);
        assert!(!m.contains_key("fromgb"));
        assert!(!m.contains_key("pre-build"));
        assert_eq!(m.get("post-timestamp").unwrap(), "100");
    }

    #[test]
    fn incremental_manifest_flags_gingerbread_source() {
        let mut source = BuildInfo::default();
        source.build_id = "GINGERBREAD".to_string();
        source.device_models = vec!["legacy".to_string()];
        source.fingerprint = "src-fp".to_string();
        let mut target = BuildInfo::default();
        target.fingerprint = "tgt-fp".to_string();
        let m = manifest_incremental(&source, &target);
        assert_eq!(m.get("fromgb").unwrap(), "true");
        assert_eq!(m.get("pre-build").unwrap(), "src-fp");
        assert_eq!(m.get("pre-device").unwrap(), "legacy");
    }

    #[test]
    fn flash_dispatch_uses_named_primitives_for_special_images() {
        assert!(matches!(flash_dispatch("esp", None), Primitive::FlashEspUpdate));
        assert!(matches!(flash_dispatch("ifwi", None), Primitive::FlashIfwi));
        assert!(matches!(flash_dispatch("capsule", None), Primitive::FlashCapsule));
        assert!(matches!(flash_dispatch("ulpmc", None), Primitive::FlashUlpmc));
    }

    #[test]
    fn flash_dispatch_falls_back_to_os_image_without_partition_table() {
        let primitive = flash_dispatch("boot", None);
        assert!(matches!(primitive, Primitive::FlashOsImage { name, partition: None } if name == "boot"));
    }

    #[test]
    fn flash_dispatch_uses_partition_table_offset_when_present() {
        let table = "-l boot -b 2048 -t ext4\n";
        let primitive = flash_dispatch("boot", Some(table));
        assert!(matches!(
            primitive,
            Primitive::FlashImageAtOffset { name, byte_offset: 1048576 } if name == "boot"
        ));
    }

    use crate::archive::test_support::build_archive_with_symlinks;
    use crate::archive::MemorySink;
    use crate::external::{NullDeviceExtensions, NullFsConfigHelper};
    use std::io::Cursor;

    struct NoopPatchEngine;
    impl PatchEngine for NoopPatchEngine {
        fn compute_patch(&self, _target: &[u8], _source: &[u8]) -> Result<Vec<u8>> {
            Ok(vec![0u8; 1])
        }
    }

    struct NoopSigner;
    impl ArchiveSigner for NoopSigner {
        fn sign_whole_archive(&self, _archive_path: &std::path::Path, _key: &str, _passphrase: &str) -> Result<()> {
            Ok(())
        }
    }

    fn null_collaborators(
        patch_engine: &NoopPatchEngine,
        fs_config: &NullFsConfigHelper,
        signer: &NoopSigner,
        device: &NullDeviceExtensions,
    ) -> Collaborators<'_> {
        Collaborators {
            patch_engine,
            fs_config_helper: fs_config,
            signer,
            device,
        }
    }

    #[test]
    fn retouch_is_not_emitted_by_default() {
        let bytes = build_archive_with_symlinks(
            &[
                ("SYSTEM/lib/libfoo.so", b"lib bytes"),
                ("META/build.prop", b""),
                (
                    "SYSTEM/build.prop",
                    b"ro.product.device=walleye\nro.build.product=walleye\nro.build.fingerprint=fp\n",
                ),
            ],
            &[],
        );
        let mut target = TargetFilesArchive::open(Cursor::new(bytes)).unwrap();
        let options = CompositionOptions::default();
        let (patch_engine, fs_config, signer, device) =
            (NoopPatchEngine, NullFsConfigHelper, NoopSigner, NullDeviceExtensions);
        let collaborators = null_collaborators(&patch_engine, &fs_config, &signer, &device);
        let mut sink = MemorySink::new();

        let composed = compose_full_ota(&mut target, &options, &collaborators, &mut sink).unwrap();
        assert!(!composed.script.render().contains("retouch_binaries"));
    }

    #[test]
    fn retouch_is_emitted_when_gated_on() {
        let bytes = build_archive_with_symlinks(
            &[
                ("SYSTEM/lib/libfoo.so", b"lib bytes"),
                ("META/build.prop", b""),
                (
                    "SYSTEM/build.prop",
                    b"ro.product.device=walleye\nro.build.product=walleye\nro.build.fingerprint=fp\n",
                ),
            ],
            &[],
        );
        let mut target = TargetFilesArchive::open(Cursor::new(bytes)).unwrap();
        let mut options = CompositionOptions::default();
        options.retouch_aslr = true;
        let (patch_engine, fs_config, signer, device) =
            (NoopPatchEngine, NullFsConfigHelper, NoopSigner, NullDeviceExtensions);
        let collaborators = null_collaborators(&patch_engine, &fs_config, &signer, &device);
        let mut sink = MemorySink::new();

        let composed = compose_full_ota(&mut target, &options, &collaborators, &mut sink).unwrap();
        assert!(composed
            .script
            .render()
            .contains("retouch_binaries(\"system/lib/libfoo.so\""));
    }
}
