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

//! Image planner (spec.md §4.4): builds the roster of bootable/firmware
//! image blobs carried by the package, decides per image whether it's
//! skipped, full-flashed, or incrementally patched, and derives the
//! recovery-from-boot patch when the target carries a recovery image.

use anyhow::Result;

use crate::blob::FileBlob;
use crate::error::OtaError;
use crate::external::PatchEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageName {
    Boot,
    Recovery,
    Fastboot,
    Esp,
    Capsule,
    Ifwi,
    Ulpmc,
    Silentlake,
}

impl ImageName {
    /// The archive/on-device file-name convention for this image.
    pub fn extension(&self) -> &'static str {
        match self {
            ImageName::Ifwi | ImageName::Esp => ".zip",
            ImageName::Capsule | ImageName::Ulpmc => ".bin",
            _ => ".img",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageName::Boot => "boot",
            ImageName::Recovery => "recovery",
            ImageName::Fastboot => "fastboot",
            ImageName::Esp => "esp",
            ImageName::Capsule => "capsule",
            ImageName::Ifwi => "ifwi",
            ImageName::Ulpmc => "ulpmc",
            ImageName::Silentlake => "silentlake",
        }
    }
}

/// Which of the mutually exclusive firmware-update images this build uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareUpdateImage {
    Capsule,
    Ifwi,
}

/// Builds the fixed ordered roster (spec.md §4.4): `boot, recovery,
/// fastboot, esp`, then the exclusive capsule/ifwi choice, then `ulpmc` and
/// `silentlake` if enabled.
pub fn build_roster(
    firmware_image: FirmwareUpdateImage,
    intel_ulpmc: bool,
    has_silentlake: bool,
) -> Vec<ImageName> {
    let mut roster = vec![
        ImageName::Boot,
        ImageName::Recovery,
        ImageName::Fastboot,
        ImageName::Esp,
    ];
    roster.push(match firmware_image {
        FirmwareUpdateImage::Capsule => ImageName::Capsule,
        FirmwareUpdateImage::Ifwi => ImageName::Ifwi,
    });
    if intel_ulpmc {
        roster.push(ImageName::Ulpmc);
    }
    if has_silentlake {
        roster.push(ImageName::Silentlake);
    }
    roster
}

#[derive(Debug, Clone)]
pub enum ImageDecision {
    Skip,
    FullFlash(FileBlob),
    IncrementalPatch { source: FileBlob, target: FileBlob },
    RecoveryFromBoot,
}

/// Rejects `blob` if it exceeds the image's declared partition size limit
/// (spec.md §7's `SizeViolation` kind, `misc_info.txt`'s `<name>_size`).
/// Images with no declared limit are always accepted.
pub fn check_size(name: ImageName, blob: &FileBlob, limit: Option<u64>) -> Result<()> {
    if let Some(limit) = limit {
        if blob.size() > limit {
            return Err(OtaError::SizeViolation(format!(
                "{} image is {} bytes, exceeds declared partition limit of {} bytes",
                name.as_str(),
                blob.size(),
                limit
            ))
            .into());
        }
    }
    Ok(())
}

/// Inputs to the per-image decision cascade that don't vary by image.
pub struct ImagePlanContext<'a> {
    pub do_partitioning: bool,
    pub fromgb: bool,
    pub device: &'a dyn crate::external::DeviceExtensions,
    /// Fallback `(offset, len)` used for `derive_recovery_from_boot` when a
    /// recovery image carries no `ANDROID!` header (spec.md §9, Open
    /// Question b, "treat as configuration").
    pub fixed_signature_region: (u64, u64),
}

/// Classifies one image per the seven-rule cascade in spec.md §4.4,
/// first match wins. `largest_source_size` is updated by the caller when
/// the returned decision is `IncrementalPatch` (kept out of this function
/// so it stays a pure classifier over a single image).
pub fn plan_image(
    name: ImageName,
    source: Option<&FileBlob>,
    target: Option<&FileBlob>,
    ctx: &ImagePlanContext,
) -> ImageDecision {
    let target = match target {
        None => return ImageDecision::Skip,
        Some(t) => t,
    };

    if let Some(source) = source {
        if source.sha1_hex() == target.sha1_hex() {
            return ImageDecision::Skip;
        }
    }

    if name == ImageName::Recovery {
        return ImageDecision::RecoveryFromBoot;
    }

    if name == ImageName::Ifwi {
        if let Some(source) = source {
            if !ctx.device.ifwi_differs(source.data(), target.data()) {
                return ImageDecision::Skip;
            }
        }
    }

    let full_images_only = ctx.do_partitioning
        || ctx.fromgb
        || matches!(
            name,
            ImageName::Ifwi | ImageName::Capsule | ImageName::Ulpmc | ImageName::Esp
        );
    if full_images_only {
        return ImageDecision::FullFlash(target.clone());
    }

    if let Some(source) = source {
        return ImageDecision::IncrementalPatch {
            source: source.clone(),
            target: target.clone(),
        };
    }

    ImageDecision::FullFlash(target.clone())
}

/// Header fields read from an Android boot image (spec.md §4.4).
#[derive(Debug, Clone, Copy)]
struct BootHeader {
    kernel_size: u32,
    ramdisk_size: u32,
    second_size: u32,
    page_size: u32,
    sig_size: u32,
}

const ANDROID_MAGIC: &[u8; 8] = b"ANDROID!";

fn parse_boot_header(data: &[u8]) -> Option<BootHeader> {
    if data.len() < 8 + 9 * 4 || &data[0..8] != ANDROID_MAGIC {
        return None;
    }
    let word = |i: usize| -> u32 {
        let off = 8 + i * 4;
        u32::from_le_bytes(data[off..off + 4].try_into().expect("4-byte slice"))
    };
    Some(BootHeader {
        kernel_size: word(0),
        ramdisk_size: word(2),
        second_size: word(4),
        page_size: word(7),
        sig_size: word(8),
    })
}

fn ceil_div(value: u32, divisor: u32) -> u64 {
    if divisor == 0 {
        return 0;
    }
    (value as u64 + divisor as u64 - 1) / divisor as u64
}

/// The recovery image's signature region (spec.md §9, Open Question b):
/// either computed from a parsed `ANDROID!` boot header, or a fixed window
/// used as a fallback for images that carry no such header. The fallback
/// bounds are configuration (`ImagePlanContext::fixed_signature_region`),
/// not a hardcoded constant, since they are device-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureRegion {
    Android { offset: u64, len: u64 },
    Fixed { offset: u64, len: u64 },
}

impl SignatureRegion {
    fn bounds(&self) -> (u64, u64) {
        match *self {
            SignatureRegion::Android { offset, len } => (offset, len),
            SignatureRegion::Fixed { offset, len } => (offset, len),
        }
    }
}

/// The default fixed signature region `(offset, len)` used when a recovery
/// image carries no `ANDROID!` header, per spec.md §4.4.
pub const DEFAULT_FIXED_SIGNATURE_REGION: (u64, u64) = (512, 480);

/// Returns the signature region within `recovery`, or `None` if the image
/// carries an `ANDROID!` header with no signature at all.
fn signature_region(recovery: &[u8], fixed_fallback: (u64, u64)) -> Option<SignatureRegion> {
    match parse_boot_header(recovery) {
        Some(header) if header.sig_size > 0 => {
            let page = header.page_size as u64;
            let offset = (ceil_div(header.kernel_size, header.page_size)
                + ceil_div(header.ramdisk_size, header.page_size)
                + ceil_div(header.second_size, header.page_size)
                + 1)
                * page;
            Some(SignatureRegion::Android {
                offset,
                len: header.sig_size as u64,
            })
        }
        Some(_) => None,
        None => Some(SignatureRegion::Fixed {
            offset: fixed_fallback.0,
            len: fixed_fallback.1,
        }),
    }
}

pub struct RecoveryFromBootPlan {
    pub patch_data: Vec<u8>,
    pub source_sha1: String,
    pub target_sha1: String,
    pub target_size: u64,
    pub check_sha1: Option<String>,
    pub install_recovery_sh: String,
}

/// Derives the recovery-from-boot patch and the `install-recovery.sh`
/// script invoking `update_recovery` with it (spec.md §4.4).
pub fn derive_recovery_from_boot(
    boot: &FileBlob,
    recovery: &FileBlob,
    patch_engine: &dyn PatchEngine,
    fixed_signature_region: (u64, u64),
) -> Result<RecoveryFromBootPlan> {
    let patch_data = patch_engine.compute_patch(recovery.data(), boot.data())?;
    let region = signature_region(recovery.data(), fixed_signature_region);
    let check_sha1 = region.map(|region| {
        let (offset, len) = region.bounds();
        let data = recovery.data();
        let start = (offset as usize).min(data.len());
        let end = ((offset + len) as usize).min(data.len());
        hex::encode(openssl::sha::sha1(&data[start..end]))
    });

    let mut script = String::new();
    script.push_str("#!/sbin/sh\n");
    script.push_str("update_recovery");
    if let Some(sha1) = &check_sha1 {
        script.push_str(&format!(" --check-sha1 {sha1}"));
    }
    script.push_str(&format!(
        " --src-sha1 {} --tgt-sha1 {} --tgt-size {} --patch {}\n",
        boot.sha1_hex(),
        recovery.sha1_hex(),
        recovery.size(),
        "/system/recovery-from-boot.p",
    ));

    Ok(RecoveryFromBootPlan {
        patch_data,
        source_sha1: boot.sha1_hex().to_string(),
        target_sha1: recovery.sha1_hex().to_string(),
        target_size: recovery.size(),
        check_sha1,
        install_recovery_sh: script,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::NullDeviceExtensions;

    fn ctx(do_partitioning: bool, fromgb: bool, device: &dyn crate::external::DeviceExtensions) -> ImagePlanContext {
        ImagePlanContext {
            do_partitioning,
            fromgb,
            device,
            fixed_signature_region: DEFAULT_FIXED_SIGNATURE_REGION,
        }
    }

    #[test]
    fn roster_appends_capsule_and_optional_images() {
        let roster = build_roster(FirmwareUpdateImage::Capsule, true, true);
        assert_eq!(
            roster,
            vec![
                ImageName::Boot,
                ImageName::Recovery,
                ImageName::Fastboot,
                ImageName::Esp,
                ImageName::Capsule,
                ImageName::Ulpmc,
                ImageName::Silentlake,
            ]
        );
    }

    #[test]
    fn roster_without_optional_flags_stays_minimal() {
        let roster = build_roster(FirmwareUpdateImage::Ifwi, false, false);
        assert_eq!(
            roster,
            vec![
                ImageName::Boot,
                ImageName::Recovery,
                ImageName::Fastboot,
                ImageName::Esp,
                ImageName::Ifwi,
            ]
        );
    }

    #[test]
    fn missing_target_is_skipped() {
        let d = NullDeviceExtensions;
        let decision = plan_image(ImageName::Boot, None, None, &ctx(false, false, &d));
        assert!(matches!(decision, ImageDecision::Skip));
    }

    #[test]
    fn identical_bytes_are_skipped() {
        let d = NullDeviceExtensions;
        let blob = FileBlob::new("boot.img", b"same bytes".to_vec());
        let decision = plan_image(
            ImageName::Boot,
            Some(&blob),
            Some(&blob),
            &ctx(false, false, &d),
        );
        assert!(matches!(decision, ImageDecision::Skip));
    }

    #[test]
    fn recovery_always_defers_to_recovery_from_boot() {
        let d = NullDeviceExtensions;
        let source = FileBlob::new("recovery.img", b"old".to_vec());
        let target = FileBlob::new("recovery.img", b"new".to_vec());
        let decision = plan_image(
            ImageName::Recovery,
            Some(&source),
            Some(&target),
            &ctx(false, false, &d),
        );
        assert!(matches!(decision, ImageDecision::RecoveryFromBoot));
    }

    #[test]
    fn esp_is_always_full_flash() {
        let d = NullDeviceExtensions;
        let source = FileBlob::new("esp.zip", b"old".to_vec());
        let target = FileBlob::new("esp.zip", b"new".to_vec());
        let decision = plan_image(
            ImageName::Esp,
            Some(&source),
            Some(&target),
            &ctx(false, false, &d),
        );
        assert!(matches!(decision, ImageDecision::FullFlash(_)));
    }

    #[test]
    fn partitioning_forces_full_flash_even_with_source() {
        let d = NullDeviceExtensions;
        let source = FileBlob::new("boot.img", b"old".to_vec());
        let target = FileBlob::new("boot.img", b"new".to_vec());
        let decision = plan_image(
            ImageName::Boot,
            Some(&source),
            Some(&target),
            &ctx(true, false, &d),
        );
        assert!(matches!(decision, ImageDecision::FullFlash(_)));
    }

    #[test]
    fn source_present_without_full_images_only_is_incremental() {
        let d = NullDeviceExtensions;
        let source = FileBlob::new("boot.img", b"old".to_vec());
        let target = FileBlob::new("boot.img", b"new".to_vec());
        let decision = plan_image(
            ImageName::Boot,
            Some(&source),
            Some(&target),
            &ctx(false, false, &d),
        );
        assert!(matches!(decision, ImageDecision::IncrementalPatch { .. }));
    }

    #[test]
    fn no_source_is_full_flash() {
        let d = NullDeviceExtensions;
        let target = FileBlob::new("boot.img", b"new".to_vec());
        let decision = plan_image(ImageName::Boot, None, Some(&target), &ctx(false, false, &d));
        assert!(matches!(decision, ImageDecision::FullFlash(_)));
    }

    #[test]
    fn signature_region_falls_back_to_fixed_window_without_magic() {
        let recovery = vec![0u8; 2000];
        assert_eq!(
            signature_region(&recovery, DEFAULT_FIXED_SIGNATURE_REGION),
            Some(SignatureRegion::Fixed { offset: 512, len: 480 })
        );
    }

    #[test]
    fn signature_region_honors_custom_fixed_fallback() {
        let recovery = vec![0u8; 2000];
        assert_eq!(
            signature_region(&recovery, (1024, 256)),
            Some(SignatureRegion::Fixed { offset: 1024, len: 256 })
        );
    }

    #[test]
    fn signature_region_derives_from_android_header() {
        let mut data = vec![0u8; 8 + 9 * 4];
        data[0..8].copy_from_slice(ANDROID_MAGIC);
        let page_size: u32 = 2048;
        let kernel_size: u32 = 5000;
        let ramdisk_size: u32 = 3000;
        let second_size: u32 = 0;
        let sig_size: u32 = 256;
        data[8..12].copy_from_slice(&kernel_size.to_le_bytes());
        data[16..20].copy_from_slice(&ramdisk_size.to_le_bytes());
        data[24..28].copy_from_slice(&second_size.to_le_bytes());
        data[36..40].copy_from_slice(&page_size.to_le_bytes());
        data[40..44].copy_from_slice(&sig_size.to_le_bytes());
        data.resize(20000, 0);
        let expected_offset = (ceil_div(kernel_size, page_size)
            + ceil_div(ramdisk_size, page_size)
            + ceil_div(second_size, page_size)
            + 1)
            * page_size as u64;
        assert_eq!(
            signature_region(&data, DEFAULT_FIXED_SIGNATURE_REGION),
            Some(SignatureRegion::Android { offset: expected_offset, len: 256 })
        );
    }

    #[test]
    fn zero_sig_size_with_magic_means_no_region() {
        let mut data = vec![0u8; 8 + 9 * 4];
        data[0..8].copy_from_slice(ANDROID_MAGIC);
        data[36..40].copy_from_slice(&2048u32.to_le_bytes());
        assert_eq!(signature_region(&data, DEFAULT_FIXED_SIGNATURE_REGION), None);
    }

    struct FixedPatchEngine(Vec<u8>);
    impl PatchEngine for FixedPatchEngine {
        fn compute_patch(&self, _target: &[u8], _source: &[u8]) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn recovery_from_boot_emits_check_sha1_without_magic() {
        let boot = FileBlob::new("boot.img", b"boot bytes".to_vec());
        let recovery = FileBlob::new("recovery.img", vec![7u8; 2000]);
        let engine = FixedPatchEngine(vec![1, 2, 3]);
        let plan =
            derive_recovery_from_boot(&boot, &recovery, &engine, DEFAULT_FIXED_SIGNATURE_REGION)
                .unwrap();
        assert!(plan.check_sha1.is_some());
        assert!(plan
            .install_recovery_sh
            .contains(&format!("--check-sha1 {}", plan.check_sha1.unwrap())));
        assert!(plan.install_recovery_sh.contains("--tgt-size 2000"));
    }

    #[test]
    fn check_size_accepts_blob_within_limit() {
        let blob = FileBlob::new("boot.img", vec![0u8; 100]);
        assert!(check_size(ImageName::Boot, &blob, Some(100)).is_ok());
    }

    #[test]
    fn check_size_rejects_blob_over_limit() {
        let blob = FileBlob::new("boot.img", vec![0u8; 101]);
        let err = check_size(ImageName::Boot, &blob, Some(100)).unwrap_err();
        assert!(err.to_string().contains("size violation"));
    }

    #[test]
    fn check_size_accepts_any_size_with_no_declared_limit() {
        let blob = FileBlob::new("boot.img", vec![0u8; 1_000_000]);
        assert!(check_size(ImageName::Boot, &blob, None).is_ok());
    }
}
