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

//! Read-only accessor over a target-files archive (spec.md §6.1). This is
//! the sole place that speaks the archive's ZIP layout; everything else in
//! the crate works with `FileBlob`s and paths.

use std::collections::BTreeMap;
use std::io::{Read, Seek};

use anyhow::{Context, Result};

use crate::blob::FileBlob;

/// External-attribute upper word identifying a ZIP entry as a symlink,
/// per spec.md §4.2/§6.1.
const SYMLINK_EXTERNAL_ATTR: u32 = 0o120777;

pub struct SystemEntry {
    /// Path relative to `SYSTEM/`, forward-slash separated.
    pub rel_path: String,
    pub is_directory: bool,
    pub symlink_target: Option<Vec<u8>>,
    pub data: Vec<u8>,
}

/// Parses `key=value` lines, ignoring blanks and `#` comments, shared by
/// `misc_info.txt` and `build.prop`.
fn parse_key_value_lines(text: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

pub struct TargetFilesArchive<R: Read + Seek> {
    zip: zip::ZipArchive<R>,
}

impl<R: Read + Seek> TargetFilesArchive<R> {
    pub fn open(reader: R) -> Result<Self> {
        let zip = zip::ZipArchive::new(reader).context("opening target-files archive")?;
        Ok(Self { zip })
    }

    /// Reads `META/filesystem_config.txt` if present.
    pub fn filesystem_config(&mut self) -> Result<Option<String>> {
        self.read_optional_text("META/filesystem_config.txt")
    }

    /// Reads `META/misc_info.txt` as a flat key/value dictionary.
    pub fn misc_info(&mut self) -> Result<BTreeMap<String, String>> {
        let text = self
            .read_optional_text("META/misc_info.txt")?
            .unwrap_or_default();
        Ok(parse_key_value_lines(&text))
    }

    /// Reads `SYSTEM/build.prop` as a flat key/value dictionary.
    pub fn build_prop(&mut self) -> Result<BTreeMap<String, String>> {
        let text = self
            .read_optional_text("SYSTEM/build.prop")?
            .unwrap_or_default();
        Ok(parse_key_value_lines(&text))
    }

    fn read_optional_text(&mut self, path: &str) -> Result<Option<String>> {
        match self.zip.by_name(path) {
            Ok(mut entry) => {
                let mut buf = String::new();
                entry
                    .read_to_string(&mut buf)
                    .with_context(|| format!("reading {path}"))?;
                Ok(Some(buf))
            }
            Err(zip::result::ZipError::FileNotFound) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("opening {path}")),
        }
    }

    /// Iterates all `SYSTEM/**` entries in archive order. Symlinks are
    /// identified by the external-attribute upper word (spec.md §4.2/6.1);
    /// regular files by everything else (directories end in `/`).
    pub fn system_entries(&mut self) -> Result<Vec<SystemEntry>> {
        let mut out = Vec::new();
        let names: Vec<String> = self
            .zip
            .file_names()
            .filter(|n| n.starts_with("SYSTEM/"))
            .map(|n| n.to_string())
            .collect();
        for name in names {
            let mut entry = self.zip.by_name(&name).with_context(|| format!("opening {name}"))?;
            let rel_path = name.trim_start_matches("SYSTEM/").to_string();
            if rel_path.is_empty() {
                continue;
            }
            let is_directory = rel_path.ends_with('/');
            let external_attr = entry.unix_mode().unwrap_or(0);
            let is_symlink = external_attr == SYMLINK_EXTERNAL_ATTR;
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .with_context(|| format!("reading {name}"))?;
            let rel_path = rel_path.trim_end_matches('/').to_string();
            if is_symlink {
                out.push(SystemEntry {
                    rel_path,
                    is_directory: false,
                    symlink_target: Some(data),
                    data: Vec::new(),
                });
            } else {
                out.push(SystemEntry {
                    rel_path,
                    is_directory,
                    symlink_target: None,
                    data,
                });
            }
        }
        Ok(out)
    }

    /// Reads an optional partition-table description used by the flash
    /// dispatch rules in spec.md §6.2, if the build carries one.
    pub fn partition_table(&mut self) -> Result<Option<String>> {
        self.read_optional_text("META/partition-table.txt")
    }

    /// Fetches a named bootable image's bytes, searching the conventional
    /// per-image source subtrees (spec.md §6.1): `IMAGES/<name><ext>` then
    /// `<NAME>/<name><ext>`.
    pub fn get_bootable_image(&mut self, name: &str, ext: &str) -> Result<Option<FileBlob>> {
        let candidates = [
            format!("IMAGES/{name}{ext}"),
            format!("{}/{name}{ext}", name.to_uppercase()),
        ];
        for candidate in candidates {
            match self.zip.by_name(&candidate) {
                Ok(mut entry) => {
                    let mut data = Vec::new();
                    entry
                        .read_to_end(&mut data)
                        .with_context(|| format!("reading {candidate}"))?;
                    return Ok(Some(FileBlob::new(format!("{name}{ext}"), data)));
                }
                Err(zip::result::ZipError::FileNotFound) => continue,
                Err(e) => return Err(e).with_context(|| format!("opening {candidate}")),
            }
        }
        Ok(None)
    }
}

/// Where C2 and C7 write the output archive's entries. Exists so the
/// system-file loader can "copy into the output archive" (spec.md §4.2)
/// without the loader itself depending on how the final archive is
/// assembled, signed, and cleaned up.
pub trait OutputSink {
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()>;
}

/// A deflated ZIP written to a temporary file, renamed into place on
/// success. Mirrors the temp-file-then-rename pattern used for build
/// archives elsewhere in this corpus.
pub struct ZipOutputArchive {
    zip: zip::ZipWriter<std::fs::File>,
    tmp_path: std::path::PathBuf,
    final_path: std::path::PathBuf,
    finished: bool,
}

impl ZipOutputArchive {
    pub fn create(final_path: impl Into<std::path::PathBuf>) -> Result<Self> {
        let final_path = final_path.into();
        let mut tmp_path = final_path.clone();
        tmp_path.set_extension("partial");
        let file = std::fs::File::create(&tmp_path)
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        Ok(Self {
            zip: zip::ZipWriter::new(file),
            tmp_path,
            final_path,
            finished: false,
        })
    }

    pub fn write_text(&mut self, path: &str, text: &str) -> Result<()> {
        self.write_file(path, text.as_bytes())
    }

    /// Closes the archive and renames the temporary file into place.
    /// Returns the final path so the caller (C7) can hand it to the signer.
    pub fn finish(mut self) -> Result<std::path::PathBuf> {
        self.zip.finish().context("finishing output archive")?;
        self.finished = true;
        std::fs::rename(&self.tmp_path, &self.final_path).with_context(|| {
            format!(
                "renaming {} to {}",
                self.tmp_path.display(),
                self.final_path.display()
            )
        })?;
        Ok(self.final_path)
    }
}

impl Drop for ZipOutputArchive {
    /// Composition never leaves a partial output archive behind on an
    /// error path (spec.md §7): if `finish` was never reached, the scratch
    /// file is removed here.
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

impl OutputSink for ZipOutputArchive {
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let opts =
            zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        self.zip
            .start_file(path, opts)
            .with_context(|| format!("starting {path} in output archive"))?;
        use std::io::Write;
        self.zip
            .write_all(data)
            .with_context(|| format!("writing {path} to output archive"))?;
        Ok(())
    }
}

/// An in-memory sink used by tests that don't need a real file on disk.
#[cfg(test)]
pub(crate) struct MemorySink {
    pub files: BTreeMap<String, Vec<u8>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
impl OutputSink for MemorySink {
    fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.files.insert(path.to_string(), data.to_vec());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::{Cursor, Write};
    use zip::write::FileOptions;
    use zip::ZipWriter;

    /// Builds an in-memory target-files archive from `(path, contents)`
    /// pairs, used by this crate's component-level tests.
    pub fn build_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buf);
            let opts = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
            for (path, data) in entries {
                zip.start_file(*path, opts).unwrap();
                zip.write_all(data).unwrap();
            }
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    /// Like `build_archive`, but marks `symlink_paths` entries with the
    /// symlink external-attribute bits (target stored as entry contents).
    pub fn build_archive_with_symlinks(
        entries: &[(&str, &[u8])],
        symlink_paths: &[&str],
    ) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buf);
            for (path, data) in entries {
                let mode = if symlink_paths.contains(path) {
                    0o120777
                } else {
                    0o100644
                };
                let opts = FileOptions::default()
                    .compression_method(zip::CompressionMethod::Deflated)
                    .unix_permissions(mode);
                zip.start_file(*path, opts).unwrap();
                zip.write_all(data).unwrap();
            }
            zip.finish().unwrap();
        }
        buf.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::io::Cursor;

    #[test]
    fn misc_info_parses_key_value_lines() {
        let bytes = build_archive(&[(
            "META/misc_info.txt",
            b"recovery_api_version=3\nbios_type=iafw\n",
        )]);
        let mut archive = TargetFilesArchive::open(Cursor::new(bytes)).unwrap();
        let info = archive.misc_info().unwrap();
        assert_eq!(info.get("recovery_api_version").unwrap(), "3");
        assert_eq!(info.get("bios_type").unwrap(), "iafw");
    }

    #[test]
    fn system_entries_classifies_symlinks_and_files() {
        let bytes = build_archive_with_symlinks(
            &[
                ("SYSTEM/a/b.txt", b"hello"),
                ("SYSTEM/a/c", b"b.txt"),
            ],
            &["SYSTEM/a/c"],
        );
        let mut archive = TargetFilesArchive::open(Cursor::new(bytes)).unwrap();
        let entries = archive.system_entries().unwrap();
        let file = entries.iter().find(|e| e.rel_path == "a/b.txt").unwrap();
        assert_eq!(file.data, b"hello");
        assert!(file.symlink_target.is_none());
        let link = entries.iter().find(|e| e.rel_path == "a/c").unwrap();
        assert_eq!(link.symlink_target.as_deref(), Some(&b"b.txt"[..]));
    }
}
