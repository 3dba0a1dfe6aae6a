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

//! System file loader (spec.md §4.2): enumerates `SYSTEM/**`, registers
//! every entry into a `Tree`, optionally copies file contents (with
//! per-path substitutions) into an output archive, and returns the
//! symlink and lib-retouch lists.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};

use crate::archive::{OutputSink, SystemEntry};
use crate::blob::FileBlob;
use crate::tree::Tree;

/// `None` in the substitution map value means "omit this file entirely".
pub type Substitutions = HashMap<String, Option<Vec<u8>>>;

pub struct LoadedSystem {
    /// `(target, link)` pairs, sorted by `(target, link)`, target first.
    pub symlinks: Vec<(String, String)>,
    /// `(device_path, sha1_hex)` for every regular file under `lib/`.
    pub retouch: Vec<(String, String)>,
    /// Every loaded regular file, keyed by its `system/`-relative device
    /// path (e.g. `system/bin/sh`), for later diffing.
    pub files: BTreeMap<String, FileBlob>,
}

/// Loads `entries` (as returned by `TargetFilesArchive::system_entries`)
/// into `tree`, applying `substitutions`, and writing surviving file
/// contents to `sink` if provided.
pub fn load_system(
    entries: Vec<SystemEntry>,
    substitutions: &Substitutions,
    tree: &mut Tree,
    mut sink: Option<&mut dyn OutputSink>,
) -> Result<LoadedSystem> {
    let mut symlinks = Vec::new();
    let mut retouch = Vec::new();
    let mut files = BTreeMap::new();

    for entry in entries {
        if let Some(target) = entry.symlink_target {
            let link_path = format!("/system/{}", entry.rel_path);
            symlinks.push((
                String::from_utf8(target).context("symlink target is not valid UTF-8")?,
                link_path,
            ));
            continue;
        }

        let device_path = format!("system/{}", entry.rel_path);
        tree.ensure_node(&device_path, entry.is_directory);

        if entry.is_directory {
            continue;
        }

        let data = match substitutions.get(&device_path) {
            Some(None) => continue,
            Some(Some(bytes)) => bytes.clone(),
            None => entry.data,
        };

        if let Some(sink) = sink.as_deref_mut() {
            sink.write_file(&device_path, &data)
                .with_context(|| format!("writing {device_path} to output archive"))?;
        }

        if entry.rel_path.starts_with("lib/") {
            let sha1_hex = hex::encode(openssl::sha::sha1(&data));
            retouch.push((device_path.clone(), sha1_hex));
        }

        files.insert(device_path.clone(), FileBlob::new(device_path, data));
    }

    symlinks.sort();

    Ok(LoadedSystem {
        symlinks,
        retouch,
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_support::build_archive_with_symlinks;
    use crate::archive::{MemorySink, TargetFilesArchive};
    use std::io::Cursor;

    fn load(entries: &[(&str, &[u8])], symlink_paths: &[&str]) -> (LoadedSystem, Tree, MemorySink) {
        let bytes = build_archive_with_symlinks(entries, symlink_paths);
        let mut archive = TargetFilesArchive::open(Cursor::new(bytes)).unwrap();
        let sys_entries = archive.system_entries().unwrap();
        let mut tree = Tree::new();
        let mut sink = MemorySink::new();
        let loaded = load_system(sys_entries, &Substitutions::new(), &mut tree, Some(&mut sink)).unwrap();
        (loaded, tree, sink)
    }

    #[test]
    fn single_file_and_symlink_round_trip() {
        let (loaded, tree, sink) = load(
            &[("SYSTEM/a/b.txt", b"hello"), ("SYSTEM/a/c", b"b.txt")],
            &["SYSTEM/a/c"],
        );
        assert_eq!(loaded.symlinks, vec![("b.txt".to_string(), "/system/a/c".to_string())]);
        assert!(tree.contains("system/a/b.txt"));
        assert_eq!(sink.files.get("system/a/b.txt").unwrap(), b"hello");
        assert!(loaded.files.contains_key("system/a/b.txt"));
    }

    #[test]
    fn lib_files_are_retouched() {
        let (loaded, _tree, _sink) = load(&[("SYSTEM/lib/libc.so", b"sofile")], &[]);
        assert_eq!(loaded.retouch.len(), 1);
        assert_eq!(loaded.retouch[0].0, "system/lib/libc.so");
    }

    #[test]
    fn substitution_none_omits_file() {
        let bytes = build_archive_with_symlinks(&[("SYSTEM/a.txt", b"orig")], &[]);
        let mut archive = TargetFilesArchive::open(Cursor::new(bytes)).unwrap();
        let entries = archive.system_entries().unwrap();
        let mut subs = Substitutions::new();
        subs.insert("system/a.txt".to_string(), None);
        let mut tree = Tree::new();
        let mut sink = MemorySink::new();
        let loaded = load_system(entries, &subs, &mut tree, Some(&mut sink)).unwrap();
        assert!(!loaded.files.contains_key("system/a.txt"));
        assert!(sink.files.is_empty());
    }
}
