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

//! A path-indexed mirror of one archive's `SYSTEM/` tree, carrying resolved
//! (uid, gid, mode) metadata and able to compact that metadata into a small
//! set of `set_perm`/`set_perm_recursive` script primitives.
//!
//! Each composition scans at most two archives (source and target, in
//! incremental mode). Each scan gets its own `Tree`; nothing is shared
//! between them, which avoids the aliasing hazard called out in the design
//! notes of the original tool this crate reimplements.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};

use crate::external::FsConfigHelper;
use crate::script::Primitive;

/// A synthesized node the image planner adds directly, bypassing `fs_config`.
pub const RECOVERY_PATCH_PATH: &str = "system/recovery-from-boot.p";
pub const INSTALL_RECOVERY_SH_PATH: &str = "system/etc/install-recovery.sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

#[derive(Debug)]
struct Node {
    is_directory: bool,
    meta: Option<Metadata>,
    parent: Option<String>,
    children: Vec<String>,
}

/// Per-directory aggregate used for permission compaction: the owner/mode
/// combination that would require the fewest overrides if applied
/// recursively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Subtree {
    uid: u32,
    gid: u32,
    dmode: u32,
    fmode: u32,
}

pub struct Tree {
    nodes: HashMap<String, Node>,
}

impl Tree {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            String::new(),
            Node {
                is_directory: true,
                meta: None,
                parent: None,
                children: Vec::new(),
            },
        );
        Self { nodes }
    }

    /// Registers `path` (and any missing intermediate directories) in the
    /// tree. Idempotent for directories; calling it twice for the same file
    /// path is a bug in the caller (the loader only ever registers a given
    /// path once) but is tolerated here rather than treated as fatal.
    pub fn ensure_node(&mut self, path: &str, is_directory: bool) {
        if self.nodes.contains_key(path) {
            return;
        }
        let (parent, name) = match path.rsplit_once('/') {
            Some((p, n)) => (p.to_string(), n.to_string()),
            None => (String::new(), path.to_string()),
        };
        if !self.nodes.contains_key(&parent) {
            self.ensure_node(&parent, true);
        }
        self.nodes
            .get_mut(&parent)
            .expect("parent just ensured")
            .children
            .push(name);
        self.nodes.insert(
            path.to_string(),
            Node {
                is_directory,
                meta: None,
                parent: Some(parent),
                children: Vec::new(),
            },
        );
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    fn set_meta(&mut self, path: &str, meta: Metadata) {
        if let Some(node) = self.nodes.get_mut(path) {
            node.meta = Some(meta);
        }
    }

    /// Registers the two images-planner-synthesized paths with their
    /// hardcoded metadata, per the recovery-from-boot derivation.
    pub fn register_recovery_patch_paths(&mut self) {
        self.ensure_node(RECOVERY_PATCH_PATH, false);
        self.set_meta(
            RECOVERY_PATCH_PATH,
            Metadata {
                uid: 0,
                gid: 0,
                mode: 0o644,
            },
        );
        self.ensure_node(INSTALL_RECOVERY_SH_PATH, false);
        self.set_meta(
            INSTALL_RECOVERY_SH_PATH,
            Metadata {
                uid: 0,
                gid: 0,
                mode: 0o544,
            },
        );
    }

    /// Resolves ownership and mode for every registered node, either from a
    /// parsed `META/filesystem_config.txt` or by invoking the `fs_config`
    /// helper, then sorts every directory's children lexicographically.
    pub fn resolve(
        &mut self,
        filesystem_config: Option<&str>,
        fs_config_helper: &dyn FsConfigHelper,
    ) -> Result<()> {
        let records = match filesystem_config {
            Some(text) => parse_filesystem_config(text)?,
            None => {
                let mut query = Vec::new();
                let mut paths: Vec<&String> = self.nodes.keys().collect();
                paths.sort();
                for path in paths {
                    if path.is_empty() {
                        continue;
                    }
                    let node = &self.nodes[path];
                    if node.meta.is_some() {
                        // Already resolved (the two synthesized recovery paths).
                        continue;
                    }
                    if node.is_directory {
                        query.push(format!("{}/", path));
                    } else {
                        query.push(path.clone());
                    }
                }
                fs_config_helper
                    .resolve(&query)
                    .context("invoking fs_config helper")?
            }
        };
        for record in records {
            self.set_meta(
                &record.path,
                Metadata {
                    uid: record.uid,
                    gid: record.gid,
                    mode: record.mode,
                },
            );
        }
        let mut paths: Vec<String> = self.nodes.keys().cloned().collect();
        for path in &paths {
            if let Some(node) = self.nodes.get_mut(path) {
                if node.is_directory {
                    node.children.sort();
                }
            }
        }
        paths.sort();
        Ok(())
    }

    fn meta(&self, path: &str) -> Metadata {
        self.nodes
            .get(path)
            .and_then(|n| n.meta)
            .unwrap_or(Metadata {
                uid: 0,
                gid: 0,
                mode: 0,
            })
    }

    /// Collects the ordered list of proper descendants' tuples of `path`, in
    /// the deterministic (sorted-children) traversal order required for
    /// reproducible tie-breaking.
    fn descendant_tuples(&self, path: &str) -> Vec<(u32, u32, Option<u32>, Option<u32>)> {
        let mut out = Vec::new();
        self.collect_descendant_tuples(path, &mut out);
        out
    }

    fn collect_descendant_tuples(&self, path: &str, out: &mut Vec<(u32, u32, Option<u32>, Option<u32>)>) {
        let node = match self.nodes.get(path) {
            Some(n) => n,
            None => return,
        };
        for child_name in &node.children {
            let child_path = join(path, child_name);
            let child = &self.nodes[&child_path];
            let m = self.meta(&child_path);
            if child.is_directory {
                out.push((m.uid, m.gid, Some(m.mode), None));
                self.collect_descendant_tuples(&child_path, out);
            } else {
                out.push((m.uid, m.gid, None, Some(m.mode)));
            }
        }
    }

    fn best_subtree(&self, path: &str) -> Subtree {
        let tuples = self.descendant_tuples(path);
        let owner = best_owner(&tuples);
        let dmode = streaming_mode(tuples.iter().filter_map(|t| {
            if (t.0, t.1) == owner {
                t.2
            } else {
                None
            }
        }))
        .unwrap_or(0);
        let fmode = streaming_mode(tuples.iter().filter_map(|t| {
            if (t.0, t.1) == owner {
                t.3
            } else {
                None
            }
        }))
        .unwrap_or(0);
        Subtree {
            uid: owner.0,
            gid: owner.1,
            dmode,
            fmode,
        }
    }

    /// Emits the minimal `set_perm`/`set_perm_recursive` sequence that
    /// reproduces every node's resolved metadata, rooted at `root` (normally
    /// `"system"`).
    pub fn emit_permissions(&self, root: &str) -> Vec<Primitive> {
        let mut out = Vec::new();
        // Sentinel context that matches nothing, per the correctness condition in 4.1.
        let sentinel = Subtree {
            uid: u32::MAX,
            gid: u32::MAX,
            dmode: u32::MAX,
            fmode: u32::MAX,
        };
        self.emit_node(root, sentinel, &mut out);
        out
    }

    fn emit_node(&self, path: &str, context: Subtree, out: &mut Vec<Primitive>) {
        let node = match self.nodes.get(path) {
            Some(n) => n,
            None => return,
        };
        let m = self.meta(path);
        let device_path = format!("/{}", path);
        let mut active = context;
        if node.is_directory {
            let subtree = self.best_subtree(path);
            if subtree != context {
                out.push(Primitive::SetPermRecursive {
                    path: device_path.clone(),
                    uid: subtree.uid,
                    gid: subtree.gid,
                    dmode: subtree.dmode,
                    fmode: subtree.fmode,
                });
                active = subtree;
            }
            if (m.uid, m.gid, m.mode) != (active.uid, active.gid, active.dmode) {
                out.push(Primitive::SetPerm {
                    path: device_path,
                    uid: m.uid,
                    gid: m.gid,
                    mode: m.mode,
                });
            }
            for name in &node.children {
                self.emit_node(&join(path, name), active, out);
            }
        } else if (m.uid, m.gid, m.mode) != (active.uid, active.gid, active.fmode) {
            out.push(Primitive::SetPerm {
                path: device_path,
                uid: m.uid,
                gid: m.gid,
                mode: m.mode,
            });
        }
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Picks the `(uid, gid)` pair with the largest total tuple count, ties
/// broken by whichever pair was first encountered in iteration order.
fn best_owner(tuples: &[(u32, u32, Option<u32>, Option<u32>)]) -> (u32, u32) {
    let mut counts: HashMap<(u32, u32), u64> = HashMap::new();
    for t in tuples {
        *counts.entry((t.0, t.1)).or_insert(0) += 1;
    }
    let mut seen = HashSet::new();
    let mut best: Option<((u32, u32), u64)> = None;
    for t in tuples {
        let owner = (t.0, t.1);
        if !seen.insert(owner) {
            continue;
        }
        let count = counts[&owner];
        best = match best {
            None => Some((owner, count)),
            Some((bowner, bcount)) => {
                if count > bcount {
                    Some((owner, count))
                } else {
                    Some((bowner, bcount))
                }
            }
        };
    }
    best.map(|(o, _)| o).unwrap_or((0, 0))
}

/// Picks the most frequent item in `items`, ties broken by last-seen-wins
/// (a `>=` comparison against the running best), matching the upstream
/// tool's tie-breaking behavior.
fn streaming_mode(items: impl Iterator<Item = u32>) -> Option<u32> {
    let mut counts: HashMap<u32, u64> = HashMap::new();
    let mut best: Option<(u32, u64)> = None;
    for item in items {
        let count = {
            let c = counts.entry(item).or_insert(0);
            *c += 1;
            *c
        };
        let is_best = match &best {
            None => true,
            Some((_, bc)) => count >= *bc,
        };
        if is_best {
            best = Some((item, count));
        }
    }
    best.map(|(v, _)| v)
}

/// One resolved `path uid gid octal_mode` record, whether parsed from
/// `META/filesystem_config.txt` or read back from the `fs_config` helper.
pub struct FsConfigRecord {
    pub path: String,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

pub fn parse_filesystem_config(text: &str) -> Result<Vec<FsConfigRecord>> {
    let mut records = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        records.push(parse_fs_config_line(line)?);
    }
    Ok(records)
}

fn parse_fs_config_line(line: &str) -> Result<FsConfigRecord> {
    let mut parts = line.split_whitespace();
    let path = parts
        .next()
        .with_context(|| format!("missing path in fs_config line: {line:?}"))?
        .trim_end_matches('/')
        .to_string();
    let uid: u32 = parts
        .next()
        .with_context(|| format!("missing uid in fs_config line: {line:?}"))?
        .parse()
        .with_context(|| format!("parsing uid in fs_config line: {line:?}"))?;
    let gid: u32 = parts
        .next()
        .with_context(|| format!("missing gid in fs_config line: {line:?}"))?
        .parse()
        .with_context(|| format!("parsing gid in fs_config line: {line:?}"))?;
    let mode_str = parts
        .next()
        .with_context(|| format!("missing mode in fs_config line: {line:?}"))?;
    let mode =
        u32::from_str_radix(mode_str, 8).with_context(|| format!("parsing mode {mode_str:?}"))?;
    Ok(FsConfigRecord {
        path,
        uid,
        gid,
        mode,
    })
}
