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

//! Difference planner (spec.md §4.3): classifies every target file as
//! verbatim, patched, or unchanged, dispatching patch computation across a
//! small worker pool and admitting results back in sorted order.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Mutex;

use anyhow::Result;

use crate::blob::FileBlob;
use crate::error::OtaError;
use crate::external::PatchEngine;

pub const DEFAULT_PATCH_THRESHOLD: f64 = 0.95;
pub const DEFAULT_WORKER_THREADS: usize = 3;

pub struct DiffOptions {
    pub require_verbatim: HashSet<String>,
    pub prohibit_verbatim: HashSet<String>,
    /// Paths excluded from diffing entirely and always sent verbatim,
    /// populated by the device-specific extension hook rather than invented
    /// configuration; empty by default, which leaves the core's behavior
    /// unchanged.
    pub exclude_patch_paths: HashSet<String>,
    pub patch_threshold: f64,
    pub worker_threads: usize,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            require_verbatim: HashSet::new(),
            prohibit_verbatim: HashSet::new(),
            exclude_patch_paths: HashSet::new(),
            patch_threshold: DEFAULT_PATCH_THRESHOLD,
            worker_threads: DEFAULT_WORKER_THREADS,
        }
    }
}

impl DiffOptions {
    pub fn validate(&self) -> Result<()> {
        let both: Vec<&String> = self
            .require_verbatim
            .intersection(&self.prohibit_verbatim)
            .collect();
        if let Some(path) = both.into_iter().next() {
            return Err(OtaError::ConfigConflict(format!(
                "{path} is in both require_verbatim and prohibit_verbatim"
            ))
            .into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum PatchDecision {
    Verbatim {
        path: String,
        size: u64,
    },
    Patched {
        path: String,
        target: FileBlob,
        source: FileBlob,
        target_size: u64,
        patch_sha1: String,
        patch_data: Vec<u8>,
    },
    Unchanged,
}

pub struct DiffPlan {
    /// Target path -> decision, in target-path sorted order.
    pub decisions: BTreeMap<String, PatchDecision>,
    pub largest_source_size: u64,
}

struct PendingPatch {
    path: String,
    target: FileBlob,
    source: FileBlob,
}

pub fn plan_diffs(
    source_files: &BTreeMap<String, FileBlob>,
    target_files: &BTreeMap<String, FileBlob>,
    options: &DiffOptions,
    patch_engine: &dyn PatchEngine,
) -> Result<DiffPlan> {
    options.validate()?;

    let mut decisions = BTreeMap::new();
    let mut pending = Vec::new();

    for (path, target) in target_files {
        let in_source = source_files.contains_key(path);
        if !in_source || options.require_verbatim.contains(path) || options.exclude_patch_paths.contains(path) {
            if options.prohibit_verbatim.contains(path) {
                return Err(OtaError::ConfigConflict(format!(
                    "{path} would be sent verbatim but is in prohibit_verbatim"
                ))
                .into());
            }
            decisions.insert(
                path.clone(),
                PatchDecision::Verbatim {
                    path: path.clone(),
                    size: target.size(),
                },
            );
            continue;
        }

        let source = &source_files[path];
        if source.sha1_hex() == target.sha1_hex() {
            decisions.insert(path.clone(), PatchDecision::Unchanged);
            continue;
        }

        pending.push(PendingPatch {
            path: path.clone(),
            target: target.clone(),
            source: source.clone(),
        });
    }

    let patches = compute_patches(&pending, options.worker_threads, patch_engine)?;

    let mut largest_source_size = 0;
    for (pending, patch_data) in pending.into_iter().zip(patches) {
        let target_size = pending.target.size();
        if (patch_data.len() as f64) > options.patch_threshold * (target_size as f64) {
            decisions.insert(
                pending.path.clone(),
                PatchDecision::Verbatim {
                    path: pending.path,
                    size: target_size,
                },
            );
            continue;
        }
        largest_source_size = largest_source_size.max(pending.source.size());
        let patch_sha1 = hex::encode(openssl::sha::sha1(&patch_data));
        decisions.insert(
            pending.path.clone(),
            PatchDecision::Patched {
                path: pending.path,
                target: pending.target,
                source: pending.source,
                target_size,
                patch_sha1,
                patch_data,
            },
        );
    }

    Ok(DiffPlan {
        decisions,
        largest_source_size,
    })
}

/// Runs `compute_patch` for every pending pair across a bounded worker
/// pool, returning results in the same order as `pending`. Per spec.md §5:
/// workers are independent, results are gathered in sorted order before
/// admission, and any worker failure aborts the whole composition after all
/// workers have finished (no cancellation, no partial results).
fn compute_patches(
    pending: &[PendingPatch],
    worker_threads: usize,
    patch_engine: &dyn PatchEngine,
) -> Result<Vec<Vec<u8>>> {
    if pending.is_empty() {
        return Ok(Vec::new());
    }

    let queue: Mutex<VecDeque<usize>> = Mutex::new((0..pending.len()).collect());
    let results: Vec<Mutex<Option<Result<Vec<u8>>>>> =
        (0..pending.len()).map(|_| Mutex::new(None)).collect();
    let worker_count = worker_threads.max(1).min(pending.len());

    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            scope.spawn(|| loop {
                let idx = match queue.lock().unwrap().pop_front() {
                    Some(i) => i,
                    None => break,
                };
                let item = &pending[idx];
                let result = patch_engine.compute_patch(item.target.data(), item.source.data());
                *results[idx].lock().unwrap() = Some(result);
            });
        }
    });

    let mut out = Vec::with_capacity(pending.len());
    for cell in results {
        let result = cell
            .into_inner()
            .unwrap()
            .expect("every queued index is processed exactly once");
        out.push(result?);
    }
    Ok(out)
}
