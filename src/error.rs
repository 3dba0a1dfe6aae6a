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

//! Named error kinds for the composition engine. Most call sites just use
//! `anyhow::Result` with `.context(...)`; these variants exist for the
//! handful of cases spec'd as distinguishable failure kinds that a caller
//! (or a test) may want to match on.

/// A named failure kind raised by the composition engine.
#[derive(Debug, thiserror::Error)]
pub enum OtaError {
    /// A required archive entry is missing, or a field in it couldn't be parsed.
    #[error("malformed input: {0}")]
    InputMalformed(String),
    /// A path appears in both `require_verbatim` and `prohibit_verbatim`, or a
    /// `prohibit_verbatim` path would have been sent verbatim.
    #[error("configuration conflict: {0}")]
    ConfigConflict(String),
    /// An image blob exceeds a declared partition size limit.
    #[error("size violation: {0}")]
    SizeViolation(String),
    /// The installer script's cumulative progress fell short of the required minimum.
    #[error("progress underrun: reached {0:.3}, required >= 0.9")]
    ProgressUnderrun(f64),
    /// A failure surfaced by an external collaborator (fs_config, the patch engine, the signer).
    #[error("external helper failed: {0}")]
    External(String),
}
