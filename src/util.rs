// Copyright 2020 CoreOS, Inc.
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

use anyhow::{anyhow, bail, Context, Result};
use std::io::Write;
use std::process::{Command, Stdio};

/// Runs `cmd`, feeding `input` to its stdin, and returns its captured stdout. Used for the
/// external helpers that speak a line-oriented protocol over stdin/stdout (`fs_config`, the
/// patch engine, the archive signer).
pub fn cmd_pipe(cmd: &mut Command, input: &[u8]) -> Result<Vec<u8>> {
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    let mut child = cmd.spawn().with_context(|| format!("spawning {:#?}", cmd))?;
    child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("no stdin handle for {:#?}", cmd))?
        .write_all(input)
        .with_context(|| format!("writing to stdin of {:#?}", cmd))?;
    let result = child
        .wait_with_output()
        .with_context(|| format!("waiting for {:#?}", cmd))?;
    if !result.status.success() {
        eprint!("{}", String::from_utf8_lossy(&result.stderr));
        bail!("{:#?} failed with {}", cmd, result.status);
    }
    Ok(result.stdout)
}
