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

use std::fs::File;
use std::process::ExitCode;

use anyhow::{Context, Result};

use ota_compose::archive::TargetFilesArchive;
use ota_compose::assemble::{assemble_full_ota, assemble_incremental_ota};
use ota_compose::cli::Cli;
use ota_compose::compose::Collaborators;
use ota_compose::external::{
    ExternalArchiveSigner, ExternalFsConfigHelper, ExternalPatchEngine, NullDeviceExtensions,
};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();
    let options = cli.to_composition_options()?;

    let patch_engine = ExternalPatchEngine::new("imgdiff");
    let fs_config_helper = ExternalFsConfigHelper::new("fs_config");
    let signer = ExternalArchiveSigner::new("sign_ota_package");
    let device = NullDeviceExtensions;
    let collaborators = Collaborators {
        patch_engine: &patch_engine,
        fs_config_helper: &fs_config_helper,
        signer: &signer,
        device: &device,
    };

    let target_file = File::open(&cli.target_files)
        .with_context(|| format!("opening {}", cli.target_files.display()))?;
    let mut target = TargetFilesArchive::open(target_file)
        .with_context(|| format!("reading {}", cli.target_files.display()))?;

    let output_path = match &cli.incremental_from {
        Some(source_path) => {
            let source_file = File::open(source_path)
                .with_context(|| format!("opening {}", source_path.display()))?;
            let mut source = TargetFilesArchive::open(source_file)
                .with_context(|| format!("reading {}", source_path.display()))?;
            assemble_incremental_ota(
                &mut source,
                &mut target,
                &options,
                &collaborators,
                cli.output_ota.clone(),
                cli.dump_manifest.as_deref(),
            )?
        }
        None => assemble_full_ota(
            &mut target,
            &options,
            &collaborators,
            cli.output_ota.clone(),
            cli.dump_manifest.as_deref(),
        )?,
    };

    println!("Wrote {}", output_path.display());
    Ok(())
}
