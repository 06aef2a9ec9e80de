// src/overlay.rs

//! Overlay build orchestration
//!
//! One run of the tool:
//!
//! 1. create a scoped temp directory for the intermediate image,
//! 2. start the compressor and walk every source tree into it,
//! 3. append the environment script, if any,
//! 4. finish the archive and wait for the compressor to exit,
//! 5. clone the base container and append the image as a partition.
//!
//! Step 5 never starts before step 4 has returned, so the collaborator only
//! ever sees a complete image file. The temp directory is removed on every
//! exit path; an unfinished compressor is torn down before that happens.

use crate::assembler::{AssemblyStats, StreamAssembler};
use crate::envscript::{self, EnvVar};
use crate::error::{Error, Result};
use crate::path::DestPath;
use crate::remap::RemapRules;
use crate::sif::ContainerPatcher;
use crate::sink::{Compressor, ImageSink};
use crate::walker::{DirectoryWalker, WalkPolicy, WalkStats};
use std::path::PathBuf;
use tracing::{debug, info};

/// File name of the intermediate image inside the temp directory
const IMAGE_NAME: &str = "overlay.img";

/// Inputs of one overlay build
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Container image to clone
    pub base: PathBuf,
    /// Where the patched container is written
    pub output: PathBuf,
    /// Host trees to add, in order
    pub sources: Vec<PathBuf>,
    pub rules: RemapRules,
    pub env: Vec<EnvVar>,
    /// Parent of the scoped temp directory; system temp dir when unset
    pub temp_dir: Option<PathBuf>,
    pub walk_policy: WalkPolicy,
}

impl BuildOptions {
    pub fn new(base: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            output: output.into(),
            sources: Vec::new(),
            rules: RemapRules::new(),
            env: Vec::new(),
            temp_dir: None,
            walk_policy: WalkPolicy::default(),
        }
    }
}

/// Summary of a finished build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub assembly: AssemblyStats,
    pub walk: WalkStats,
    /// Whether the environment script entry was written
    pub env_script: bool,
}

/// Stream every source tree and the env script into `assembler`
fn assemble<S: ImageSink>(
    options: &BuildOptions,
    assembler: &mut StreamAssembler<S>,
    report: &mut BuildReport,
) -> Result<()> {
    let walker = DirectoryWalker::new(options.walk_policy);
    for source in &options.sources {
        let dest = DestPath::new(options.rules.remap(source));
        report.walk += walker.walk(source, &dest, assembler)?;
    }
    report.env_script = envscript::inject(assembler, &options.env)?;
    Ok(())
}

/// Build the overlay image and splice it into a copy of the base container
pub fn build_overlay<C, P>(options: &BuildOptions, compressor: &C, patcher: &P) -> Result<BuildReport>
where
    C: Compressor,
    P: ContainerPatcher,
{
    if options.sources.is_empty() {
        return Err(Error::NoSources);
    }
    if !options.base.is_file() {
        return Err(Error::BaseImageNotFound(options.base.clone()));
    }

    let temp_root = options.temp_dir.clone().unwrap_or_else(std::env::temp_dir);
    let work_dir = tempfile::Builder::new()
        .prefix("dir2sif-")
        .tempdir_in(&temp_root)?;
    let image = work_dir.path().join(IMAGE_NAME);
    debug!("Intermediate image at {}", image.display());

    let mut report = BuildReport::default();
    {
        let mut assembler = StreamAssembler::new(compressor.open(&image)?);
        if let Err(err) = assemble(options, &mut assembler, &mut report) {
            return Err(assembler.abort(err));
        }
        report.assembly = *assembler.stats();

        // Returns only after the compressor has exited successfully
        assembler.finish()?;
    }

    if report.walk.skipped > 0 {
        info!("{} unreadable entries were left out", report.walk.skipped);
    }

    patcher.clone_and_append(
        &options.base,
        &options.output,
        &image,
        compressor.filesystem(),
    )?;

    work_dir.close()?;
    Ok(report)
}
