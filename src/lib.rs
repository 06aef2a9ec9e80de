// src/lib.rs

//! dir2sif
//!
//! Adds host directory trees to a Singularity (SIF) container image as a
//! squashfs overlay partition.
//!
//! # Architecture
//!
//! - Remapping: each source root gets a destination root from ordered
//!   `FIND:REPLACE` prefix rules
//! - Assembly: trees are walked and streamed as a GNU tar archive, each
//!   destination path written at most once per run
//! - Compression: the archive is piped into `sqfstar`, which runs
//!   concurrently and writes the squashfs image
//! - Patching: the base SIF is cloned and the image appended as an overlay
//!   partition once the compressor has exited

pub mod assembler;
pub mod entry;
pub mod envscript;
mod error;
pub mod overlay;
pub mod path;
pub mod registry;
pub mod remap;
pub mod sif;
pub mod sink;
pub mod walker;

pub use assembler::{AssemblyStats, StreamAssembler};
pub use envscript::EnvVar;
pub use error::{Error, Result};
pub use overlay::{build_overlay, BuildOptions, BuildReport};
pub use path::DestPath;
pub use registry::EntryRegistry;
pub use remap::{RemapRule, RemapRules};
pub use sif::{ContainerPatcher, SifPatcher};
pub use sink::{Compressor, ImageSink, PipeSink, PlainTar, Sqfstar};
pub use walker::{DirectoryWalker, WalkPolicy, WalkStats};
