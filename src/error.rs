// src/error.rs

//! Error types for overlay assembly

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building an overlay image
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid replacement {0:?}: expected FIND:REPLACE")]
    InvalidRemapRule(String),

    #[error("Invalid environment variable {0:?}: expected KEY=VALUE")]
    InvalidEnvVar(String),

    #[error("At least one source path must be specified")]
    NoSources,

    #[error("Base image not found at {0}")]
    BaseImageNotFound(PathBuf),

    #[error("Failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Source { path: PathBuf, source: io::Error },

    #[error("Required tool not found: {0}")]
    ToolNotFound(String),

    #[error("Failed to start {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("{program} failed with {status}")]
    Compressor { program: String, status: ExitStatus },

    #[error("Invalid SIF image {path}: {reason}")]
    InvalidSif { path: PathBuf, reason: String },

    #[error("No free descriptor slot in {0}")]
    NoFreeDescriptor(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
