// src/cli.rs
//! CLI definitions for dir2sif
//!
//! Flags are single letters and repeatable where noted. `-r` rules are tried
//! in the order given and the first matching prefix wins.

use clap::Parser;
use dir2sif::{EnvVar, RemapRule, Sqfstar};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dir2sif")]
#[command(author = "dir2sif Contributors")]
#[command(version)]
#[command(about = "Add directories to a SIF image as a squashfs overlay partition", long_about = None)]
pub struct Cli {
    /// Path to the base SIF image
    #[arg(short = 'b', value_name = "PATH")]
    pub base: PathBuf,

    /// Output image
    #[arg(short = 'o', value_name = "PATH")]
    pub output: PathBuf,

    /// Path to be added to the image (can be used multiple times)
    #[arg(short = 'p', value_name = "PATH", required = true)]
    pub paths: Vec<PathBuf>,

    /// Replacement prefix, format FIND:REPLACE (can be used multiple times; first match wins)
    #[arg(short = 'r', value_name = "FIND:REPLACE")]
    pub replacements: Vec<RemapRule>,

    /// Environment variable to add to the image (can be used multiple times)
    #[arg(short = 'e', value_name = "KEY=VALUE")]
    pub env: Vec<EnvVar>,

    /// Directory to temporarily place the squashfs file (default: system temp dir)
    #[arg(short = 't', value_name = "DIR")]
    pub temp_dir: Option<PathBuf>,

    /// Fail instead of skipping entries that cannot be read while walking
    #[arg(long)]
    pub strict: bool,

    /// sqfstar program to run
    #[arg(long, value_name = "PROGRAM", env = "DIR2SIF_SQFSTAR", default_value = Sqfstar::DEFAULT_PROGRAM)]
    pub sqfstar: String,
}
