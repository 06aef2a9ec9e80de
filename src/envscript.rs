// src/envscript.rs

//! Environment script injection
//!
//! Singularity sources every script in `/.singularity.d/env` when a
//! container starts. Variables given with `-e KEY=VALUE` are written to one
//! generated script there, going through the assembler like any other file.
//!
//! Values are wrapped in double quotes without escaping, so a value that
//! itself contains `"`, `$` or a backtick is interpreted by the shell.

use crate::assembler::StreamAssembler;
use crate::error::{Error, Result};
use crate::path::DestPath;
use crate::sink::ImageSink;
use std::fmt::Write as _;
use std::str::FromStr;
use tracing::{debug, info};

/// Location of the generated script inside the image
pub const SCRIPT_PATH: &str = "/.singularity.d/env/99_dir2singularity.sh";

const SCRIPT_MODE: u32 = 0o755;

/// One `KEY=VALUE` assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl FromStr for EnvVar {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('=').collect();
        match parts.as_slice() {
            [key, value] if !key.is_empty() => Ok(Self::new(*key, *value)),
            _ => Err(Error::InvalidEnvVar(s.to_string())),
        }
    }
}

/// Render one `export KEY="VALUE"` line per variable, in order
pub fn render_script(vars: &[EnvVar]) -> String {
    let mut script = String::new();
    for var in vars {
        let _ = writeln!(script, "export {}=\"{}\"", var.key, var.value);
    }
    script
}

/// Write the environment script into the archive
///
/// Nothing is written when `vars` is empty. Returns whether the script
/// entry was written.
pub fn inject<S: ImageSink>(assembler: &mut StreamAssembler<S>, vars: &[EnvVar]) -> Result<bool> {
    if vars.is_empty() {
        return Ok(false);
    }

    let path = DestPath::new(SCRIPT_PATH);
    assembler.write_parents(&path)?;

    let script = render_script(vars);
    let written = assembler.write_data(&path, script.as_bytes(), SCRIPT_MODE)?;
    if written {
        info!("Added {} environment variables at {}", vars.len(), path);
    } else {
        debug!("{} already provided by a source tree", path);
    }
    Ok(written)
}
