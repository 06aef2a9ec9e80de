// src/remap.rs

//! Destination prefix remapping
//!
//! A source directory lands in the image at the path it has on the host
//! unless a `FIND:REPLACE` rule rewrites its prefix. Rules are tried in the
//! order they were given on the command line and the **first** match wins,
//! so a more specific rule must come before a broader one:
//!
//! ```
//! use dir2sif::{RemapRule, RemapRules};
//! use std::path::Path;
//!
//! let rules: RemapRules = vec![
//!     "/a/b:/1".parse::<RemapRule>().unwrap(),
//!     "/a:/2".parse().unwrap(),
//! ]
//! .into();
//! assert_eq!(rules.remap(Path::new("/a/b")), Path::new("/1"));
//! assert_eq!(rules.remap(Path::new("/a/c")), Path::new("/2/c"));
//! ```

use crate::error::{Error, Result};
use crate::path::{clean, strip_text_prefix};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// One `FIND:REPLACE` prefix substitution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapRule {
    /// Prefix matched against the source path
    pub find: PathBuf,
    /// Prefix substituted for `find`
    pub replace: PathBuf,
}

impl RemapRule {
    pub fn new(find: impl Into<PathBuf>, replace: impl Into<PathBuf>) -> Self {
        Self {
            find: find.into(),
            replace: replace.into(),
        }
    }

    /// Apply this rule, or `None` if `find` is not a prefix of `path`
    ///
    /// The prefix is compared as text, so `/a` also matches `/ab` (giving
    /// `replace` joined with `b`).
    pub fn apply(&self, path: &Path) -> Option<PathBuf> {
        let rest = strip_text_prefix(path, &self.find)?;
        Some(clean(self.replace.join(rest)))
    }
}

impl FromStr for RemapRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [find, replace] => Ok(Self::new(*find, *replace)),
            _ => Err(Error::InvalidRemapRule(s.to_string())),
        }
    }
}

/// Ordered rule list; order is significant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemapRules(Vec<RemapRule>);

impl RemapRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a source path to its destination
    ///
    /// The first rule whose prefix matches rewrites the path; with no match
    /// the path is returned unchanged.
    pub fn remap(&self, path: &Path) -> PathBuf {
        self.0
            .iter()
            .find_map(|rule| rule.apply(path))
            .unwrap_or_else(|| path.to_path_buf())
    }
}

impl From<Vec<RemapRule>> for RemapRules {
    fn from(rules: Vec<RemapRule>) -> Self {
        Self(rules)
    }
}
