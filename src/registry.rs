// src/registry.rs

//! Registry of destination paths already written this session
//!
//! One registry lives for the whole run and is shared by every source tree
//! and by the environment script, so a destination path reaches the archive
//! at most once. When two sources map onto the same path the first writer
//! wins and later entries are dropped.

use crate::path::DestPath;
use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct EntryRegistry {
    seen: HashSet<DestPath>,
}

impl EntryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `path`, returning `true` only the first time it is claimed
    pub fn claim(&mut self, path: &DestPath) -> bool {
        if self.seen.contains(path) {
            return false;
        }
        self.seen.insert(path.clone())
    }

    pub fn contains(&self, path: &DestPath) -> bool {
        self.seen.contains(path)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
