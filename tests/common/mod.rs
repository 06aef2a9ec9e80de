// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use dir2sif::sif::{Arch, Partition, SifImage};
use dir2sif::{Compressor, PipeSink, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use tar::{Archive, EntryType};

/// One archive member as read back from an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listed {
    pub name: String,
    pub kind: EntryType,
    pub mode: u32,
    pub mtime: u64,
    pub data: Vec<u8>,
    pub link: Option<PathBuf>,
}

/// Read every member of a tar stream, in archive order
pub fn list_archive(bytes: &[u8]) -> Vec<Listed> {
    let mut archive = Archive::new(bytes);
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            Listed {
                name: entry.path().unwrap().to_string_lossy().into_owned(),
                kind: entry.header().entry_type(),
                mode: entry.header().mode().unwrap(),
                mtime: entry.header().mtime().unwrap(),
                data,
                link: entry.link_name().unwrap().map(|l| l.into_owned()),
            }
        })
        .collect()
}

/// Find a member by name
pub fn find<'a>(entries: &'a [Listed], name: &str) -> Option<&'a Listed> {
    entries.iter().find(|e| e.name == name)
}

/// Create an empty amd64 SIF with room for a few objects
pub fn base_sif(dir: &Path) -> PathBuf {
    let path = dir.join("base.sif");
    SifImage::create(&path, Arch::AMD64, 8).unwrap();
    path
}

/// The single appended partition of `sif` and its payload
pub fn overlay_partition(sif: &Path) -> (Partition, Vec<u8>) {
    let mut image = SifImage::open(sif).unwrap();
    let descriptors: Vec<_> = image.descriptors().cloned().collect();
    assert_eq!(descriptors.len(), 1, "expected exactly one object");
    let payload = image.read_object(&descriptors[0]).unwrap();
    (descriptors[0].partition().unwrap(), payload)
}

/// Compressor that pipes the archive through `sh`, which stores it verbatim
///
/// Exercises the real subprocess pipe without needing sqfstar installed.
pub struct ShellCompressor {
    pub script: &'static str,
}

impl ShellCompressor {
    pub fn storing() -> Self {
        Self {
            script: r#"cat > "$1""#,
        }
    }

    pub fn failing() -> Self {
        Self {
            script: "cat > /dev/null; exit 1",
        }
    }

    /// Exits without reading its input
    pub fn exiting_early() -> Self {
        Self { script: "exit 7" }
    }
}

impl Compressor for ShellCompressor {
    type Sink = PipeSink;

    fn open(&self, image: &Path) -> Result<PipeSink> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(self.script).arg("sh").arg(image);
        PipeSink::spawn(command)
    }

    fn filesystem(&self) -> dir2sif::sif::FsType {
        dir2sif::sif::FsType::Raw
    }
}
