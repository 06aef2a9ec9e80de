// src/assembler.rs

//! Archive stream assembly
//!
//! [`StreamAssembler`] serializes directories, regular files and symlinks as
//! GNU tar records into an [`ImageSink`]. Every write goes through the
//! session's [`EntryRegistry`] first: a destination path that was already
//! written is silently skipped, whichever source tree produced it.
//!
//! Directories, symlinks and synthetic files carry the session clock taken
//! when the assembler is created. Regular files keep their source mtime and
//! get their mode normalized with [`normalize_mode`].

use crate::entry::{normalize_mode, Entry, EntryKind};
use crate::error::{Error, Result};
use crate::path::DestPath;
use crate::registry::EntryRegistry;
use crate::sink::ImageSink;
use chrono::Utc;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tar::Builder;
use tracing::{debug, info, trace};

/// Counts of what reached the archive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblyStats {
    pub directories: usize,
    pub files: usize,
    pub symlinks: usize,
    /// Entries dropped because their destination was already written
    pub duplicates: usize,
    /// Payload bytes of regular files
    pub bytes: u64,
}

impl AssemblyStats {
    pub fn entries(&self) -> usize {
        self.directories + self.files + self.symlinks
    }
}

/// Yields exactly `size` bytes of `inner` or fails
///
/// A tar payload must match the size in its header. Extra bytes from a file
/// that grew are cut off; a file that shrank is an `UnexpectedEof` error.
struct SizedReader<R> {
    inner: io::Take<R>,
    remaining: u64,
}

impl<R: Read> SizedReader<R> {
    fn new(inner: R, size: u64) -> Self {
        Self {
            inner: inner.take(size),
            remaining: size,
        }
    }
}

impl<R: Read> Read for SizedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && self.remaining > 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file shrank by {} bytes while being archived", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Serializes entries into a sink, at most once per destination path
pub struct StreamAssembler<S: ImageSink> {
    builder: Builder<S>,
    registry: EntryRegistry,
    session_time: u64,
    stats: AssemblyStats,
}

impl<S: ImageSink> StreamAssembler<S> {
    /// Start a session writing into `sink`, with the clock set to now
    pub fn new(sink: S) -> Self {
        Self::with_session_time(sink, Utc::now().timestamp().max(0) as u64)
    }

    pub fn with_session_time(sink: S, session_time: u64) -> Self {
        Self {
            builder: Builder::new(sink),
            registry: EntryRegistry::new(),
            session_time,
            stats: AssemblyStats::default(),
        }
    }

    pub fn registry(&self) -> &EntryRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &AssemblyStats {
        &self.stats
    }

    /// Claim `path` for writing; the root is never written
    fn claim(&mut self, path: &DestPath) -> bool {
        if path.is_root() {
            return false;
        }
        if self.registry.claim(path) {
            return true;
        }
        self.stats.duplicates += 1;
        debug!("Skipping {}: already written", path);
        false
    }

    /// Write a directory; returns whether it was new
    pub fn write_directory(&mut self, path: &DestPath) -> Result<bool> {
        if !self.claim(path) {
            return Ok(false);
        }
        self.append(Entry::directory(path.clone(), self.session_time))?;
        Ok(true)
    }

    /// Write every missing ancestor directory of `path`, outermost first
    pub fn write_parents(&mut self, path: &DestPath) -> Result<()> {
        for ancestor in path.ancestors() {
            self.write_directory(&ancestor)?;
        }
        Ok(())
    }

    /// Write the regular file at `source` to `path`; returns whether it was new
    pub fn write_file(&mut self, path: &DestPath, source: &Path) -> Result<bool> {
        if !self.claim(path) {
            return Ok(false);
        }

        let source_error = |err| Error::Source {
            path: source.to_path_buf(),
            source: err,
        };
        let file = File::open(source).map_err(source_error)?;
        let metadata = file.metadata().map_err(source_error)?;

        let size = metadata.len();
        let mtime = metadata.mtime().max(0) as u64;
        let mode = normalize_mode(metadata.mode());

        let mut contents = SizedReader::new(file, size);
        self.append(Entry::file(path.clone(), mtime, mode, size, &mut contents))
            .map_err(|err| match err {
                Error::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof => source_error(err),
                other => other,
            })?;
        Ok(true)
    }

    /// Write an in-memory file stamped with the session clock
    pub fn write_data(&mut self, path: &DestPath, data: &[u8], mode: u32) -> Result<bool> {
        if !self.claim(path) {
            return Ok(false);
        }
        let mut contents = data;
        self.append(Entry::file(
            path.clone(),
            self.session_time,
            mode,
            data.len() as u64,
            &mut contents,
        ))?;
        Ok(true)
    }

    /// Write a symlink pointing at `target`; returns whether it was new
    pub fn write_symlink(&mut self, path: &DestPath, target: &Path) -> Result<bool> {
        if !self.claim(path) {
            return Ok(false);
        }
        self.append(Entry::symlink(
            path.clone(),
            self.session_time,
            target.to_path_buf(),
        ))?;
        Ok(true)
    }

    fn append(&mut self, entry: Entry<'_>) -> Result<()> {
        let mut header = entry.header();
        let name = entry.path.archive_name();
        trace!("Writing {} {}", entry.type_name(), entry.path);

        match entry.kind {
            EntryKind::Directory => {
                self.builder.append_data(&mut header, name, io::empty())?;
                self.stats.directories += 1;
            }
            EntryKind::File { size, contents } => {
                self.builder.append_data(&mut header, name, contents)?;
                self.stats.files += 1;
                self.stats.bytes += size;
            }
            EntryKind::Symlink { target } => {
                self.builder.append_link(&mut header, name, &target)?;
                self.stats.symlinks += 1;
            }
        }
        Ok(())
    }

    /// Hand a failure that interrupted the stream to the sink
    ///
    /// A subprocess sink whose consumer died replaces the write error with
    /// the consumer's exit status.
    pub fn abort(&mut self, err: Error) -> Error {
        self.builder.get_mut().abort(err)
    }

    /// Close the archive, then close the sink
    ///
    /// The tar footer is written before the sink is finished, so for a
    /// subprocess sink the compressor sees a complete archive before EOF.
    pub fn finish(mut self) -> Result<S::Output> {
        if let Err(err) = self.builder.finish() {
            return Err(self.abort(err.into()));
        }
        let stats = self.stats;
        let sink = self.builder.into_inner()?;
        info!(
            "Archived {} directories, {} files ({} bytes), {} symlinks; {} duplicates skipped",
            stats.directories, stats.files, stats.bytes, stats.symlinks, stats.duplicates
        );
        sink.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tar::{Archive, EntryType};

    const SESSION: u64 = 1_700_000_000;

    struct Listed {
        name: PathBuf,
        kind: EntryType,
        mode: u32,
        mtime: u64,
        data: Vec<u8>,
        link: Option<PathBuf>,
    }

    fn list(archive: &[u8]) -> Vec<Listed> {
        let mut archive = Archive::new(archive);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                Listed {
                    name: entry.path().unwrap().into_owned(),
                    kind: entry.header().entry_type(),
                    mode: entry.header().mode().unwrap(),
                    mtime: entry.header().mtime().unwrap(),
                    data,
                    link: entry.link_name().unwrap().map(|l| l.into_owned()),
                }
            })
            .collect()
    }

    fn assembler() -> StreamAssembler<Vec<u8>> {
        StreamAssembler::with_session_time(Vec::new(), SESSION)
    }

    #[test]
    fn test_directory_written_once() {
        let mut asm = assembler();
        let dir = DestPath::new("/data");

        assert!(asm.write_directory(&dir).unwrap());
        assert!(!asm.write_directory(&dir).unwrap());
        assert!(!asm.write_directory(&DestPath::new("data/")).unwrap());
        assert_eq!(asm.stats().duplicates, 2);

        let entries = list(&asm.finish().unwrap());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, PathBuf::from("data"));
        assert_eq!(entries[0].kind, EntryType::Directory);
        assert_eq!(entries[0].mode, 0o755);
        assert_eq!(entries[0].mtime, SESSION);
    }

    #[test]
    fn test_first_file_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let first = tmp.path().join("first");
        let second = tmp.path().join("second");
        fs::write(&first, b"first").unwrap();
        fs::write(&second, b"second").unwrap();

        let mut asm = assembler();
        let dest = DestPath::new("/etc/config");
        assert!(asm.write_file(&dest, &first).unwrap());
        assert!(!asm.write_file(&dest, &second).unwrap());
        // A different entry type at the same path is dropped too
        assert!(!asm.write_directory(&dest).unwrap());

        let entries = list(&asm.finish().unwrap());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].data, b"first");
        assert_eq!(entries[0].kind, EntryType::Regular);
    }

    #[test]
    fn test_file_mode_and_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("secret");
        fs::write(&source, b"data").unwrap();
        fs::set_permissions(&source, fs::Permissions::from_mode(0o640)).unwrap();
        let mtime = fs::metadata(&source).unwrap().mtime() as u64;

        let mut asm = assembler();
        asm.write_file(&DestPath::new("/secret"), &source).unwrap();

        let entries = list(&asm.finish().unwrap());
        assert_eq!(entries[0].mode, 0o644);
        assert_eq!(entries[0].mtime, mtime);
    }

    #[test]
    fn test_executable_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("tool");
        fs::write(&source, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&source, fs::Permissions::from_mode(0o4700)).unwrap();

        let mut asm = assembler();
        asm.write_file(&DestPath::new("/bin/tool"), &source).unwrap();

        let entries = list(&asm.finish().unwrap());
        assert_eq!(entries[0].mode, 0o755);
    }

    #[test]
    fn test_sized_reader_exact_length() {
        let mut grown = SizedReader::new(&b"abcdef"[..], 4);
        let mut out = Vec::new();
        grown.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcd");

        let mut shrunk = SizedReader::new(&b"abc"[..], 5);
        let mut out = Vec::new();
        let err = shrunk.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(out, b"abc");
    }

    #[test]
    fn test_missing_source_is_fatal() {
        let mut asm = assembler();
        let err = asm
            .write_file(&DestPath::new("/x"), Path::new("/nonexistent/dir2sif/x"))
            .unwrap_err();
        assert!(matches!(err, Error::Source { .. }));
    }

    #[test]
    fn test_symlink_entry() {
        let mut asm = assembler();
        asm.write_symlink(&DestPath::new("/data/link"), Path::new("/data/target"))
            .unwrap();

        let entries = list(&asm.finish().unwrap());
        assert_eq!(entries[0].kind, EntryType::Symlink);
        assert_eq!(entries[0].link, Some(PathBuf::from("/data/target")));
        assert_eq!(entries[0].mtime, SESSION);
    }

    #[test]
    fn test_long_names() {
        let long_dir = format!("/{}", "d".repeat(150));
        let long_target = format!("/{}/{}", "t".repeat(120), "u".repeat(80));

        let mut asm = assembler();
        asm.write_directory(&DestPath::new(&long_dir)).unwrap();
        asm.write_data(&DestPath::new(format!("{long_dir}/file")), b"x", 0o644)
            .unwrap();
        asm.write_symlink(&DestPath::new(format!("{long_dir}/link")), Path::new(&long_target))
            .unwrap();

        let entries = list(&asm.finish().unwrap());
        let names: Vec<PathBuf> = entries.iter().map(|e| e.name.clone()).collect();
        let trimmed = &long_dir[1..];
        assert_eq!(
            names,
            vec![
                PathBuf::from(trimmed),
                PathBuf::from(format!("{trimmed}/file")),
                PathBuf::from(format!("{trimmed}/link")),
            ]
        );
        assert_eq!(entries[2].link, Some(PathBuf::from(long_target)));
    }

    #[test]
    fn test_write_parents() {
        let mut asm = assembler();
        asm.write_parents(&DestPath::new("/opt/app/data")).unwrap();
        asm.write_parents(&DestPath::new("/opt/app/other")).unwrap();

        let entries = list(&asm.finish().unwrap());
        let names: Vec<PathBuf> = entries.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec![PathBuf::from("opt"), PathBuf::from("opt/app")]);
    }

    #[test]
    fn test_root_is_never_written() {
        let mut asm = assembler();
        assert!(!asm.write_directory(&DestPath::root()).unwrap());
        assert_eq!(asm.stats().duplicates, 0);
        assert!(list(&asm.finish().unwrap()).is_empty());
    }

    #[test]
    fn test_stats() {
        let mut asm = assembler();
        asm.write_directory(&DestPath::new("/a")).unwrap();
        asm.write_data(&DestPath::new("/a/f"), b"12345", 0o644).unwrap();
        asm.write_symlink(&DestPath::new("/a/l"), Path::new("f")).unwrap();

        assert_eq!(
            *asm.stats(),
            AssemblyStats {
                directories: 1,
                files: 1,
                symlinks: 1,
                duplicates: 0,
                bytes: 5,
            }
        );
        assert_eq!(asm.stats().entries(), 3);
        assert_eq!(asm.registry().len(), 3);
    }
}
