// src/walker.rs

//! Source tree traversal
//!
//! Walks one host directory depth-first in the filesystem's native order and
//! feeds every directory, regular file and symlink to the assembler under
//! the tree's destination root. Symlinks are never followed.
//!
//! Absolute symlink targets that start with the source root are rewritten
//! to point at the same location under the destination root. The root is
//! matched as a text prefix. Relative targets and all other targets are kept
//! verbatim and may dangle in the image.

use crate::assembler::StreamAssembler;
use crate::error::{Error, Result};
use crate::path::{clean, strip_text_prefix, DestPath};
use crate::sink::ImageSink;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// What to do when a node cannot be visited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WalkPolicy {
    /// Log the failure, skip the node and keep walking
    #[default]
    BestEffort,
    /// Abort the run on the first failure
    Strict,
}

/// Per-tree traversal counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub visited: usize,
    /// Nodes dropped because they could not be read
    pub skipped: usize,
    /// Sockets, FIFOs and device nodes
    pub special: usize,
    pub rewritten_links: usize,
}

impl std::ops::AddAssign for WalkStats {
    fn add_assign(&mut self, other: Self) {
        self.visited += other.visited;
        self.skipped += other.skipped;
        self.special += other.special;
        self.rewritten_links += other.rewritten_links;
    }
}

/// Point an absolute link target starting with `source_root` at `dest` instead
///
/// Returns `None` when the target should be kept as is.
///
/// ```
/// use dir2sif::DestPath;
/// use dir2sif::walker::rewrite_link_target;
/// use std::path::{Path, PathBuf};
///
/// let dest = DestPath::new("/data");
/// assert_eq!(
///     rewrite_link_target(Path::new("/home/me/src/target"), Path::new("/home/me/src"), &dest),
///     Some(PathBuf::from("/data/target"))
/// );
/// assert_eq!(rewrite_link_target(Path::new("/etc/passwd"), Path::new("/home/me/src"), &dest), None);
/// ```
pub fn rewrite_link_target(target: &Path, source_root: &Path, dest: &DestPath) -> Option<PathBuf> {
    if !target.is_absolute() {
        return None;
    }
    let rest = strip_text_prefix(target, source_root)?;
    Some(dest.join(rest).as_path().to_path_buf())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryWalker {
    policy: WalkPolicy,
}

impl DirectoryWalker {
    pub fn new(policy: WalkPolicy) -> Self {
        Self { policy }
    }

    /// Add the tree at `source` to the archive under `dest`
    ///
    /// Missing ancestors of `dest` are written once the root of the tree has
    /// been reached.
    pub fn walk<S: ImageSink>(
        &self,
        source: &Path,
        dest: &DestPath,
        assembler: &mut StreamAssembler<S>,
    ) -> Result<WalkStats> {
        info!("Adding {} as {}", source.display(), dest);

        let source_root = clean(std::path::absolute(source)?);
        let mut stats = WalkStats::default();

        for entry in WalkDir::new(source).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().unwrap_or(source).to_path_buf();
                    if self.policy == WalkPolicy::Strict {
                        return Err(Error::Walk { path, source: err });
                    }
                    warn!("Skipping {}: {}", path.display(), err);
                    stats.skipped += 1;
                    continue;
                }
            };
            stats.visited += 1;
            if entry.depth() == 0 {
                assembler.write_parents(dest)?;
            }

            let relative = entry.path().strip_prefix(source).unwrap_or(Path::new(""));
            let path = dest.join(relative);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                assembler.write_directory(&path)?;
            } else if file_type.is_file() {
                assembler.write_file(&path, entry.path())?;
            } else if file_type.is_symlink() {
                let target = fs::read_link(entry.path()).map_err(|err| Error::Source {
                    path: entry.path().to_path_buf(),
                    source: err,
                })?;
                let target = match rewrite_link_target(&target, &source_root, dest) {
                    Some(rewritten) => {
                        debug!(
                            "Rewrote link {}: {} -> {}",
                            path,
                            target.display(),
                            rewritten.display()
                        );
                        stats.rewritten_links += 1;
                        rewritten
                    }
                    None => target,
                };
                assembler.write_symlink(&path, &target)?;
            } else {
                debug!("Skipping special file {}", entry.path().display());
                stats.special += 1;
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::os::unix::fs::symlink;
    use tar::{Archive, EntryType};

    fn listing(archive: &[u8]) -> BTreeMap<String, (EntryType, Option<PathBuf>)> {
        let mut archive = Archive::new(archive);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().into_owned();
                let link = entry.link_name().unwrap().map(|l| l.into_owned());
                (name, (entry.header().entry_type(), link))
            })
            .collect()
    }

    #[test]
    fn test_rewrite_link_target() {
        let dest = DestPath::new("/dest");
        let root = Path::new("/src/tree");

        assert_eq!(
            rewrite_link_target(Path::new("/src/tree/a/b"), root, &dest),
            Some(PathBuf::from("/dest/a/b"))
        );
        assert_eq!(
            rewrite_link_target(Path::new("/src/tree"), root, &dest),
            Some(PathBuf::from("/dest"))
        );
        assert_eq!(rewrite_link_target(Path::new("/etc/passwd"), root, &dest), None);
        assert_eq!(rewrite_link_target(Path::new("../x"), root, &dest), None);
        // Textual prefix: a sibling sharing the root's name is rewritten too
        assert_eq!(
            rewrite_link_target(Path::new("/src/tree2/x"), root, &dest),
            Some(PathBuf::from("/dest/2/x"))
        );
    }

    #[test]
    fn test_walk_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source");
        fs::create_dir_all(source.join("sub")).unwrap();
        fs::write(source.join("target"), b"t").unwrap();
        fs::write(source.join("sub/file"), b"f").unwrap();
        symlink(source.join("target"), source.join("link")).unwrap();
        symlink("/etc/passwd", source.join("passwd")).unwrap();
        symlink("../target", source.join("sub/relative")).unwrap();

        let mut asm = StreamAssembler::with_session_time(Vec::new(), 1);
        let stats = DirectoryWalker::default()
            .walk(&source, &DestPath::new("/dest"), &mut asm)
            .unwrap();
        assert_eq!(stats.visited, 7);
        assert_eq!(stats.rewritten_links, 1);

        let entries = listing(&asm.finish().unwrap());
        let names: Vec<&str> = entries.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            vec![
                "dest",
                "dest/link",
                "dest/passwd",
                "dest/sub",
                "dest/sub/file",
                "dest/sub/relative",
                "dest/target",
            ]
        );
        assert_eq!(
            entries["dest/link"],
            (EntryType::Symlink, Some(PathBuf::from("/dest/target")))
        );
        assert_eq!(
            entries["dest/passwd"],
            (EntryType::Symlink, Some(PathBuf::from("/etc/passwd")))
        );
        assert_eq!(
            entries["dest/sub/relative"],
            (EntryType::Symlink, Some(PathBuf::from("../target")))
        );
        assert_eq!(entries["dest/sub"].0, EntryType::Directory);
        assert_eq!(entries["dest/sub/file"].0, EntryType::Regular);
    }

    #[test]
    fn test_walk_writes_parents_of_dest() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("f"), b"").unwrap();

        let mut asm = StreamAssembler::with_session_time(Vec::new(), 1);
        DirectoryWalker::default()
            .walk(tmp.path(), &DestPath::new("/opt/app/data"), &mut asm)
            .unwrap();

        let entries = listing(&asm.finish().unwrap());
        let names: Vec<&str> = entries.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["opt", "opt/app", "opt/app/data", "opt/app/data/f"]);
    }

    #[test]
    fn test_walk_skips_special_files() {
        let tmp = tempfile::tempdir().unwrap();
        let _listener = std::os::unix::net::UnixListener::bind(tmp.path().join("sock")).unwrap();
        fs::write(tmp.path().join("plain"), b"").unwrap();

        let mut asm = StreamAssembler::with_session_time(Vec::new(), 1);
        let stats = DirectoryWalker::default()
            .walk(tmp.path(), &DestPath::new("/d"), &mut asm)
            .unwrap();
        assert_eq!(stats.special, 1);

        let entries = listing(&asm.finish().unwrap());
        assert!(entries.contains_key("d/plain"));
        assert!(!entries.contains_key("d/sock"));
    }

    #[test]
    fn test_walk_missing_source_best_effort() {
        let mut asm = StreamAssembler::with_session_time(Vec::new(), 1);
        let stats = DirectoryWalker::new(WalkPolicy::BestEffort)
            .walk(Path::new("/nonexistent/dir2sif"), &DestPath::new("/opt/app/d"), &mut asm)
            .unwrap();
        assert_eq!(stats.skipped, 1);
        // No empty ancestors for a tree that was never reached
        assert_eq!(stats.visited, 0);
        assert!(listing(&asm.finish().unwrap()).is_empty());
    }

    #[test]
    fn test_walk_missing_source_strict() {
        let mut asm = StreamAssembler::with_session_time(Vec::new(), 1);
        let err = DirectoryWalker::new(WalkPolicy::Strict)
            .walk(Path::new("/nonexistent/dir2sif"), &DestPath::new("/d"), &mut asm)
            .unwrap_err();
        assert!(matches!(err, Error::Walk { .. }));
    }

    #[test]
    fn test_walk_dotted_source_rewrites_links() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("tree");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("target"), b"").unwrap();
        symlink(source.join("target"), source.join("link")).unwrap();

        // Walk through a path containing `.` so the root differs textually
        let dotted = tmp.path().join(".").join("tree");
        let mut asm = StreamAssembler::with_session_time(Vec::new(), 1);
        DirectoryWalker::default()
            .walk(&dotted, &DestPath::new("/x"), &mut asm)
            .unwrap();

        let entries = listing(&asm.finish().unwrap());
        assert_eq!(entries["x/link"].1, Some(PathBuf::from("/x/target")));
    }
}
