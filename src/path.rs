// src/path.rs

//! Destination path handling
//!
//! Every entry written into the overlay is keyed by a [`DestPath`]: an
//! absolute, lexically cleaned path inside the image. Two spellings of the
//! same location (`/data/./x`, `data//x/`, `/data/y/../x`) map to the same
//! key, which is what makes the entry registry's dedup reliable.

use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

/// Lexically clean a path
///
/// Removes `.` components and redundant separators and resolves `..`
/// against the preceding component. A `..` that would climb above the root
/// of an absolute path is dropped; in a relative path it is kept.
/// An empty result becomes `/` or `.`.
///
/// No filesystem access is performed, so symlinks are not resolved.
pub fn clean(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let mut rooted = false;
    let mut parts: Vec<Component<'_>> = Vec::new();

    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                rooted = true;
                parts.clear();
            }
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(component),
            },
            Component::Normal(_) => parts.push(component),
        }
    }

    let mut cleaned = if rooted {
        PathBuf::from("/")
    } else {
        PathBuf::new()
    };
    for part in parts {
        cleaned.push(part.as_os_str());
    }

    if cleaned.as_os_str().is_empty() {
        cleaned.push(".");
    }
    cleaned
}

/// Remainder of `path` after the textual prefix `prefix`
///
/// Unlike [`Path::strip_prefix`] this ignores component boundaries, so
/// `/ab/c` minus `/a` is `b/c`. A leading separator on the remainder is
/// dropped so it can be joined onto another path.
pub fn strip_text_prefix<'a>(path: &'a Path, prefix: &Path) -> Option<&'a Path> {
    let rest = path
        .as_os_str()
        .as_bytes()
        .strip_prefix(prefix.as_os_str().as_bytes())?;
    let rest = Path::new(OsStr::from_bytes(rest));
    Some(rest.strip_prefix("/").unwrap_or(rest))
}

/// An absolute, cleaned path inside the overlay image
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DestPath(PathBuf);

impl DestPath {
    /// The image root
    pub fn root() -> Self {
        Self(PathBuf::from("/"))
    }

    /// Build a destination path, anchoring relative input at the root
    ///
    /// # Examples
    ///
    /// ```
    /// use dir2sif::DestPath;
    ///
    /// assert_eq!(DestPath::new("data/./x/").to_string(), "/data/x");
    /// assert_eq!(DestPath::new("/a/b/../c").to_string(), "/a/c");
    /// ```
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self(clean(Path::new("/").join(path.as_ref())))
    }

    /// Append a path relative to this one
    ///
    /// A leading `/` on `relative` is ignored, so the result never escapes
    /// `self` through an absolute argument.
    pub fn join(&self, relative: impl AsRef<Path>) -> Self {
        let relative = relative.as_ref();
        let relative = relative.strip_prefix("/").unwrap_or(relative);
        Self::new(self.0.join(relative))
    }

    /// Whether this is the image root
    pub fn is_root(&self) -> bool {
        self.0.as_os_str() == "/"
    }

    /// The path as stored in the archive: no leading `/`
    ///
    /// Empty for the root.
    pub fn archive_name(&self) -> &Path {
        self.0.strip_prefix("/").unwrap_or(&self.0)
    }

    /// Ancestors strictly between the root and `self`, outermost first
    pub fn ancestors(&self) -> Vec<DestPath> {
        let mut ancestors: Vec<DestPath> = self
            .0
            .ancestors()
            .skip(1)
            .filter(|p| p.parent().is_some())
            .map(|p| Self(p.to_path_buf()))
            .collect();
        ancestors.reverse();
        ancestors
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for DestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl AsRef<Path> for DestPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}
