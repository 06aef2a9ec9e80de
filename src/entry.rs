// src/entry.rs

//! Classified filesystem entries and their archive headers

use crate::path::DestPath;
use std::io::Read;
use std::path::PathBuf;
use tar::{EntryType, Header};

/// Mode given to every directory in the image
pub const DIR_MODE: u32 = 0o755;

/// Mode given to every symlink in the image
pub const SYMLINK_MODE: u32 = 0o777;

/// Highest mode a regular file may carry: no setuid, setgid or sticky bit
/// and no group/other write
const MODE_CEILING: u32 = 0o755;

/// Normalize a regular file's permission bits
///
/// The owner's `rwx` bits are copied into the group and other positions and
/// the result is masked to `0755`.
///
/// ```
/// use dir2sif::entry::normalize_mode;
///
/// assert_eq!(normalize_mode(0o640), 0o644);
/// assert_eq!(normalize_mode(0o700), 0o755);
/// assert_eq!(normalize_mode(0o4755), 0o755);
/// ```
pub fn normalize_mode(mode: u32) -> u32 {
    let owner = mode & 0o700;
    (owner | owner >> 3 | owner >> 6) & MODE_CEILING
}

/// Payload and type-specific data of an entry
pub enum EntryKind<'a> {
    Directory,
    File {
        size: u64,
        contents: &'a mut dyn Read,
    },
    Symlink {
        target: PathBuf,
    },
}

/// One filesystem object destined for the archive
pub struct Entry<'a> {
    /// Location inside the image, also the dedup key
    pub path: DestPath,
    /// Modification time, seconds since the epoch
    pub mtime: u64,
    pub mode: u32,
    pub kind: EntryKind<'a>,
}

impl<'a> Entry<'a> {
    pub fn directory(path: DestPath, mtime: u64) -> Self {
        Self {
            path,
            mtime,
            mode: DIR_MODE,
            kind: EntryKind::Directory,
        }
    }

    pub fn file(
        path: DestPath,
        mtime: u64,
        mode: u32,
        size: u64,
        contents: &'a mut dyn Read,
    ) -> Self {
        Self {
            path,
            mtime,
            mode,
            kind: EntryKind::File { size, contents },
        }
    }

    pub fn symlink(path: DestPath, mtime: u64, target: PathBuf) -> Self {
        Self {
            path,
            mtime,
            mode: SYMLINK_MODE,
            kind: EntryKind::Symlink { target },
        }
    }

    /// Short label used in log lines
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            EntryKind::Directory => "directory",
            EntryKind::File { .. } => "file",
            EntryKind::Symlink { .. } => "symlink",
        }
    }

    /// GNU header carrying type, mode, mtime and size
    ///
    /// Name, link name and checksum are filled in by `tar::Builder` so that
    /// long values get GNU long-name records.
    pub fn header(&self) -> Header {
        let mut header = Header::new_gnu();
        let (entry_type, size) = match &self.kind {
            EntryKind::Directory => (EntryType::Directory, 0),
            EntryKind::File { size, .. } => (EntryType::Regular, *size),
            EntryKind::Symlink { .. } => (EntryType::Symlink, 0),
        };
        header.set_entry_type(entry_type);
        header.set_mode(self.mode);
        header.set_mtime(self.mtime);
        header.set_size(size);
        header.set_uid(0);
        header.set_gid(0);
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_mode_broadens_owner_bits() {
        assert_eq!(normalize_mode(0o640), 0o644);
        assert_eq!(normalize_mode(0o600), 0o644);
        assert_eq!(normalize_mode(0o700), 0o755);
        assert_eq!(normalize_mode(0o500), 0o555);
        assert_eq!(normalize_mode(0o400), 0o444);
    }

    #[test]
    fn test_normalize_mode_ignores_group_other_and_special_bits() {
        assert_eq!(normalize_mode(0o077), 0o000);
        assert_eq!(normalize_mode(0o6777), 0o755);
        assert_eq!(normalize_mode(0o1644), 0o644);
    }

    #[test]
    fn test_header_fields() {
        let mut data: &[u8] = b"hello";
        let entry = Entry::file(DestPath::new("/f"), 1_700_000_000, 0o644, 5, &mut data);
        let header = entry.header();
        assert_eq!(header.entry_type(), EntryType::Regular);
        assert_eq!(header.mode().unwrap(), 0o644);
        assert_eq!(header.mtime().unwrap(), 1_700_000_000);
        assert_eq!(header.size().unwrap(), 5);
        assert!(header.as_gnu().is_some());

        let dir = Entry::directory(DestPath::new("/d"), 42);
        assert_eq!(dir.header().entry_type(), EntryType::Directory);
        assert_eq!(dir.header().mode().unwrap(), DIR_MODE);
        assert_eq!(dir.type_name(), "directory");

        let link = Entry::symlink(DestPath::new("/l"), 42, PathBuf::from("/t"));
        assert_eq!(link.header().entry_type(), EntryType::Symlink);
        assert_eq!(link.header().size().unwrap(), 0);
    }
}
