// src/sif.rs

//! SIF container patching
//!
//! The overlay is delivered by cloning a base Singularity Image Format file
//! and appending the compressed image as a new data partition. Only the
//! parts of SIF needed for that are modelled here: the global header, the
//! fixed descriptor table and the partition descriptor's extra data.
//!
//! # Layout (little-endian)
//!
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ Global header (128 bytes)    │
//! ├──────────────────────────────┤ descriptors_offset
//! │ Descriptor table             │
//! │ (descriptors_total × 585)    │
//! ├──────────────────────────────┤ data_offset
//! │ Object data                  │
//! │ ...                          │
//! │ new partition (4K aligned)   │
//! └──────────────────────────────┘ data_offset + data_size
//! ```

use crate::error::{Error, Result};
use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Size of the global header
pub const HEADER_LEN: usize = 128;

/// Size of one descriptor
pub const DESCRIPTOR_LEN: usize = 585;

const LAUNCH_SCRIPT: &[u8] = b"#!/usr/bin/env run-singularity\n";
const MAGIC: [u8; 10] = *b"SIF_MAGIC\0";
const VERSION: [u8; 3] = *b"01\0";

const NAME_LEN: usize = 128;
const EXTRA_LEN: usize = 384;

/// Descriptor data type of a filesystem partition
pub const DATA_PARTITION: i32 = 0x4004;

/// High bits set on every stored group id
const GROUP_MASK: u32 = 0xf000_0000;
const DEFAULT_GROUP: u32 = 1;

/// Partition payloads start on a page boundary
const PARTITION_ALIGNMENT: u64 = 4096;

/// Filesystem held by a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FsType {
    Squash = 1,
    Ext3 = 2,
    ImmutableObjects = 3,
    Raw = 4,
}

/// Role of a partition in the container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PartType {
    System = 1,
    PrimarySystem = 2,
    Data = 3,
    Overlay = 4,
}

/// Three-byte architecture code as stored in SIF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arch(pub [u8; 3]);

impl Arch {
    pub const UNKNOWN: Self = Self(*b"00\0");
    pub const AMD64: Self = Self(*b"02\0");
    pub const ARM64: Self = Self(*b"04\0");

    const NAMES: [(&'static [u8; 3], &'static str); 13] = [
        (b"00\0", "unknown"),
        (b"01\0", "386"),
        (b"02\0", "amd64"),
        (b"03\0", "arm"),
        (b"04\0", "arm64"),
        (b"05\0", "ppc64"),
        (b"06\0", "ppc64le"),
        (b"07\0", "mips"),
        (b"08\0", "mipsle"),
        (b"09\0", "mips64"),
        (b"10\0", "mips64le"),
        (b"11\0", "s390x"),
        (b"12\0", "riscv64"),
    ];

    /// Go-style architecture name
    pub fn name(&self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(code, _)| **code == self.0)
            .map(|(_, name)| *name)
            .unwrap_or("unknown")
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Sequential little-endian field reader over a fixed buffer
struct Fields<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn i64(&mut self) -> i64 {
        i64::from_le_bytes(self.bytes())
    }

    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.bytes())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.bytes())
    }
}

/// SIF global header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub launch_script: [u8; 32],
    pub arch: Arch,
    pub id: [u8; 16],
    pub created_at: i64,
    pub modified_at: i64,
    pub descriptors_free: i64,
    pub descriptors_total: i64,
    pub descriptors_offset: i64,
    pub descriptors_size: i64,
    pub data_offset: i64,
    pub data_size: i64,
}

impl Header {
    /// Header of an image with `capacity` empty descriptor slots and no data
    pub fn new(arch: Arch, capacity: usize) -> Self {
        let mut launch_script = [0u8; 32];
        launch_script[..LAUNCH_SCRIPT.len()].copy_from_slice(LAUNCH_SCRIPT);

        let descriptors_size = (capacity * DESCRIPTOR_LEN) as u64;
        let data_offset = (HEADER_LEN as u64 + descriptors_size).next_multiple_of(PARTITION_ALIGNMENT);
        let now = Utc::now().timestamp();

        Self {
            launch_script,
            arch,
            id: *uuid::Uuid::new_v4().as_bytes(),
            created_at: now,
            modified_at: now,
            descriptors_free: capacity as i64,
            descriptors_total: capacity as i64,
            descriptors_offset: HEADER_LEN as i64,
            descriptors_size: descriptors_size as i64,
            data_offset: data_offset as i64,
            data_size: 0,
        }
    }

    /// Parse a header, rejecting anything without the SIF magic and version
    pub fn decode(buf: &[u8; HEADER_LEN]) -> std::result::Result<Self, String> {
        let mut fields = Fields::new(buf);
        let launch_script = fields.bytes::<32>();
        if fields.bytes::<10>() != MAGIC {
            return Err("bad magic".to_string());
        }
        let version = fields.bytes::<3>();
        if version != VERSION {
            return Err(format!(
                "unsupported version {:?}",
                String::from_utf8_lossy(&version).trim_end_matches('\0')
            ));
        }

        Ok(Self {
            launch_script,
            arch: Arch(fields.bytes()),
            id: fields.bytes(),
            created_at: fields.i64(),
            modified_at: fields.i64(),
            descriptors_free: fields.i64(),
            descriptors_total: fields.i64(),
            descriptors_offset: fields.i64(),
            descriptors_size: fields.i64(),
            data_offset: fields.i64(),
            data_size: fields.i64(),
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(&self.launch_script);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&VERSION);
        buf.extend_from_slice(&self.arch.0);
        buf.extend_from_slice(&self.id);
        for value in [
            self.created_at,
            self.modified_at,
            self.descriptors_free,
            self.descriptors_total,
            self.descriptors_offset,
            self.descriptors_size,
            self.data_offset,
            self.data_size,
        ] {
            buf.extend_from_slice(&value.to_le_bytes());
        }

        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(&buf);
        out
    }

    /// End of the data section
    fn data_end(&self) -> u64 {
        self.data_offset.saturating_add(self.data_size).max(0) as u64
    }
}

/// Partition metadata kept in a descriptor's extra bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub fs_type: i32,
    pub part_type: i32,
    pub arch: Arch,
}

impl Partition {
    fn encode(&self) -> [u8; EXTRA_LEN] {
        let mut extra = [0u8; EXTRA_LEN];
        extra[0..4].copy_from_slice(&self.fs_type.to_le_bytes());
        extra[4..8].copy_from_slice(&self.part_type.to_le_bytes());
        extra[8..11].copy_from_slice(&self.arch.0);
        extra
    }

    fn decode(extra: &[u8; EXTRA_LEN]) -> Self {
        let mut fields = Fields::new(extra);
        Self {
            fs_type: fields.i32(),
            part_type: fields.i32(),
            arch: Arch(fields.bytes()),
        }
    }
}

/// One slot of the descriptor table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub data_type: i32,
    pub used: bool,
    pub id: u32,
    pub group_id: u32,
    pub linked_id: u32,
    pub offset: i64,
    pub size: i64,
    pub size_with_padding: i64,
    pub created_at: i64,
    pub modified_at: i64,
    pub uid: i64,
    pub gid: i64,
    pub name: [u8; NAME_LEN],
    pub extra: [u8; EXTRA_LEN],
}

impl Descriptor {
    pub fn decode(buf: &[u8; DESCRIPTOR_LEN]) -> Self {
        let mut fields = Fields::new(buf);
        Self {
            data_type: fields.i32(),
            used: fields.bytes::<1>()[0] != 0,
            id: fields.u32(),
            group_id: fields.u32(),
            linked_id: fields.u32(),
            offset: fields.i64(),
            size: fields.i64(),
            size_with_padding: fields.i64(),
            created_at: fields.i64(),
            modified_at: fields.i64(),
            uid: fields.i64(),
            gid: fields.i64(),
            name: fields.bytes(),
            extra: fields.bytes(),
        }
    }

    pub fn encode(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut buf = Vec::with_capacity(DESCRIPTOR_LEN);
        buf.extend_from_slice(&self.data_type.to_le_bytes());
        buf.push(u8::from(self.used));
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.group_id.to_le_bytes());
        buf.extend_from_slice(&self.linked_id.to_le_bytes());
        for value in [
            self.offset,
            self.size,
            self.size_with_padding,
            self.created_at,
            self.modified_at,
            self.uid,
            self.gid,
        ] {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        buf.extend_from_slice(&self.name);
        buf.extend_from_slice(&self.extra);

        let mut out = [0u8; DESCRIPTOR_LEN];
        out.copy_from_slice(&buf);
        out
    }

    /// Object name up to the first NUL
    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Group id without the stored mask bits
    pub fn group(&self) -> u32 {
        self.group_id & !GROUP_MASK
    }

    /// Partition metadata, if this is a partition descriptor
    pub fn partition(&self) -> Option<Partition> {
        (self.data_type == DATA_PARTITION).then(|| Partition::decode(&self.extra))
    }
}

fn encode_name(name: &str) -> [u8; NAME_LEN] {
    let mut out = [0u8; NAME_LEN];
    let bytes = name.as_bytes();
    let len = bytes.len().min(NAME_LEN - 1);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

/// Number of descriptor slots, if the table described by `header` is
/// consistent and lies within a file of `file_len` bytes
fn table_len(header: &Header, file_len: u64) -> Option<usize> {
    let total = u64::try_from(header.descriptors_total).ok()?;
    let offset = u64::try_from(header.descriptors_offset).ok()?;
    let size = u64::try_from(header.descriptors_size).ok()?;

    if offset < HEADER_LEN as u64 || total.checked_mul(DESCRIPTOR_LEN as u64)? != size {
        return None;
    }
    if offset.checked_add(size)? > file_len {
        return None;
    }
    usize::try_from(total).ok()
}

/// A SIF file opened for reading and appending
pub struct SifImage {
    path: PathBuf,
    file: File,
    header: Header,
    descriptors: Vec<Descriptor>,
}

impl SifImage {
    /// Write an empty image with `capacity` descriptor slots
    pub fn create(path: impl AsRef<Path>, arch: Arch, capacity: usize) -> Result<Self> {
        let path = path.as_ref();
        let header = Header::new(arch, capacity);

        let mut file = File::create(path)?;
        file.write_all(&header.encode())?;
        file.write_all(&vec![0u8; capacity * DESCRIPTOR_LEN])?;
        file.set_len(header.data_offset as u64)?;
        file.sync_all()?;
        drop(file);

        Self::open(path)
    }

    /// Open an existing image read-write
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let invalid = |reason: String| Error::InvalidSif {
            path: path.clone(),
            reason,
        };

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut buf = [0u8; HEADER_LEN];
        file.read_exact(&mut buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => invalid("truncated header".to_string()),
            _ => Error::Io(e),
        })?;
        let header = Header::decode(&buf).map_err(&invalid)?;

        let file_len = file.metadata()?.len();
        let total = table_len(&header, file_len).ok_or_else(|| {
            invalid("corrupt descriptor table bounds".to_string())
        })?;

        file.seek(SeekFrom::Start(header.descriptors_offset as u64))?;
        let mut descriptors = Vec::with_capacity(total);
        for _ in 0..total {
            let mut buf = [0u8; DESCRIPTOR_LEN];
            file.read_exact(&mut buf).map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => invalid("truncated descriptor table".to_string()),
                _ => Error::Io(e),
            })?;
            descriptors.push(Descriptor::decode(&buf));
        }

        Ok(Self {
            path,
            file,
            header,
            descriptors,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Used descriptors in table order
    pub fn descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.iter().filter(|d| d.used)
    }

    /// Architecture recorded for the primary system partition
    pub fn primary_arch(&self) -> Arch {
        self.header.arch
    }

    /// Read an object's payload
    pub fn read_object(&mut self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let file_len = self.file.metadata()?.len();
        let in_bounds = u64::try_from(descriptor.offset)
            .ok()
            .zip(u64::try_from(descriptor.size).ok())
            .and_then(|(offset, size)| offset.checked_add(size))
            .is_some_and(|end| end <= file_len);
        if !in_bounds {
            return Err(Error::InvalidSif {
                path: self.path.clone(),
                reason: format!("object {} lies outside the file", descriptor.id),
            });
        }

        let mut data = vec![0u8; descriptor.size as usize];
        self.file.seek(SeekFrom::Start(descriptor.offset.max(0) as u64))?;
        self.file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Append the file at `payload` as a partition
    ///
    /// The payload goes after the current data section, aligned to 4 KiB,
    /// and is described by the first unused descriptor slot.
    pub fn add_partition(
        &mut self,
        payload: &Path,
        fs_type: FsType,
        part_type: PartType,
        arch: Arch,
    ) -> Result<Descriptor> {
        let slot = self
            .descriptors
            .iter()
            .position(|d| !d.used)
            .ok_or_else(|| Error::NoFreeDescriptor(self.path.clone()))?;
        let id = self
            .descriptors()
            .map(|d| d.id)
            .max()
            .unwrap_or(0)
            + 1;

        let end = self.header.data_end();
        let offset = end.next_multiple_of(PARTITION_ALIGNMENT);

        let mut source = File::open(payload).map_err(|source| Error::Source {
            path: payload.to_path_buf(),
            source,
        })?;
        self.file.seek(SeekFrom::Start(offset))?;
        let size = io::copy(&mut source, &mut self.file)?;

        let now = Utc::now().timestamp();
        let name = payload
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let descriptor = Descriptor {
            data_type: DATA_PARTITION,
            used: true,
            id,
            group_id: DEFAULT_GROUP | GROUP_MASK,
            linked_id: 0,
            offset: offset as i64,
            size: size as i64,
            size_with_padding: (size + offset - end) as i64,
            created_at: now,
            modified_at: now,
            uid: 0,
            gid: 0,
            name: encode_name(&name),
            extra: Partition {
                fs_type: fs_type as i32,
                part_type: part_type as i32,
                arch,
            }
            .encode(),
        };

        let slot_offset = self.header.descriptors_offset as u64 + (slot * DESCRIPTOR_LEN) as u64;
        self.file.seek(SeekFrom::Start(slot_offset))?;
        self.file.write_all(&descriptor.encode())?;

        self.header.descriptors_free = (self.header.descriptors_free - 1).max(0);
        self.header.data_size = (offset + size) as i64 - self.header.data_offset;
        self.header.modified_at = now;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode())?;
        self.file.sync_all()?;

        debug!(
            "Added partition {} ({} bytes at {}) to {}",
            id,
            size,
            offset,
            self.path.display()
        );

        self.descriptors[slot] = descriptor.clone();
        Ok(descriptor)
    }
}

/// Clone-then-append access to a container image format
pub trait ContainerPatcher {
    /// Copy `base` to `output` byte-for-byte, then append `partition` as an
    /// overlay partition holding an `fs_type` filesystem
    fn clone_and_append(
        &self,
        base: &Path,
        output: &Path,
        partition: &Path,
        fs_type: FsType,
    ) -> Result<()>;
}

/// [`ContainerPatcher`] for SIF images
#[derive(Debug, Clone, Copy, Default)]
pub struct SifPatcher;

impl ContainerPatcher for SifPatcher {
    fn clone_and_append(
        &self,
        base: &Path,
        output: &Path,
        partition: &Path,
        fs_type: FsType,
    ) -> Result<()> {
        info!("Cloning {} to {}", base.display(), output.display());
        fs::copy(base, output)?;

        let appended = SifImage::open(output).and_then(|mut image| {
            let arch = image.primary_arch();
            image
                .add_partition(partition, fs_type, PartType::Overlay, arch)
                .map(|descriptor| (descriptor, arch))
        });
        let (descriptor, arch) = match appended {
            Ok(appended) => appended,
            Err(err) => {
                // Never leave a half-patched container behind
                let _ = fs::remove_file(output);
                return Err(err);
            }
        };

        info!(
            "Appended overlay partition {} ({} bytes, {})",
            descriptor.id, descriptor.size, arch
        );
        Ok(())
    }
}
