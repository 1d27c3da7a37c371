//! SVR4 "newc" CPIO serialization.
//!
//! The format the kernel unpacks at boot: a 110-byte ASCII header per entry
//! (magic `070701` plus thirteen 8-digit hex fields), the NUL-terminated
//! path, then file data, with name and data each padded to a 4-byte
//! boundary. The stream ends with the reserved `TRAILER!!!` record.
//!
//! Headers are fully determined by the entry list: inodes are assigned
//! sequentially at serialization time, uid/gid are forced to root, and mtime
//! to zero, so identical trees serialize to identical bytes.

use anyhow::{bail, Result};
use std::fmt::Write as _;

const MAGIC: &str = "070701";
const TRAILER: &str = "TRAILER!!!";
const HEADER_LEN: usize = 110;

// POSIX file type bits for the mode field.
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;
const S_IFCHR: u32 = 0o020000;
const S_IFBLK: u32 = 0o060000;

/// One record in the packed stream.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Path relative to the archive root, no leading slash.
    pub path: String,
    /// Full mode word including type bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    /// File content; symlinks store their target here.
    pub data: Vec<u8>,
    pub rdev_major: u32,
    pub rdev_minor: u32,
}

impl ArchiveEntry {
    fn new(path: impl Into<String>, mode: u32) -> Self {
        Self {
            path: path.into(),
            mode,
            uid: 0,
            gid: 0,
            nlink: 1,
            data: Vec::new(),
            rdev_major: 0,
            rdev_minor: 0,
        }
    }

    /// Regular file with content.
    pub fn file(path: impl Into<String>, data: Vec<u8>, perm: u32) -> Self {
        let mut entry = Self::new(path, S_IFREG | (perm & 0o7777));
        entry.data = data;
        entry
    }

    /// Directory.
    pub fn dir(path: impl Into<String>, perm: u32) -> Self {
        let mut entry = Self::new(path, S_IFDIR | (perm & 0o7777));
        entry.nlink = 2;
        entry
    }

    /// Symlink; the target travels as entry data.
    pub fn symlink(path: impl Into<String>, target: &str) -> Self {
        let mut entry = Self::new(path, S_IFLNK | 0o777);
        entry.data = target.as_bytes().to_vec();
        entry
    }

    /// Character device node.
    pub fn char_device(path: impl Into<String>, perm: u32, major: u32, minor: u32) -> Self {
        let mut entry = Self::new(path, S_IFCHR | (perm & 0o7777));
        entry.rdev_major = major;
        entry.rdev_minor = minor;
        entry
    }

    /// Block device node.
    pub fn block_device(path: impl Into<String>, perm: u32, major: u32, minor: u32) -> Self {
        let mut entry = Self::new(path, S_IFBLK | (perm & 0o7777));
        entry.rdev_major = major;
        entry.rdev_minor = minor;
        entry
    }

    /// True if this entry is a symlink record.
    pub fn is_symlink(&self) -> bool {
        self.mode & 0o170000 == S_IFLNK
    }
}

/// Serialize entries, in the order given, into a complete newc stream.
///
/// Fails on an entry whose data cannot be represented in the 32-bit
/// filesize header field.
pub fn serialize(entries: &[ArchiveEntry]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut next_ino = 1u32;

    for entry in entries {
        let namesize = entry.path.len() + 1;
        let header = format_header(
            next_ino,
            entry.mode,
            entry.uid,
            entry.gid,
            entry.nlink,
            filesize_field(&entry.path, entry.data.len())?,
            entry.rdev_major,
            entry.rdev_minor,
            namesize as u32,
        );
        next_ino += 1;

        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(entry.path.as_bytes());
        out.push(0);
        pad_to_4(&mut out);

        if !entry.data.is_empty() {
            out.extend_from_slice(&entry.data);
            pad_to_4(&mut out);
        }
    }

    // Reserved trailer record marks the end of the stream.
    let namesize = TRAILER.len() + 1;
    let header = format_header(0, 0, 0, 0, 1, 0, 0, 0, namesize as u32);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(TRAILER.as_bytes());
    out.push(0);
    pad_to_4(&mut out);

    Ok(out)
}

/// Entry data length as the 32-bit header field. The format stores sizes as
/// eight hex digits, so anything 4 GiB or larger cannot be represented.
fn filesize_field(path: &str, len: usize) -> Result<u32> {
    match u32::try_from(len) {
        Ok(size) => Ok(size),
        Err(_) => bail!("'{path}' is too large for a cpio entry ({len} bytes)"),
    }
}

/// Bytes a single entry occupies in the stream, padding included.
pub fn entry_overhead(path_len: usize, data_len: usize) -> usize {
    let head = align4(HEADER_LEN + path_len + 1);
    head + align4(data_len)
}

#[allow(clippy::too_many_arguments)]
fn format_header(
    ino: u32,
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    filesize: u32,
    rdev_major: u32,
    rdev_minor: u32,
    namesize: u32,
) -> String {
    let mut header = String::with_capacity(HEADER_LEN);
    header.push_str(MAGIC);
    for field in [
        ino, mode, uid, gid, nlink, 0, // mtime pinned to epoch
        filesize, 0, 0, // dev major/minor
        rdev_major, rdev_minor, namesize, 0, // check field, unused in newc
    ] {
        let _ = write!(header, "{:08x}", field);
    }
    debug_assert_eq!(header.len(), HEADER_LEN);
    header
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn pad_to_4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}
