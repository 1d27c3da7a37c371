//! Archive packing: staging tree to CPIO byte stream.
//!
//! The walk is path-ordered and the serializer pins every
//! non-content header field, so two identical trees pack to byte-identical
//! archives.

pub mod cpio;

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use walkdir::WalkDir;

use crate::tree::{DeviceKind, StagingTree, LOCK_FILE_NAME};
use cpio::ArchiveEntry;

/// Pack the finished staging tree into a newc CPIO stream.
///
/// Entries are emitted in lexicographic path order; a parent directory is a
/// strict prefix of its children, so parents always precede contents.
pub fn pack(tree: &StagingTree) -> Result<Vec<u8>> {
    let root = tree.root();
    let mut entries = Vec::new();

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| "walking staging tree")?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .expect("walk stays under root");

        if rel == Path::new(LOCK_FILE_NAME) {
            continue;
        }
        // Device nodes come from the tree's manifest below, whether or not a
        // real node could be created on disk.
        if tree.devices().contains_key(rel) {
            continue;
        }

        let path = rel.to_string_lossy().into_owned();
        let file_type = entry.file_type();

        if file_type.is_dir() {
            let perm = entry.metadata()?.permissions().mode() & 0o7777;
            entries.push(ArchiveEntry::dir(path, perm));
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .with_context(|| format!("reading symlink '{}'", entry.path().display()))?;
            entries.push(ArchiveEntry::symlink(path, &target.to_string_lossy()));
        } else {
            let perm = entry.metadata()?.permissions().mode() & 0o7777;
            let data = fs::read(entry.path())
                .with_context(|| format!("reading '{}'", entry.path().display()))?;
            entries.push(ArchiveEntry::file(path, data, perm));
        }
    }

    for (rel, node) in tree.devices() {
        let path = rel.to_string_lossy().into_owned();
        let entry = match node.kind {
            DeviceKind::Char => {
                ArchiveEntry::char_device(path, node.mode, node.major, node.minor)
            }
            DeviceKind::Block => {
                ArchiveEntry::block_device(path, node.mode, node.major, node.minor)
            }
        };
        entries.push(entry);
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    cpio::serialize(&entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{DeviceKind, FileOp};
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    fn populated_tree(temp: &TempDir) -> StagingTree {
        let mut tree = StagingTree::create(
            &temp.path().join("staging"),
            false,
            Duration::from_secs(5),
        )
        .unwrap();
        tree.place(FileOp::Dir {
            path: "bin".into(),
            mode: 0o755,
        })
        .unwrap();
        tree.place(FileOp::WriteFile {
            path: "bin/sh".into(),
            content: b"#!/bin/busybox sh\n".to_vec(),
            mode: 0o755,
        })
        .unwrap();
        tree.place(FileOp::Symlink {
            link: "a".into(),
            target: "b".into(),
        })
        .unwrap();
        tree.place(FileOp::DeviceNode {
            path: "dev/null".into(),
            kind: DeviceKind::Char,
            major: 1,
            minor: 3,
            mode: 0o666,
        })
        .unwrap();
        tree
    }

    /// Read (path, filesize) pairs back out of a newc stream.
    fn list_entries(bytes: &[u8]) -> Vec<(String, u32)> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos + 110 <= bytes.len() {
            let header = std::str::from_utf8(&bytes[pos..pos + 110]).unwrap();
            assert_eq!(&header[..6], "070701");
            let filesize = u32::from_str_radix(&header[6 + 6 * 8..6 + 7 * 8], 16).unwrap();
            let namesize =
                u32::from_str_radix(&header[6 + 11 * 8..6 + 12 * 8], 16).unwrap() as usize;
            let name_start = pos + 110;
            let name =
                String::from_utf8_lossy(&bytes[name_start..name_start + namesize - 1]).into_owned();
            if name == "TRAILER!!!" {
                break;
            }
            pos = (name_start + namesize + 3) & !3;
            pos = (pos + filesize as usize + 3) & !3;
            out.push((name, filesize));
        }
        out
    }

    #[test]
    fn test_pack_is_path_ordered_and_complete() {
        let temp = TempDir::new().unwrap();
        let tree = populated_tree(&temp);
        let bytes = pack(&tree).unwrap();

        let names: Vec<String> = list_entries(&bytes).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["a", "bin", "bin/sh", "dev", "dev/null"]);
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_pack_twice_is_byte_identical() {
        let temp = TempDir::new().unwrap();
        let tree = populated_tree(&temp);
        assert_eq!(pack(&tree).unwrap(), pack(&tree).unwrap());
    }

    #[test]
    fn test_symlink_target_round_trips() {
        let temp = TempDir::new().unwrap();
        let tree = populated_tree(&temp);
        let bytes = pack(&tree).unwrap();

        // The entry for "a" carries its one-byte target "b" as data.
        let entries = list_entries(&bytes);
        let (_, filesize) = entries.iter().find(|(n, _)| n == "a").unwrap();
        assert_eq!(*filesize, 1);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains('a'));
    }

    #[test]
    fn test_lock_file_is_not_packed() {
        let temp = TempDir::new().unwrap();
        let tree = populated_tree(&temp);
        let bytes = pack(&tree).unwrap();
        let names: Vec<String> = list_entries(&bytes).into_iter().map(|(n, _)| n).collect();
        assert!(!names.iter().any(|n| n.contains(".mkinitramfs.lock")));
    }

    #[test]
    fn test_unpacked_size_accounting() {
        let temp = TempDir::new().unwrap();
        let mut tree = StagingTree::create(
            &temp.path().join("staging"),
            false,
            Duration::from_secs(5),
        )
        .unwrap();
        let files: [(&str, &[u8]); 3] = [
            ("one", b"11111"),
            ("three", b"333"),
            ("two", b"22"),
        ];
        for (name, content) in files {
            tree.place(FileOp::WriteFile {
                path: PathBuf::from(name),
                content: content.to_vec(),
                mode: 0o644,
            })
            .unwrap();
        }

        let bytes = pack(&tree).unwrap();
        let expected: usize = files
            .iter()
            .map(|(name, content)| cpio::entry_overhead(name.len(), content.len()))
            .sum::<usize>()
            + cpio::entry_overhead("TRAILER!!!".len(), 0);
        assert_eq!(bytes.len(), expected);
    }
}
