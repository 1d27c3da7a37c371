//! Staging tree construction.
//!
//! A [`StagingTree`] is an exclusively-owned on-disk directory mirroring the
//! future initramfs root. Stages mutate it through [`FileOp`] placements;
//! every destination is normalized and checked against the tree root so no
//! operation can escape onto the host, even when running as root.

pub mod strip;

use anyhow::{Context, Result};
use fs2::FileExt;
use std::collections::{BTreeMap, HashMap};
use std::ffi::CString;
use std::fs::{self, File};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::BuildError;

/// Lock file asserting exclusive ownership of the staging directory.
/// Excluded from the packed archive.
pub(crate) const LOCK_FILE_NAME: &str = ".mkinitramfs.lock";

/// Character or block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Char,
    Block,
}

/// A device node recorded for the archive.
///
/// Creating real nodes needs root; the tree therefore keeps a manifest the
/// packer consults, so unprivileged builds still emit correct records.
#[derive(Debug, Clone)]
pub struct DeviceNode {
    pub kind: DeviceKind,
    pub major: u32,
    pub minor: u32,
    pub mode: u32,
}

/// One filesystem mutation a stage asks for.
///
/// All paths are relative to the tree root; a leading `/` is tolerated and
/// treated as tree-absolute.
#[derive(Debug, Clone)]
pub enum FileOp {
    /// Create a directory (and parents) with the given mode.
    Dir { path: PathBuf, mode: u32 },
    /// Write a file with content and mode.
    WriteFile {
        path: PathBuf,
        content: Vec<u8>,
        mode: u32,
    },
    /// Copy a host file into the tree, preserving mode bits.
    CopyFile { source: PathBuf, dest: PathBuf },
    /// Copy a host directory tree into the tree.
    CopyTree { source: PathBuf, dest: PathBuf },
    /// Create a symlink. The target may intentionally dangle (mount points
    /// like /proc resolve only at boot).
    Symlink { link: PathBuf, target: PathBuf },
    /// Create a device node.
    DeviceNode {
        path: PathBuf,
        kind: DeviceKind,
        major: u32,
        minor: u32,
        mode: u32,
    },
    /// Mark a placed path immutable: later stages overwriting it fail.
    Protect { path: PathBuf },
}

/// The staging directory under construction.
pub struct StagingTree {
    root: PathBuf,
    _lock: File,
    /// Protected paths, keyed by normalized relative path, valued by the
    /// stage that claimed them.
    immutable: HashMap<PathBuf, String>,
    devices: BTreeMap<PathBuf, DeviceNode>,
    strip_binaries: bool,
    tool_timeout: Duration,
    current_stage: String,
}

impl StagingTree {
    /// Create the staging directory and take exclusive ownership of it.
    pub fn create(root: &Path, strip_binaries: bool, tool_timeout: Duration) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("creating staging directory '{}'", root.display()))?;
        // Canonical root makes the containment checks below exact.
        let root = fs::canonicalize(root)
            .with_context(|| format!("resolving staging directory '{}'", root.display()))?;

        let lock_path = root.join(LOCK_FILE_NAME);
        let lock = File::create(&lock_path)
            .with_context(|| format!("creating staging lock '{}'", lock_path.display()))?;
        lock.try_lock_exclusive().map_err(|_| {
            BuildError::Config(format!(
                "staging directory '{}' is in use by another build",
                root.display()
            ))
        })?;

        Ok(Self {
            root,
            _lock: lock,
            immutable: HashMap::new(),
            devices: BTreeMap::new(),
            strip_binaries,
            tool_timeout,
            current_stage: String::new(),
        })
    }

    /// Tree root on disk.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Name the stage whose placements follow, for conflict attribution.
    pub fn set_stage(&mut self, name: &str) {
        self.current_stage = name.to_string();
    }

    /// Device nodes recorded for the archive, keyed by relative path.
    pub fn devices(&self) -> &BTreeMap<PathBuf, DeviceNode> {
        &self.devices
    }

    /// Apply one file operation to the tree.
    pub fn place(&mut self, op: FileOp) -> Result<()> {
        match op {
            FileOp::Dir { path, mode } => {
                let rel = normalize(&path)?;
                self.check_writable(&rel)?;
                self.ensure_within_root(&rel)?;
                let dest = self.root.join(&rel);
                fs::create_dir_all(&dest)
                    .with_context(|| format!("creating directory '{}'", dest.display()))?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
            }
            FileOp::WriteFile {
                path,
                content,
                mode,
            } => {
                let rel = normalize(&path)?;
                self.check_writable(&rel)?;
                self.ensure_within_root(&rel)?;
                let dest = self.root.join(&rel);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&dest, content)
                    .with_context(|| format!("writing '{}'", dest.display()))?;
                fs::set_permissions(&dest, fs::Permissions::from_mode(mode))?;
            }
            FileOp::CopyFile { source, dest } => {
                let rel = normalize(&dest)?;
                self.check_writable(&rel)?;
                self.ensure_parent_within_root(&rel)?;
                self.copy_file(&source, &rel)?;
            }
            FileOp::CopyTree { source, dest } => {
                let rel = normalize(&dest)?;
                self.check_writable(&rel)?;
                self.ensure_within_root(&rel)?;
                self.copy_tree(&source, &rel)?;
            }
            FileOp::Symlink { link, target } => {
                let rel = normalize(&link)?;
                self.check_writable(&rel)?;
                self.ensure_parent_within_root(&rel)?;
                let dest = self.root.join(&rel);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                // Later stages take precedence over earlier unprotected links.
                if dest.symlink_metadata().is_ok() {
                    fs::remove_file(&dest)?;
                }
                std::os::unix::fs::symlink(&target, &dest)
                    .with_context(|| format!("linking '{}'", dest.display()))?;
            }
            FileOp::DeviceNode {
                path,
                kind,
                major,
                minor,
                mode,
            } => {
                let rel = normalize(&path)?;
                self.check_writable(&rel)?;
                self.ensure_within_root(&rel)?;
                self.make_device_node(&rel, kind, major, minor, mode)?;
            }
            FileOp::Protect { path } => {
                let rel = normalize(&path)?;
                self.immutable.insert(rel, self.current_stage.clone());
            }
        }
        Ok(())
    }

    /// Refuse a destination whose on-disk resolution leaves the tree.
    ///
    /// [`normalize`] is purely lexical; a symlink already placed in the tree
    /// can still point outward, and writing through it would land on the
    /// host. Walk the destination component by component, following any
    /// symlink encountered, and fail with [`BuildError::PathEscape`] the
    /// moment the walk resolves outside the root. Symlinks targeting other
    /// tree paths (the merged lib64 link, busybox applets) pass.
    fn ensure_within_root(&self, rel: &Path) -> Result<()> {
        let mut probe = self.root.clone();
        for component in rel.components() {
            probe.push(component);
            let mut hops = 0;
            while probe
                .symlink_metadata()
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false)
            {
                hops += 1;
                if hops > 40 {
                    return Err(BuildError::PathEscape(rel.to_path_buf()).into());
                }
                let target = fs::read_link(&probe)?;
                let base = probe.parent().unwrap_or(&self.root).to_path_buf();
                probe = if target.is_absolute() {
                    resolve_lexically(&target)
                } else {
                    resolve_lexically(&base.join(target))
                };
            }
            if !probe.starts_with(&self.root) {
                return Err(BuildError::PathEscape(rel.to_path_buf()).into());
            }
        }
        Ok(())
    }

    /// Containment check for ops that replace the final component outright
    /// (symlink and file copies remove an existing link before creating).
    fn ensure_parent_within_root(&self, rel: &Path) -> Result<()> {
        match rel.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => self.ensure_within_root(parent),
            _ => Ok(()),
        }
    }

    fn check_writable(&self, rel: &Path) -> Result<()> {
        if let Some(owner) = self.immutable.get(rel) {
            // A stage may rewrite its own protected paths.
            if *owner != self.current_stage {
                return Err(
                    BuildError::PathConflict(rel.to_path_buf(), owner.clone()).into(),
                );
            }
        }
        Ok(())
    }

    fn copy_file(&self, source: &Path, rel: &Path) -> Result<()> {
        let dest = self.root.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let meta = source
            .symlink_metadata()
            .with_context(|| format!("reading '{}'", source.display()))?;

        if meta.file_type().is_symlink() {
            let target = fs::read_link(source)?;
            if dest.symlink_metadata().is_ok() {
                fs::remove_file(&dest)?;
            }
            std::os::unix::fs::symlink(&target, &dest)?;
            return Ok(());
        }

        if dest.symlink_metadata().is_ok() {
            fs::remove_file(&dest)?;
        }
        fs::copy(source, &dest)
            .with_context(|| format!("copying '{}' to '{}'", source.display(), dest.display()))?;

        if self.strip_binaries && strip::is_elf(&dest) {
            strip::strip_binary(&dest, self.tool_timeout)?;
        }
        Ok(())
    }

    fn copy_tree(&self, source: &Path, rel: &Path) -> Result<()> {
        let meta = source
            .symlink_metadata()
            .with_context(|| format!("reading '{}'", source.display()))?;
        if !meta.is_dir() {
            return self.copy_file(source, rel);
        }

        fs::create_dir_all(self.root.join(rel))?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            self.copy_tree(&entry.path(), &rel.join(entry.file_name()))?;
        }
        Ok(())
    }

    fn make_device_node(
        &mut self,
        rel: &Path,
        kind: DeviceKind,
        major: u32,
        minor: u32,
        mode: u32,
    ) -> Result<()> {
        let dest = self.root.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        // Real nodes need CAP_MKNOD. Unprivileged builds rely on the
        // manifest alone; the packer emits the records either way.
        if unsafe { libc::geteuid() } == 0 {
            let type_bits = match kind {
                DeviceKind::Char => libc::S_IFCHR,
                DeviceKind::Block => libc::S_IFBLK,
            };
            let c_path = CString::new(dest.as_os_str().as_bytes())
                .map_err(|_| BuildError::PathEscape(rel.to_path_buf()))?;
            let rdev = libc::makedev(major, minor);
            let ret = unsafe { libc::mknod(c_path.as_ptr(), type_bits | mode, rdev) };
            if ret != 0 {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("mknod '{}'", dest.display()));
            }
        }

        self.devices.insert(
            rel.to_path_buf(),
            DeviceNode {
                kind,
                major,
                minor,
                mode,
            },
        );
        Ok(())
    }
}

/// Normalize a destination path to a safe tree-relative form.
///
/// Leading `/` and `.` components are dropped; any `..` component fails with
/// [`BuildError::PathEscape`]. The result is never empty.
pub fn normalize(path: &Path) -> Result<PathBuf, BuildError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(BuildError::PathEscape(path.to_path_buf()));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(BuildError::PathEscape(path.to_path_buf()));
    }
    Ok(out)
}

/// Resolve `.` and `..` lexically, without touching the filesystem.
fn resolve_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}
