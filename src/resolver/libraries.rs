//! Shared-library closure for dynamically linked binaries.
//!
//! Inspects a binary's dynamic-linking requirements through the loader
//! (`ldd`) and returns every shared object the binary needs at initramfs
//! runtime. The output parsing is separated from the process spawn so it is
//! unit-testable without staging real binaries.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::BuildError;
use crate::process::Cmd;

/// Directories searched when the loader reports a library without a path.
pub const STANDARD_SEARCH_PATH: &[&str] = &["/lib", "/lib64", "/usr/lib", "/usr/lib64"];

/// One parsed line of loader output.
#[derive(Debug, PartialEq, Eq)]
pub enum LoaderLine {
    /// Library resolved to an absolute path.
    Resolved(PathBuf),
    /// Library named but not located by the loader.
    NotFound(String),
    /// Virtual entries (vdso) and noise.
    Ignored,
}

/// Resolves transitive shared-library dependencies of binaries.
pub struct LibraryResolver {
    search_path: Vec<PathBuf>,
    timeout: Duration,
}

impl LibraryResolver {
    pub fn new(timeout: Duration) -> Self {
        Self {
            search_path: STANDARD_SEARCH_PATH.iter().map(PathBuf::from).collect(),
            timeout,
        }
    }

    /// The transitive set of shared libraries the binary needs.
    ///
    /// `ldd` already walks the dependency graph, so one invocation yields the
    /// full closure. Static binaries resolve to an empty set. A missing
    /// binary fails with [`BuildError::BinaryNotFound`]; a library the
    /// loader cannot locate anywhere in the standard search path fails with
    /// [`BuildError::UnresolvedLibrary`].
    pub fn closure(&self, binary: &Path) -> Result<BTreeSet<PathBuf>> {
        if !binary.exists() {
            return Err(BuildError::BinaryNotFound(binary.to_path_buf()).into());
        }

        let result = Cmd::new("ldd")
            .arg_path(binary)
            .timeout(self.timeout)
            .allow_fail() // static binaries make ldd exit non-zero
            .run()
            .context("failed to run ldd")?;

        if !result.success() {
            // Static binary, or not an ELF at all. Nothing to copy.
            return Ok(BTreeSet::new());
        }

        let mut libs = BTreeSet::new();
        for line in result.stdout_text().lines() {
            match parse_loader_line(line) {
                LoaderLine::Resolved(path) => {
                    libs.insert(path);
                }
                LoaderLine::NotFound(name) => {
                    // Second chance before failing: the loader's cache can
                    // lag behind what is actually on disk.
                    match find_in_search_path(&name, &self.search_path) {
                        Some(path) => {
                            libs.insert(path);
                        }
                        None => {
                            return Err(BuildError::UnresolvedLibrary(
                                name,
                                binary.to_path_buf(),
                            )
                            .into());
                        }
                    }
                }
                LoaderLine::Ignored => {}
            }
        }
        Ok(libs)
    }
}

/// Parse one line of `ldd` output.
///
/// Formats seen in the wild:
///
/// ```text
///     libc.so.6 => /usr/lib64/libc.so.6 (0x00007f...)
///     libmissing.so.1 => not found
///     /lib64/ld-linux-x86-64.so.2 (0x00007f...)
///     linux-vdso.so.1 (0x00007fff...)
/// ```
pub fn parse_loader_line(line: &str) -> LoaderLine {
    let line = line.trim();
    if line.is_empty() {
        return LoaderLine::Ignored;
    }

    if let Some(arrow) = line.find("=>") {
        let name = line[..arrow].trim();
        let target = line[arrow + 2..].trim();
        if target.starts_with("not found") {
            return LoaderLine::NotFound(name.to_string());
        }
        if let Some(path) = target.split_whitespace().next() {
            if path.starts_with('/') {
                return LoaderLine::Resolved(PathBuf::from(path));
            }
        }
        return LoaderLine::Ignored;
    }

    // No arrow: either the dynamic loader itself or a virtual entry.
    if let Some(path) = line.split_whitespace().next() {
        if path.starts_with('/') {
            return LoaderLine::Resolved(PathBuf::from(path));
        }
    }
    LoaderLine::Ignored
}

/// Locate a library by name in the given search path.
pub fn find_in_search_path(name: &str, search_path: &[PathBuf]) -> Option<PathBuf> {
    search_path
        .iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.exists())
}
