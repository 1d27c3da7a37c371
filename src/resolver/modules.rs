//! Kernel module closure computation from the depmod index.
//!
//! `modules.dep` (written by depmod) lists one module per line:
//!
//! ```text
//! kernel/fs/ext4/ext4.ko.xz: kernel/fs/jbd2/jbd2.ko.xz kernel/fs/mbcache.ko.xz
//! ```
//!
//! The resolver indexes that file once per build and answers closure queries
//! from it. Closures are cached per resolver instance; resolvers live exactly
//! as long as one build, so nothing leaks across builds.

use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::BuildError;

/// One entry in the depmod index.
#[derive(Debug, Clone)]
struct ModuleEntry {
    /// Path relative to the kernel module directory, as written in modules.dep.
    rel_path: PathBuf,
    /// Short names of direct dependencies.
    deps: Vec<String>,
}

/// Resolves transitive kernel module dependencies for one build.
pub struct ModuleResolver {
    module_dir: PathBuf,
    index: HashMap<String, ModuleEntry>,
    cache: HashMap<String, BTreeSet<String>>,
}

impl ModuleResolver {
    /// Load and index `modules.dep` from the kernel module directory.
    pub fn new(module_dir: &Path) -> Result<Self> {
        let dep_path = module_dir.join("modules.dep");
        let text = fs::read_to_string(&dep_path)
            .with_context(|| format!("reading module index '{}'", dep_path.display()))?;
        Ok(Self {
            module_dir: module_dir.to_path_buf(),
            index: parse_dep_index(&text),
            cache: HashMap::new(),
        })
    }

    /// Whether the index knows this module name.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Path of a module relative to the module directory.
    pub fn module_path(&self, name: &str) -> Option<&Path> {
        self.index.get(name).map(|e| e.rel_path.as_path())
    }

    /// Compute the transitive dependency closure of the requested modules.
    ///
    /// The result contains the requested names plus every module they pull
    /// in. Cycles in the index are tolerated: a module already in the closure
    /// is not re-resolved. An unknown name fails with
    /// [`BuildError::ModuleNotFound`].
    pub fn closure<S: AsRef<str>>(&mut self, names: &[S]) -> Result<BTreeSet<String>> {
        let mut result = BTreeSet::new();
        for name in names {
            let name = name.as_ref();
            if let Some(cached) = self.cache.get(name) {
                result.extend(cached.iter().cloned());
                continue;
            }

            let mut single = BTreeSet::new();
            self.visit(name, &mut single)?;
            result.extend(single.iter().cloned());
            self.cache.insert(name.to_string(), single);
        }
        Ok(result)
    }

    fn visit(&self, name: &str, out: &mut BTreeSet<String>) -> Result<()> {
        if out.contains(name) {
            return Ok(());
        }
        let entry = self.index.get(name).ok_or_else(|| {
            BuildError::ModuleNotFound(name.to_string(), self.module_dir.clone())
        })?;
        out.insert(name.to_string());
        for dep in &entry.deps {
            self.visit(dep, out)?;
        }
        Ok(())
    }
}

/// Parse modules.dep text into a name-keyed index.
fn parse_dep_index(text: &str) -> HashMap<String, ModuleEntry> {
    let mut index = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((path_part, deps_part)) = line.split_once(':') else {
            continue;
        };
        let deps = deps_part
            .split_whitespace()
            .map(module_name)
            .collect::<Vec<_>>();
        index.insert(
            module_name(path_part),
            ModuleEntry {
                rel_path: PathBuf::from(path_part),
                deps,
            },
        );
    }
    index
}

/// Short module name from an index path: strip directories, `.ko`, and any
/// compression suffix (`ext4.ko.xz` → `ext4`).
pub fn module_name(path: &str) -> String {
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.split_once(".ko") {
        Some((stem, _)) => stem.to_string(),
        None => file.to_string(),
    }
}
