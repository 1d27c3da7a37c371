//! Build configuration and validation.
//!
//! The pipeline consumes an already-populated [`BuildConfig`]; flag parsing,
//! JSON config files, and kernel-version detection are the caller's problem.
//! Defaults come from pure constructors, never from mutable process state, so
//! tests can build independent configurations without interference.

use anyhow::Result;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::BuildError;

/// Stage names enabled when the caller does not choose their own set, in
/// registry order.
pub const DEFAULT_STAGES: &[&str] = &[
    "earlyfw",
    "base",
    "busybox",
    "busybox-init",
    "firmware",
    "fs",
    "kernel-modules",
    "mdev",
    "mdev-rules",
    "rootfs",
    "pivot",
    "compression",
];

/// Default timeout for external tools (strip, bzip2, lzop).
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Supported compression codecs for the packed archive.
///
/// A closed set: names outside it are rejected at the configuration boundary
/// with [`BuildError::UnsupportedCodec`], before any build work begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Bzip2,
    Gzip,
    Lzma,
    Lzo,
    Xz,
}

impl Codec {
    /// All supported codecs.
    pub const ALL: &'static [Codec] =
        &[Codec::Bzip2, Codec::Gzip, Codec::Lzma, Codec::Lzo, Codec::Xz];

    /// Canonical lowercase name, matching what callers pass on input.
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Bzip2 => "bzip2",
            Codec::Gzip => "gzip",
            Codec::Lzma => "lzma",
            Codec::Lzo => "lzo",
            Codec::Xz => "xz",
        }
    }

    /// Host tools this codec needs, as (command, package) pairs for the
    /// preflight check. Codecs compressed in-process need none.
    pub fn required_tools(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Codec::Bzip2 => &[("bzip2", "bzip2")],
            Codec::Lzo => &[("lzop", "lzop")],
            Codec::Gzip | Codec::Lzma | Codec::Xz => &[],
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codec {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bzip2" => Ok(Codec::Bzip2),
            "gzip" => Ok(Codec::Gzip),
            "lzma" => Ok(Codec::Lzma),
            "lzo" => Ok(Codec::Lzo),
            "xz" => Ok(Codec::Xz),
            other => Err(BuildError::UnsupportedCodec(other.to_string())),
        }
    }
}

/// Everything one build invocation needs. Immutable once the pipeline starts.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Kernel release string (e.g. "6.8.0-1-default"), already resolved by
    /// the caller; the pipeline never queries the running kernel itself.
    pub kernel_version: String,
    /// Directory holding the target kernel's modules and modules.dep.
    pub module_dir: PathBuf,
    /// Kernel modules requested beyond what the fs stage pulls in.
    pub modules: Vec<String>,
    /// Enabled stage names. Execution order is fixed by the registry, not by
    /// this list's order.
    pub stages: Vec<String>,
    /// Compression applied to the packed archive.
    pub codec: Codec,
    /// Final image path.
    pub output: PathBuf,
    /// Overwrite an existing output file.
    pub use_force: bool,
    /// Strip debug symbols from staged ELF binaries.
    pub strip_binaries: bool,
    /// Staging directory for the tree under construction. Created by the
    /// pipeline, removed unconditionally when the build ends.
    pub staging_dir: PathBuf,
    /// Timeout applied to every external tool invocation.
    pub tool_timeout: Duration,
}

impl BuildConfig {
    /// Configuration with process-wide defaults for the given kernel.
    pub fn new(kernel_version: impl Into<String>, module_dir: impl Into<PathBuf>) -> Self {
        let staging_dir =
            std::env::temp_dir().join(format!("mkinitramfs-{}", std::process::id()));
        Self {
            kernel_version: kernel_version.into(),
            module_dir: module_dir.into(),
            modules: Vec::new(),
            stages: DEFAULT_STAGES.iter().map(|s| s.to_string()).collect(),
            codec: Codec::Xz,
            output: PathBuf::from("/boot/initramfs.img"),
            use_force: false,
            strip_binaries: false,
            staging_dir,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Validate the configuration before any build work.
    ///
    /// Checks everything that should fail fast: empty kernel version, missing
    /// module directory, and an existing destination without force. The
    /// destination check lives here, not after packing, so a refused
    /// overwrite wastes no work.
    pub fn validate(&self) -> Result<()> {
        if self.kernel_version.trim().is_empty() {
            return Err(BuildError::Config("kernel version is empty".into()).into());
        }
        if !self.module_dir.is_dir() {
            return Err(BuildError::Config(format!(
                "kernel module directory '{}' does not exist",
                self.module_dir.display()
            ))
            .into());
        }
        if self.stages.is_empty() {
            return Err(BuildError::Config("no stages enabled".into()).into());
        }
        if self.output.exists() && !self.use_force {
            return Err(BuildError::DestinationExists(self.output.clone()).into());
        }
        Ok(())
    }

    /// The per-kernel module directory, e.g. `<module_dir>` itself when it
    /// already names a kernel version, used by module-copying stages.
    pub fn module_dir_for_kernel(&self) -> PathBuf {
        if self.module_dir.ends_with(Path::new(&self.kernel_version)) {
            self.module_dir.clone()
        } else {
            self.module_dir.join(&self.kernel_version)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_codec_round_trip() {
        for codec in Codec::ALL {
            assert_eq!(codec.as_str().parse::<Codec>().unwrap(), *codec);
        }
    }

    #[test]
    fn test_codec_rejects_unknown_name() {
        let err = "zstd".parse::<Codec>().unwrap_err();
        assert!(matches!(err, BuildError::UnsupportedCodec(ref name) if name == "zstd"));
    }

    #[test]
    fn test_defaults_are_independent() {
        let mut a = BuildConfig::new("6.8.0", "/lib/modules/6.8.0");
        let b = BuildConfig::new("6.8.0", "/lib/modules/6.8.0");
        a.stages.clear();
        assert_eq!(b.stages.len(), DEFAULT_STAGES.len());
        assert_eq!(b.codec, Codec::Xz);
    }

    #[test]
    fn test_validate_rejects_empty_kernel_version() {
        let temp = TempDir::new().unwrap();
        let config = BuildConfig::new("  ", temp.path());
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_missing_module_dir() {
        let config = BuildConfig::new("6.8.0", "/nonexistent/modules/6.8.0");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_existing_destination_without_force() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("initramfs.img");
        fs::write(&output, b"old image").unwrap();

        let mut config = BuildConfig::new("6.8.0", temp.path());
        config.output = output.clone();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::DestinationExists(_))
        ));

        config.use_force = true;
        config.validate().unwrap();
    }

    #[test]
    fn test_module_dir_for_kernel_appends_version_once() {
        let mut config = BuildConfig::new("6.8.0", "/lib/modules");
        assert_eq!(
            config.module_dir_for_kernel(),
            PathBuf::from("/lib/modules/6.8.0")
        );
        config.module_dir = PathBuf::from("/lib/modules/6.8.0");
        assert_eq!(
            config.module_dir_for_kernel(),
            PathBuf::from("/lib/modules/6.8.0")
        );
    }
}
