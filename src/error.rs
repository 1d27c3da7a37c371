//! Typed error kinds for the build pipeline.
//!
//! The pipeline composes errors with `anyhow` for context, but the contract
//! errors callers may want to match on are carried as [`BuildError`] values
//! inside the chain. Tests and callers recover them with
//! `err.downcast_ref::<BuildError>()`.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal error kinds produced by the build pipeline.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Invalid configuration caught before any build work starts.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Compression codec name outside the supported set.
    #[error("unsupported compression codec '{0}' (allowed: bzip2, gzip, lzma, lzo, xz)")]
    UnsupportedCodec(String),

    /// Output file already exists and force was not given.
    #[error("destination '{}' already exists (pass force to overwrite)", .0.display())]
    DestinationExists(PathBuf),

    /// Requested stage name is not in the plugin registry.
    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    /// Kernel module missing from the module directory's dependency index.
    #[error("kernel module '{0}' not found under '{}'", .1.display())]
    ModuleNotFound(String, PathBuf),

    /// Binary handed to the library resolver does not exist.
    #[error("binary not found: {}", .0.display())]
    BinaryNotFound(PathBuf),

    /// A shared library needed by a binary could not be located.
    #[error("unresolved library '{0}' needed by '{}'", .1.display())]
    UnresolvedLibrary(String, PathBuf),

    /// Placement destination would land outside the staging tree.
    #[error("path '{}' escapes the staging tree", .0.display())]
    PathEscape(PathBuf),

    /// Placement destination was marked immutable by an earlier stage.
    #[error("path '{}' conflicts with an entry protected by stage '{1}'", .0.display())]
    PathConflict(PathBuf, String),

    /// External tool exceeded the configured timeout.
    #[error("'{tool}' timed out after {seconds}s")]
    ToolTimeout { tool: String, seconds: u64 },

    /// Termination signal received mid-build.
    #[error("build interrupted by signal")]
    Interrupted,

    /// Filesystem failure while staging or packing.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_offender() {
        let err = BuildError::UnknownStage("netboot".into());
        assert!(err.to_string().contains("netboot"));

        let err = BuildError::UnsupportedCodec("zstd".into());
        assert!(err.to_string().contains("zstd"));
        assert!(err.to_string().contains("xz"));
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = BuildError::Interrupted.into();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Interrupted)
        ));
    }
}
