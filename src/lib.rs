//! Builds bootable initramfs images.
//!
//! A compressed CPIO archive holding a minimal root filesystem (init,
//! kernel modules, device-management rules, filesystem drivers) that the
//! kernel unpacks into memory before the real root is mounted.
//!
//! The crate is the build pipeline; flag parsing, config files, and
//! kernel-version detection are the caller's job and only ever show up here
//! as an already-populated [`BuildConfig`].
//!
//! # Architecture
//!
//! ```text
//! BuildConfig
//!     |
//!     v
//! pipeline -- resolve_stages --> stage registry (fixed order)
//!     |
//!     |-- ops per stage -------> StagingTree (closures from resolver)
//!     |-- pack ----------------> newc CPIO archive
//!     |-- compress ------------> bzip2/gzip/lzma/lzo/xz
//!     `-- write ---------------> output file + staging cleanup
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use mkinitramfs::{pipeline, BuildConfig};
//!
//! let mut config = BuildConfig::new("6.8.0-1-default", "/lib/modules/6.8.0-1-default");
//! config.output = "/boot/initramfs-6.8.0.img".into();
//! config.use_force = true;
//!
//! let report = pipeline::build(&config)?;
//! println!("wrote {} ({} bytes)", report.output.display(), report.compressed_bytes);
//! ```

pub mod archive;
pub mod compress;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod resolver;
pub mod stage;
pub mod tree;

pub use config::{BuildConfig, Codec, DEFAULT_STAGES};
pub use error::BuildError;
pub use pipeline::{build, BuildReport};
pub use stage::{resolve_stages, Stage};
pub use tree::{FileOp, StagingTree};
