//! Pipeline orchestration.
//!
//! Drives one build front to back: validate, create the staging tree, run
//! the resolved stages in registry order, pack, compress, write. The staging
//! directory is removed in every outcome (success, stage failure, or a
//! termination signal) and its own removal failure is logged, never allowed
//! to mask the original error.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::archive;
use crate::compress::compress;
use crate::config::BuildConfig;
use crate::error::BuildError;
use crate::preflight;
use crate::resolver::{LibraryResolver, ModuleResolver};
use crate::stage::{self, StageContext};
use crate::tree::StagingTree;

/// Where the pipeline currently is. Failures report the phase they
/// interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    StagingTreeCreated,
    /// Running the stage at this index (zero-based).
    StagesRunning(usize),
    Packed,
    Compressed,
    Written,
    CleanedUp,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Initializing => write!(f, "initializing"),
            Phase::StagingTreeCreated => write!(f, "staging tree created"),
            Phase::StagesRunning(i) => write!(f, "running stage {}", i + 1),
            Phase::Packed => write!(f, "archive packed"),
            Phase::Compressed => write!(f, "archive compressed"),
            Phase::Written => write!(f, "image written"),
            Phase::CleanedUp => write!(f, "cleaned up"),
        }
    }
}

/// Summary of a finished build.
#[derive(Debug)]
pub struct BuildReport {
    pub output: PathBuf,
    pub stages_run: usize,
    pub archive_bytes: usize,
    pub compressed_bytes: usize,
    pub sha256: String,
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn mark_interrupted(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Arrange for SIGINT/SIGTERM to abort the build between phases, so the
/// staging directory still gets cleaned up on the way out.
pub fn install_signal_handlers() {
    let handler = mark_interrupted as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

fn ensure_not_interrupted() -> Result<()> {
    if INTERRUPTED.load(Ordering::SeqCst) {
        return Err(BuildError::Interrupted.into());
    }
    Ok(())
}

/// Removes the staging directory when dropped, whatever path got us there.
struct StagingGuard {
    path: PathBuf,
    done: bool,
}

impl StagingGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, done: false }
    }

    fn cleanup(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if self.path.exists() {
            if let Err(err) = fs::remove_dir_all(&self.path) {
                eprintln!(
                    "warning: failed to remove staging directory '{}': {}",
                    self.path.display(),
                    err
                );
            }
        }
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Run one complete build.
///
/// Fails fast on configuration problems (bad codec is impossible here by
/// construction, but a taken destination, empty kernel version, or unknown
/// stage name are all caught) before the staging directory exists.
pub fn build(config: &BuildConfig) -> Result<BuildReport> {
    let mut phase = Phase::Initializing;

    config.validate()?;
    preflight::check_build_tools(config)?;
    // Resolving stages before creating the staging directory keeps an
    // unknown stage name from mutating the filesystem at all.
    let stages = stage::resolve_stages(&config.stages)?;

    println!(
        "Building initramfs for kernel {} ({} stages, {} compression)",
        config.kernel_version,
        stages.len(),
        config.codec
    );

    let mut guard = StagingGuard::new(config.staging_dir.clone());
    let result = run_pipeline(config, &stages, &mut phase);
    // Cleanup runs here for success and failure alike; a cleanup problem is
    // logged inside the guard and never replaces the pipeline's own error.
    guard.cleanup();

    result.with_context(|| format!("build failed while {phase}"))
}

fn run_pipeline(
    config: &BuildConfig,
    stages: &[Box<dyn stage::Stage>],
    phase: &mut Phase,
) -> Result<BuildReport> {
    let mut tree = StagingTree::create(
        &config.staging_dir,
        config.strip_binaries,
        config.tool_timeout,
    )?;
    *phase = Phase::StagingTreeCreated;

    let module_dir = config.module_dir_for_kernel();
    let mut modules = ModuleResolver::new(&module_dir)?;
    let libraries = LibraryResolver::new(config.tool_timeout);

    for (index, stage) in stages.iter().enumerate() {
        *phase = Phase::StagesRunning(index);
        ensure_not_interrupted()?;
        println!("[{}/{}] {}", index + 1, stages.len(), stage.name());

        let ops = {
            let mut ctx = StageContext {
                config,
                modules: &mut modules,
                libraries: &libraries,
            };
            stage
                .ops(&mut ctx)
                .with_context(|| format!("stage '{}' failed", stage.name()))?
        };

        tree.set_stage(stage.name());
        let count = ops.len();
        for op in ops {
            tree.place(op)
                .with_context(|| format!("stage '{}' failed", stage.name()))?;
        }
        println!("  {} operations applied", count);
    }

    ensure_not_interrupted()?;
    println!("Packing CPIO archive...");
    let archive = archive::pack(&tree)?;
    *phase = Phase::Packed;
    println!("  {} bytes", archive.len());

    ensure_not_interrupted()?;
    println!("Compressing ({})...", config.codec);
    let compressed = compress(&archive, config.codec, config.tool_timeout)?;
    *phase = Phase::Compressed;
    println!("  {} bytes compressed", compressed.len());

    // The destination is only ever written after compression fully
    // succeeded; no partial image can appear at the output path.
    fs::write(&config.output, &compressed)
        .with_context(|| format!("writing '{}'", config.output.display()))?;
    *phase = Phase::Written;

    let digest = Sha256::digest(&compressed);
    let sha256 = digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>();
    println!("Wrote {} (sha256 {})", config.output.display(), sha256);

    // Release the staging lock before the guard removes the directory.
    drop(tree);
    *phase = Phase::CleanedUp;

    Ok(BuildReport {
        output: config.output.clone(),
        stages_run: stages.len(),
        archive_bytes: archive.len(),
        compressed_bytes: compressed.len(),
        sha256,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Codec;
    use std::io::Read;
    use tempfile::TempDir;

    const SAMPLE_DEP: &str = "\
kernel/fs/mbcache.ko:
kernel/fs/jbd2/jbd2.ko:
kernel/fs/ext4/ext4.ko: kernel/fs/jbd2/jbd2.ko kernel/fs/mbcache.ko
";

    /// Stages that touch nothing on the host outside the fixture.
    const HERMETIC_STAGES: &[&str] = &[
        "base",
        "busybox-init",
        "fs",
        "mdev",
        "mdev-rules",
        "rootfs",
        "pivot",
        "compression",
    ];

    fn fixture_config(temp: &TempDir) -> BuildConfig {
        let module_dir = temp.path().join("modules/6.8.0");
        fs::create_dir_all(module_dir.join("kernel/fs/jbd2")).unwrap();
        fs::write(module_dir.join("modules.dep"), SAMPLE_DEP).unwrap();
        fs::write(module_dir.join("kernel/fs/mbcache.ko"), b"\x7fELFmb").unwrap();
        fs::write(module_dir.join("kernel/fs/jbd2/jbd2.ko"), b"\x7fELFjbd2").unwrap();
        fs::create_dir_all(module_dir.join("kernel/fs/ext4")).unwrap();
        fs::write(module_dir.join("kernel/fs/ext4/ext4.ko"), b"\x7fELFext4").unwrap();

        let mut config = BuildConfig::new("6.8.0", &module_dir);
        config.stages = HERMETIC_STAGES.iter().map(|s| s.to_string()).collect();
        config.codec = Codec::Gzip;
        config.output = temp.path().join("initramfs.img");
        config.staging_dir = temp.path().join("staging");
        config
    }

    #[test]
    fn test_full_build_succeeds_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let config = fixture_config(&temp);

        let report = build(&config).unwrap();
        assert!(config.output.is_file());
        assert_eq!(report.stages_run, HERMETIC_STAGES.len());
        assert!(report.compressed_bytes > 0);
        assert!(!config.staging_dir.exists(), "staging must be removed");

        // The image is a gzip stream wrapping a newc archive.
        let compressed = fs::read(&config.output).unwrap();
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut archive = Vec::new();
        decoder.read_to_end(&mut archive).unwrap();
        assert!(archive.starts_with(b"070701"));
        let text = String::from_utf8_lossy(&archive);
        assert!(text.contains("etc/mdev.conf"));
        assert!(text.contains("ext4.ko"));
        assert!(text.contains("TRAILER!!!"));
    }

    #[test]
    fn test_identical_inputs_build_identical_images() {
        let temp = TempDir::new().unwrap();
        let mut config = fixture_config(&temp);
        config.use_force = true;

        build(&config).unwrap();
        let first = fs::read(&config.output).unwrap();
        build(&config).unwrap();
        let second = fs::read(&config.output).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_stage_input_order_does_not_matter() {
        let temp = TempDir::new().unwrap();
        let mut config = fixture_config(&temp);
        config.use_force = true;

        build(&config).unwrap();
        let first = fs::read(&config.output).unwrap();

        config.stages.reverse();
        build(&config).unwrap();
        let second = fs::read(&config.output).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_stage_fails_without_touching_disk() {
        let temp = TempDir::new().unwrap();
        let mut config = fixture_config(&temp);
        config.stages.push("netboot".into());

        let err = build(&config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::UnknownStage(_))
        ));
        assert!(!config.staging_dir.exists());
        assert!(!config.output.exists());
    }

    #[test]
    fn test_existing_destination_fails_before_staging() {
        let temp = TempDir::new().unwrap();
        let mut config = fixture_config(&temp);
        fs::write(&config.output, b"previous image").unwrap();

        let err = build(&config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::DestinationExists(_))
        ));
        assert!(!config.staging_dir.exists());
        // The previous image is untouched.
        assert_eq!(fs::read(&config.output).unwrap(), b"previous image");
    }

    #[test]
    fn test_failed_stage_still_cleans_staging() {
        let temp = TempDir::new().unwrap();
        let mut config = fixture_config(&temp);
        config.stages.push("kernel-modules".into());
        config.modules = vec!["no-such-module".into()];

        let err = build(&config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::ModuleNotFound(_, _))
        ));
        assert!(!config.staging_dir.exists(), "staging must be removed on failure");
        assert!(!config.output.exists(), "no partial output on failure");
    }

    #[test]
    fn test_force_overwrites_existing_destination() {
        let temp = TempDir::new().unwrap();
        let mut config = fixture_config(&temp);
        config.use_force = true;
        fs::write(&config.output, b"previous image").unwrap();

        build(&config).unwrap();
        assert_ne!(fs::read(&config.output).unwrap(), b"previous image");
    }
}
