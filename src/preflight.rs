//! Preflight checks for build validation.
//!
//! Verifies the host tools a configuration needs before any build work, so
//! a missing compressor surfaces as one clear message instead of a failure
//! after stages have run.

use anyhow::{bail, Result};

use crate::config::BuildConfig;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// # Arguments
///
/// * `tools` - Slice of (command, package) tuples
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check every host tool this configuration will reach for.
pub fn check_build_tools(config: &BuildConfig) -> Result<()> {
    let mut tools: Vec<(&str, &str)> = config.codec.required_tools().to_vec();
    if config.strip_binaries {
        tools.push(("strip", "binutils"));
    }
    if config.stages.iter().any(|s| s == "busybox") {
        tools.push(("busybox", "busybox"));
        tools.push(("ldd", "glibc"));
    }
    check_required_tools(&tools)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Codec;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely-not-a-real-tool-xyz"));
    }

    #[test]
    fn test_missing_tools_are_listed() {
        let err = check_required_tools(&[("no-such-tool-abc", "some-package")]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("no-such-tool-abc"));
        assert!(msg.contains("some-package"));
    }

    #[test]
    fn test_in_process_codecs_need_no_tools() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut config = crate::config::BuildConfig::new("6.8.0", temp.path());
        config.stages = vec!["base".into()];
        for codec in [Codec::Gzip, Codec::Lzma, Codec::Xz] {
            config.codec = codec;
            check_build_tools(&config).unwrap();
        }
    }
}
