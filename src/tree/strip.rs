//! Debug-symbol stripping for staged ELF objects.
//!
//! Stripping keeps the image small but is never worth failing a build over:
//! if the host `strip` is missing or refuses an object, the unstripped copy
//! stays in place and the build continues. The one exception is a tool
//! timeout, which is a build failure like any other external-process timeout.

use anyhow::Result;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use crate::error::BuildError;
use crate::process::Cmd;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// Whether the file starts with the ELF magic.
pub fn is_elf(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut magic = [0u8; 4];
    matches!(file.read_exact(&mut magic), Ok(())) && magic == ELF_MAGIC
}

/// Strip debug symbols from a staged binary in place.
///
/// Non-fatal on tool failure; fatal on timeout.
pub fn strip_binary(path: &Path, timeout: Duration) -> Result<()> {
    let result = Cmd::new("strip")
        .arg("--strip-unneeded")
        .arg_path(path)
        .timeout(timeout)
        .allow_fail()
        .run();

    match result {
        Ok(result) if result.success() => {}
        Ok(result) => {
            println!(
                "  warning: strip failed for '{}' ({}), keeping unstripped copy",
                path.display(),
                result.stderr_trimmed()
            );
        }
        Err(err) => {
            if matches!(
                err.downcast_ref::<BuildError>(),
                Some(BuildError::ToolTimeout { .. })
            ) {
                return Err(err);
            }
            // strip not installed, most likely. Copy stays as-is.
            println!(
                "  warning: could not run strip for '{}': {:#}",
                path.display(),
                err
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_is_elf_detects_magic() {
        let temp = TempDir::new().unwrap();

        let elf = temp.path().join("elf");
        fs::write(&elf, [0x7f, b'E', b'L', b'F', 2, 1, 1, 0]).unwrap();
        assert!(is_elf(&elf));

        let script = temp.path().join("script");
        fs::write(&script, b"#!/bin/sh\n").unwrap();
        assert!(!is_elf(&script));

        let short = temp.path().join("short");
        fs::write(&short, b"\x7fE").unwrap();
        assert!(!is_elf(&short));

        assert!(!is_elf(&temp.path().join("missing")));
    }

    #[test]
    fn test_strip_failure_is_non_fatal() {
        let temp = TempDir::new().unwrap();
        let not_elf = temp.path().join("not-an-object");
        fs::write(&not_elf, b"plain text").unwrap();

        // strip rejects the file; the call still succeeds.
        strip_binary(&not_elf, Duration::from_secs(10)).unwrap();
        assert!(not_elf.exists());
    }
}
