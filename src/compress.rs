//! Archive compression.
//!
//! A pure, single-pass transform over the packed archive bytes. Gzip, lzma,
//! and xz compress in-process; bzip2 and lzo go through the host tools (their
//! presence is verified by the preflight check before the pipeline starts).
//! The codec set is closed: unknown names never get past configuration
//! parsing.

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::time::Duration;

use crate::config::Codec;
use crate::process::Cmd;

/// Compress archive bytes with the selected codec.
pub fn compress(archive: &[u8], codec: Codec, tool_timeout: Duration) -> Result<Vec<u8>> {
    match codec {
        Codec::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(archive)?;
            Ok(encoder.finish()?)
        }
        Codec::Lzma => {
            let mut out = Vec::new();
            lzma_rs::lzma_compress(&mut &archive[..], &mut out)
                .context("lzma compression failed")?;
            Ok(out)
        }
        Codec::Xz => {
            let mut out = Vec::new();
            lzma_rs::xz_compress(&mut &archive[..], &mut out)
                .context("xz compression failed")?;
            Ok(out)
        }
        Codec::Bzip2 => compress_with_tool("bzip2", archive, tool_timeout),
        Codec::Lzo => compress_with_tool("lzop", archive, tool_timeout),
    }
}

/// Pipe the archive through a host compression tool, stdout capturing the
/// compressed stream.
fn compress_with_tool(tool: &str, archive: &[u8], timeout: Duration) -> Result<Vec<u8>> {
    let result = Cmd::new(tool)
        .args(["-9", "-c"])
        .stdin_bytes(archive)
        .timeout(timeout)
        .error_msg(format!("{tool} compression failed"))
        .run()?;
    Ok(result.stdout)
}
