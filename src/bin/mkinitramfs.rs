//! Thin command-line entry point.
//!
//! Only populates a [`BuildConfig`] and hands it to the pipeline; all build
//! logic lives in the library.

use anyhow::{bail, Result};
use std::path::PathBuf;

use mkinitramfs::{pipeline, BuildConfig, Codec};

const VERSION: &str = concat!("mkinitramfs ", env!("CARGO_PKG_VERSION"));

fn usage() -> &'static str {
    "Usage: mkinitramfs [OPTIONS] -k KERNEL_VERSION\n\
     \n\
     Options:\n\
       -k, --kernel-version VER    Kernel version to build for (required)\n\
       -K, --kernel-module-dir DIR Kernel module directory [default: /lib/modules/VER]\n\
       -F, --file PATH             Output file [default: /boot/initramfs.img]\n\
       -c, --compression CODEC     bzip2, gzip, lzma, lzo, or xz [default: xz]\n\
       -p, --plugins LIST          Comma-separated stage names to enable\n\
       -m, --module NAME           Kernel module to include (repeatable)\n\
       -t, --tempdir DIR           Staging directory to build in\n\
       -f, --force                 Overwrite an existing output file\n\
       -s, --strip                 Strip staged ELF binaries\n\
       -h, --help                  Show this help\n\
       -V, --version               Show version"
}

struct CliOptions {
    kernel_version: Option<String>,
    module_dir: Option<PathBuf>,
    output: Option<PathBuf>,
    codec: Option<Codec>,
    stages: Option<Vec<String>>,
    modules: Vec<String>,
    staging_dir: Option<PathBuf>,
    use_force: bool,
    strip_binaries: bool,
}

fn parse_args(args: &[String]) -> Result<CliOptions> {
    let mut opts = CliOptions {
        kernel_version: None,
        module_dir: None,
        output: None,
        codec: None,
        stages: None,
        modules: Vec::new(),
        staging_dir: None,
        use_force: false,
        strip_binaries: false,
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| -> Result<String> {
            iter.next()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("{flag} requires a value\n\n{}", usage()))
        };
        match arg.as_str() {
            "-k" | "--kernel-version" => opts.kernel_version = Some(value(arg)?),
            "-K" | "--kernel-module-dir" => opts.module_dir = Some(value(arg)?.into()),
            "-F" | "--file" => opts.output = Some(value(arg)?.into()),
            "-c" | "--compression" => opts.codec = Some(value(arg)?.parse()?),
            "-p" | "--plugins" => {
                opts.stages = Some(
                    value(arg)?
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect(),
                );
            }
            "-m" | "--module" => opts.modules.push(value(arg)?),
            "-t" | "--tempdir" => opts.staging_dir = Some(value(arg)?.into()),
            "-f" | "--force" => opts.use_force = true,
            "-s" | "--strip" => opts.strip_binaries = true,
            "-h" | "--help" => {
                println!("{VERSION}\n{}", usage());
                std::process::exit(0);
            }
            "-V" | "--version" => {
                println!("{VERSION}");
                std::process::exit(0);
            }
            other => bail!("unknown option '{other}'\n\n{}", usage()),
        }
    }
    Ok(opts)
}

fn display_options(config: &BuildConfig) {
    println!("Command options enabled:");
    println!("  Kernel version:           {}", config.kernel_version);
    println!("  Kernel modules directory: {}", config.module_dir.display());
    println!("  File to write:            {}", config.output.display());
    println!("  Image compression type:   {}", config.codec);
    println!("  Using force:              {}", config.use_force);
    println!("  Strip installed binaries: {}", config.strip_binaries);
    println!("  Staging directory:        {}", config.staging_dir.display());
    println!("  Enabled stages:           {}", config.stages.join(", "));
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let opts = parse_args(&args)?;

    let Some(kernel_version) = opts.kernel_version else {
        bail!("missing required -k KERNEL_VERSION\n\n{}", usage());
    };
    let module_dir = opts
        .module_dir
        .unwrap_or_else(|| PathBuf::from("/lib/modules").join(&kernel_version));

    let mut config = BuildConfig::new(kernel_version, module_dir);
    config.modules = opts.modules;
    if let Some(stages) = opts.stages {
        config.stages = stages;
    }
    if let Some(codec) = opts.codec {
        config.codec = codec;
    }
    if let Some(output) = opts.output {
        config.output = output;
    }
    if let Some(staging_dir) = opts.staging_dir {
        config.staging_dir = staging_dir;
    }
    config.use_force = opts.use_force;
    config.strip_binaries = opts.strip_binaries;

    display_options(&config);
    pipeline::install_signal_handlers();

    let report = pipeline::build(&config)?;
    println!(
        "Done: {} stages, {} -> {} bytes",
        report.stages_run, report.archive_bytes, report.compressed_bytes
    );
    Ok(())
}
