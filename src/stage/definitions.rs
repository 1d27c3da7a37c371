//! The built-in stage set.
//!
//! Layout ownership: `base` owns the FHS skeleton and device nodes,
//! `busybox` owns /bin, `busybox-init` owns /init, the module stages own
//! /lib/modules, and the mdev pair owns the device manager. Stage ordering
//! is what keeps these from colliding (busybox populates the /bin that base
//! created), with /init protected outright.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::{Stage, StageContext};
use crate::tree::{DeviceKind, FileOp};

/// Busybox applets linked into /bin for the boot environment.
const BUSYBOX_APPLETS: &[&str] = &[
    "sh", "mount", "umount", "mkdir", "cat", "ls", "sleep", "switch_root", "echo", "test", "[",
    "grep", "sed", "ln", "rm", "cp", "mv", "chmod", "chown", "mknod", "losetup", "insmod",
    "modprobe", "blkid", "findfs",
];

/// Module metadata files modprobe needs for dependency resolution at boot.
const MODULE_METADATA_FILES: &[&str] = &[
    "modules.dep",
    "modules.dep.bin",
    "modules.alias",
    "modules.alias.bin",
    "modules.softdep",
    "modules.symbols",
    "modules.symbols.bin",
    "modules.builtin",
    "modules.builtin.bin",
    "modules.builtin.modinfo",
    "modules.order",
];

/// Filesystem drivers staged when the kernel ships them as modules. Kernels
/// with these built in simply do not list them in modules.dep, so absence
/// here is not an error.
const FILESYSTEM_DRIVERS: &[&str] = &["ext4", "vfat", "isofs", "squashfs", "overlay", "xfs", "btrfs"];

/// CPU microcode directories loaded before anything else at boot.
const EARLY_FIRMWARE_DIRS: &[&str] = &["amd-ucode", "intel-ucode"];

/// Runtime firmware files worth carrying when the host has them.
const RUNTIME_FIRMWARE_FILES: &[&str] = &["regulatory.db", "regulatory.db.p7s"];

/// Emit copy operations for a set of resolved modules, mirroring the
/// modules.dep-relative layout under `lib/modules/<version>/`.
fn module_copy_ops(
    ctx: &StageContext,
    closure: &BTreeSet<String>,
) -> Result<Vec<FileOp>> {
    let source_base = ctx.config.module_dir_for_kernel();
    let dest_base = Path::new("lib/modules").join(&ctx.config.kernel_version);

    let mut ops = Vec::with_capacity(closure.len());
    for name in closure {
        let rel = ctx
            .modules
            .module_path(name)
            .with_context(|| format!("module '{name}' vanished from the index"))?
            .to_path_buf();
        ops.push(FileOp::CopyFile {
            source: source_base.join(&rel),
            dest: dest_base.join(&rel),
        });
    }
    Ok(ops)
}

// 00 earlyfw

/// CPU microcode, loaded by the kernel before regular drivers.
pub struct EarlyFirmwareStage;

impl Stage for EarlyFirmwareStage {
    fn name(&self) -> &'static str {
        "earlyfw"
    }

    fn order(&self) -> u8 {
        0
    }

    fn ops(&self, _ctx: &mut StageContext) -> Result<Vec<FileOp>> {
        let mut ops = vec![FileOp::Dir {
            path: "lib/firmware".into(),
            mode: 0o755,
        }];
        for dir in EARLY_FIRMWARE_DIRS {
            let host = Path::new("/lib/firmware").join(dir);
            if host.is_dir() {
                ops.push(FileOp::CopyTree {
                    source: host,
                    dest: Path::new("lib/firmware").join(dir),
                });
            }
        }
        Ok(ops)
    }
}

// 01 base

/// FHS skeleton, merged lib symlink, and the device nodes the kernel expects
/// before any device manager runs.
pub struct BaseStage;

impl Stage for BaseStage {
    fn name(&self) -> &'static str {
        "base"
    }

    fn order(&self) -> u8 {
        1
    }

    fn ops(&self, _ctx: &mut StageContext) -> Result<Vec<FileOp>> {
        let mut ops = Vec::new();
        for dir in [
            "bin", "sbin", "etc", "dev", "dev/pts", "lib", "lib/modules", "mnt", "proc", "run",
            "sys", "usr/bin", "usr/sbin", "usr/lib", "var",
        ] {
            ops.push(FileOp::Dir {
                path: dir.into(),
                mode: 0o755,
            });
        }
        ops.push(FileOp::Dir {
            path: "tmp".into(),
            mode: 0o1777,
        });
        ops.push(FileOp::Symlink {
            link: "lib64".into(),
            target: "lib".into(),
        });
        ops.push(FileOp::Symlink {
            link: "var/run".into(),
            target: "/run".into(),
        });

        // Console majors/minors per Documentation/admin-guide/devices.txt.
        let nodes: [(&str, u32, u32, u32); 7] = [
            ("dev/console", 5, 1, 0o600),
            ("dev/tty", 5, 0, 0o666),
            ("dev/null", 1, 3, 0o666),
            ("dev/zero", 1, 5, 0o666),
            ("dev/kmsg", 1, 11, 0o644),
            ("dev/random", 1, 8, 0o666),
            ("dev/urandom", 1, 9, 0o666),
        ];
        for (path, major, minor, mode) in nodes {
            ops.push(FileOp::DeviceNode {
                path: path.into(),
                kind: DeviceKind::Char,
                major,
                minor,
                mode,
            });
        }
        Ok(ops)
    }
}

// 02 busybox

/// The busybox binary, its shared libraries, and applet symlinks.
pub struct BusyboxStage;

impl Stage for BusyboxStage {
    fn name(&self) -> &'static str {
        "busybox"
    }

    fn order(&self) -> u8 {
        2
    }

    fn ops(&self, ctx: &mut StageContext) -> Result<Vec<FileOp>> {
        let busybox = which::which("busybox")
            .context("busybox not found on host (install: busybox or busybox-static)")?;

        let mut ops = vec![FileOp::CopyFile {
            source: busybox.clone(),
            dest: "bin/busybox".into(),
        }];

        // Most distro busybox builds are static; dynamic ones pull their
        // libraries in at the host's own paths so the loader finds them.
        for lib in ctx.libraries.closure(&busybox)? {
            let dest = lib
                .strip_prefix("/")
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| lib.clone());
            ops.push(FileOp::CopyFile { source: lib, dest });
        }

        for applet in BUSYBOX_APPLETS {
            ops.push(FileOp::Symlink {
                link: Path::new("bin").join(applet),
                target: "busybox".into(),
            });
        }
        ops.push(FileOp::Protect {
            path: "bin/busybox".into(),
        });
        Ok(ops)
    }
}

// 03 busybox-init

/// /init and the inittab driving the boot shell.
pub struct BusyboxInitStage;

const INIT_SCRIPT: &str = r#"#!/bin/busybox sh
# Early userspace init: mount kernel filesystems, start device handling,
# then hand over to the real root.

/bin/busybox mount -t proc proc /proc
/bin/busybox mount -t sysfs sysfs /sys
/bin/busybox mount -t devtmpfs devtmpfs /dev 2>/dev/null

/bin/busybox mdev -s
echo /sbin/mdev > /proc/sys/kernel/hotplug 2>/dev/null

for mod in $(cat /etc/modules 2>/dev/null); do
    /bin/busybox modprobe "$mod"
done

exec /bin/busybox init
"#;

const INITTAB: &str = "\
::sysinit:/bin/busybox mount -o remount,rw /
::respawn:/bin/busybox getty -L console 0 vt100
::ctrlaltdel:/bin/busybox reboot
::shutdown:/bin/busybox umount -a -r
";

impl Stage for BusyboxInitStage {
    fn name(&self) -> &'static str {
        "busybox-init"
    }

    fn order(&self) -> u8 {
        3
    }

    fn ops(&self, ctx: &mut StageContext) -> Result<Vec<FileOp>> {
        let modules_list = ctx
            .config
            .modules
            .iter()
            .map(|m| format!("{m}\n"))
            .collect::<String>();
        Ok(vec![
            FileOp::WriteFile {
                path: "init".into(),
                content: INIT_SCRIPT.as_bytes().to_vec(),
                mode: 0o755,
            },
            FileOp::Protect {
                path: "init".into(),
            },
            FileOp::WriteFile {
                path: "etc/inittab".into(),
                content: INITTAB.as_bytes().to_vec(),
                mode: 0o644,
            },
            FileOp::WriteFile {
                path: "etc/modules".into(),
                content: modules_list.into_bytes(),
                mode: 0o644,
            },
        ])
    }
}

// 04 firmware

/// Runtime firmware blobs drivers may request after boot.
pub struct FirmwareStage;

impl Stage for FirmwareStage {
    fn name(&self) -> &'static str {
        "firmware"
    }

    fn order(&self) -> u8 {
        4
    }

    fn ops(&self, _ctx: &mut StageContext) -> Result<Vec<FileOp>> {
        let mut ops = vec![FileOp::Dir {
            path: "lib/firmware".into(),
            mode: 0o755,
        }];
        for file in RUNTIME_FIRMWARE_FILES {
            let host = Path::new("/lib/firmware").join(file);
            if host.is_file() {
                ops.push(FileOp::CopyFile {
                    source: host,
                    dest: Path::new("lib/firmware").join(file),
                });
            }
        }
        Ok(ops)
    }
}

// 05 fs

/// Filesystem driver modules and their dependency closure.
pub struct FilesystemDriversStage;

impl Stage for FilesystemDriversStage {
    fn name(&self) -> &'static str {
        "fs"
    }

    fn order(&self) -> u8 {
        5
    }

    fn ops(&self, ctx: &mut StageContext) -> Result<Vec<FileOp>> {
        let present: Vec<&str> = FILESYSTEM_DRIVERS
            .iter()
            .copied()
            .filter(|name| ctx.modules.contains(name))
            .collect();
        let closure = ctx.modules.closure(&present)?;
        module_copy_ops(ctx, &closure)
    }
}

// 06 kernel-modules

/// The caller-requested kernel modules, their closure, and the modprobe
/// metadata files.
pub struct KernelModulesStage;

impl Stage for KernelModulesStage {
    fn name(&self) -> &'static str {
        "kernel-modules"
    }

    fn order(&self) -> u8 {
        6
    }

    fn ops(&self, ctx: &mut StageContext) -> Result<Vec<FileOp>> {
        let requested = ctx.config.modules.clone();
        // Unlike the fs stage, explicitly requested modules must exist.
        let closure = ctx.modules.closure(&requested)?;
        let mut ops = module_copy_ops(ctx, &closure)?;

        let source_base = ctx.config.module_dir_for_kernel();
        let dest_base = Path::new("lib/modules").join(&ctx.config.kernel_version);
        ops.push(FileOp::Dir {
            path: dest_base.clone(),
            mode: 0o755,
        });
        for metadata in MODULE_METADATA_FILES {
            let source = source_base.join(metadata);
            if source.is_file() {
                ops.push(FileOp::CopyFile {
                    source,
                    dest: dest_base.join(metadata),
                });
            }
        }
        Ok(ops)
    }
}

// 07 mdev / 08 mdev-rules

/// Device manager binary. Busybox provides mdev, so this is a symlink; the
/// rules stage that follows presumes it is already staged.
pub struct MdevStage;

impl Stage for MdevStage {
    fn name(&self) -> &'static str {
        "mdev"
    }

    fn order(&self) -> u8 {
        7
    }

    fn ops(&self, _ctx: &mut StageContext) -> Result<Vec<FileOp>> {
        Ok(vec![FileOp::Symlink {
            link: "sbin/mdev".into(),
            target: "../bin/busybox".into(),
        }])
    }
}

const MDEV_CONF: &str = "\
# mdev device naming rules.
null        root:root 666
zero        root:root 666
full        root:root 666
random      root:root 666
urandom     root:root 666
kmsg        root:root 644
console     root:root 600
tty         root:root 666
tty[0-9]*   root:root 620
sd[a-z]*    root:root 660
sr[0-9]*    root:root 660
loop[0-9]*  root:root 660
";

/// /etc/mdev.conf naming rules.
pub struct MdevRulesStage;

impl Stage for MdevRulesStage {
    fn name(&self) -> &'static str {
        "mdev-rules"
    }

    fn order(&self) -> u8 {
        8
    }

    fn ops(&self, _ctx: &mut StageContext) -> Result<Vec<FileOp>> {
        Ok(vec![FileOp::WriteFile {
            path: "etc/mdev.conf".into(),
            content: MDEV_CONF.as_bytes().to_vec(),
            mode: 0o644,
        }])
    }
}

// 09 rootfs / 10 pivot

/// Mount scaffolding for the real root filesystem.
pub struct RootfsStage;

impl Stage for RootfsStage {
    fn name(&self) -> &'static str {
        "rootfs"
    }

    fn order(&self) -> u8 {
        9
    }

    fn ops(&self, _ctx: &mut StageContext) -> Result<Vec<FileOp>> {
        Ok(vec![
            FileOp::Dir {
                path: "mnt/root".into(),
                mode: 0o755,
            },
            FileOp::WriteFile {
                path: "etc/fstab".into(),
                content: b"proc  /proc  proc   defaults  0 0\nsysfs /sys   sysfs  defaults  0 0\n"
                    .to_vec(),
                mode: 0o644,
            },
        ])
    }
}

const PIVOT_SCRIPT: &str = r#"#!/bin/busybox sh
# Hand control to the real root once it is mounted at /mnt/root.
[ -x /mnt/root/sbin/init ] || exec /bin/busybox sh

/bin/busybox mount --move /proc /mnt/root/proc
/bin/busybox mount --move /sys /mnt/root/sys
/bin/busybox mount --move /dev /mnt/root/dev
exec /bin/busybox switch_root /mnt/root /sbin/init
"#;

/// switch_root helper invoked by init once the root device appears.
pub struct PivotStage;

impl Stage for PivotStage {
    fn name(&self) -> &'static str {
        "pivot"
    }

    fn order(&self) -> u8 {
        10
    }

    fn ops(&self, _ctx: &mut StageContext) -> Result<Vec<FileOp>> {
        Ok(vec![FileOp::WriteFile {
            path: "sbin/switch-to-root".into(),
            content: PIVOT_SCRIPT.as_bytes().to_vec(),
            mode: 0o755,
        }])
    }
}

// 11 compression

/// Marker recording which codec wrapped this image, for tooling that
/// inspects an unpacked initramfs.
pub struct CompressionMarkerStage;

impl Stage for CompressionMarkerStage {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn order(&self) -> u8 {
        11
    }

    fn ops(&self, ctx: &mut StageContext) -> Result<Vec<FileOp>> {
        let content = format!("{}\n", ctx.config.codec);
        Ok(vec![FileOp::WriteFile {
            path: PathBuf::from("etc/mkinitramfs/codec"),
            content: content.into_bytes(),
            mode: 0o644,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildConfig, Codec};
    use crate::resolver::{LibraryResolver, ModuleResolver};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    const SAMPLE_DEP: &str = "\
kernel/fs/mbcache.ko.xz:
kernel/fs/jbd2/jbd2.ko.xz:
kernel/fs/ext4/ext4.ko.xz: kernel/fs/jbd2/jbd2.ko.xz kernel/fs/mbcache.ko.xz
kernel/drivers/block/virtio_blk.ko.xz:
";

    struct Fixture {
        _temp: TempDir,
        config: BuildConfig,
        modules: ModuleResolver,
        libraries: LibraryResolver,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let module_dir = temp.path().join("6.8.0");
            fs::create_dir_all(&module_dir).unwrap();
            fs::write(module_dir.join("modules.dep"), SAMPLE_DEP).unwrap();
            fs::write(module_dir.join("modules.alias"), "# aliases\n").unwrap();

            let mut config = BuildConfig::new("6.8.0", &module_dir);
            config.codec = Codec::Gzip;
            let modules = ModuleResolver::new(&module_dir).unwrap();
            Self {
                _temp: temp,
                config,
                modules,
                libraries: LibraryResolver::new(Duration::from_secs(5)),
            }
        }

        fn ctx(&mut self) -> StageContext<'_> {
            StageContext {
                config: &self.config,
                modules: &mut self.modules,
                libraries: &self.libraries,
            }
        }
    }

    fn dest_paths(ops: &[FileOp]) -> Vec<String> {
        ops.iter()
            .filter_map(|op| match op {
                FileOp::CopyFile { dest, .. } => Some(dest.to_string_lossy().into_owned()),
                FileOp::WriteFile { path, .. } => Some(path.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_base_stage_places_console_and_null() {
        let mut fixture = Fixture::new();
        let ops = BaseStage.ops(&mut fixture.ctx()).unwrap();
        let devices: Vec<(&str, u32, u32)> = ops
            .iter()
            .filter_map(|op| match op {
                FileOp::DeviceNode {
                    path, major, minor, ..
                } => Some((path.to_str().unwrap(), *major, *minor)),
                _ => None,
            })
            .collect();
        assert!(devices.contains(&("dev/console", 5, 1)));
        assert!(devices.contains(&("dev/null", 1, 3)));
    }

    #[test]
    fn test_fs_stage_skips_builtin_drivers() {
        let mut fixture = Fixture::new();
        // Only ext4 (and deps) exist in the sample index; vfat etc. are
        // treated as built into the kernel.
        let ops = FilesystemDriversStage.ops(&mut fixture.ctx()).unwrap();
        let dests = dest_paths(&ops);
        assert_eq!(dests.len(), 3);
        assert!(dests
            .iter()
            .all(|d| d.starts_with("lib/modules/6.8.0/kernel/")));
        assert!(dests.iter().any(|d| d.ends_with("ext4.ko.xz")));
        assert!(dests.iter().any(|d| d.ends_with("jbd2.ko.xz")));
    }

    #[test]
    fn test_kernel_modules_stage_fails_on_missing_request() {
        let mut fixture = Fixture::new();
        fixture.config.modules = vec!["nvme".into()];
        let err = KernelModulesStage.ops(&mut fixture.ctx()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::BuildError>(),
            Some(crate::error::BuildError::ModuleNotFound(ref name, _)) if name == "nvme"
        ));
    }

    #[test]
    fn test_kernel_modules_stage_copies_closure_and_metadata() {
        let mut fixture = Fixture::new();
        fixture.config.modules = vec!["ext4".into(), "virtio_blk".into()];
        let ops = KernelModulesStage.ops(&mut fixture.ctx()).unwrap();
        let dests = dest_paths(&ops);
        assert!(dests.iter().any(|d| d.ends_with("virtio_blk.ko.xz")));
        assert!(dests.iter().any(|d| d.ends_with("mbcache.ko.xz")));
        assert!(dests
            .iter()
            .any(|d| d.ends_with("lib/modules/6.8.0/modules.dep")));
        assert!(dests
            .iter()
            .any(|d| d.ends_with("lib/modules/6.8.0/modules.alias")));
    }

    #[test]
    fn test_init_is_protected() {
        let mut fixture = Fixture::new();
        let ops = BusyboxInitStage.ops(&mut fixture.ctx()).unwrap();
        assert!(ops.iter().any(|op| matches!(
            op,
            FileOp::Protect { path } if path == Path::new("init")
        )));
        assert!(ops.iter().any(|op| matches!(
            op,
            FileOp::WriteFile { path, mode, .. }
                if path == Path::new("init") && *mode == 0o755
        )));
    }

    #[test]
    fn test_compression_marker_records_codec() {
        let mut fixture = Fixture::new();
        let ops = CompressionMarkerStage.ops(&mut fixture.ctx()).unwrap();
        match &ops[0] {
            FileOp::WriteFile { content, .. } => {
                assert_eq!(String::from_utf8_lossy(content), "gzip\n");
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn test_mdev_rules_follow_mdev() {
        assert!(MdevStage.order() < MdevRulesStage.order());
        assert!(BusyboxStage.order() < MdevStage.order());
    }
}
