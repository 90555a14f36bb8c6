// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Filesystem operations for the volumes the driver formats: mkfs,
//! grow, shrink, UUID regeneration, and busy-tolerant mount handling.

use std::fmt;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use tempfile::TempDir;

use crate::error::DriverError;
use crate::process::{run_command, Operation};
use crate::volume::Volume;

/// Filesystems a volume may be formatted with.
pub const ALLOWED_FILESYSTEMS: [&str; 3] = ["ext4", "xfs", "btrfs"];

/// How many times to retry a busy mount or unmount before giving up.
const MOUNT_RETRIES: u32 = 20;
/// Delay between mount retries.
const MOUNT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Filesystem {
    Ext4,
    Xfs,
    Btrfs,
}

impl Filesystem {
    pub fn parse(name: &str) -> Result<Self, DriverError> {
        match name {
            "ext4" => Ok(Self::Ext4),
            "xfs" => Ok(Self::Xfs),
            "btrfs" => Ok(Self::Btrfs),
            other => Err(DriverError::InvalidOption(
                "block.filesystem".to_string(),
                format!("unsupported filesystem \"{}\"", other),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ext4 => "ext4",
            Self::Xfs => "xfs",
            Self::Btrfs => "btrfs",
        }
    }
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether mounting a second copy of this filesystem requires a fresh
/// UUID. xfs and btrfs both refuse duplicate UUIDs in the kernel.
pub fn needs_uuid_regen(fs: Filesystem) -> bool {
    matches!(fs, Filesystem::Xfs | Filesystem::Btrfs)
}

/// Format a device. -K tells mkfs not to discard blocks, which on thin
/// volumes would throw away the provisioning done at create time.
pub fn mkfs(fs: Filesystem, device: &Path, op: Option<&Operation>) -> Result<()> {
    let mut cmd = match fs {
        Filesystem::Ext4 => {
            let mut cmd = Command::new("/sbin/mkfs.ext4");
            cmd.arg("-K");
            cmd
        }
        Filesystem::Xfs => {
            let mut cmd = Command::new("/sbin/mkfs.xfs");
            cmd.arg("-K");
            cmd
        }
        Filesystem::Btrfs => {
            let mut cmd = Command::new("/sbin/mkfs.btrfs");
            cmd.arg("-K");
            cmd
        }
    };
    cmd.arg(device);

    run_command(cmd, op).with_context(|| format!("Cannot format {}", device.display()))
}

/// Grow a filesystem to fill its (already grown) device. ext4 grows
/// from the device node; xfs and btrfs only grow mounted, so reuse the
/// volume's mount point when it is mounted and a temp mount otherwise.
pub fn grow(
    fs: Filesystem,
    device: &Path,
    mounted_at: Option<&Path>,
    op: Option<&Operation>,
) -> Result<()> {
    let grow_mounted = |mut cmd: Command| -> Result<()> {
        match mounted_at {
            Some(path) => {
                cmd.arg(path);
                run_command(cmd, op)
            }
            None => {
                let mount = TempMount::new(device, fs)?;
                cmd.arg(mount.path());
                run_command(cmd, op)
            }
        }
        .with_context(|| format!("Failed to grow {} on {}", fs, device.display()))
    };

    match fs {
        Filesystem::Ext4 => {
            let mut cmd = Command::new("/sbin/resize2fs");
            cmd.arg(device);
            run_command(cmd, op)
                .with_context(|| format!("Failed to grow ext4 on {}", device.display()))
        }
        Filesystem::Xfs => grow_mounted(Command::new("/usr/sbin/xfs_growfs")),
        Filesystem::Btrfs => {
            let mut cmd = Command::new("/sbin/btrfs");
            cmd.args(["filesystem", "resize", "max"]);
            grow_mounted(cmd)
        }
    }
}

/// Shrink a filesystem to `new_bytes` ahead of shrinking its device.
/// Only ext4 supports offline shrinking.
pub fn shrink(
    fs: Filesystem,
    device: &Path,
    new_bytes: u64,
    op: Option<&Operation>,
) -> Result<()> {
    match fs {
        Filesystem::Ext4 => {
            // e2fsck exits 1 when it corrected something; that is still
            // a clean filesystem.
            crate::process::check_cancelled(op)?;
            let output = Command::new("/sbin/e2fsck")
                .args(["-f", "-p"])
                .arg(device)
                .output()
                .with_context(|| format!("Failed to run e2fsck on {}", device.display()))?;
            if !matches!(output.status.code(), Some(0) | Some(1)) {
                anyhow::bail!(
                    "e2fsck on {} failed: {}",
                    device.display(),
                    String::from_utf8_lossy(&output.stderr)
                );
            }

            let mut cmd = Command::new("/sbin/resize2fs");
            cmd.arg(device);
            cmd.arg(format!("{}K", new_bytes / 1024));
            run_command(cmd, op)
                .with_context(|| format!("Failed to shrink ext4 on {}", device.display()))
        }
        Filesystem::Xfs | Filesystem::Btrfs => Err(DriverError::NotSupported(format!(
            "filesystem \"{}\" cannot be shrunk",
            fs
        ))
        .into()),
    }
}

/// Give the filesystem on a device a new UUID, so it can be mounted
/// alongside the volume it was snapshotted from.
pub fn regenerate_uuid(fs: Filesystem, device: &Path, op: Option<&Operation>) -> Result<()> {
    info!("Regenerating filesystem UUID on {}", device.display());
    let mut cmd = match fs {
        Filesystem::Xfs => {
            let mut cmd = Command::new("/usr/sbin/xfs_admin");
            cmd.args(["-U", "generate"]);
            cmd
        }
        Filesystem::Btrfs => {
            let mut cmd = Command::new("/sbin/btrfstune");
            cmd.args(["-f", "-u"]);
            cmd
        }
        Filesystem::Ext4 => {
            return Err(DriverError::NotSupported(
                "UUID regeneration is not needed for ext4".to_string(),
            )
            .into());
        }
    };
    cmd.arg(device);

    run_command(cmd, op)
        .with_context(|| format!("Failed to regenerate UUID on {}", device.display()))
}

/// Mount flags and filesystem data string for a volume. All supported
/// filesystems sit on LVs, so pass discards down to the thinpool.
pub fn mount_options(_vol: &Volume) -> (MsFlags, String) {
    (MsFlags::empty(), "discard".to_string())
}

/// Whether the given path is a mount point. A missing path is not one.
pub fn is_mount_point(path: &Path) -> bool {
    let Ok(md) = nix::sys::stat::stat(path) else {
        return false;
    };

    let Some(parent) = path.parent() else {
        // The filesystem root is as mounted as it gets.
        return true;
    };
    let Ok(parent_md) = nix::sys::stat::stat(parent) else {
        return false;
    };

    // A mount boundary changes the device; a bind mount of the same
    // filesystem repeats the root inode.
    md.st_dev != parent_md.st_dev || md.st_ino == parent_md.st_ino
}

/// Mount a device, retrying while the kernel reports it busy. LVM holds
/// transient device locks right after LV activation.
pub fn try_mount(
    device: &Path,
    target: &Path,
    fs: Filesystem,
    flags: MsFlags,
    data: &str,
) -> Result<()> {
    let data_opt: Option<&str> = if data.is_empty() { None } else { Some(data) };
    let mut attempt = 0;
    loop {
        match nix::mount::mount(
            Some(device),
            target,
            Some(fs.as_str()),
            flags,
            data_opt,
        ) {
            Ok(()) => {
                info!("Mounted {} to {}", device.display(), target.display());
                return Ok(());
            }
            Err(Errno::EBUSY) if attempt < MOUNT_RETRIES => {
                attempt += 1;
                thread::sleep(MOUNT_RETRY_DELAY);
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "Failed to mount {} to {}",
                        device.display(),
                        target.display()
                    )
                });
            }
        }
    }
}

/// Unmount a path, retrying while busy.
pub fn try_unmount(target: &Path, flags: MntFlags) -> Result<()> {
    let mut attempt = 0;
    loop {
        match nix::mount::umount2(target, flags) {
            Ok(()) => {
                info!("Unmounted {}", target.display());
                return Ok(());
            }
            Err(Errno::EBUSY) if attempt < MOUNT_RETRIES => {
                attempt += 1;
                thread::sleep(MOUNT_RETRY_DELAY);
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to unmount {}", target.display()));
            }
        }
    }
}

/// A mount on a temporary directory, unmounted and removed on drop.
struct TempMount {
    tempdir: TempDir,
}

impl TempMount {
    fn new(device: &Path, fs: Filesystem) -> Result<Self> {
        let tempdir = TempDir::new().context("Failed to create temp mount dir")?;
        try_mount(device, tempdir.path(), fs, MsFlags::empty(), "")?;
        Ok(Self { tempdir })
    }

    fn path(&self) -> &Path {
        self.tempdir.path()
    }
}

impl Drop for TempMount {
    fn drop(&mut self) {
        if let Err(err) = try_unmount(self.tempdir.path(), MntFlags::empty()) {
            log::error!(
                "Error unmounting temp directory at {}: {}",
                self.tempdir.path().display(),
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use crate::volume::{ContentType, VolumeType};

    #[test]
    fn test_filesystem_parse() {
        for name in ALLOWED_FILESYSTEMS {
            assert_eq!(Filesystem::parse(name).unwrap().as_str(), name);
        }
        assert!(Filesystem::parse("vfat").is_err());
        assert!(Filesystem::parse("").is_err());
    }

    #[test]
    fn test_needs_uuid_regen() {
        assert!(needs_uuid_regen(Filesystem::Xfs));
        assert!(needs_uuid_regen(Filesystem::Btrfs));
        assert!(!needs_uuid_regen(Filesystem::Ext4));
    }

    #[test]
    fn test_mount_options() {
        let vol = Volume::new(
            VolumeType::Custom,
            ContentType::Filesystem,
            "c1",
            BTreeMap::new(),
        );
        let (flags, data) = mount_options(&vol);
        assert_eq!(flags, MsFlags::empty());
        assert_eq!(data, "discard");
    }

    #[test]
    fn test_is_mount_point() {
        // The root of the mount namespace is always a mount point; a
        // fresh tempdir never is; a missing path never is.
        assert!(is_mount_point(Path::new("/")));
        let dir = TempDir::new().unwrap();
        assert!(!is_mount_point(dir.path()));
        assert!(!is_mount_point(&dir.path().join("missing")));
    }
}
