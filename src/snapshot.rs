// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Snapshot lifecycle: create, delete, mount, unmount, rename, restore.
//!
//! Two ground-truth decisions live here. Snapshot enumeration reads the
//! on-disk snapshot directory, never LVM origin metadata, because a
//! restore rewrites origin pointers and a partial failure can leave a
//! directory without an LV. And read-only snapshot mounts on
//! filesystems that refuse duplicate UUIDs go through a transient
//! writable snapshot-of-the-snapshot with a regenerated UUID, so the
//! snapshot itself is never mutated.

use std::fs;
use std::io;

use anyhow::{Context, Result};
use log::{info, warn};
use nix::mount::{MntFlags, MsFlags};

use crate::driver::LvmDriver;
use crate::error::DriverError;
use crate::fsutil::{self, Filesystem};
use crate::lvm;
use crate::paths;
use crate::process::Operation;
use crate::revert::Reverter;
use crate::transfer;
use crate::util;
use crate::volume::{ContentType, Volume, TMP_VOL_SUFFIX};

impl LvmDriver {
    /// Split a snapshot volume's name, rejecting non-snapshot names.
    fn snapshot_parts<'v>(&self, snap_vol: &'v Volume) -> Result<(&'v str, &'v str), DriverError> {
        snap_vol.split_snapshot().ok_or_else(|| {
            DriverError::InvalidVolumeName(
                snap_vol.name().to_string(),
                "not a snapshot name".to_string(),
            )
        })
    }

    /// Name of the transient writable snapshot shadowing a snapshot LV.
    fn tmp_lv_name(&self, snap_vol: &Volume) -> String {
        format!("{}{}", paths::lv_name(snap_vol), TMP_VOL_SUFFIX)
    }

    /// CoW space for a classic snapshot: the full origin size, so no
    /// amount of rewriting can invalidate it. Thin snapshots allocate
    /// from the pool on demand instead.
    fn snapshot_cow_bytes(&self, source_lv: &str, op: Option<&Operation>) -> Result<u64> {
        if self.use_thinpool() {
            return Ok(0);
        }

        lvm::lv_size_bytes(self.vg(), source_lv, op)
    }

    /// Enumerate a volume's snapshots. The on-disk directory listing is
    /// authoritative.
    pub fn volume_snapshots(&self, vol: &Volume) -> Result<Vec<String>> {
        let dir = self.snapshots_dir(vol);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read {}", dir.display()));
            }
        };

        let mut snapshots = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("Failed to read {}", dir.display()))?;
            snapshots.push(entry.file_name().to_string_lossy().to_string());
        }
        snapshots.sort();

        Ok(snapshots)
    }

    /// Take a read-only snapshot of a volume. For VM block volumes the
    /// sibling filesystem volume is snapshotted as well, with the
    /// reverter armed to drop the block snapshot if that fails.
    pub fn create_volume_snapshot(
        &self,
        snap_vol: &Volume,
        op: Option<&Operation>,
    ) -> Result<()> {
        snap_vol.validate_name()?;
        let (parent, _) = self.snapshot_parts(snap_vol)?;

        let mut rev = Reverter::new();

        let parent_dir = paths::snapshots_dir(self.pool_root(), snap_vol.vol_type(), parent);
        if util::ensure_dir(&parent_dir)? {
            let undo_dir = parent_dir.clone();
            rev.add("creation of snapshot directory", move || {
                util::remove_dir_if_empty(&undo_dir)
            });
        }

        let mount_dir = self.mount_path(snap_vol);
        if util::ensure_dir(&mount_dir)? {
            let undo_dir = mount_dir.clone();
            rev.add("creation of snapshot mount directory", move || {
                util::remove_dir_tree(&undo_dir)
            });
        }

        let source_lv = paths::lv_name(&snap_vol.with_name(parent));
        let snap_lv = paths::lv_name(snap_vol);
        let cow_bytes = self.snapshot_cow_bytes(&source_lv, op)?;
        lvm::create_lv_snapshot(
            self.vg(),
            self.thinpool(),
            &source_lv,
            &snap_lv,
            true,
            cow_bytes,
            op,
        )?;
        let (undo_vg, undo_lv) = (self.vg().to_string(), snap_lv);
        rev.add("creation of snapshot volume", move || {
            lvm::remove_lv(&undo_vg, &undo_lv, None)
        });

        if snap_vol.is_vm_block() {
            let fs_snap = snap_vol.new_vm_block_filesystem_volume();
            self.create_volume_snapshot(&fs_snap, op)?;
        }

        rev.success();
        info!("Created snapshot \"{}\"", snap_vol.name());

        Ok(())
    }

    /// Delete a snapshot: unmount, drop the LV (and any transient tmp
    /// LV), recurse for VM block, then clean up the directory layout.
    pub fn delete_volume_snapshot(
        &self,
        snap_vol: &Volume,
        op: Option<&Operation>,
    ) -> Result<()> {
        let (parent, _) = self.snapshot_parts(snap_vol)?;

        let snap_lv = paths::lv_name(snap_vol);
        if lvm::lv_exists(self.vg(), &snap_lv, op)? {
            self.unmount_volume_snapshot(snap_vol, op)?;
            lvm::remove_lv(self.vg(), &snap_lv, op)?;
        }

        if snap_vol.is_vm_block() {
            let fs_snap = snap_vol.new_vm_block_filesystem_volume();
            self.delete_volume_snapshot(&fs_snap, op)?;
        }

        util::remove_dir_tree(&self.mount_path(snap_vol))?;
        let parent_dir = paths::snapshots_dir(self.pool_root(), snap_vol.vol_type(), parent);
        util::remove_dir_if_empty(&parent_dir)?;

        info!("Deleted snapshot \"{}\"", snap_vol.name());

        Ok(())
    }

    /// Mount a snapshot read-only. Filesystems that refuse duplicate
    /// UUIDs get a transient writable snapshot with a fresh UUID
    /// mounted in the snapshot's place; the snapshot LV itself is never
    /// touched. Returns whether this call did the mounting.
    pub fn mount_volume_snapshot(
        &self,
        snap_vol: &Volume,
        op: Option<&Operation>,
    ) -> Result<bool> {
        self.snapshot_parts(snap_vol)?;

        if snap_vol.is_vm_block() {
            // The block snapshot is activated for read access; only the
            // sibling filesystem snapshot is actually mounted.
            lvm::activate_lv(self.vg(), &paths::lv_name(snap_vol), op)?;
            let fs_snap = snap_vol.new_vm_block_filesystem_volume();
            return self.mount_volume_snapshot(&fs_snap, op);
        }
        if snap_vol.content_type() != ContentType::Filesystem {
            lvm::activate_lv(self.vg(), &paths::lv_name(snap_vol), op)?;
            return Ok(false);
        }

        let mount_dir = self.mount_path(snap_vol);
        if fsutil::is_mount_point(&mount_dir) {
            return Ok(false);
        }
        util::ensure_dir(&mount_dir)?;

        let fs = Filesystem::parse(snap_vol.filesystem())?;
        let snap_lv = paths::lv_name(snap_vol);
        let (flags, data) = fsutil::mount_options(snap_vol);
        let flags = flags | MsFlags::MS_RDONLY;

        let mut rev = Reverter::new();

        if fsutil::needs_uuid_regen(fs) {
            let tmp_lv = self.tmp_lv_name(snap_vol);

            // A leftover tmp snapshot from an interrupted mount is
            // stale; replace it.
            if lvm::lv_exists(self.vg(), &tmp_lv, op)? {
                lvm::remove_lv(self.vg(), &tmp_lv, op)?;
            }

            let cow_bytes = self.snapshot_cow_bytes(&snap_lv, op)?;
            lvm::create_lv_snapshot(
                self.vg(),
                self.thinpool(),
                &snap_lv,
                &tmp_lv,
                false,
                cow_bytes,
                op,
            )?;
            let (undo_vg, undo_lv) = (self.vg().to_string(), tmp_lv.clone());
            rev.add("creation of temporary snapshot volume", move || {
                lvm::remove_lv(&undo_vg, &undo_lv, None)
            });

            lvm::activate_lv(self.vg(), &tmp_lv, op)?;
            let tmp_dev = lvm::lv_path(self.vg(), &tmp_lv);
            fsutil::regenerate_uuid(fs, &tmp_dev, op)?;
            fsutil::try_mount(&tmp_dev, &mount_dir, fs, flags, &data)?;
        } else {
            lvm::activate_lv(self.vg(), &snap_lv, op)?;
            let dev = lvm::lv_path(self.vg(), &snap_lv);
            fsutil::try_mount(&dev, &mount_dir, fs, flags, &data)?;
        }

        rev.success();

        Ok(true)
    }

    /// Unmount a snapshot. Whether or not the mount went through a
    /// transient snapshot, probe for one by name and remove it; the
    /// reserved-suffix rule guarantees only driver-created LVs match.
    /// An unmount has happened by the time tmp removal can fail, so
    /// that failure is surfaced after the fact.
    pub fn unmount_volume_snapshot(
        &self,
        snap_vol: &Volume,
        op: Option<&Operation>,
    ) -> Result<bool> {
        self.snapshot_parts(snap_vol)?;

        if snap_vol.is_vm_block() {
            let fs_snap = snap_vol.new_vm_block_filesystem_volume();
            let our_unmount = self.unmount_volume_snapshot(&fs_snap, op)?;
            if let Err(err) = lvm::deactivate_lv(self.vg(), &paths::lv_name(snap_vol), op) {
                warn!("Failed to deactivate {}: {:#}", paths::lv_name(snap_vol), err);
            }
            return Ok(our_unmount);
        }

        let mount_dir = self.mount_path(snap_vol);
        if !fsutil::is_mount_point(&mount_dir) {
            return Ok(false);
        }

        fsutil::try_unmount(&mount_dir, MntFlags::empty())?;

        let tmp_lv = self.tmp_lv_name(snap_vol);
        if lvm::lv_exists(self.vg(), &tmp_lv, op)? {
            lvm::remove_lv(self.vg(), &tmp_lv, op)
                .context("Failed to remove temporary snapshot volume after unmount")?;
        }

        let snap_lv = paths::lv_name(snap_vol);
        if let Err(err) = lvm::deactivate_lv(self.vg(), &snap_lv, op) {
            warn!("Failed to deactivate {}: {:#}", snap_lv, err);
        }

        Ok(true)
    }

    /// Roll a volume back to one of its snapshots.
    ///
    /// On a thinpool this is a transactional rename-swap: the current
    /// head is renamed aside, a writable snapshot of the chosen
    /// snapshot takes its name, and only once nothing can fail anymore
    /// is the old head removed. Classic pools fall back to a file-level
    /// rsync from the mounted snapshot.
    pub fn restore_volume(
        &self,
        vol: &Volume,
        snapshot: &str,
        op: Option<&Operation>,
    ) -> Result<()> {
        if vol.is_snapshot() {
            return Err(DriverError::InvalidVolumeName(
                vol.name().to_string(),
                "cannot restore a snapshot".to_string(),
            )
            .into());
        }
        if !self.volume_snapshots(vol)?.iter().any(|s| s == snapshot) {
            return Err(DriverError::VolumeNotFound(
                crate::volume::snapshot_volume_name(vol.name(), snapshot),
            )
            .into());
        }

        let snap_vol = vol.snapshot_volume(snapshot);

        if self.use_thinpool() {
            self.thin_restore_volume(vol, &snap_vol, op)?;
        } else {
            if vol.content_type() != ContentType::Filesystem {
                return Err(DriverError::NotSupported(
                    "block volumes require a thinpool to be restored".to_string(),
                )
                .into());
            }

            self.with_snapshot_mounted(&snap_vol, op, |snap_path| {
                self.with_volume_mounted(vol, op, |vol_path| {
                    transfer::rsync_tree(snap_path, vol_path, self.bwlimit(), op)?;
                    util::set_mount_dir_mode(vol_path)
                })
            })?;
        }

        info!(
            "Restored volume \"{}\" from snapshot \"{}\"",
            vol.name(),
            snapshot
        );

        Ok(())
    }

    /// The thinpool rename-swap. Everything up to the final removal of
    /// the renamed-aside head is undoable.
    fn thin_restore_volume(
        &self,
        vol: &Volume,
        snap_vol: &Volume,
        op: Option<&Operation>,
    ) -> Result<()> {
        self.unmount_volume(vol, op)?;

        let lv = paths::lv_name(vol);
        let tmp_lv = format!("{}{}", lv, TMP_VOL_SUFFIX);

        // A leftover from an interrupted restore would block the
        // rename; it holds no data the current head does not.
        if lvm::lv_exists(self.vg(), &tmp_lv, op)? {
            lvm::remove_lv(self.vg(), &tmp_lv, op)?;
        }

        let mut rev = Reverter::new();

        lvm::rename_lv(self.vg(), &lv, &tmp_lv, op)?;
        {
            let (undo_vg, undo_old, undo_new) =
                (self.vg().to_string(), lv.clone(), tmp_lv.clone());
            rev.add("rename of original volume", move || {
                lvm::rename_lv(&undo_vg, &undo_new, &undo_old, None)
            });
        }

        lvm::create_lv_snapshot(
            self.vg(),
            self.thinpool(),
            &paths::lv_name(snap_vol),
            &lv,
            false,
            0,
            op,
        )?;
        {
            let (undo_vg, undo_lv) = (self.vg().to_string(), lv.clone());
            rev.add("creation of restored volume", move || {
                lvm::remove_lv(&undo_vg, &undo_lv, None)
            });
        }

        if vol.content_type() == ContentType::Filesystem {
            let fs = Filesystem::parse(vol.filesystem())?;
            if fsutil::needs_uuid_regen(fs) {
                lvm::activate_lv(self.vg(), &lv, op)?;
                fsutil::regenerate_uuid(fs, &lvm::lv_path(self.vg(), &lv), op)?;
            }
        }

        if vol.is_vm_block() {
            let fs_vol = vol.new_vm_block_filesystem_volume();
            let fs_snap = snap_vol.new_vm_block_filesystem_volume();
            self.thin_restore_volume(&fs_vol, &fs_snap, op)?;
        }

        rev.success();

        // Point of no return; until here every step was reverted on
        // failure.
        lvm::remove_lv(self.vg(), &tmp_lv, op)
            .context("Failed to remove original volume after restore")?;

        Ok(())
    }

    /// Rename a snapshot: the LV and its mount directory move in
    /// lockstep. VM block siblings are not recursed on; callers rename
    /// the pair with two calls.
    pub fn rename_volume_snapshot(
        &self,
        snap_vol: &Volume,
        new_snapshot: &str,
        op: Option<&Operation>,
    ) -> Result<()> {
        let (parent, _) = self.snapshot_parts(snap_vol)?;
        let new_snap_vol =
            snap_vol.with_name(&crate::volume::snapshot_volume_name(parent, new_snapshot));
        new_snap_vol.validate_name()?;

        let mut rev = Reverter::new();

        let old_lv = paths::lv_name(snap_vol);
        let new_lv = paths::lv_name(&new_snap_vol);
        lvm::rename_lv(self.vg(), &old_lv, &new_lv, op)?;
        {
            let (undo_vg, undo_old, undo_new) =
                (self.vg().to_string(), old_lv.clone(), new_lv.clone());
            rev.add("rename of snapshot volume", move || {
                lvm::rename_lv(&undo_vg, &undo_new, &undo_old, None)
            });
        }

        let old_mount = self.mount_path(snap_vol);
        if old_mount.is_dir() {
            let new_mount = self.mount_path(&new_snap_vol);
            fs::rename(&old_mount, &new_mount).with_context(|| {
                format!(
                    "Failed to rename {} to {}",
                    old_mount.display(),
                    new_mount.display()
                )
            })?;
        }

        rev.success();
        info!(
            "Renamed snapshot \"{}\" to \"{}\"",
            snap_vol.name(),
            new_snap_vol.name()
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;
    use std::path::Path;

    use tempfile::TempDir;

    use crate::driver::PoolConfig;
    use crate::volume::VolumeType;

    fn driver(root: &Path) -> LvmDriver {
        let mut map = BTreeMap::new();
        map.insert("lvm.vg_name".to_string(), "vg0".to_string());
        map.insert("lvm.thinpool_name".to_string(), "tp".to_string());
        LvmDriver::new("pool0", root, PoolConfig::from_map(&map).unwrap())
    }

    fn vol(name: &str) -> Volume {
        Volume::new(
            VolumeType::Container,
            ContentType::Filesystem,
            name,
            BTreeMap::new(),
        )
    }

    #[test]
    fn test_snapshot_parts() {
        let root = TempDir::new().unwrap();
        let driver = driver(root.path());

        let snap = vol("c1/s0");
        assert_eq!(driver.snapshot_parts(&snap).unwrap(), ("c1", "s0"));

        let head = vol("c1");
        assert!(matches!(
            driver.snapshot_parts(&head),
            Err(DriverError::InvalidVolumeName(_, _))
        ));
    }

    #[test]
    fn test_tmp_lv_name() {
        let root = TempDir::new().unwrap();
        let driver = driver(root.path());

        assert_eq!(driver.tmp_lv_name(&vol("c1/s0")), "container_c1-s0.tmp");
    }

    #[test]
    fn test_snapshot_enumeration_is_directory_based() {
        let root = TempDir::new().unwrap();
        let driver = driver(root.path());
        let head = vol("c1");

        assert!(driver.volume_snapshots(&head).unwrap().is_empty());

        // The directory is the ground truth even with no LVs around.
        fs::create_dir_all(root.path().join("containers-snapshots/c1/s1")).unwrap();
        fs::create_dir_all(root.path().join("containers-snapshots/c1/s0")).unwrap();
        assert_eq!(driver.volume_snapshots(&head).unwrap(), vec!["s0", "s1"]);
    }

    #[test]
    fn test_restore_unknown_snapshot_rejected() {
        let root = TempDir::new().unwrap();
        let driver = driver(root.path());

        let err = driver.restore_volume(&vol("c1"), "nope", None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DriverError>(),
            Some(DriverError::VolumeNotFound(name)) if name == "c1/nope"
        ));
    }

    #[test]
    fn test_restore_of_snapshot_rejected() {
        let root = TempDir::new().unwrap();
        let driver = driver(root.path());

        let err = driver
            .restore_volume(&vol("c1/s0"), "s1", None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DriverError>(),
            Some(DriverError::InvalidVolumeName(_, _))
        ));
    }
}
