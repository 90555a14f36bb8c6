// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The LVM storage pool driver: maps volume lifecycle operations onto
//! LVM primitives and filesystem tooling, with transactional rollback.
//!
//! Every public operation either completes fully or, on any error,
//! fires its reverter so the pool is observably back in the pre-call
//! state. VM block volumes are composite: a raw block LV plus a sibling
//! filesystem LV with the same name, kept lifecycle-atomic by recursing
//! onto the sibling with the reverter already armed.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::mount::MntFlags;

use crate::error::DriverError;
use crate::fsutil::{self, Filesystem};
use crate::lvm;
use crate::paths;
use crate::process::Operation;
use crate::revert::Reverter;
use crate::transfer;
use crate::util;
use crate::volume::{ContentType, Volume};

/// Callback that populates a fresh volume's contents. Runs with the
/// volume mounted; receives the mount path and, for block volumes, the
/// device path (empty for filesystem volumes).
pub type Filler<'a> = &'a mut dyn FnMut(&Path, &Path) -> Result<()>;

/// How a migration stream moves volume data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationType {
    Rsync,
    Block,
}

/// Hooks returned from a backup unpack: `post` runs after the caller
/// has recorded the volume, `revert` undoes the unpack if the caller
/// fails before that.
pub struct BackupHooks<'d> {
    pub post: Box<dyn FnOnce() -> Result<()> + 'd>,
    pub revert: Box<dyn FnOnce() + 'd>,
}

/// Pool-level configuration consumed by the driver.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    vg_name: String,
    thinpool_name: Option<String>,
    rsync_bwlimit: Option<String>,
}

impl PoolConfig {
    pub fn from_map(config: &BTreeMap<String, String>) -> Result<Self, DriverError> {
        let vg_name = match config.get("lvm.vg_name") {
            Some(vg) if !vg.is_empty() => vg.clone(),
            _ => {
                return Err(DriverError::InvalidPoolConfig(
                    "lvm.vg_name is required".to_string(),
                ));
            }
        };

        Ok(Self {
            vg_name,
            thinpool_name: config
                .get("lvm.thinpool_name")
                .filter(|name| !name.is_empty())
                .cloned(),
            rsync_bwlimit: config
                .get("rsync.bwlimit")
                .filter(|limit| !limit.is_empty())
                .cloned(),
        })
    }
}

/// The LVM-backed storage pool driver. Operations on a single volume
/// are serialized by the caller; LVM's own VG locking covers the rest.
pub struct LvmDriver {
    pool_name: String,
    pool_root: PathBuf,
    config: PoolConfig,
}

impl LvmDriver {
    pub fn new(pool_name: &str, pool_root: &Path, config: PoolConfig) -> Self {
        Self {
            pool_name: pool_name.to_string(),
            pool_root: pool_root.to_path_buf(),
            config,
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    pub(crate) fn pool_root(&self) -> &Path {
        &self.pool_root
    }

    pub(crate) fn vg(&self) -> &str {
        &self.config.vg_name
    }

    pub(crate) fn thinpool(&self) -> Option<&str> {
        self.config.thinpool_name.as_deref()
    }

    /// A configured thinpool switches every branch in the driver from
    /// classic to thin provisioning.
    pub(crate) fn use_thinpool(&self) -> bool {
        self.config.thinpool_name.is_some()
    }

    pub(crate) fn bwlimit(&self) -> Option<&str> {
        self.config.rsync_bwlimit.as_deref()
    }

    /// Device path of a volume's LV.
    pub fn dev_path(&self, vol: &Volume) -> PathBuf {
        paths::volume_dev_path(self.vg(), vol)
    }

    /// Mount path of a volume.
    pub fn mount_path(&self, vol: &Volume) -> PathBuf {
        paths::mount_path(&self.pool_root, vol)
    }

    pub(crate) fn snapshots_dir(&self, vol: &Volume) -> PathBuf {
        paths::snapshots_dir(&self.pool_root, vol.vol_type(), vol.name())
    }

    /// Whether the volume's LV exists.
    pub fn has_volume(&self, vol: &Volume, op: Option<&Operation>) -> Result<bool> {
        lvm::lv_exists(self.vg(), &paths::lv_name(vol), op)
    }

    /// Validate one config key. Returns false for unrecognized keys.
    fn validate_config_key(&self, key: &str, value: &str) -> Result<bool, DriverError> {
        let invalid = |reason: String| DriverError::InvalidOption(key.to_string(), reason);

        match key {
            "size" => {
                if !value.is_empty() {
                    util::parse_size(value).map_err(|err| invalid(format!("{:#}", err)))?;
                }
                Ok(true)
            }
            "block.filesystem" => {
                if !value.is_empty() && !fsutil::ALLOWED_FILESYSTEMS.contains(&value) {
                    return Err(invalid(format!("unsupported filesystem \"{}\"", value)));
                }
                Ok(true)
            }
            "lvm.stripes" => {
                if self.use_thinpool() {
                    return Err(invalid("striping is incompatible with thinpools".to_string()));
                }
                value
                    .parse::<u32>()
                    .map_err(|err| invalid(err.to_string()))?;
                Ok(true)
            }
            "lvm.stripes.size" => {
                if self.use_thinpool() {
                    return Err(invalid("striping is incompatible with thinpools".to_string()));
                }
                util::parse_size(value).map_err(|err| invalid(format!("{:#}", err)))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Validate a volume's name and config. Unrecognized keys are
    /// removed when `remove_unknown_keys` is set and rejected otherwise.
    pub fn validate_volume(&self, vol: &mut Volume, remove_unknown_keys: bool) -> Result<()> {
        vol.validate_name()?;

        let mut unknown = Vec::new();
        for (key, value) in vol.config() {
            if !self.validate_config_key(key, value)? {
                if !remove_unknown_keys {
                    return Err(DriverError::InvalidOption(
                        key.clone(),
                        "unrecognized option".to_string(),
                    )
                    .into());
                }
                unknown.push(key.clone());
            }
        }

        for key in unknown {
            vol.config_mut().remove(&key);
        }

        Ok(())
    }

    /// Internal strict variant for volumes about to be acted on.
    pub(crate) fn check_volume(&self, vol: &Volume) -> Result<()> {
        vol.validate_name()?;
        for (key, value) in vol.config() {
            if !self.validate_config_key(key, value)? {
                return Err(DriverError::InvalidOption(
                    key.clone(),
                    "unrecognized option".to_string(),
                )
                .into());
            }
        }

        Ok(())
    }

    /// Apply volume config changes. Size changes route to the quota
    /// path; everything shape-altering is rejected on a live volume.
    pub fn update_volume(
        &self,
        vol: &Volume,
        changed: &BTreeMap<String, String>,
        op: Option<&Operation>,
    ) -> Result<()> {
        for (key, value) in changed {
            match key.as_str() {
                "size" => self.set_volume_quota(vol, value, op)?,
                "lvm.stripes" | "lvm.stripes.size" | "block.filesystem" => {
                    return Err(DriverError::NotSupported(format!(
                        "\"{}\" cannot be changed on an existing volume",
                        key
                    ))
                    .into());
                }
                _ => {
                    if !self.validate_config_key(key, value)? {
                        return Err(DriverError::InvalidOption(
                            key.clone(),
                            "unrecognized option".to_string(),
                        )
                        .into());
                    }
                }
            }
        }

        Ok(())
    }

    /// Stripe settings for classic LVs. Thin volumes ignore striping.
    fn volume_stripes(&self, vol: &Volume) -> Result<(Option<u32>, Option<u64>)> {
        if self.use_thinpool() {
            return Ok((None, None));
        }

        let stripes = match vol.config().get("lvm.stripes") {
            Some(value) if !value.is_empty() => Some(
                value
                    .parse::<u32>()
                    .context("Invalid lvm.stripes value")?,
            ),
            _ => None,
        };
        let stripe_size = match vol.config().get("lvm.stripes.size") {
            Some(value) if !value.is_empty() => Some(util::parse_size(value)?),
            _ => None,
        };

        Ok((stripes, stripe_size))
    }

    /// The volume's configured size rounded up to the VG extent size,
    /// which is what LVM will actually allocate.
    fn rounded_size_bytes(&self, vol: &Volume, op: Option<&Operation>) -> Result<u64> {
        let extent = lvm::vg_extent_size(self.vg(), op)?;
        Ok(util::round_up(vol.size_bytes()?, extent))
    }

    /// Create a new empty volume.
    ///
    /// Order matters: mount directory, LV, filesystem, sibling, filler.
    /// Each completed step arms an undo, so a failure anywhere leaves
    /// nothing behind.
    pub fn create_volume(
        &self,
        vol: &Volume,
        filler: Option<Filler>,
        op: Option<&Operation>,
    ) -> Result<()> {
        self.check_volume(vol)?;
        if vol.is_snapshot() {
            return Err(DriverError::InvalidVolumeName(
                vol.name().to_string(),
                "snapshots are created via snapshot operations".to_string(),
            )
            .into());
        }
        if self.has_volume(vol, op)? {
            return Err(DriverError::VolumeExists(vol.name().to_string()).into());
        }

        let mut rev = Reverter::new();

        let mount_dir = self.mount_path(vol);
        if util::ensure_dir(&mount_dir)? {
            let undo_dir = mount_dir.clone();
            rev.add("creation of mount directory", move || {
                util::remove_dir_tree(&undo_dir)
            });
        }

        let lv = paths::lv_name(vol);
        let size = self.rounded_size_bytes(vol, op)?;
        let (stripes, stripe_size) = self.volume_stripes(vol)?;
        lvm::create_lv(self.vg(), self.thinpool(), &lv, size, stripes, stripe_size, op)?;
        let (undo_vg, undo_lv) = (self.vg().to_string(), lv.clone());
        rev.add("creation of logical volume", move || {
            lvm::remove_lv(&undo_vg, &undo_lv, None)
        });

        if vol.content_type() == ContentType::Filesystem {
            lvm::activate_lv(self.vg(), &lv, op)?;
            let fs = Filesystem::parse(vol.filesystem())?;
            fsutil::mkfs(fs, &self.dev_path(vol), op)?;
        }

        if vol.is_vm_block() {
            let fs_vol = vol.new_vm_block_filesystem_volume();
            self.create_volume(&fs_vol, None, op)?;
            rev.add("creation of sibling filesystem volume", {
                let this = self;
                let undo_vol = fs_vol.clone();
                move || this.delete_volume(&undo_vol, None)
            });
        }

        if let Some(filler) = filler {
            self.run_filler(vol, filler, op)?;
        }

        rev.success();
        info!("Created volume \"{}\"", vol.name());

        Ok(())
    }

    /// Mount the volume, run the filler, re-assert directory
    /// permissions, unmount.
    fn run_filler(&self, vol: &Volume, filler: Filler, op: Option<&Operation>) -> Result<()> {
        let mount_dir = self.mount_path(vol);
        let device_arg = match vol.content_type() {
            ContentType::Block => self.dev_path(vol),
            ContentType::Filesystem => PathBuf::new(),
        };

        let our_mount = self.mount_volume(vol, op)?;
        let fill_result = filler(&mount_dir, &device_arg)
            .context("Failed to fill volume contents");
        let perms_result = util::set_mount_dir_mode(&mount_dir);

        if our_mount {
            let unmount_result = self.unmount_volume(vol, op);
            if fill_result.is_ok() && perms_result.is_ok() {
                unmount_result?;
            } else if let Err(err) = unmount_result {
                warn!("Failed to unmount volume after filler error: {:#}", err);
            }
        }

        fill_result?;
        perms_result
    }

    /// Create a volume as a copy of another volume in the same pool,
    /// including the requested snapshots.
    pub fn create_volume_from_copy(
        &self,
        vol: &Volume,
        src_vol: &Volume,
        snapshots: &[String],
        op: Option<&Operation>,
    ) -> Result<()> {
        self.check_volume(vol)?;
        if self.use_thinpool() {
            self.thin_copy_volume(vol, src_vol, snapshots, op)
        } else {
            self.generic_copy_volume(vol, src_vol, snapshots, false, op)
        }
    }

    /// Re-sync an existing volume from a source volume, diffing rather
    /// than recreating.
    pub fn refresh_volume(
        &self,
        vol: &Volume,
        src_vol: &Volume,
        snapshots: &[String],
        op: Option<&Operation>,
    ) -> Result<()> {
        if self.use_thinpool() {
            // A thin copy is O(1); replace the volume and its snapshots
            // outright instead of diff-syncing.
            for snap in self.volume_snapshots(vol)? {
                self.delete_volume_snapshot(&vol.snapshot_volume(&snap), op)?;
            }
            self.delete_volume(vol, op)?;
            self.thin_copy_volume(vol, src_vol, snapshots, op)
        } else {
            self.generic_copy_volume(vol, src_vol, snapshots, true, op)
        }
    }

    /// Thinpool copy: LVM snapshots are the copy primitive. Requested
    /// source snapshots are copied first so they chain off the
    /// original, then the head.
    fn thin_copy_volume(
        &self,
        vol: &Volume,
        src_vol: &Volume,
        snapshots: &[String],
        op: Option<&Operation>,
    ) -> Result<()> {
        let mut rev = Reverter::new();

        let mount_dir = self.mount_path(vol);
        if util::ensure_dir(&mount_dir)? {
            let undo_dir = mount_dir.clone();
            rev.add("creation of mount directory", move || {
                util::remove_dir_tree(&undo_dir)
            });
        }

        for snap in snapshots {
            let src_snap = src_vol.snapshot_volume(snap);
            let dst_snap = vol.snapshot_volume(snap);

            let parent_dir = self.snapshots_dir(vol);
            if util::ensure_dir(&parent_dir)? {
                let undo_dir = parent_dir.clone();
                rev.add("creation of snapshot directory", move || {
                    util::remove_dir_if_empty(&undo_dir)
                });
            }
            let snap_dir = self.mount_path(&dst_snap);
            if util::ensure_dir(&snap_dir)? {
                let undo_dir = snap_dir.clone();
                rev.add("creation of snapshot mount directory", move || {
                    util::remove_dir_tree(&undo_dir)
                });
            }

            lvm::create_lv_snapshot(
                self.vg(),
                self.thinpool(),
                &paths::lv_name(&src_snap),
                &paths::lv_name(&dst_snap),
                true,
                0,
                op,
            )?;
            let (undo_vg, undo_lv) = (self.vg().to_string(), paths::lv_name(&dst_snap));
            rev.add("creation of snapshot volume", move || {
                lvm::remove_lv(&undo_vg, &undo_lv, None)
            });
        }

        let lv = paths::lv_name(vol);
        lvm::create_lv_snapshot(
            self.vg(),
            self.thinpool(),
            &paths::lv_name(src_vol),
            &lv,
            false,
            0,
            op,
        )?;
        let (undo_vg, undo_lv) = (self.vg().to_string(), lv.clone());
        rev.add("creation of logical volume", move || {
            lvm::remove_lv(&undo_vg, &undo_lv, None)
        });

        // The copy shares the source's filesystem UUID; regenerate it
        // where the filesystem would otherwise refuse to mount twice.
        if vol.content_type() == ContentType::Filesystem {
            let fs = Filesystem::parse(vol.filesystem())?;
            if fsutil::needs_uuid_regen(fs) {
                lvm::activate_lv(self.vg(), &lv, op)?;
                fsutil::regenerate_uuid(fs, &self.dev_path(vol), op)?;
            }
        }

        if vol.is_vm_block() {
            let fs_vol = vol.new_vm_block_filesystem_volume();
            let src_fs_vol = src_vol.new_vm_block_filesystem_volume();
            self.thin_copy_volume(&fs_vol, &src_fs_vol, snapshots, op)?;
        }

        rev.success();
        info!(
            "Copied volume \"{}\" to \"{}\"",
            src_vol.name(),
            vol.name()
        );

        Ok(())
    }

    /// Classic copy and refresh: file-level rsync between mounted
    /// trees, snapshotting the target as each source snapshot lands.
    fn generic_copy_volume(
        &self,
        vol: &Volume,
        src_vol: &Volume,
        snapshots: &[String],
        refresh: bool,
        op: Option<&Operation>,
    ) -> Result<()> {
        if vol.content_type() != ContentType::Filesystem {
            return Err(DriverError::NotSupported(
                "block volumes require a thinpool to be copied".to_string(),
            )
            .into());
        }

        let mut rev = Reverter::new();

        if !refresh {
            self.create_volume(vol, None, op)?;
            rev.add("creation of volume", {
                let this = self;
                let undo_vol = vol.clone();
                move || this.delete_volume(&undo_vol, None)
            });
        }

        for snap in snapshots {
            let src_snap = src_vol.snapshot_volume(snap);
            self.with_snapshot_mounted(&src_snap, op, |snap_path| {
                self.with_volume_mounted(vol, op, |vol_path| {
                    transfer::rsync_tree(snap_path, vol_path, self.bwlimit(), op)
                })
            })?;

            let dst_snap = vol.snapshot_volume(snap);
            self.create_volume_snapshot(&dst_snap, op)?;
            rev.add("creation of snapshot", {
                let this = self;
                let undo_snap = dst_snap.clone();
                move || this.delete_volume_snapshot(&undo_snap, None)
            });
        }

        self.with_volume_mounted(src_vol, op, |src_path| {
            self.with_volume_mounted(vol, op, |vol_path| {
                transfer::rsync_tree(src_path, vol_path, self.bwlimit(), op)?;
                util::set_mount_dir_mode(vol_path)
            })
        })?;

        rev.success();

        Ok(())
    }

    /// Receive a volume over a migration stream staged at `source`.
    /// Only the plain rsync transport over filesystem volumes is
    /// supported; optimized block transports belong to other drivers.
    pub fn create_volume_from_migration(
        &self,
        vol: &Volume,
        source: &Path,
        migration_type: MigrationType,
        op: Option<&Operation>,
    ) -> Result<()> {
        if vol.content_type() != ContentType::Filesystem || migration_type != MigrationType::Rsync
        {
            return Err(DriverError::NotSupported(
                "only rsync migration of filesystem volumes is supported".to_string(),
            )
            .into());
        }

        let mut rev = Reverter::new();

        self.create_volume(vol, None, op)?;
        rev.add("creation of volume", {
            let this = self;
            let undo_vol = vol.clone();
            move || this.delete_volume(&undo_vol, None)
        });

        self.with_volume_mounted(vol, op, |vol_path| {
            transfer::rsync_tree(source, vol_path, self.bwlimit(), op)?;
            util::set_mount_dir_mode(vol_path)
        })?;

        rev.success();

        Ok(())
    }

    /// Unpack a backup stream into a fresh volume. The returned hooks
    /// let the caller finish (apply quota) or abandon (delete) the
    /// volume after it has recorded it.
    pub fn create_volume_from_backup<'d, R: Read>(
        &'d self,
        vol: &Volume,
        reader: R,
        op: Option<&Operation>,
    ) -> Result<BackupHooks<'d>> {
        let mut rev = Reverter::new();

        self.create_volume(vol, None, op)?;
        rev.add("creation of volume", {
            let this = self;
            let undo_vol = vol.clone();
            move || this.delete_volume(&undo_vol, None)
        });

        self.with_volume_mounted(vol, op, |vol_path| {
            transfer::unpack_tree(reader, vol_path)?;
            util::set_mount_dir_mode(vol_path)
        })?;

        rev.success();

        let post_vol = vol.clone();
        let revert_vol = vol.clone();
        Ok(BackupHooks {
            post: Box::new(move || {
                // Quota was provisioned at default size; converge on the
                // volume's configured size now the data is in place.
                match post_vol.config().get("size") {
                    Some(size) => self.set_volume_quota(&post_vol, size, None),
                    None => Ok(()),
                }
            }),
            revert: Box::new(move || {
                if let Err(err) = self.delete_volume(&revert_vol, None) {
                    warn!(
                        "Failed reverting backup volume \"{}\": {:#}",
                        revert_vol.name(),
                        err
                    );
                }
            }),
        })
    }

    /// Delete a volume, its mount directory, and (for VM block
    /// volumes) the sibling filesystem volume. Refuses while snapshots
    /// remain.
    pub fn delete_volume(&self, vol: &Volume, op: Option<&Operation>) -> Result<()> {
        if vol.is_snapshot() {
            return self.delete_volume_snapshot(vol, op);
        }

        let snapshots = self.volume_snapshots(vol)?;
        if !snapshots.is_empty() {
            return Err(DriverError::VolumeHasSnapshots(vol.name().to_string()).into());
        }

        let lv = paths::lv_name(vol);
        if lvm::lv_exists(self.vg(), &lv, op)? {
            self.unmount_volume(vol, op)?;
            lvm::remove_lv(self.vg(), &lv, op)?;
        }

        util::remove_dir_tree(&self.mount_path(vol))?;
        util::remove_dir_if_empty(&self.snapshots_dir(vol))?;

        if vol.is_vm_block() {
            let fs_vol = vol.new_vm_block_filesystem_volume();
            self.delete_volume(&fs_vol, op)?;
        }

        info!("Deleted volume \"{}\"", vol.name());

        Ok(())
    }

    /// Rename the LVs (snapshots first, then the head) of one member of
    /// a volume family, registering reverse renames.
    fn rename_volume_lvs<'a>(
        &self,
        vol: &Volume,
        new_vol: &Volume,
        snapshots: &[String],
        rev: &mut Reverter<'a>,
        op: Option<&Operation>,
    ) -> Result<()> {
        for snap in snapshots {
            let old_lv = paths::lv_name(&vol.snapshot_volume(snap));
            let new_lv = paths::lv_name(&new_vol.snapshot_volume(snap));
            lvm::rename_lv(self.vg(), &old_lv, &new_lv, op)?;
            let (undo_vg, undo_old, undo_new) =
                (self.vg().to_string(), old_lv.clone(), new_lv.clone());
            rev.add("rename of snapshot volume", move || {
                lvm::rename_lv(&undo_vg, &undo_new, &undo_old, None)
            });
        }

        let old_lv = paths::lv_name(vol);
        let new_lv = paths::lv_name(new_vol);
        lvm::rename_lv(self.vg(), &old_lv, &new_lv, op)?;
        let (undo_vg, undo_old, undo_new) = (self.vg().to_string(), old_lv, new_lv);
        rev.add("rename of logical volume", move || {
            lvm::rename_lv(&undo_vg, &undo_new, &undo_old, None)
        });

        Ok(())
    }

    /// Rename a volume and all of its snapshots. The caller must hold
    /// no open handles; the volume is unmounted for the duration.
    pub fn rename_volume(&self, vol: &Volume, new_name: &str, op: Option<&Operation>) -> Result<()> {
        let new_vol = vol.with_name(new_name);
        new_vol.validate_name()?;
        if new_vol.is_snapshot() {
            return Err(DriverError::InvalidVolumeName(
                new_name.to_string(),
                "snapshots are renamed via snapshot operations".to_string(),
            )
            .into());
        }
        if lvm::lv_exists(self.vg(), &paths::lv_name(&new_vol), op)? {
            return Err(DriverError::VolumeExists(new_name.to_string()).into());
        }

        let was_mounted = self.unmount_volume(vol, op)?;
        let snapshots = self.volume_snapshots(vol)?;

        let mut rev = Reverter::new();

        // Snapshot LVs move before the head so a mid-way failure never
        // leaves a head pointing at differently-named snapshots.
        for snap in &snapshots {
            let old_lv = paths::lv_name(&vol.snapshot_volume(snap));
            let new_lv = paths::lv_name(&new_vol.snapshot_volume(snap));
            lvm::rename_lv(self.vg(), &old_lv, &new_lv, op)?;
            let (undo_vg, undo_old, undo_new) =
                (self.vg().to_string(), old_lv.clone(), new_lv.clone());
            rev.add("rename of snapshot volume", move || {
                lvm::rename_lv(&undo_vg, &undo_new, &undo_old, None)
            });
        }

        let old_snap_dir = self.snapshots_dir(vol);
        if old_snap_dir.is_dir() {
            let new_snap_dir = self.snapshots_dir(&new_vol);
            fs::rename(&old_snap_dir, &new_snap_dir).with_context(|| {
                format!(
                    "Failed to rename {} to {}",
                    old_snap_dir.display(),
                    new_snap_dir.display()
                )
            })?;
            let (undo_old, undo_new) = (old_snap_dir.clone(), new_snap_dir.clone());
            rev.add("rename of snapshot directory", move || {
                fs::rename(&undo_new, &undo_old).map_err(Into::into)
            });
        }

        let old_lv = paths::lv_name(vol);
        let new_lv = paths::lv_name(&new_vol);
        lvm::rename_lv(self.vg(), &old_lv, &new_lv, op)?;
        {
            let (undo_vg, undo_old, undo_new) =
                (self.vg().to_string(), old_lv.clone(), new_lv.clone());
            rev.add("rename of logical volume", move || {
                lvm::rename_lv(&undo_vg, &undo_new, &undo_old, None)
            });
        }

        let old_mount = self.mount_path(vol);
        if old_mount.is_dir() {
            let new_mount = self.mount_path(&new_vol);
            fs::rename(&old_mount, &new_mount).with_context(|| {
                format!(
                    "Failed to rename {} to {}",
                    old_mount.display(),
                    new_mount.display()
                )
            })?;
            let (undo_old, undo_new) = (old_mount.clone(), new_mount.clone());
            rev.add("rename of mount directory", move || {
                fs::rename(&undo_new, &undo_old).map_err(Into::into)
            });
        }

        if vol.is_vm_block() {
            let fs_vol = vol.new_vm_block_filesystem_volume();
            let new_fs_vol = new_vol.new_vm_block_filesystem_volume();
            // Directories are shared with the block volume and already
            // moved; only the sibling's LVs remain.
            self.rename_volume_lvs(&fs_vol, &new_fs_vol, &snapshots, &mut rev, op)?;
        }

        rev.success();

        if was_mounted {
            self.mount_volume(&new_vol, op)?;
        }

        info!("Renamed volume \"{}\" to \"{}\"", vol.name(), new_name);

        Ok(())
    }

    /// Resize a volume to the given size string. Growth resizes the LV
    /// then the filesystem; shrinking goes the other way. Raw block
    /// volumes only grow.
    pub fn set_volume_quota(
        &self,
        vol: &Volume,
        size: &str,
        op: Option<&Operation>,
    ) -> Result<()> {
        if size.is_empty() || size == "0" {
            return Ok(());
        }

        let extent = lvm::vg_extent_size(self.vg(), op)?;
        let new_bytes = util::round_up(util::parse_size(size)?, extent);

        let lv = paths::lv_name(vol);
        let current_bytes = lvm::lv_size_bytes(self.vg(), &lv, op)?;

        // LVM refuses a resize that lands on the current extent count.
        if new_bytes == util::round_up(current_bytes, extent) {
            debug!(
                "Volume \"{}\" already sized to {} bytes",
                vol.name(),
                new_bytes
            );
            return Ok(());
        }

        match vol.content_type() {
            ContentType::Filesystem => {
                let fs = Filesystem::parse(vol.filesystem())?;
                let dev = self.dev_path(vol);
                if new_bytes < current_bytes {
                    // Filesystem first: the LV must never be smaller
                    // than the filesystem it carries.
                    let was_mounted = self.unmount_volume(vol, op)?;
                    lvm::activate_lv(self.vg(), &lv, op)?;
                    fsutil::shrink(fs, &dev, new_bytes, op)?;
                    lvm::resize_lv(self.vg(), &lv, new_bytes, op)?;
                    if was_mounted {
                        self.mount_volume(vol, op)?;
                    }
                } else {
                    lvm::resize_lv(self.vg(), &lv, new_bytes, op)?;
                    lvm::activate_lv(self.vg(), &lv, op)?;
                    let mount_dir = self.mount_path(vol);
                    let mounted_at = fsutil::is_mount_point(&mount_dir)
                        .then_some(mount_dir.as_path());
                    fsutil::grow(fs, &dev, mounted_at, op)?;
                }
            }
            ContentType::Block => {
                if new_bytes < current_bytes {
                    return Err(DriverError::NotSupported(
                        "block volumes cannot be shrunk".to_string(),
                    )
                    .into());
                }
                lvm::resize_lv(self.vg(), &lv, new_bytes, op)?;
            }
        }

        info!("Resized volume \"{}\" to {} bytes", vol.name(), new_bytes);

        Ok(())
    }

    /// Mount a volume. Returns whether this call did the mounting, so
    /// the caller pairs an unmount only with work actually done. For VM
    /// block volumes the raw LV is activated and the sibling mounted.
    pub fn mount_volume(&self, vol: &Volume, op: Option<&Operation>) -> Result<bool> {
        let lv = paths::lv_name(vol);

        if vol.is_vm_block() {
            lvm::activate_lv(self.vg(), &lv, op)?;
            let fs_vol = vol.new_vm_block_filesystem_volume();
            return self.mount_volume(&fs_vol, op);
        }

        match vol.content_type() {
            ContentType::Block => {
                lvm::activate_lv(self.vg(), &lv, op)?;
                Ok(false)
            }
            ContentType::Filesystem => {
                let mount_dir = self.mount_path(vol);
                if fsutil::is_mount_point(&mount_dir) {
                    return Ok(false);
                }

                util::ensure_dir(&mount_dir)?;
                lvm::activate_lv(self.vg(), &lv, op)?;
                let fs = Filesystem::parse(vol.filesystem())?;
                let (flags, data) = fsutil::mount_options(vol);
                fsutil::try_mount(&self.dev_path(vol), &mount_dir, fs, flags, &data)?;

                Ok(true)
            }
        }
    }

    /// Unmount a volume. Symmetric with `mount_volume`: returns whether
    /// an unmount actually happened. Deactivation failures after a
    /// successful unmount are logged, not surfaced.
    pub fn unmount_volume(&self, vol: &Volume, op: Option<&Operation>) -> Result<bool> {
        let lv = paths::lv_name(vol);

        if vol.is_vm_block() {
            let fs_vol = vol.new_vm_block_filesystem_volume();
            let our_unmount = self.unmount_volume(&fs_vol, op)?;
            if let Err(err) = lvm::deactivate_lv(self.vg(), &lv, op) {
                warn!("Failed to deactivate {}: {:#}", lv, err);
            }
            return Ok(our_unmount);
        }

        match vol.content_type() {
            ContentType::Block => {
                if let Err(err) = lvm::deactivate_lv(self.vg(), &lv, op) {
                    warn!("Failed to deactivate {}: {:#}", lv, err);
                }
                Ok(false)
            }
            ContentType::Filesystem => {
                let mount_dir = self.mount_path(vol);
                if !fsutil::is_mount_point(&mount_dir) {
                    return Ok(false);
                }

                fsutil::try_unmount(&mount_dir, MntFlags::empty())?;
                if let Err(err) = lvm::deactivate_lv(self.vg(), &lv, op) {
                    warn!("Failed to deactivate {}: {:#}", lv, err);
                }

                Ok(true)
            }
        }
    }

    /// Mount a volume around a closure, unmounting afterwards if the
    /// mount was ours.
    pub(crate) fn with_volume_mounted<T>(
        &self,
        vol: &Volume,
        op: Option<&Operation>,
        f: impl FnOnce(&Path) -> Result<T>,
    ) -> Result<T> {
        let our_mount = self.mount_volume(vol, op)?;
        let result = f(&self.mount_path(vol));

        if our_mount {
            match self.unmount_volume(vol, op) {
                Ok(_) => {}
                Err(err) => {
                    if result.is_ok() {
                        return Err(err);
                    }
                    warn!("Failed to unmount \"{}\" after error: {:#}", vol.name(), err);
                }
            }
        }

        result
    }

    /// Snapshot-mounting analogue of `with_volume_mounted`.
    pub(crate) fn with_snapshot_mounted<T>(
        &self,
        snap_vol: &Volume,
        op: Option<&Operation>,
        f: impl FnOnce(&Path) -> Result<T>,
    ) -> Result<T> {
        let our_mount = self.mount_volume_snapshot(snap_vol, op)?;
        let result = f(&self.mount_path(snap_vol));

        if our_mount {
            match self.unmount_volume_snapshot(snap_vol, op) {
                Ok(_) => {}
                Err(err) => {
                    if result.is_ok() {
                        return Err(err);
                    }
                    warn!(
                        "Failed to unmount snapshot \"{}\" after error: {:#}",
                        snap_vol.name(),
                        err
                    );
                }
            }
        }

        result
    }

    /// Bytes in use by a volume. Only meaningful for mounted
    /// filesystems and thin block volumes.
    pub fn get_volume_usage(&self, vol: &Volume, op: Option<&Operation>) -> Result<u64> {
        match vol.content_type() {
            ContentType::Filesystem => {
                let mount_dir = self.mount_path(vol);
                if !fsutil::is_mount_point(&mount_dir) {
                    return Err(DriverError::NotSupported(
                        "usage is only tracked for mounted volumes".to_string(),
                    )
                    .into());
                }

                let stat = nix::sys::statfs::statfs(&mount_dir)
                    .with_context(|| format!("Failed to statfs {}", mount_dir.display()))?;
                let used = stat.blocks().saturating_sub(stat.blocks_free());
                Ok(used.saturating_mul(stat.block_size() as u64))
            }
            ContentType::Block if self.use_thinpool() => {
                lvm::thin_volume_usage(self.vg(), &paths::lv_name(vol), op)
            }
            ContentType::Block => Err(DriverError::NotSupported(
                "usage of classic block volumes is not tracked".to_string(),
            )
            .into()),
        }
    }

    /// Device path handed to the hypervisor. Only VM block volumes have
    /// one.
    pub fn get_volume_disk_path(&self, vol: &Volume) -> Result<PathBuf> {
        if !vol.is_vm_block() {
            return Err(DriverError::NotImplemented.into());
        }

        Ok(self.dev_path(vol))
    }

    /// Enumerate the pool's volumes from the VG. Snapshot LVs and
    /// foreign LVs are skipped; a VM block pair surfaces once, as the
    /// block volume.
    pub fn list_volumes(&self, op: Option<&Operation>) -> Result<Vec<Volume>> {
        let lv_names = lvm::list_lvs(self.vg(), op)?;
        let name_set: BTreeSet<&str> = lv_names.iter().map(String::as_str).collect();

        let mut volumes = Vec::new();
        for lv in &lv_names {
            if Some(lv.as_str()) == self.thinpool() {
                continue;
            }
            let Some((vol_type, content_type, name)) = paths::parse_lv_name(lv) else {
                continue;
            };
            if name.contains('/') {
                continue;
            }
            // The filesystem half of a VM block pair is implied by the
            // block half.
            if content_type == ContentType::Filesystem
                && name_set.contains(format!("{}{}", lv, paths::BLOCK_VOL_SUFFIX).as_str())
            {
                continue;
            }

            volumes.push(Volume::new(vol_type, content_type, &name, BTreeMap::new()));
        }

        Ok(volumes)
    }

    /// Send a volume's data to a migration staging path. Same transport
    /// restrictions as receiving.
    pub fn migrate_volume(
        &self,
        vol: &Volume,
        target: &Path,
        migration_type: MigrationType,
        op: Option<&Operation>,
    ) -> Result<()> {
        if vol.content_type() != ContentType::Filesystem || migration_type != MigrationType::Rsync
        {
            return Err(DriverError::NotSupported(
                "only rsync migration of filesystem volumes is supported".to_string(),
            )
            .into());
        }

        self.with_volume_mounted(vol, op, |vol_path| {
            transfer::rsync_tree(vol_path, target, self.bwlimit(), op)
        })
    }

    /// Export a volume's tree as a backup stream. No optimized backup
    /// support: this is always the file-level path.
    pub fn backup_volume<W: Write>(
        &self,
        vol: &Volume,
        writer: W,
        op: Option<&Operation>,
    ) -> Result<()> {
        if vol.content_type() != ContentType::Filesystem {
            return Err(DriverError::NotSupported(
                "only filesystem volumes can be backed up file-level".to_string(),
            )
            .into());
        }

        self.with_volume_mounted(vol, op, |vol_path| transfer::pack_tree(vol_path, writer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::volume::{VolumeType, TMP_VOL_SUFFIX};

    use tempfile::TempDir;

    fn pool_config(thinpool: bool) -> PoolConfig {
        let mut map = BTreeMap::new();
        map.insert("lvm.vg_name".to_string(), "vg0".to_string());
        if thinpool {
            map.insert("lvm.thinpool_name".to_string(), "tp".to_string());
        }
        PoolConfig::from_map(&map).unwrap()
    }

    fn driver(root: &Path, thinpool: bool) -> LvmDriver {
        LvmDriver::new("pool0", root, pool_config(thinpool))
    }

    fn vol(vol_type: VolumeType, content_type: ContentType, name: &str) -> Volume {
        Volume::new(vol_type, content_type, name, BTreeMap::new())
    }

    #[test]
    fn test_pool_config() {
        assert!(matches!(
            PoolConfig::from_map(&BTreeMap::new()),
            Err(DriverError::InvalidPoolConfig(_))
        ));

        let mut map = BTreeMap::new();
        map.insert("lvm.vg_name".to_string(), "vg0".to_string());
        map.insert("rsync.bwlimit".to_string(), "1m".to_string());
        let config = PoolConfig::from_map(&map).unwrap();
        assert_eq!(config.vg_name, "vg0");
        assert!(config.thinpool_name.is_none());
        assert_eq!(config.rsync_bwlimit.as_deref(), Some("1m"));
    }

    #[test]
    fn test_paths() {
        let root = TempDir::new().unwrap();
        let driver = driver(root.path(), false);

        let v = vol(VolumeType::Custom, ContentType::Filesystem, "c1");
        assert_eq!(driver.dev_path(&v), Path::new("/dev/vg0/custom_c1"));
        assert_eq!(
            driver.mount_path(&v),
            root.path().join("custom").join("c1")
        );
    }

    #[test]
    fn test_validate_volume_config() {
        let root = TempDir::new().unwrap();
        let thin = driver(root.path(), true);
        let classic = driver(root.path(), false);

        let mut v = vol(VolumeType::Custom, ContentType::Filesystem, "c1");
        v.config_mut()
            .insert("size".to_string(), "16MiB".to_string());
        v.config_mut()
            .insert("block.filesystem".to_string(), "xfs".to_string());
        classic.validate_volume(&mut v, false).unwrap();
        thin.validate_volume(&mut v, false).unwrap();

        // Striping is a classic-only option.
        v.config_mut()
            .insert("lvm.stripes".to_string(), "2".to_string());
        classic.validate_volume(&mut v, false).unwrap();
        let err = thin.validate_volume(&mut v, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DriverError>(),
            Some(DriverError::InvalidOption(key, _)) if key == "lvm.stripes"
        ));
        v.config_mut().remove("lvm.stripes");

        // Unknown keys are rejected, or removed on request.
        v.config_mut()
            .insert("zfs.blocksize".to_string(), "8KiB".to_string());
        assert!(classic.validate_volume(&mut v, false).is_err());
        classic.validate_volume(&mut v, true).unwrap();
        assert!(!v.config().contains_key("zfs.blocksize"));

        // Bad values are rejected regardless.
        v.config_mut()
            .insert("block.filesystem".to_string(), "vfat".to_string());
        assert!(classic.validate_volume(&mut v, false).is_err());
    }

    #[test]
    fn test_reserved_suffix_rejected() {
        let root = TempDir::new().unwrap();
        let driver = driver(root.path(), true);

        let name = format!("c1{}", TMP_VOL_SUFFIX);
        let mut v = vol(VolumeType::Custom, ContentType::Filesystem, &name);
        let err = driver.validate_volume(&mut v, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DriverError>(),
            Some(DriverError::InvalidVolumeName(_, _))
        ));
    }

    #[test]
    fn test_update_volume_rejects_shape_changes() {
        let root = TempDir::new().unwrap();
        let driver = driver(root.path(), false);
        let v = vol(VolumeType::Custom, ContentType::Filesystem, "c1");

        let mut changed = BTreeMap::new();
        changed.insert("lvm.stripes".to_string(), "3".to_string());
        let err = driver.update_volume(&v, &changed, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DriverError>(),
            Some(DriverError::NotSupported(_))
        ));

        // An empty size change is a no-op rather than an error.
        let mut changed = BTreeMap::new();
        changed.insert("size".to_string(), String::new());
        driver.update_volume(&v, &changed, None).unwrap();
    }

    #[test]
    fn test_quota_empty_size_is_noop() {
        let root = TempDir::new().unwrap();
        let driver = driver(root.path(), false);
        let v = vol(VolumeType::Custom, ContentType::Filesystem, "c1");

        // No LVM tooling exists in the test environment; these return
        // before reaching it.
        driver.set_volume_quota(&v, "", None).unwrap();
        driver.set_volume_quota(&v, "0", None).unwrap();
    }

    #[test]
    fn test_migration_type_gate() {
        let root = TempDir::new().unwrap();
        let driver = driver(root.path(), false);

        let block = vol(VolumeType::VirtualMachine, ContentType::Block, "v1");
        let err = driver
            .create_volume_from_migration(&block, Path::new("/nonexistent"), MigrationType::Rsync, None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DriverError>(),
            Some(DriverError::NotSupported(_))
        ));

        let fs = vol(VolumeType::Custom, ContentType::Filesystem, "c1");
        let err = driver
            .migrate_volume(&fs, Path::new("/nonexistent"), MigrationType::Block, None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DriverError>(),
            Some(DriverError::NotSupported(_))
        ));
    }

    #[test]
    fn test_disk_path_vm_block_only() {
        let root = TempDir::new().unwrap();
        let driver = driver(root.path(), false);

        let block = vol(VolumeType::VirtualMachine, ContentType::Block, "v1");
        assert_eq!(
            driver.get_volume_disk_path(&block).unwrap(),
            Path::new("/dev/vg0/virtual-machine_v1.block")
        );

        let fs = vol(VolumeType::Container, ContentType::Filesystem, "c1");
        let err = driver.get_volume_disk_path(&fs).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DriverError>(),
            Some(DriverError::NotImplemented)
        ));
    }

    #[test]
    fn test_delete_with_snapshots_refused() {
        let root = TempDir::new().unwrap();
        let driver = driver(root.path(), false);
        let v = vol(VolumeType::Container, ContentType::Filesystem, "c1");

        // Snapshot presence is judged from the directory layout, so a
        // populated snapshot directory is enough to trip the check.
        let snap_dir = driver.snapshots_dir(&v).join("s0");
        std::fs::create_dir_all(&snap_dir).unwrap();

        let err = driver.delete_volume(&v, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DriverError>(),
            Some(DriverError::VolumeHasSnapshots(name)) if name == "c1"
        ));
        assert!(snap_dir.exists());
    }

    #[test]
    fn test_backup_content_type_gate() {
        let root = TempDir::new().unwrap();
        let driver = driver(root.path(), false);

        let block = vol(VolumeType::Custom, ContentType::Block, "b1");
        let mut sink = Vec::new();
        let err = driver.backup_volume(&block, &mut sink, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DriverError>(),
            Some(DriverError::NotSupported(_))
        ));
    }
}
