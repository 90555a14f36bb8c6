// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The volume data model: types, names, per-volume configuration.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;

use crate::error::DriverError;
use crate::util;

/// Reserved name suffix for transient LVs: the writable secondary
/// snapshots used for read-only mounting on duplicate-UUID filesystems,
/// and the renamed-aside original during a restore. User-supplied names
/// must never collide with it.
pub const TMP_VOL_SUFFIX: &str = ".tmp";

/// Filesystem used when a volume does not configure one.
pub const DEFAULT_FILESYSTEM: &str = "ext4";

/// Volume size used when a volume does not configure one.
pub const DEFAULT_VOLUME_SIZE: &str = "10GiB";

/// Size of the filesystem volume paired with a VM block volume. It only
/// holds VM metadata, not the VM disk.
pub const DEFAULT_VM_FILESYSTEM_SIZE: &str = "100MiB";

/// The kind of workload a volume belongs to; selects the directory
/// layout beneath the pool root.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeType {
    Container,
    VirtualMachine,
    Image,
    Custom,
}

impl VolumeType {
    /// Prefix used when mangling a volume name into an LV name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::VirtualMachine => "virtual-machine",
            Self::Image => "image",
            Self::Custom => "custom",
        }
    }

    /// Directory under the pool root holding this type's mount points.
    pub fn mount_dir(&self) -> &'static str {
        match self {
            Self::Container => "containers",
            Self::VirtualMachine => "virtual-machines",
            Self::Image => "images",
            Self::Custom => "custom",
        }
    }

    pub fn from_lv_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "container" => Some(Self::Container),
            "virtual-machine" => Some(Self::VirtualMachine),
            "image" => Some(Self::Image),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a volume stores: a mountable filesystem or a raw block device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentType {
    Filesystem,
    Block,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Block => "block",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the name of a snapshot volume from its parent and snapshot
/// names.
pub fn snapshot_volume_name(parent: &str, snapshot: &str) -> String {
    format!("{}/{}", parent, snapshot)
}

/// A single volume in the pool. Snapshots are volumes too, named
/// `parent/snap`. The pool identity and pool config live on the driver,
/// not here.
#[derive(Clone, Debug)]
pub struct Volume {
    vol_type: VolumeType,
    content_type: ContentType,
    name: String,
    config: BTreeMap<String, String>,
}

impl Volume {
    pub fn new(
        vol_type: VolumeType,
        content_type: ContentType,
        name: &str,
        config: BTreeMap<String, String>,
    ) -> Self {
        Self {
            vol_type,
            content_type,
            name: name.to_string(),
            config,
        }
    }

    pub fn vol_type(&self) -> VolumeType {
        self.vol_type
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BTreeMap<String, String> {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.config
    }

    /// A snapshot volume is named `parent/snap`.
    pub fn is_snapshot(&self) -> bool {
        self.name.contains('/')
    }

    /// Split a snapshot volume name into (parent, snap).
    pub fn split_snapshot(&self) -> Option<(&str, &str)> {
        self.name.split_once('/')
    }

    /// A block-content volume belonging to a virtual machine implies a
    /// sibling filesystem volume carrying the VM metadata.
    pub fn is_vm_block(&self) -> bool {
        self.vol_type == VolumeType::VirtualMachine && self.content_type == ContentType::Block
    }

    /// Derive the sibling filesystem volume of a VM-block volume: same
    /// name and config, content type switched to filesystem. The block
    /// volume's size does not carry over; the sibling is a small
    /// metadata filesystem sized by its own default.
    pub fn new_vm_block_filesystem_volume(&self) -> Volume {
        let mut config = self.config.clone();
        config.remove("size");
        Volume {
            vol_type: self.vol_type,
            content_type: ContentType::Filesystem,
            name: self.name.clone(),
            config,
        }
    }

    /// For a snapshot volume, the volume it was taken from. The parent's
    /// config is assumed identical; the driver only needs its identity.
    pub fn parent_volume(&self) -> Option<Volume> {
        let (parent, _) = self.split_snapshot()?;
        Some(self.with_name(parent))
    }

    /// The same volume under a different name.
    pub fn with_name(&self, name: &str) -> Volume {
        Volume {
            vol_type: self.vol_type,
            content_type: self.content_type,
            name: name.to_string(),
            config: self.config.clone(),
        }
    }

    /// Derive the volume identity of one of this volume's snapshots.
    pub fn snapshot_volume(&self, snap: &str) -> Volume {
        self.with_name(&snapshot_volume_name(&self.name, snap))
    }

    /// The filesystem this volume is formatted with.
    pub fn filesystem(&self) -> &str {
        match self.config.get("block.filesystem") {
            Some(fs) if !fs.is_empty() => fs,
            _ => DEFAULT_FILESYSTEM,
        }
    }

    /// The configured provisioning size in bytes.
    pub fn size_bytes(&self) -> Result<u64> {
        let size = match self.config.get("size") {
            Some(size) if !size.is_empty() => size.as_str(),
            _ if self.vol_type == VolumeType::VirtualMachine
                && self.content_type == ContentType::Filesystem =>
            {
                DEFAULT_VM_FILESYSTEM_SIZE
            }
            _ => DEFAULT_VOLUME_SIZE,
        };
        util::parse_size(size)
    }

    /// Check the name shape: non-empty components, at most one `/`
    /// (snapshots), and no collision with the reserved tmp suffix.
    pub fn validate_name(&self) -> Result<(), DriverError> {
        let invalid = |reason: &str| {
            Err(DriverError::InvalidVolumeName(
                self.name.clone(),
                reason.to_string(),
            ))
        };

        if self.name.is_empty() {
            return invalid("empty name");
        }

        let components: Vec<&str> = self.name.split('/').collect();
        if components.len() > 2 {
            return invalid("more than one \"/\"");
        }

        for component in components {
            if component.is_empty() {
                return invalid("empty component");
            }
            if component.ends_with(TMP_VOL_SUFFIX) {
                return invalid("reserved suffix");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vol(vol_type: VolumeType, content_type: ContentType, name: &str) -> Volume {
        Volume::new(vol_type, content_type, name, BTreeMap::new())
    }

    #[test]
    fn test_snapshot_names() {
        assert_eq!(snapshot_volume_name("c1", "snap0"), "c1/snap0");

        let snap = vol(VolumeType::Container, ContentType::Filesystem, "c1/snap0");
        assert!(snap.is_snapshot());
        assert_eq!(snap.split_snapshot(), Some(("c1", "snap0")));
        assert_eq!(snap.parent_volume().unwrap().name(), "c1");

        let head = vol(VolumeType::Container, ContentType::Filesystem, "c1");
        assert!(!head.is_snapshot());
        assert!(head.parent_volume().is_none());
    }

    #[test]
    fn test_vm_block_sibling() {
        let block = vol(VolumeType::VirtualMachine, ContentType::Block, "v1");
        assert!(block.is_vm_block());

        let mut block = block;
        block
            .config_mut()
            .insert("size".to_string(), "20GiB".to_string());
        let sibling = block.new_vm_block_filesystem_volume();
        assert_eq!(sibling.content_type(), ContentType::Filesystem);
        assert_eq!(sibling.name(), "v1");
        assert!(!sibling.is_vm_block());

        // The VM disk size stays on the block volume; the sibling is a
        // small metadata filesystem.
        assert!(!sibling.config().contains_key("size"));
        assert_eq!(
            sibling.size_bytes().unwrap(),
            util::parse_size(DEFAULT_VM_FILESYSTEM_SIZE).unwrap()
        );

        // Block volumes of other types have no sibling semantics.
        assert!(!vol(VolumeType::Custom, ContentType::Block, "b1").is_vm_block());
    }

    #[test]
    fn test_validate_name() {
        let ok = |name: &str| {
            vol(VolumeType::Custom, ContentType::Filesystem, name)
                .validate_name()
                .unwrap()
        };
        let bad = |name: &str| {
            vol(VolumeType::Custom, ContentType::Filesystem, name)
                .validate_name()
                .unwrap_err()
        };

        ok("c1");
        ok("c1/snap0");
        ok("with-dashes");

        bad("");
        bad("/leading");
        bad("trailing/");
        bad("a/b/c");
        bad("name.tmp");
        bad("c1/snap0.tmp");
    }

    #[test]
    fn test_config_accessors() {
        let mut config = BTreeMap::new();
        config.insert("block.filesystem".to_string(), "xfs".to_string());
        config.insert("size".to_string(), "16MiB".to_string());
        let vol = Volume::new(VolumeType::Custom, ContentType::Filesystem, "c1", config);

        assert_eq!(vol.filesystem(), "xfs");
        assert_eq!(vol.size_bytes().unwrap(), 16 << 20);

        let defaulted = Volume::new(
            VolumeType::Custom,
            ContentType::Filesystem,
            "c2",
            BTreeMap::new(),
        );
        assert_eq!(defaulted.filesystem(), DEFAULT_FILESYSTEM);
        assert_eq!(
            defaulted.size_bytes().unwrap(),
            util::parse_size(DEFAULT_VOLUME_SIZE).unwrap()
        );
    }
}
