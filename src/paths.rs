// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pure mapping from volume identities to LV names, device paths and
//! mount paths. Everything here must be deterministic; the rest of the
//! driver treats these strings as ground truth.

use std::path::{Path, PathBuf};

use crate::volume::{ContentType, Volume, VolumeType};

/// Suffix appended to the LV name of block-content volumes, so a block
/// volume and its sibling filesystem volume can share a name.
pub const BLOCK_VOL_SUFFIX: &str = ".block";

/// Escape a volume name for use in an LV name: literal hyphens are
/// doubled, then the snapshot separator `/` becomes a single hyphen.
/// The mapping is reversible because an odd hyphen can only be a
/// separator.
pub fn escape_name(name: &str) -> String {
    name.replace('-', "--").replace('/', "-")
}

/// Invert `escape_name`.
pub fn unescape_name(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '-' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'-') {
            chars.next();
            out.push('-');
        } else {
            out.push('/');
        }
    }

    out
}

/// The LV name for a volume: type prefix, escaped name, and the block
/// suffix for block content.
pub fn lv_name(vol: &Volume) -> String {
    let suffix = match vol.content_type() {
        ContentType::Block => BLOCK_VOL_SUFFIX,
        ContentType::Filesystem => "",
    };

    format!("{}_{}{}", vol.vol_type(), escape_name(vol.name()), suffix)
}

/// Parse an LV name back into a volume identity. Returns None for LVs
/// the driver does not own (thinpools, foreign LVs).
pub fn parse_lv_name(lv: &str) -> Option<(VolumeType, ContentType, String)> {
    let (prefix, rest) = lv.split_once('_')?;
    let vol_type = VolumeType::from_lv_prefix(prefix)?;

    let (rest, content_type) = match rest.strip_suffix(BLOCK_VOL_SUFFIX) {
        Some(stripped) => (stripped, ContentType::Block),
        None => (rest, ContentType::Filesystem),
    };
    if rest.is_empty() {
        return None;
    }

    Some((vol_type, content_type, unescape_name(rest)))
}

/// Path to the device node of a named LV.
pub fn lv_path(volume_group: &str, lv: &str) -> PathBuf {
    PathBuf::from(format!("/dev/{}/{}", volume_group, lv))
}

/// Path to the device node of a volume's LV.
pub fn volume_dev_path(volume_group: &str, vol: &Volume) -> PathBuf {
    lv_path(volume_group, &lv_name(vol))
}

/// Directory holding the mount points of a parent volume's snapshots.
pub fn snapshots_dir(pool_root: &Path, vol_type: VolumeType, parent: &str) -> PathBuf {
    pool_root
        .join(format!("{}-snapshots", vol_type.mount_dir()))
        .join(parent)
}

/// Mount path of a volume. Snapshots mount under their parent's
/// snapshot directory; everything else under the per-type directory.
pub fn mount_path(pool_root: &Path, vol: &Volume) -> PathBuf {
    match vol.split_snapshot() {
        Some((parent, snap)) => snapshots_dir(pool_root, vol.vol_type(), parent).join(snap),
        None => pool_root.join(vol.vol_type().mount_dir()).join(vol.name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    fn vol(vol_type: VolumeType, content_type: ContentType, name: &str) -> Volume {
        Volume::new(vol_type, content_type, name, BTreeMap::new())
    }

    #[test]
    fn test_escape_round_trip() {
        for name in ["c1", "a-b", "a--b", "p/s", "a-b/c-d", "-", "x-"] {
            assert_eq!(unescape_name(&escape_name(name)), name, "name {:?}", name);
        }

        assert_eq!(escape_name("a-b/c"), "a--b-c");
        assert_eq!(unescape_name("a--b-c"), "a-b/c");
    }

    #[test]
    fn test_lv_names() {
        assert_eq!(
            lv_name(&vol(VolumeType::Custom, ContentType::Filesystem, "c1")),
            "custom_c1"
        );
        assert_eq!(
            lv_name(&vol(VolumeType::VirtualMachine, ContentType::Block, "v1")),
            "virtual-machine_v1.block"
        );
        assert_eq!(
            lv_name(&vol(
                VolumeType::VirtualMachine,
                ContentType::Filesystem,
                "v1"
            )),
            "virtual-machine_v1"
        );
        assert_eq!(
            lv_name(&vol(VolumeType::Container, ContentType::Filesystem, "c1/s0")),
            "container_c1-s0"
        );
    }

    #[test]
    fn test_parse_lv_name() {
        assert_eq!(
            parse_lv_name("custom_c1"),
            Some((VolumeType::Custom, ContentType::Filesystem, "c1".to_string()))
        );
        assert_eq!(
            parse_lv_name("virtual-machine_v1.block"),
            Some((
                VolumeType::VirtualMachine,
                ContentType::Block,
                "v1".to_string()
            ))
        );
        assert_eq!(
            parse_lv_name("container_c1-s0"),
            Some((
                VolumeType::Container,
                ContentType::Filesystem,
                "c1/s0".to_string()
            ))
        );

        assert_eq!(parse_lv_name("thinpool"), None);
        assert_eq!(parse_lv_name("cryptohome-data"), None);
        assert_eq!(parse_lv_name("custom_"), None);
    }

    #[test]
    fn test_device_paths() {
        let v = vol(VolumeType::Custom, ContentType::Filesystem, "c1");
        assert_eq!(
            volume_dev_path("vg0", &v),
            PathBuf::from("/dev/vg0/custom_c1")
        );
    }

    #[test]
    fn test_mount_paths() {
        let root = Path::new("/var/lib/pool");

        let head = vol(VolumeType::Container, ContentType::Filesystem, "c1");
        assert_eq!(
            mount_path(root, &head),
            PathBuf::from("/var/lib/pool/containers/c1")
        );

        let snap = vol(VolumeType::Container, ContentType::Filesystem, "c1/s0");
        assert_eq!(
            mount_path(root, &snap),
            PathBuf::from("/var/lib/pool/containers-snapshots/c1/s0")
        );

        assert_eq!(
            snapshots_dir(root, VolumeType::Container, "c1"),
            PathBuf::from("/var/lib/pool/containers-snapshots/c1")
        );
    }
}
