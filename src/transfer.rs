// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Generic file-level data movers shared by copy, refresh, restore,
//! migration and backup: rsync between mounted trees, and tar streams
//! for backup export and import.

use std::io::{Read, Write};
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};

use crate::process::{run_command, Operation};

const RSYNC_PATH: &str = "/usr/bin/rsync";

/// Sync the contents of `source` into `target`, preserving ownership,
/// hard links, xattrs and sparseness, and deleting extraneous target
/// files so a refresh converges on the source tree.
pub fn rsync_tree(
    source: &Path,
    target: &Path,
    bwlimit: Option<&str>,
    op: Option<&Operation>,
) -> Result<()> {
    let mut cmd = Command::new(RSYNC_PATH);
    cmd.args([
        "-a",
        "-H",
        "-A",
        "-X",
        "--sparse",
        "--devices",
        "--delete",
        "--numeric-ids",
    ]);
    if let Some(bwlimit) = bwlimit {
        cmd.arg(format!("--bwlimit={}", bwlimit));
    }
    // Trailing slash: copy the contents of source, not source itself.
    cmd.arg(format!("{}/", source.display()));
    cmd.arg(target);

    run_command(cmd, op).with_context(|| {
        format!(
            "Failed to rsync {} to {}",
            source.display(),
            target.display()
        )
    })
}

/// Pack a mounted volume tree into a tar stream.
pub fn pack_tree<W: Write>(root: &Path, writer: W) -> Result<()> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", root)
        .with_context(|| format!("Failed to pack {}", root.display()))?;
    builder.finish().context("Failed to finish tar stream")
}

/// Unpack a tar stream into a mounted volume tree.
pub fn unpack_tree<R: Read>(reader: R, root: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(true);
    archive
        .unpack(root)
        .with_context(|| format!("Failed to unpack into {}", root.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use tempfile::TempDir;

    #[test]
    fn test_tar_pack_unpack() {
        let source = TempDir::new().unwrap();
        fs::create_dir(source.path().join("dir")).unwrap();
        fs::write(source.path().join("dir/file"), b"contents").unwrap();
        fs::write(source.path().join("top"), b"x").unwrap();

        let mut buffer = Vec::new();
        pack_tree(source.path(), &mut buffer).unwrap();

        let target = TempDir::new().unwrap();
        unpack_tree(buffer.as_slice(), target.path()).unwrap();

        assert_eq!(
            fs::read(target.path().join("dir/file")).unwrap(),
            b"contents"
        );
        assert_eq!(fs::read(target.path().join("top")).unwrap(), b"x");
    }

    // Needs a real rsync binary, so leave it as a manual test:
    //     cargo test -- --ignored
    #[test]
    #[ignore]
    fn test_rsync_tree() {
        let source = TempDir::new().unwrap();
        fs::write(source.path().join("f"), b"data").unwrap();
        let target = TempDir::new().unwrap();
        fs::write(target.path().join("stale"), b"old").unwrap();

        rsync_tree(source.path(), target.path(), None, None).unwrap();

        assert_eq!(fs::read(target.path().join("f")).unwrap(), b"data");
        assert!(!target.path().join("stale").exists());
    }
}
