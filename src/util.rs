// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Size-string parsing and directory helpers shared across the driver.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// Mode applied to volume mount directories. Restrictive on purpose: the
/// directory contents belong to the workload, not to pool users.
const MOUNT_DIR_MODE: u32 = 0o711;

/// Parse a size string like "16MiB", "10GB" or "512" into bytes. A bare
/// number is taken as bytes. Binary (KiB) and decimal (KB) suffixes are
/// both accepted, as are the single-letter forms LVM prints.
pub fn parse_size(input: &str) -> Result<u64> {
    let s = input.trim();
    let digits = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(digits);
    if number.is_empty() {
        bail!("Invalid size string \"{}\"", input);
    }

    let value: u64 = number
        .parse()
        .with_context(|| format!("Invalid size string \"{}\"", input))?;

    let multiplier: u64 = match suffix.trim() {
        "" | "B" | "b" => 1,
        "k" | "K" | "KiB" => 1 << 10,
        "M" | "MiB" => 1 << 20,
        "G" | "GiB" => 1 << 30,
        "T" | "TiB" => 1 << 40,
        "KB" => 1000,
        "MB" => 1000 * 1000,
        "GB" => 1000 * 1000 * 1000,
        "TB" => 1000 * 1000 * 1000 * 1000,
        other => bail!("Invalid size suffix \"{}\" in \"{}\"", other, input),
    };

    value
        .checked_mul(multiplier)
        .with_context(|| format!("Size \"{}\" overflows", input))
}

/// Round `value` up to the next multiple of `multiple`.
pub fn round_up(value: u64, multiple: u64) -> u64 {
    if multiple == 0 {
        return value;
    }

    ((value + multiple - 1) / multiple) * multiple
}

/// Create a directory (and parents) if it does not exist. Returns whether
/// this call created it, so the caller can scope its undo action.
pub fn ensure_dir(path: &Path) -> Result<bool> {
    if path.is_dir() {
        return Ok(false);
    }

    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory {}", path.display()))?;

    Ok(true)
}

/// Remove a directory tree, tolerating it already being gone.
pub fn remove_dir_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("Failed to remove directory {}", path.display()))
        }
    }
}

/// Remove a directory only if it exists and is empty.
pub fn remove_dir_if_empty(path: &Path) -> Result<()> {
    let mut entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to read {}", path.display()));
        }
    };

    if entries.next().is_some() {
        return Ok(());
    }

    fs::remove_dir(path).with_context(|| format!("Failed to remove {}", path.display()))
}

/// Re-assert ownership-independent permissions on a mount directory.
/// Fillers and unpack helpers run as root and can leave the directory
/// with whatever mode the payload carried.
pub fn set_mount_dir_mode(path: &Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(MOUNT_DIR_MODE))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_plain_bytes() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("512B").unwrap(), 512);
        assert_eq!(parse_size(" 512 ").unwrap(), 512);
    }

    #[test]
    fn test_parse_size_binary_suffixes() {
        assert_eq!(parse_size("16MiB").unwrap(), 16 << 20);
        assert_eq!(parse_size("16M").unwrap(), 16 << 20);
        assert_eq!(parse_size("4k").unwrap(), 4096);
        assert_eq!(parse_size("2GiB").unwrap(), 2 << 30);
        assert_eq!(parse_size("1TiB").unwrap(), 1 << 40);
    }

    #[test]
    fn test_parse_size_decimal_suffixes() {
        assert_eq!(parse_size("10KB").unwrap(), 10_000);
        assert_eq!(parse_size("10GB").unwrap(), 10_000_000_000);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("MiB").is_err());
        assert!(parse_size("12XB").is_err());
        assert!(parse_size("-4MiB").is_err());
    }

    #[test]
    fn test_round_up() {
        let extent = 4 << 20;
        assert_eq!(round_up(17 << 20, extent), 20 << 20);
        assert_eq!(round_up(20 << 20, extent), 20 << 20);
        assert_eq!(round_up(1, extent), extent);
        assert_eq!(round_up(123, 0), 123);
    }

    #[test]
    fn test_dir_helpers() {
        let root = tempfile::TempDir::new().unwrap();
        let dir = root.path().join("a/b");

        assert!(ensure_dir(&dir).unwrap());
        assert!(!ensure_dir(&dir).unwrap());

        // Empty directory goes away, missing directory is tolerated.
        remove_dir_if_empty(&dir).unwrap();
        assert!(!dir.exists());
        remove_dir_if_empty(&dir).unwrap();

        // Non-empty directory stays.
        ensure_dir(&dir).unwrap();
        std::fs::write(dir.join("f"), b"x").unwrap();
        remove_dir_if_empty(&dir).unwrap();
        assert!(dir.exists());

        remove_dir_tree(&dir).unwrap();
        assert!(!dir.exists());
        remove_dir_tree(&dir).unwrap();
    }
}
