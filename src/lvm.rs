// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Thin layer over the LVM command suite. Each function either succeeds
//! fully or reports failure with no partial on-disk effect for the
//! caller to clean up.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context, Result};

use crate::process::{command_output, run_command, Operation};

const LVCREATE_PATH: &str = "/sbin/lvcreate";
const LVREMOVE_PATH: &str = "/sbin/lvremove";
const LVRENAME_PATH: &str = "/sbin/lvrename";
const LVRESIZE_PATH: &str = "/sbin/lvresize";
const LVCHANGE_PATH: &str = "/sbin/lvchange";
const LVDISPLAY_PATH: &str = "/sbin/lvdisplay";
const LVS_PATH: &str = "/sbin/lvs";
const VGS_PATH: &str = "/sbin/vgs";

/// Get the path to the given logical volume's device node.
pub fn lv_path(volume_group: &str, name: &str) -> PathBuf {
    PathBuf::from(format!("/dev/{}/{}", volume_group, name))
}

/// Get the fully qualified name of an LV.
fn full_lv_name(volume_group: &str, name: &str) -> String {
    format!("{}/{}", volume_group, name)
}

/// Determine if the given logical volume exists.
pub fn lv_exists(volume_group: &str, name: &str, op: Option<&Operation>) -> Result<bool> {
    crate::process::check_cancelled(op)?;
    let volume = full_lv_name(volume_group, name);
    let output = Command::new(LVDISPLAY_PATH)
        .arg(&volume)
        .output()
        .context("Failed to get output for child process")?;
    Ok(output.status.success())
}

/// Create a new logical volume. A thinpool name selects thin
/// provisioning, which allocates on demand and ignores striping.
pub fn create_lv(
    volume_group: &str,
    thinpool: Option<&str>,
    name: &str,
    size_bytes: u64,
    stripes: Option<u32>,
    stripe_size_bytes: Option<u64>,
    op: Option<&Operation>,
) -> Result<()> {
    let size = format!("{}b", size_bytes);
    let mut cmd = Command::new(LVCREATE_PATH);
    cmd.arg("--yes");

    match thinpool {
        Some(thinpool) => {
            cmd.args(["--thin", "-V", &size, "-n", name]);
            cmd.arg(full_lv_name(volume_group, thinpool));
        }
        None => {
            cmd.args(["--wipesignatures", "y", "--zero", "y", "-L", &size, "-n", name]);
            if let Some(stripes) = stripes {
                cmd.args(["--stripes", &stripes.to_string()]);
            }
            if let Some(stripe_size) = stripe_size_bytes {
                cmd.args(["--stripesize", &format!("{}b", stripe_size)]);
            }
            cmd.arg(volume_group);
        }
    }

    run_command(cmd, op).with_context(|| {
        format!(
            "Error creating LVM logical volume {}",
            lv_path(volume_group, name).display()
        )
    })
}

/// Create an LVM snapshot of `source`. The readonly flag matters only
/// for classic snapshots; thin snapshots are mounted read-only instead.
/// Classic snapshots need CoW space, sized via `cow_bytes`.
pub fn create_lv_snapshot(
    volume_group: &str,
    thinpool: Option<&str>,
    source: &str,
    name: &str,
    readonly: bool,
    cow_bytes: u64,
    op: Option<&Operation>,
) -> Result<()> {
    let mut cmd = Command::new(LVCREATE_PATH);
    cmd.args(["-s", "-n", name]);

    if thinpool.is_some() {
        // Disable activation skip so the device node appears without a
        // separate lvchange -K.
        cmd.arg("-kn");
    } else {
        cmd.args(["-L", &format!("{}b", cow_bytes)]);
        if readonly {
            cmd.args(["-p", "r"]);
        }
    }

    cmd.arg(full_lv_name(volume_group, source));

    run_command(cmd, op).with_context(|| {
        format!(
            "Error creating LVM snapshot volume {}",
            lv_path(volume_group, name).display()
        )
    })
}

/// Remove a logical volume. Fails if the LV is still open.
pub fn remove_lv(volume_group: &str, name: &str, op: Option<&Operation>) -> Result<()> {
    let mut cmd = Command::new(LVREMOVE_PATH);
    cmd.args(["-f", &full_lv_name(volume_group, name)]);

    run_command(cmd, op).with_context(|| {
        format!(
            "Error removing LVM logical volume {}",
            lv_path(volume_group, name).display()
        )
    })
}

/// Rename a logical volume within its volume group.
pub fn rename_lv(
    volume_group: &str,
    old_name: &str,
    new_name: &str,
    op: Option<&Operation>,
) -> Result<()> {
    let mut cmd = Command::new(LVRENAME_PATH);
    cmd.args([volume_group, old_name, new_name]);

    run_command(cmd, op).with_context(|| {
        format!(
            "Error renaming LVM logical volume {}",
            lv_path(volume_group, old_name).display()
        )
    })
}

/// Resize a logical volume to an exact byte count. The caller rounds to
/// extent granularity and elides no-op resizes; LVM itself refuses a
/// resize to the current size.
pub fn resize_lv(
    volume_group: &str,
    name: &str,
    size_bytes: u64,
    op: Option<&Operation>,
) -> Result<()> {
    let mut cmd = Command::new(LVRESIZE_PATH);
    cmd.args(["-f", "-L", &format!("{}b", size_bytes)]);
    cmd.arg(lv_path(volume_group, name));

    run_command(cmd, op).with_context(|| {
        format!(
            "Error resizing LVM logical volume {}",
            lv_path(volume_group, name).display()
        )
    })
}

/// Activate a logical volume. Already-active volumes (device node
/// present) are left alone.
pub fn activate_lv(volume_group: &str, name: &str, op: Option<&Operation>) -> Result<()> {
    if lv_path(volume_group, name).exists() {
        return Ok(());
    }

    let full_name = full_lv_name(volume_group, name);
    let mut cmd = Command::new(LVCHANGE_PATH);
    cmd.args(["-ay", &full_name]);

    run_command(cmd, op).with_context(|| format!("Failed to activate logical volume {}", full_name))
}

/// Deactivate a logical volume. Already-inactive volumes are left alone.
pub fn deactivate_lv(volume_group: &str, name: &str, op: Option<&Operation>) -> Result<()> {
    if !lv_path(volume_group, name).exists() {
        return Ok(());
    }

    let full_name = full_lv_name(volume_group, name);
    let mut cmd = Command::new(LVCHANGE_PATH);
    cmd.args(["-an", &full_name]);

    run_command(cmd, op)
        .with_context(|| format!("Failed to deactivate logical volume {}", full_name))
}

/// Enumerate the LV names in a volume group.
pub fn list_lvs(volume_group: &str, op: Option<&Operation>) -> Result<Vec<String>> {
    let mut cmd = Command::new(LVS_PATH);
    cmd.args(["--noheadings", "-o", "lv_name", volume_group]);

    let output = command_output(cmd, op)
        .with_context(|| format!("Failed to list LVs in volume group {}", volume_group))?;
    let output_string = String::from_utf8_lossy(&output);

    Ok(output_string
        .split_whitespace()
        .map(|e| e.trim().to_string())
        .collect())
}

/// Parse a single numeric field out of report output. `lvs --units b
/// --nosuffix` prints whole byte counts, but tolerate a decimal tail.
fn parse_report_number(field: &str) -> Result<u64> {
    let trimmed = field.trim();
    let integer = trimmed.split('.').next().unwrap_or(trimmed);
    integer
        .parse()
        .with_context(|| format!("Failed to parse LVM report field \"{}\"", field))
}

fn report_output(mut cmd: Command, op: Option<&Operation>) -> Result<String> {
    cmd.args(["--noheadings", "--nosuffix", "--units", "b"]);
    let output = command_output(cmd, op)?;
    Ok(String::from_utf8_lossy(&output).trim().to_string())
}

/// Get the size of a logical volume in bytes.
pub fn lv_size_bytes(volume_group: &str, name: &str, op: Option<&Operation>) -> Result<u64> {
    let mut cmd = Command::new(LVS_PATH);
    cmd.args(["-o", "lv_size", &full_lv_name(volume_group, name)]);

    let line = report_output(cmd, op).with_context(|| {
        format!(
            "Error querying size of LVM logical volume {}",
            lv_path(volume_group, name).display()
        )
    })?;
    parse_report_number(&line)
}

/// Get the extent size of a volume group in bytes. All LV sizes round
/// up to a multiple of this.
pub fn vg_extent_size(volume_group: &str, op: Option<&Operation>) -> Result<u64> {
    let mut cmd = Command::new(VGS_PATH);
    cmd.args(["-o", "vg_extent_size", volume_group]);

    let line = report_output(cmd, op)
        .with_context(|| format!("Failed to get extent size of volume group {}", volume_group))?;
    parse_report_number(&line)
}

/// Get the number of bytes a thin volume has actually allocated from
/// its thinpool.
pub fn thin_volume_usage(volume_group: &str, name: &str, op: Option<&Operation>) -> Result<u64> {
    let mut cmd = Command::new(LVS_PATH);
    cmd.args(["-o", "lv_size,data_percent", &full_lv_name(volume_group, name)]);

    let line = report_output(cmd, op).with_context(|| {
        format!(
            "Failed to get thin pool usage of {}",
            lv_path(volume_group, name).display()
        )
    })?;

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 2 {
        bail!("Unexpected lvs output \"{}\"", line);
    }

    let size = parse_report_number(fields[0])?;
    let percent: f64 = fields[1]
        .trim()
        .parse()
        .with_context(|| format!("Failed to parse data_percent \"{}\"", fields[1]))?;

    Ok((size as f64 * percent / 100.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lv_path() {
        assert_eq!(
            lv_path("vg0", "custom_c1"),
            PathBuf::from("/dev/vg0/custom_c1")
        );
        assert_eq!(full_lv_name("vg0", "custom_c1"), "vg0/custom_c1");
    }

    #[test]
    fn test_parse_report_number() {
        assert_eq!(parse_report_number("16777216").unwrap(), 16777216);
        assert_eq!(parse_report_number(" 16777216.00 ").unwrap(), 16777216);
        assert!(parse_report_number("16MiB").is_err());
        assert!(parse_report_number("").is_err());
    }
}
