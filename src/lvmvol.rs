// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Listing for the LVM volume driver library components.

pub mod driver;
pub mod error;
pub mod fsutil;
pub mod lvm;
pub mod paths;
pub mod process;
pub mod revert;
pub mod transfer;
pub mod volume;

mod snapshot;
mod util;

pub use driver::{BackupHooks, Filler, LvmDriver, MigrationType, PoolConfig};
pub use error::DriverError;
pub use process::Operation;
pub use volume::{ContentType, Volume, VolumeType};
