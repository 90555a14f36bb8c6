// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Structured error kinds surfaced to the pool manager.

use thiserror::Error as ThisError;

/// Errors with meaning to the caller, as opposed to wrapped tool and
/// syscall failures which only carry context strings. Callers probe for
/// these with `anyhow::Error::downcast_ref`.
#[derive(Debug, ThisError)]
pub enum DriverError {
    /// The operation is valid for some driver but not this one.
    #[error("Not supported: {0}")]
    NotSupported(String),
    /// The operation is not part of this driver's surface at all.
    #[error("Not implemented")]
    NotImplemented,
    /// The caller's cancellation signal fired before a tool spawn.
    #[error("Operation cancelled")]
    Cancelled,
    /// Deleting a volume that still has snapshots.
    #[error("Volume \"{0}\" has snapshots")]
    VolumeHasSnapshots(String),
    /// Creating a volume whose LV already exists.
    #[error("Volume \"{0}\" already exists")]
    VolumeExists(String),
    /// Referencing a volume or snapshot that does not exist.
    #[error("Volume \"{0}\" not found")]
    VolumeNotFound(String),
    /// A malformed or reserved volume name.
    #[error("Invalid volume name \"{0}\": {1}")]
    InvalidVolumeName(String, String),
    /// A config key failed validation, or an unrecognized key was given.
    #[error("Invalid volume option \"{0}\": {1}")]
    InvalidOption(String, String),
    /// The pool-level configuration is unusable.
    #[error("Invalid pool configuration: {0}")]
    InvalidPoolConfig(String),
}
