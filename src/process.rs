// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Checked invocation of external tools, with classification of the
//! failure modes the driver has to react to.

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::process::{Command, Output};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use log::debug;

use crate::error::DriverError;

/// Opaque per-call handle threaded through the public operations. The
/// driver itself never polls it; it is only consulted immediately before
/// spawning an external tool, so an external cancellation signal stops
/// future tool spawns within the same call.
#[derive(Default)]
pub struct Operation {
    cancelled: AtomicBool,
}

impl Operation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum ErrorKind {
    LaunchProcess(io::Error),
    ExitedNonZero(Output),
}

/// Error from running an external tool. Carries the full output so the
/// caller can distinguish "not found", "busy" and "already exists" from
/// everything else, per the tooling contract.
#[derive(Debug)]
pub struct ProcessError {
    command: String,
    kind: ErrorKind,
}

impl ProcessError {
    fn stderr(&self) -> Cow<'_, str> {
        match &self.kind {
            ErrorKind::ExitedNonZero(output) => String::from_utf8_lossy(&output.stderr),
            ErrorKind::LaunchProcess(_) => Cow::Borrowed(""),
        }
    }

    /// The tool reported the target object missing.
    pub fn is_not_found(&self) -> bool {
        let stderr = self.stderr().to_lowercase();
        stderr.contains("not found") || stderr.contains("failed to find")
    }

    /// The tool reported the target object open or busy.
    pub fn is_busy(&self) -> bool {
        let stderr = self.stderr().to_lowercase();
        stderr.contains("in use") || stderr.contains("busy")
    }

    /// The tool reported the target object already present.
    pub fn already_exists(&self) -> bool {
        self.stderr().to_lowercase().contains("already exists")
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.kind {
            ErrorKind::LaunchProcess(err) => {
                write!(f, "failed to launch process \"{}\": {}", self.command, err)
            }
            ErrorKind::ExitedNonZero(output) => write!(
                f,
                "command \"{}\" failed: {}\nstdout={}\nstderr={}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr),
            ),
        }
    }
}

impl std::error::Error for ProcessError {}

/// Format the command as a string for logging.
///
/// The debug format puts quotes around the program and each argument;
/// stripping them is not correct in all cases but good enough for logs.
fn command_to_string(cmd: &Command) -> String {
    format!("{:?}", cmd).replace('"', "")
}

/// Return `DriverError::Cancelled` if the operation handle has fired.
pub fn check_cancelled(op: Option<&Operation>) -> Result<(), DriverError> {
    if op.map_or(false, |o| o.is_cancelled()) {
        return Err(DriverError::Cancelled);
    }

    Ok(())
}

/// Run a command and get its stdout as raw bytes. An error is returned
/// if the operation was cancelled, the process fails to launch, or it
/// exits non-zero.
pub fn command_output(mut command: Command, op: Option<&Operation>) -> Result<Vec<u8>> {
    check_cancelled(op)?;

    let cmd_str = command_to_string(&command);
    debug!("Running command: {}", cmd_str);

    let output = command.output().map_err(|err| ProcessError {
        command: cmd_str.clone(),
        kind: ErrorKind::LaunchProcess(err),
    })?;

    if !output.status.success() {
        return Err(ProcessError {
            command: cmd_str,
            kind: ErrorKind::ExitedNonZero(output),
        }
        .into());
    }

    Ok(output.stdout)
}

/// Run a command for its side effect only.
pub fn run_command(command: Command, op: Option<&Operation>) -> Result<()> {
    command_output(command, op).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_to_string() {
        let mut cmd = Command::new("myCmd");
        cmd.args(["arg1", "arg2"]);
        assert_eq!(command_to_string(&cmd), "myCmd arg1 arg2");
    }

    #[test]
    fn test_command_output_bad_path() {
        let err = command_output(Command::new("/this/path/does/not/exist"), None).unwrap_err();
        let perr = err.downcast_ref::<ProcessError>().unwrap();
        assert!(matches!(perr.kind, ErrorKind::LaunchProcess(_)));
    }

    #[test]
    fn test_command_output_success() {
        let mut command = Command::new("echo");
        command.arg("myOutput");
        assert_eq!(command_output(command, None).unwrap(), b"myOutput\n");
    }

    #[test]
    fn test_command_output_exit_nonzero() {
        let err = command_output(Command::new("false"), None).unwrap_err();
        let perr = err.downcast_ref::<ProcessError>().unwrap();
        assert!(matches!(perr.kind, ErrorKind::ExitedNonZero(_)));
    }

    #[test]
    fn test_cancelled_operation() {
        let operation = Operation::new();
        operation.cancel();
        let mut command = Command::new("echo");
        command.arg("never runs");
        let err = command_output(command, Some(&operation)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DriverError>(),
            Some(DriverError::Cancelled)
        ));
    }

    #[test]
    fn test_error_classification() {
        let stderr_error = |text: &str| ProcessError {
            command: "lvremove".to_string(),
            kind: ErrorKind::ExitedNonZero(Output {
                status: std::process::Command::new("false").status().unwrap(),
                stdout: vec![],
                stderr: text.as_bytes().to_vec(),
            }),
        };

        assert!(stderr_error("Logical volume vg0/c1 in use.").is_busy());
        assert!(stderr_error("Failed to find logical volume \"vg0/c1\"").is_not_found());
        assert!(stderr_error("Logical volume \"c1\" already exists in volume group \"vg0\"")
            .already_exists());
        assert!(!stderr_error("Insufficient free space").is_busy());
    }
}
