// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Compensating-action stack scoped to a single public operation. Undo
//! actions accumulate as an operation makes external side effects; any
//! early error return drops the reverter and fires them in reverse
//! order, restoring the pre-call state.

use anyhow::Result;
use log::{debug, warn};

struct RevertAction<'a> {
    what: String,
    action: Box<dyn FnOnce() -> Result<()> + 'a>,
}

/// A LIFO stack of undo actions. Owned exclusively by the enclosing
/// operation; `success()` disarms it on the happy path, dropping it any
/// other way fires the stack. Undo failures are logged, never surfaced:
/// the error that armed the stack is the one the caller sees.
#[derive(Default)]
pub struct Reverter<'a> {
    actions: Vec<RevertAction<'a>>,
}

impl<'a> Reverter<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an undo for a side effect that just completed. `what`
    /// names the effect for the log.
    pub fn add<F>(&mut self, what: &str, action: F)
    where
        F: FnOnce() -> Result<()> + 'a,
    {
        self.actions.push(RevertAction {
            what: what.to_string(),
            action: Box::new(action),
        });
    }

    /// The operation completed; discard the undo stack.
    pub fn success(mut self) {
        self.actions.clear();
    }

    /// Fire the undo stack now. Dropping the reverter does the same;
    /// this exists for call sites that want to be explicit.
    pub fn fail(self) {}
}

impl Drop for Reverter<'_> {
    fn drop(&mut self) {
        while let Some(entry) = self.actions.pop() {
            debug!("Reverting: {}", entry.what);
            if let Err(err) = (entry.action)() {
                warn!("Failed reverting {}: {:#}", entry.what, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;

    #[test]
    fn test_fires_in_reverse_order() {
        let fired = RefCell::new(Vec::new());
        {
            let mut reverter = Reverter::new();
            reverter.add("first", || {
                fired.borrow_mut().push(1);
                Ok(())
            });
            reverter.add("second", || {
                fired.borrow_mut().push(2);
                Ok(())
            });
        }
        assert_eq!(*fired.borrow(), vec![2, 1]);
    }

    #[test]
    fn test_success_disarms() {
        let fired = RefCell::new(false);
        let mut reverter = Reverter::new();
        reverter.add("never", || {
            *fired.borrow_mut() = true;
            Ok(())
        });
        reverter.success();
        assert!(!*fired.borrow());
    }

    #[test]
    fn test_failed_undo_does_not_stop_the_rest() {
        let fired = RefCell::new(Vec::new());
        {
            let mut reverter = Reverter::new();
            reverter.add("first", || {
                fired.borrow_mut().push(1);
                Ok(())
            });
            reverter.add("second", || anyhow::bail!("undo went wrong"));
            reverter.add("third", || {
                fired.borrow_mut().push(3);
                Ok(())
            });
        }
        assert_eq!(*fired.borrow(), vec![3, 1]);
    }

    #[test]
    fn test_explicit_fail() {
        let fired = RefCell::new(false);
        let mut reverter = Reverter::new();
        reverter.add("undo", || {
            *fired.borrow_mut() = true;
            Ok(())
        });
        reverter.fail();
        assert!(*fired.borrow());
    }
}
