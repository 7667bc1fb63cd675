// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Reentrancy guard error: a dump is already in progress")]
pub struct AtomGuardError;

/// Lets at most one holder through at a time. Used to keep two faults (nested, or on two threads)
/// from interleaving their dumps on the same sink.
pub struct AtomGuard<'a> {
    counter: &'a AtomicU64,
}

impl<'a> AtomGuard<'a> {
    pub fn new(counter: &'a AtomicU64) -> Result<Self, AtomGuardError> {
        // A CAS "takes" the counter from 0 to 1, so the check and the claim are one atomic step.
        match counter.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => Ok(AtomGuard { counter }),
            Err(_) => Err(AtomGuardError),
        }
    }
}

impl Drop for AtomGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_holder_is_rejected() {
        let counter = AtomicU64::new(0);
        let guard = AtomGuard::new(&counter).unwrap();
        assert!(AtomGuard::new(&counter).is_err());
        drop(guard);
        let _again = AtomGuard::new(&counter).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
