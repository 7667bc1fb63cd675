// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The interpreter-facing side of the fault handler: threads publish their call stacks here, and
//! the host reports runtime state that ends up in fatal error reports.

mod frame;
mod thread_registry;

pub use frame::{CodeLocation, Frame, StackSnapshot};
pub use thread_registry::{
    all_threads, capture_current_thread, current_thread, enter_frame, for_each_thread,
    register_current_thread, FrameGuard, Frames, RegistryError, ThreadHandle, ThreadRegistration,
};

use serde::{Deserialize, Serialize};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8};

/// Lifecycle of the host runtime, reported as `Python runtime state: <state>`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeState {
    Initializing = 0,
    Initialized = 1,
    Finalizing = 2,
}

impl RuntimeState {
    /// A static string, to avoid the memory allocation of `to_string` in a signal handler.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeState::Initializing => "initializing",
            RuntimeState::Initialized => "initialized",
            RuntimeState::Finalizing => "finalizing",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => RuntimeState::Initializing,
            2 => RuntimeState::Finalizing,
            _ => RuntimeState::Initialized,
        }
    }
}

static RUNTIME_STATE: AtomicU8 = AtomicU8::new(RuntimeState::Initialized as u8);
static GC_COLLECTING: AtomicBool = AtomicBool::new(false);
// Either null, or `Box::into_raw()` of the preformatted `Extension modules: ...` line.
static EXTENSION_MODULES: AtomicPtr<String> = AtomicPtr::new(ptr::null_mut());

pub fn set_runtime_state(state: RuntimeState) {
    RUNTIME_STATE.store(state as u8, SeqCst);
}

pub fn runtime_state() -> RuntimeState {
    RuntimeState::from_u8(RUNTIME_STATE.load(SeqCst))
}

/// Flags that the garbage collector is running on the current thread. Fatal reports then carry a
/// `Garbage-collecting` marker.
pub fn set_gc_collecting(collecting: bool) {
    GC_COLLECTING.store(collecting, SeqCst);
}

pub fn gc_collecting() -> bool {
    GC_COLLECTING.load(SeqCst)
}

/// Publishes the names of the loaded native extension modules, appended to fatal reports as
/// `Extension modules: a, b (total: 2)`. An empty list removes the line.
///
/// SAFETY:
///     The previous line is freed here. A fatal report being written concurrently on another
///     thread could still be reading it; call this during start-up or module loading, not while
///     crashes are expected.
/// ATOMICITY:
///     This function uses a swap on an atomic pointer.
pub fn set_extension_modules<S: AsRef<str>>(names: &[S]) {
    let new = if names.is_empty() {
        ptr::null_mut()
    } else {
        let joined = names
            .iter()
            .map(|name| name.as_ref())
            .collect::<Vec<_>>()
            .join(", ");
        let line = format!("Extension modules: {joined} (total: {})\n", names.len());
        Box::into_raw(Box::new(line))
    };
    let old = EXTENSION_MODULES.swap(new, SeqCst);
    if !old.is_null() {
        // Safety: This can only come from a box above.
        unsafe {
            std::mem::drop(Box::from_raw(old));
        }
    }
}

/// The preformatted extension modules line, if any. Performs no allocation.
pub(crate) fn extension_modules_line() -> Option<&'static str> {
    // SAFETY: see `set_extension_modules`.
    unsafe { EXTENSION_MODULES.load(SeqCst).as_ref() }.map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial(runtime_state)]
    fn test_runtime_state() {
        assert_eq!(runtime_state(), RuntimeState::Initialized);
        set_runtime_state(RuntimeState::Finalizing);
        assert_eq!(runtime_state().as_str(), "finalizing");
        set_runtime_state(RuntimeState::Initialized);
    }

    #[test]
    #[serial(runtime_state)]
    fn test_extension_modules_line() {
        set_extension_modules(&["_json", "_socket"]);
        assert_eq!(
            extension_modules_line(),
            Some("Extension modules: _json, _socket (total: 2)\n")
        );
        set_extension_modules::<&str>(&[]);
        assert_eq!(extension_modules_line(), None);
    }
}
