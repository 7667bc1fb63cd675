// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Thin wrappers over the few OS primitives that differ between platforms.
//! Everything here is async-signal-safe.

/// Identifier of the calling thread, as printed in thread headers.
#[cfg(unix)]
pub(crate) fn current_thread_id() -> u64 {
    // SAFETY: pthread_self has no preconditions and never fails.
    unsafe { libc::pthread_self() as u64 }
}

#[cfg(windows)]
pub(crate) fn current_thread_id() -> u64 {
    // SAFETY: GetCurrentThreadId has no preconditions and never fails.
    unsafe { windows::Win32::System::Threading::GetCurrentThreadId() as u64 }
}

/// Exits immediately, without running atexit handlers or flushing stdio.
#[cfg(unix)]
pub(crate) fn exit_immediately(code: i32) -> ! {
    // SAFETY: _exit is async-signal-safe and has no preconditions.
    unsafe { libc::_exit(code) }
}

#[cfg(windows)]
pub(crate) fn exit_immediately(code: i32) -> ! {
    // SAFETY: ExitProcess has no preconditions.
    unsafe { windows::Win32::System::Threading::ExitProcess(code as u32) };
    #[allow(clippy::empty_loop)]
    loop {}
}
