// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! This crate implements a fault handler for interpreter runtimes written in Rust.
//!
//! Architecturally, it consists of three parts:
//! 1. A lock-free registry of interpreter call stacks ([`runtime`]). The host runtime registers
//!    each of its threads and pushes/pops a frame whenever it enters/leaves a function. The
//!    registry is designed to be read from inside a signal handler: every read is an atomic load
//!    and the memory being read is never freed.
//! 2. Signal handlers ([`enable`], [`register`]) and a watchdog thread
//!    ([`dump_traceback_later`]) which dump those stacks to a file descriptor. The signal
//!    handlers run under a constrained environment where many standard operations are illegal.
//!    <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
//!    In particular, memory allocation and synchronization such as mutexes are potentially UB.
//!    Everything the handlers need is therefore prepared ahead of time, and the dump itself only
//!    performs atomic loads and `write(2)` calls.
//! 3. A line-oriented text format ([`collector::emitters`]) which is stable and greppable:
//!
//! ```text
//! Fatal Python error: Segmentation fault
//!
//! Current thread 0x00007f3a1c5fd740 (most recent call first):
//!   File "script.py", line 3 in crash
//!   File "script.py", line 7 in <module>
//! ```
//!
//! After dumping, fatal signals are re-raised with the previous disposition so that the process
//! still terminates the way it would have without the fault handler.

#[cfg(feature = "collector")]
pub mod collector;
#[cfg(all(windows, feature = "collector_windows"))]
mod collector_windows;
pub mod runtime;
mod shared;

#[cfg(feature = "collector")]
pub use collector::api::*;
pub use runtime::{
    enter_frame, register_current_thread, set_extension_modules, set_gc_collecting,
    set_runtime_state, CodeLocation, Frame, FrameGuard, RuntimeState, StackSnapshot,
    ThreadHandle, ThreadRegistration,
};
pub use shared::configuration::{
    FaultHandlerConfiguration, UserSignalConfiguration, WatchdogConfiguration,
};
pub use shared::constants::{MAX_FRAME_DEPTH, MAX_NTHREADS, MAX_STRING_LENGTH};
pub use shared::error::FaultHandlerError;
pub use shared::sink::{Sink, SinkWriter};
