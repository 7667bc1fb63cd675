// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Function names and source paths longer than this are truncated, and `...` is appended.
pub const MAX_STRING_LENGTH: usize = 500;

/// Number of innermost frames kept per thread. Deeper stacks lose their outermost frames, and the
/// dump ends with a `  ...` line.
pub const MAX_FRAME_DEPTH: usize = 100;

/// Number of threads dumped by an all-threads dump. Further threads are summarized as `...`.
pub const MAX_NTHREADS: usize = 100;

/// Capacity of the thread registry.
pub(crate) const MAX_REGISTERED_THREADS: usize = 256;

pub(crate) const FATAL_ERROR_PREFIX: &str = "Fatal Python error: ";
pub(crate) const RUNTIME_STATE_PREFIX: &str = "Python runtime state: ";
pub(crate) const STACK_HEADER: &str = "Stack (most recent call first):\n";
pub(crate) const CURRENT_THREAD_PREFIX: &str = "Current thread 0x";
pub(crate) const THREAD_PREFIX: &str = "Thread 0x";
pub(crate) const THREAD_HEADER_SUFFIX: &str = " (most recent call first):\n";
pub(crate) const GARBAGE_COLLECTING: &str = "  Garbage-collecting\n";
pub(crate) const NO_PYTHON_FRAME: &str = "  <no Python frame>\n";
pub(crate) const TRUNCATED_FRAMES: &str = "  ...\n";
pub(crate) const TRUNCATED_THREADS: &str = "...\n";
pub(crate) const ELLIPSIS: &str = "...";

