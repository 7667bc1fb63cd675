// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Interned metadata of a piece of interpreted code.
///
/// The registry hands out `&'static CodeLocation`s to signal handlers running on other threads, so
/// they must never be freed. Hosts typically declare them as `static`s for builtins and use
/// [`CodeLocation::leak`] when compiling user code.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct CodeLocation {
    pub function_name: &'static str,
    pub source: &'static str,
}

impl CodeLocation {
    pub const fn new(function_name: &'static str, source: &'static str) -> Self {
        Self {
            function_name,
            source,
        }
    }

    /// Interns a dynamically built location for the rest of the process' lifetime.
    pub fn leak(function_name: impl Into<String>, source: impl Into<String>) -> &'static Self {
        let function_name: &'static str = Box::leak(function_name.into().into_boxed_str());
        let source: &'static str = Box::leak(source.into().into_boxed_str());
        Box::leak(Box::new(Self::new(function_name, source)))
    }
}

/// One frame of an interpreter call stack, as captured at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub function_name: &'static str,
    pub source: &'static str,
    pub line: u32,
}

impl Frame {
    pub fn new(code: &'static CodeLocation, line: u32) -> Self {
        Self {
            function_name: code.function_name,
            source: code.source,
            line,
        }
    }
}

/// The call stack of one thread, innermost frame first.
///
/// `truncated` is set when the thread was deeper than [`crate::MAX_FRAME_DEPTH`] frames; the
/// outermost frames are the ones missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSnapshot {
    pub thread_id: u64,
    pub is_current: bool,
    pub frames: Vec<Frame>,
    pub truncated: bool,
}
