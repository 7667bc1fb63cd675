// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::shared::sink::{Sink, SinkWriter};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicI32};

const NO_FD: i32 = -1;

/// Where a handler dumps, and how much. Stored as atomics so a signal handler can read it without
/// locking; a cleared target reads as `None`.
pub(crate) struct DumpTarget {
    fd: AtomicI32,
    all_threads: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LoadedTarget {
    pub fd: i32,
    pub all_threads: bool,
}

impl LoadedTarget {
    pub fn writer(&self) -> SinkWriter {
        SinkWriter::from_fd(self.fd)
    }
}

impl DumpTarget {
    pub(crate) const fn new() -> Self {
        Self {
            fd: AtomicI32::new(NO_FD),
            all_threads: AtomicBool::new(true),
        }
    }

    /// `all_threads` is stored first, so a handler that sees the new fd also sees the new mode.
    pub(crate) fn set(&self, sink: Sink, all_threads: bool) {
        self.all_threads.store(all_threads, SeqCst);
        self.fd.store(sink.fd(), SeqCst);
    }

    pub(crate) fn clear(&self) {
        self.fd.store(NO_FD, SeqCst);
    }

    pub(crate) fn load(&self) -> Option<LoadedTarget> {
        let fd = self.fd.load(SeqCst);
        if fd == NO_FD {
            return None;
        }
        Some(LoadedTarget {
            fd,
            all_threads: self.all_threads.load(SeqCst),
        })
    }
}
