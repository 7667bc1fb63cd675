// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::error::FaultHandlerError;
use std::io;

/// An already-open, write-only destination for stack dumps.
///
/// A `Sink` does not own its file descriptor: the caller must keep the underlying file open for as
/// long as the sink is installed (through [`crate::enable`], [`crate::register`] or
/// [`crate::dump_traceback_later`]). The fault handler never closes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sink {
    fd: i32,
}

impl Sink {
    /// The process' standard error.
    pub fn stderr() -> Self {
        Self { fd: 2 }
    }

    /// Wraps a raw file descriptor, checking that it is open and writable.
    pub fn from_raw_fd(fd: i32) -> Result<Self, FaultHandlerError> {
        validate_fd(fd)?;
        Ok(Self { fd })
    }

    /// Wraps the descriptor of an open file. The file must outlive the sink's installation.
    #[cfg(unix)]
    pub fn from_file(file: &impl std::os::fd::AsRawFd) -> Result<Self, FaultHandlerError> {
        Self::from_raw_fd(file.as_raw_fd())
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    /// An unbuffered writer over this sink.
    pub fn writer(&self) -> SinkWriter {
        SinkWriter { fd: self.fd }
    }

    /// Re-checks the descriptor. Used before installing a sink that was built a while ago.
    pub(crate) fn validate(&self) -> Result<(), FaultHandlerError> {
        validate_fd(self.fd)
    }
}

#[cfg(unix)]
fn validate_fd(fd: i32) -> Result<(), FaultHandlerError> {
    if fd < 0 {
        return Err(FaultHandlerError::InvalidSink {
            fd,
            reason: "file descriptor cannot be a negative integer",
        });
    }
    // SAFETY: F_GETFL only reads the descriptor flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(FaultHandlerError::InvalidSink {
            fd,
            reason: "file descriptor is closed",
        });
    }
    if flags & libc::O_ACCMODE == libc::O_RDONLY {
        return Err(FaultHandlerError::InvalidSink {
            fd,
            reason: "file descriptor is not writable",
        });
    }
    Ok(())
}

#[cfg(windows)]
fn validate_fd(fd: i32) -> Result<(), FaultHandlerError> {
    if fd < 0 {
        return Err(FaultHandlerError::InvalidSink {
            fd,
            reason: "file descriptor cannot be a negative integer",
        });
    }
    Ok(())
}

/// Writes straight to the file descriptor with `write(2)`: no buffering, no allocation, and
/// nothing is lost if the process dies right after a call returns.
#[derive(Debug)]
pub struct SinkWriter {
    fd: i32,
}

impl SinkWriter {
    pub(crate) fn from_fd(fd: i32) -> Self {
        Self { fd }
    }
}

impl io::Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: the buffer is valid for `buf.len()` bytes. A stale descriptor only makes the
        // call fail.
        #[cfg(unix)]
        let written = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
        #[cfg(windows)]
        let written = unsafe {
            libc::write(
                self.fd,
                buf.as_ptr().cast(),
                buf.len().min(u32::MAX as usize) as libc::c_uint,
            )
        };
        if written < 0 {
            // `write_all` retries on `ErrorKind::Interrupted`.
            return Err(io::Error::last_os_error());
        }
        Ok(written as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
