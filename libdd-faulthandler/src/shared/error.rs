// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Configuration errors reported synchronously by the public API.
///
/// Nothing in this enum is ever produced from inside a signal handler: failures while dumping are
/// swallowed so that the process keeps heading towards its default termination.
#[derive(Debug, Error)]
pub enum FaultHandlerError {
    #[error("Invalid sink (fd {fd}): {reason}")]
    InvalidSink { fd: i32, reason: &'static str },
    #[error("Signal {0} cannot be registered, use enable() instead")]
    SignalCannotBeRegistered(i32),
    #[error("Signal number {0} out of range")]
    SignalOutOfRange(i32),
    #[error("Invalid timeout: {0}")]
    InvalidTimeout(&'static str),
    #[error("Failed to set up the alternate signal stack: {0}")]
    AltStack(String),
    #[error("Failed to spawn the watchdog thread: {0}")]
    WatchdogSpawn(std::io::Error),
    #[error("Failed to write the dump: {0}")]
    Write(#[from] std::io::Error),
    #[error(transparent)]
    Registry(#[from] crate::runtime::RegistryError),
    #[cfg(unix)]
    #[error("System call failed: {0}")]
    Sys(#[from] nix::Error),
    #[cfg(windows)]
    #[error("Failed to install the exception handler")]
    ExceptionHandler,
}
