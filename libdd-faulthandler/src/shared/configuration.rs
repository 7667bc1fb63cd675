// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use super::error::FaultHandlerError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the fatal signal handlers dump and where they run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultHandlerConfiguration {
    /// Dump every registered thread rather than only the faulting one.
    all_threads: bool,
    create_alt_stack: bool,
    use_alt_stack: bool,
}

impl Default for FaultHandlerConfiguration {
    fn default() -> Self {
        Self {
            all_threads: true,
            create_alt_stack: true,
            use_alt_stack: true,
        }
    }
}

impl FaultHandlerConfiguration {
    pub fn new(
        all_threads: bool,
        create_alt_stack: bool,
        use_alt_stack: bool,
    ) -> Result<Self, FaultHandlerError> {
        // Requesting to create, but not use, the altstack is considered paradoxical.
        if create_alt_stack && !use_alt_stack {
            return Err(FaultHandlerError::AltStack(
                "Cannot create an altstack without using it".to_string(),
            ));
        }
        Ok(Self {
            all_threads,
            create_alt_stack,
            use_alt_stack,
        })
    }

    /// The default configuration, dumping either all threads or only the faulting one.
    pub fn with_all_threads(all_threads: bool) -> Self {
        Self {
            all_threads,
            ..Default::default()
        }
    }

    pub fn all_threads(&self) -> bool {
        self.all_threads
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }
}

/// How a user-registered signal dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSignalConfiguration {
    pub all_threads: bool,
    /// Call the handler that was installed before registration after dumping.
    pub chain: bool,
}

impl Default for UserSignalConfiguration {
    fn default() -> Self {
        Self {
            all_threads: true,
            chain: false,
        }
    }
}

/// When and how often the watchdog dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogConfiguration {
    timeout: Duration,
    repeat: bool,
    exit: bool,
}

impl WatchdogConfiguration {
    pub fn new(timeout: Duration, repeat: bool, exit: bool) -> Result<Self, FaultHandlerError> {
        if timeout.is_zero() {
            return Err(FaultHandlerError::InvalidTimeout(
                "timeout must be greater than 0",
            ));
        }
        if timeout.as_micros() > u64::MAX as u128 {
            return Err(FaultHandlerError::InvalidTimeout("timeout value is too large"));
        }
        Ok(Self {
            timeout,
            repeat,
            exit,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn repeat(&self) -> bool {
        self.repeat
    }

    /// Whether the process is terminated right after the first dump.
    pub fn exit(&self) -> bool {
        self.exit
    }
}
