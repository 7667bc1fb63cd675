// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod api;
#[cfg(unix)]
mod atomguard;
mod crash_handler;
mod dump_target;
pub mod emitters;
#[cfg(unix)]
mod signal_handler_manager;
#[cfg(unix)]
mod user_signals;
mod watchdog;

#[cfg(all(windows, feature = "collector_windows"))]
pub(crate) use crash_handler::{report_fault, unusual_runtime_state};
