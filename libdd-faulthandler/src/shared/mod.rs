// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! This module holds constants/structures that are shared between the signal handlers, the
//! watchdog and the runtime registry.

pub(crate) mod configuration;
pub(crate) mod constants;
pub(crate) mod error;
pub(crate) mod platform;
pub(crate) mod sink;
