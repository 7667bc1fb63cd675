// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod exception_handler;

pub(crate) use exception_handler::{install_exception_handler, uninstall_exception_handler};
