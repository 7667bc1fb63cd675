// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collector::emitters::{emit_hex_padded, emit_runtime_state, EmitterError};
use crate::collector::{report_fault, unusual_runtime_state};
use crate::shared::error::FaultHandlerError;
use crate::shared::sink::SinkWriter;
use std::ffi::c_void;
use std::io::Write;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::SeqCst;
use windows::Win32::System::Diagnostics::Debug::{
    AddVectoredExceptionHandler, RemoveVectoredExceptionHandler, EXCEPTION_CONTINUE_SEARCH,
    EXCEPTION_POINTERS,
};

const WINDOWS_EXCEPTION_PREFIX: &str = "Windows fatal exception: ";

// Raised by the MSVC runtime for C++ `throw`, and by the CLR for managed exceptions. Both are
// routinely caught.
const MSC_CPP_EXCEPTION: u32 = 0xE06D7363;
const COM_RUNTIME_EXCEPTION: u32 = 0xE0434352;

const EXCEPTION_DESCRIPTIONS: [(u32, &str); 6] = [
    (0xC0000005, "access violation"),
    (0xC000008E, "float divide by zero"),
    (0xC0000091, "float overflow"),
    (0xC0000094, "int divide by zero"),
    (0xC0000006, "page error"),
    (0xC00000FD, "stack overflow"),
];

// Either null, or the handle returned by `AddVectoredExceptionHandler`.
static HANDLER: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());

/// Installs the vectored exception handler reporting fatal exceptions. Does nothing if it is
/// already installed.
pub(crate) fn install_exception_handler() -> Result<(), FaultHandlerError> {
    if !HANDLER.load(SeqCst).is_null() {
        return Ok(());
    }
    // SAFETY: `handle_exception` only writes to the sink and always continues the search.
    let handle = unsafe { AddVectoredExceptionHandler(1, Some(handle_exception)) };
    if handle.is_null() {
        return Err(FaultHandlerError::ExceptionHandler);
    }
    HANDLER.store(handle, SeqCst);
    Ok(())
}

pub(crate) fn uninstall_exception_handler() {
    let handle = HANDLER.swap(ptr::null_mut(), SeqCst);
    if !handle.is_null() {
        // SAFETY: the handle came from `AddVectoredExceptionHandler` and is removed only once.
        unsafe { RemoveVectoredExceptionHandler(handle) };
    }
}

/// Exceptions that are not errors, or that the code raising them expects to catch.
fn is_ignored(code: u32) -> bool {
    code & 0x8000_0000 == 0 || code == MSC_CPP_EXCEPTION || code == COM_RUNTIME_EXCEPTION
}

fn description(code: u32) -> Option<&'static str> {
    EXCEPTION_DESCRIPTIONS
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, description)| *description)
}

fn emit_exception_header(w: &mut SinkWriter, code: u32) -> Result<(), EmitterError> {
    w.write_all(WINDOWS_EXCEPTION_PREFIX.as_bytes())?;
    match description(code) {
        Some(description) => w.write_all(description.as_bytes())?,
        None => {
            w.write_all(b"code 0x")?;
            emit_hex_padded(w, code as u64, 8)?;
        }
    }
    w.write_all(b"\n")?;
    emit_runtime_state(w, unusual_runtime_state())
}

unsafe extern "system" fn handle_exception(exception_info: *mut EXCEPTION_POINTERS) -> i32 {
    // SAFETY: Windows guarantees exception_info is valid during exception handling
    let code = exception_info
        .as_ref()
        .and_then(|info| info.ExceptionRecord.as_ref())
        .map(|record| record.ExceptionCode.0 as u32);
    if let Some(code) = code.filter(|code| !is_ignored(*code)) {
        report_fault(|w| emit_exception_header(w, code));
    }
    // Let the process die the way it would have without us.
    EXCEPTION_CONTINUE_SEARCH
}
