// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::dump_target::DumpTarget;
use super::emitters::{emit_dump, emit_extension_modules, EmitterError};
use crate::runtime::{gc_collecting, runtime_state, RuntimeState};
use crate::shared::sink::SinkWriter;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::SeqCst;

// Note that this file makes use the following async-signal safe functions in a signal handler.
// <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
// - raise
// - sigaction
// - write

/// Where fatal faults are reported. Set by `enable`, cleared by `disable`.
pub(crate) static FATAL_TARGET: DumpTarget = DumpTarget::new();

/// The runtime state line is only worth printing when the runtime is not in its steady state.
pub(crate) fn unusual_runtime_state() -> Option<RuntimeState> {
    let state = runtime_state();
    (state != RuntimeState::Initialized).then_some(state)
}

/// Writes a fatal fault report to the fatal target: `emit_header`'s lines, the stack dump, and
/// the extension modules line.
///
/// One-time guard: a second fault (nested, on another thread, or raised by a chained handler as
/// it aborts) writes nothing, so the report that matters is not buried or interleaved.
pub(crate) fn report_fault(
    emit_header: impl FnOnce(&mut SinkWriter) -> Result<(), EmitterError>,
) {
    static NUM_TIMES_CALLED: AtomicU64 = AtomicU64::new(0);
    if NUM_TIMES_CALLED.fetch_add(1, SeqCst) > 0 {
        return;
    }
    let Some(target) = FATAL_TARGET.load() else {
        return;
    };
    let _ = emit_fault_report(&mut target.writer(), target.all_threads, emit_header);
}

fn emit_fault_report(
    w: &mut SinkWriter,
    all_threads: bool,
    emit_header: impl FnOnce(&mut SinkWriter) -> Result<(), EmitterError>,
) -> Result<(), EmitterError> {
    emit_header(w)?;
    emit_dump(w, all_threads, gc_collecting())?;
    emit_extension_modules(w)?;
    Ok(())
}

#[cfg(unix)]
pub(crate) use self::unix::handle_fatal_signal;

#[cfg(unix)]
mod unix {
    use super::*;
    use crate::collector::emitters::emit_fatal_header;
    use crate::collector::signal_handler_manager::{fault_name, uninstall_fatal_handler};
    use libc::{c_int, c_void, siginfo_t};

    pub(crate) extern "C" fn handle_fatal_signal(
        signum: c_int,
        sig_info: *mut siginfo_t,
        _ucontext: *mut c_void,
    ) {
        if let Some(name) = fault_name(signum) {
            report_fault(|w| emit_fatal_header(w, None, name, unusual_runtime_state()));
        }
        // Put the previous action back and raise again. Thanks to SA_NODEFER the signal is
        // delivered to it right away: the default action kills the process, and a user handler
        // runs. For a real fault, returning re-executes the faulting instruction anyway.
        uninstall_fatal_handler(signum);
        // SAFETY: raise is async-signal-safe.
        unsafe { libc::raise(signum) };
        // A signal sent with kill/raise has no faulting instruction to re-execute. If the
        // previous handler returned (std's SIGSEGV handler does for anything but a guard page
        // hit), fall back to the default action so the process still dies.
        if was_sent(sig_info) {
            // SAFETY: signal and raise are async-signal-safe.
            unsafe {
                libc::signal(signum, libc::SIG_DFL);
                libc::raise(signum);
            }
        }
    }

    /// Whether the signal came from kill/raise/sigqueue rather than from the hardware.
    fn was_sent(sig_info: *const siginfo_t) -> bool {
        // SAFETY: the kernel passes a valid siginfo to SA_SIGINFO handlers; null is tolerated.
        match unsafe { sig_info.as_ref() } {
            Some(info) => info.si_code <= 0,
            None => true,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::set_runtime_state;
    use serial_test::serial;

    #[test]
    #[serial(runtime_state)]
    fn test_runtime_state_only_when_unusual() {
        assert_eq!(unusual_runtime_state(), None);
        set_runtime_state(RuntimeState::Finalizing);
        assert_eq!(unusual_runtime_state(), Some(RuntimeState::Finalizing));
        set_runtime_state(RuntimeState::Initialized);
    }
}
