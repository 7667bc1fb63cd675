// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::crash_handler::FATAL_TARGET;
use super::emitters::{emit_dump, emit_extension_modules, emit_fatal_header, EmitterError};
use super::watchdog::Watchdog;
use crate::runtime::{gc_collecting, runtime_state};
use crate::shared::configuration::{FaultHandlerConfiguration, WatchdogConfiguration};
use crate::shared::error::FaultHandlerError;
use crate::shared::sink::{Sink, SinkWriter};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[cfg(unix)]
use super::{signal_handler_manager, user_signals};
#[cfg(unix)]
use crate::shared::configuration::UserSignalConfiguration;

/// Configuration shared by every public entry point. Signal handlers never touch it: what they
/// need is published through atomics before they are installed.
#[derive(Debug)]
struct FaultHandlerState {
    enabled: bool,
    watchdog: Option<Watchdog>,
}

static STATE: Mutex<FaultHandlerState> = Mutex::new(FaultHandlerState {
    enabled: false,
    watchdog: None,
});

fn lock_state() -> MutexGuard<'static, FaultHandlerState> {
    // The state stays consistent even if a holder panicked: every field is updated last.
    STATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(unix)]
fn install_fatal_handlers(config: &FaultHandlerConfiguration) -> Result<(), FaultHandlerError> {
    signal_handler_manager::install_fatal_handlers(config)
}

#[cfg(windows)]
fn install_fatal_handlers(_config: &FaultHandlerConfiguration) -> Result<(), FaultHandlerError> {
    #[cfg(feature = "collector_windows")]
    crate::collector_windows::install_exception_handler()?;
    Ok(())
}

/// Async-signal-safe.
fn uninstall_fatal_handlers() {
    #[cfg(unix)]
    signal_handler_manager::uninstall_fatal_handlers();
    #[cfg(all(windows, feature = "collector_windows"))]
    crate::collector_windows::uninstall_exception_handler();
}

/// Dumps the interpreter stacks to `sink` when the process receives a fatal signal (SIGSEGV,
/// SIGFPE, SIGABRT, SIGBUS, SIGILL), or a fatal exception on Windows.
///
/// Calling it again while enabled only replaces the sink and the `all_threads` setting: the
/// handlers recorded as "previous" stay those that were installed before the first call.
///
/// PRECONDITIONS:
///     The file behind `sink` stays open until `disable` is called.
/// ATOMICITY:
///     Serialized with every other configuration function. A fault landing while the handlers are
///     being installed runs either the previous handler or ours, fully configured.
pub fn enable(sink: Sink, config: FaultHandlerConfiguration) -> Result<(), FaultHandlerError> {
    sink.validate()?;
    let mut state = lock_state();
    FATAL_TARGET.set(sink, config.all_threads());
    if state.enabled {
        debug!(fd = sink.fd(), "Fault handler already enabled, replaced its sink");
        return Ok(());
    }
    if let Err(e) = install_fatal_handlers(&config) {
        FATAL_TARGET.clear();
        return Err(e);
    }
    state.enabled = true;
    debug!(fd = sink.fd(), all_threads = config.all_threads(), "Fault handler enabled");
    Ok(())
}

/// Restores the handlers that were installed before `enable`. Does nothing when not enabled.
pub fn disable() {
    let mut state = lock_state();
    if !state.enabled {
        return;
    }
    uninstall_fatal_handlers();
    FATAL_TARGET.clear();
    state.enabled = false;
    debug!("Fault handler disabled");
}

pub fn is_enabled() -> bool {
    lock_state().enabled
}

/// Dumps the stack of the calling thread, or of every registered thread, to `sink`.
pub fn dump_traceback(sink: Sink, all_threads: bool) -> Result<(), FaultHandlerError> {
    sink.validate()?;
    emit_dump(&mut sink.writer(), all_threads, gc_collecting())?;
    Ok(())
}

/// Dumps every registered thread to `sink` after `config.timeout()`, then again every timeout if
/// `config.repeat()`. With `config.exit()`, the process exits with status 1 after the dump.
///
/// Replaces the current timer, if any: the previous watchdog thread is stopped and joined first.
pub fn dump_traceback_later(
    sink: Sink,
    config: WatchdogConfiguration,
) -> Result<(), FaultHandlerError> {
    sink.validate()?;
    let mut state = lock_state();
    // Drop (cancel and join) before spawning, so two watchdogs never share the sink.
    drop(state.watchdog.take());
    state.watchdog = Some(Watchdog::spawn(sink, config)?);
    debug!(
        fd = sink.fd(),
        timeout = ?config.timeout(),
        repeat = config.repeat(),
        exit = config.exit(),
        "Watchdog armed"
    );
    Ok(())
}

/// Cancels the timer set by `dump_traceback_later`. Does nothing if none is armed.
///
/// ATOMICITY:
///     The watchdog is stopped and joined with the configuration lock held, so once this returns
///     it writes nothing more, and a concurrent `dump_traceback_later` arms its timer only after.
pub fn cancel_dump_traceback_later() {
    let mut state = lock_state();
    if let Some(watchdog) = state.watchdog.take() {
        let fired = !watchdog.is_armed();
        drop(watchdog);
        debug!(fired, "Watchdog cancelled");
    }
}

/// Dumps to `sink` whenever the process receives `signum`. With `config.chain`, the handler that
/// was installed before registration is called after the dump.
///
/// Registering a signal again replaces the previous registration.
#[cfg(unix)]
pub fn register(
    signum: i32,
    sink: Sink,
    config: UserSignalConfiguration,
) -> Result<(), FaultHandlerError> {
    user_signals::check_signum(signum)?;
    sink.validate()?;
    let _state = lock_state();
    user_signals::register(signum, sink, config)?;
    debug!(signum, fd = sink.fd(), chain = config.chain, "Registered user signal");
    Ok(())
}

/// Restores the handler `signum` had before `register`. Returns whether it was registered.
#[cfg(unix)]
pub fn unregister(signum: i32) -> Result<bool, FaultHandlerError> {
    user_signals::check_signum(signum)?;
    let _state = lock_state();
    let registered = user_signals::unregister(signum);
    debug!(signum, registered, "Unregistered user signal");
    Ok(registered)
}

/// Reports a fatal error detected by the interpreter itself, then aborts.
///
/// The report goes to the fault handler's sink if enabled, otherwise to stderr:
/// `Fatal Python error: [<func>: ]<message>`, the runtime state, a stack dump and the extension
/// modules. The fault handlers are removed before aborting, so SIGABRT is not reported again.
pub fn fatal_error(func: Option<&str>, message: &str) -> ! {
    let (mut w, all_threads) = match FATAL_TARGET.load() {
        Some(target) => (target.writer(), target.all_threads),
        None => (Sink::stderr().writer(), true),
    };
    let _ = emit_fatal_error(&mut w, func, message, all_threads);
    uninstall_fatal_handlers();
    std::process::abort()
}

fn emit_fatal_error(
    w: &mut SinkWriter,
    func: Option<&str>,
    message: &str,
    all_threads: bool,
) -> Result<(), EmitterError> {
    emit_fatal_header(w, func, message, Some(runtime_state()))?;
    emit_dump(w, all_threads, gc_collecting())?;
    emit_extension_modules(w)?;
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::runtime::{enter_frame, register_current_thread, CodeLocation};
    use serial_test::serial;
    use std::io::{Read, Seek};
    use std::time::Duration;

    static RUN: CodeLocation = CodeLocation::new("run", "worker.py");

    fn read_all(file: &mut std::fs::File) -> String {
        file.rewind().unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        contents
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_dump_traceback_current_thread() {
        let _registration = register_current_thread().unwrap();
        let _frame = enter_frame(&RUN, 3);
        let mut file = tempfile::tempfile().unwrap();
        dump_traceback(Sink::from_file(&file).unwrap(), false).unwrap();
        assert_eq!(
            read_all(&mut file),
            "Stack (most recent call first):\n  File \"worker.py\", line 3 in run\n"
        );
    }

    #[test]
    #[serial(watchdog)]
    #[cfg_attr(miri, ignore)]
    fn test_cancel_is_idempotent() {
        cancel_dump_traceback_later();
        let file = tempfile::tempfile().unwrap();
        let config = WatchdogConfiguration::new(Duration::from_secs(60), false, false).unwrap();
        dump_traceback_later(Sink::from_file(&file).unwrap(), config).unwrap();
        // Re-arming replaces the timer.
        dump_traceback_later(Sink::from_file(&file).unwrap(), config).unwrap();
        cancel_dump_traceback_later();
        cancel_dump_traceback_later();
    }

    #[test]
    #[serial(watchdog)]
    #[cfg_attr(miri, ignore)]
    fn test_cancel_racing_with_rearm_leaves_no_timer() {
        let mut file = tempfile::tempfile().unwrap();
        let sink = Sink::from_file(&file).unwrap();
        let config = WatchdogConfiguration::new(Duration::from_millis(1), true, false).unwrap();
        let canceller = std::thread::spawn(|| {
            for _ in 0..200 {
                cancel_dump_traceback_later();
            }
        });
        for _ in 0..200 {
            dump_traceback_later(sink, config).unwrap();
        }
        canceller.join().unwrap();
        cancel_dump_traceback_later();

        let written = read_all(&mut file).len();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(read_all(&mut file).len(), written);
    }

    #[test]
    #[serial(user_signals)]
    fn test_register_rejects_fatal_signals() {
        let err = register(
            libc::SIGSEGV,
            Sink::stderr(),
            UserSignalConfiguration::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("use enable() instead"), "{err}");
        assert!(matches!(
            unregister(libc::SIGABRT),
            Err(FaultHandlerError::SignalCannotBeRegistered(_))
        ));
        assert!(matches!(
            unregister(0),
            Err(FaultHandlerError::SignalOutOfRange(0))
        ));
    }

    #[test]
    #[serial(user_signals)]
    #[cfg_attr(miri, ignore)]
    fn test_register_sigkill_fails() {
        let err = register(
            libc::SIGKILL,
            Sink::stderr(),
            UserSignalConfiguration::default(),
        )
        .unwrap_err();
        assert!(matches!(err, FaultHandlerError::Sys(_)), "{err}");
        assert!(!unregister(libc::SIGKILL).unwrap());
    }

    #[test]
    fn test_disable_when_not_enabled() {
        // Installing the fatal handlers in the test binary would turn any test failure into a
        // dump; enabling is covered by the test app instead.
        disable();
        assert!(!is_enabled());
    }
}
