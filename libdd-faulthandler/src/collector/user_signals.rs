// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dumps on signals chosen by the user, such as SIGUSR1. These are not faults: after the dump the
//! process keeps running.

use super::atomguard::AtomGuard;
use super::dump_target::DumpTarget;
use super::emitters::emit_dump;
use super::signal_handler_manager::{
    alt_stack_created, fault_name, install_raw_handler, SavedAction, MAX_SIGNALS,
};
use crate::runtime::gc_collecting;
use crate::shared::configuration::UserSignalConfiguration;
use crate::shared::error::FaultHandlerError;
use crate::shared::sink::Sink;
use libc::{c_int, c_void, siginfo_t};
use nix::errno::Errno;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU64};

struct UserSignal {
    target: DumpTarget,
    chain: AtomicBool,
    previous: SavedAction,
}

impl UserSignal {
    const fn new() -> Self {
        Self {
            target: DumpTarget::new(),
            chain: AtomicBool::new(false),
            previous: SavedAction::new(),
        }
    }
}

static USER_SIGNALS: [UserSignal; MAX_SIGNALS] = [const { UserSignal::new() }; MAX_SIGNALS];

// Chained handlers run with the signal unblocked, so the dump guards against itself.
static DUMPING: AtomicU64 = AtomicU64::new(0);

/// Rejects the signals `enable` owns, and numbers outside the signal table.
pub(crate) fn check_signum(signum: c_int) -> Result<(), FaultHandlerError> {
    if fault_name(signum).is_some() {
        return Err(FaultHandlerError::SignalCannotBeRegistered(signum));
    }
    if signum < 1 || signum as usize >= MAX_SIGNALS {
        return Err(FaultHandlerError::SignalOutOfRange(signum));
    }
    Ok(())
}

fn handler_flags(chain: bool) -> c_int {
    let mut flags = libc::SA_RESTART;
    if chain {
        // The previous handler is raised from inside ours.
        flags |= libc::SA_NODEFER;
    }
    if alt_stack_created() {
        flags |= libc::SA_ONSTACK;
    }
    flags
}

/// Installs the dump handler for `signum`. Registering an already registered signal keeps the
/// recorded previous action, so it is always the one installed by someone else.
///
/// PRECONDITIONS:
///     `signum` passed `check_signum`.
/// SAFETY:
///     Must be called with the configuration lock held.
/// ATOMICITY:
///     The target is published before the handler is installed: a signal arriving during the call
///     runs either the previous action or a fully configured handler. A re-registration swaps the
///     target and flags in place, and never reinstates the previous action in between.
pub(crate) fn register(
    signum: c_int,
    sink: Sink,
    config: UserSignalConfiguration,
) -> Result<(), FaultHandlerError> {
    let slot = &USER_SIGNALS[signum as usize];
    let was_installed = slot.previous.is_installed();
    if !was_installed {
        // SAFETY: the configuration lock is held, and the slot is not installed.
        unsafe { slot.previous.capture(signum)? };
    }
    slot.chain.store(config.chain, SeqCst);
    slot.target.set(sink, config.all_threads);
    slot.previous.mark_installed();
    if let Err(e) = install_raw_handler(signum, handle_user_signal, handler_flags(config.chain)) {
        // A failed re-registration leaves the old handler in place, now with the new target.
        if !was_installed {
            slot.previous.mark_uninstalled();
            slot.target.clear();
        }
        return Err(e.into());
    }
    Ok(())
}

/// Restores the action recorded by `register`. Returns whether `signum` was registered.
///
/// SAFETY:
///     Must be called with the configuration lock held.
pub(crate) fn unregister(signum: c_int) -> bool {
    let slot = &USER_SIGNALS[signum as usize];
    let restored = slot.previous.restore(signum);
    slot.target.clear();
    restored
}

#[cfg(test)]
fn is_registered(signum: c_int) -> bool {
    USER_SIGNALS
        .get(signum as usize)
        .is_some_and(|slot| slot.previous.is_installed())
}

extern "C" fn handle_user_signal(signum: c_int, _sig_info: *mut siginfo_t, _uc: *mut c_void) {
    // The interrupted code may be about to read errno.
    let saved_errno = Errno::last_raw();
    let Some(slot) = USER_SIGNALS.get(signum as usize) else {
        return;
    };
    if let Some(target) = slot.target.load() {
        if let Ok(_guard) = AtomGuard::new(&DUMPING) {
            let _ = emit_dump(&mut target.writer(), target.all_threads, gc_collecting());
        }
    }
    if slot.chain.load(SeqCst) {
        // Put the previous action back and raise: with SA_NODEFER it runs before raise returns.
        // Then install ourselves again.
        slot.previous.reinstate(signum);
        Errno::set_raw(saved_errno);
        // SAFETY: raise is async-signal-safe.
        unsafe { libc::raise(signum) };
        if slot.previous.is_installed() {
            let _ = install_raw_handler(signum, handle_user_signal, handler_flags(true));
        }
    }
    Errno::set_raw(saved_errno);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{enter_frame, register_current_thread, CodeLocation};
    use serial_test::serial;
    use std::io::{Read, Seek};
    use std::sync::Arc;

    #[test]
    fn test_check_signum() {
        assert!(matches!(
            check_signum(libc::SIGSEGV),
            Err(FaultHandlerError::SignalCannotBeRegistered(_))
        ));
        assert!(matches!(
            check_signum(0),
            Err(FaultHandlerError::SignalOutOfRange(0))
        ));
        assert!(matches!(
            check_signum(MAX_SIGNALS as c_int),
            Err(FaultHandlerError::SignalOutOfRange(_))
        ));
        check_signum(libc::SIGUSR1).unwrap();
    }

    #[test]
    #[serial(user_signals)]
    #[cfg_attr(miri, ignore)]
    fn test_register_dump_and_unregister() {
        let mut file = tempfile::tempfile().unwrap();
        let sink = Sink::from_file(&file).unwrap();
        let config = UserSignalConfiguration {
            all_threads: false,
            chain: false,
        };
        register(libc::SIGUSR2, sink, config).unwrap();
        assert!(is_registered(libc::SIGUSR2));
        // Re-registering replaces the registration rather than chaining to ourselves.
        register(libc::SIGUSR2, sink, config).unwrap();
        register(libc::SIGUSR2, sink, config).unwrap();

        // SAFETY: the handler only dumps; SIGUSR2 is handled synchronously by the raising thread.
        unsafe { libc::raise(libc::SIGUSR2) };

        assert!(unregister(libc::SIGUSR2));
        assert!(!unregister(libc::SIGUSR2));
        assert!(!is_registered(libc::SIGUSR2));

        file.rewind().unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(
            contents,
            "Stack (most recent call first):\n  <no Python frame>\n"
        );
    }

    #[test]
    #[serial(user_signals)]
    #[cfg_attr(miri, ignore)]
    fn test_reregister_while_signals_arrive() {
        let file = tempfile::tempfile().unwrap();
        let sink = Sink::from_file(&file).unwrap();
        let config = UserSignalConfiguration {
            all_threads: false,
            chain: false,
        };
        register(libc::SIGUSR2, sink, config).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let sender_stop = Arc::clone(&stop);
        // raise() targets the sending thread itself, so no signal is left pending once it stops.
        let sender = std::thread::spawn(move || {
            let mut sent = 0u64;
            while !sender_stop.load(SeqCst) {
                // SAFETY: SIGUSR2 stays registered until the sender is joined.
                unsafe { libc::raise(libc::SIGUSR2) };
                sent += 1;
            }
            sent
        });
        // Any window with the default action in place would kill the test process.
        for _ in 0..20_000 {
            register(libc::SIGUSR2, sink, config).unwrap();
        }
        stop.store(true, SeqCst);
        let sent = sender.join().unwrap();
        assert!(unregister(libc::SIGUSR2));
        assert!(sent > 0);
    }

    #[test]
    #[serial(user_signals)]
    #[cfg_attr(miri, ignore)]
    fn test_dump_all_threads_on_signal() {
        static HANDLE: CodeLocation = CodeLocation::new("handle", "server.py");
        let _registration = register_current_thread().unwrap();
        let _frame = enter_frame(&HANDLE, 17);
        let mut file = tempfile::tempfile().unwrap();
        let sink = Sink::from_file(&file).unwrap();
        register(libc::SIGUSR2, sink, UserSignalConfiguration::default()).unwrap();

        // SAFETY: the handler only dumps; SIGUSR2 is handled synchronously by the raising thread.
        unsafe { libc::raise(libc::SIGUSR2) };
        assert!(unregister(libc::SIGUSR2));

        file.rewind().unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        let current = regex::Regex::new(
            r#"(?m)^Current thread 0x[0-9a-f]{16} \(most recent call first\):\n  File "server.py", line 17 in handle\n"#,
        )
        .unwrap();
        assert!(current.is_match(&contents), "{contents}");
        assert!(!contents.starts_with("Stack"), "{contents}");
    }
}
