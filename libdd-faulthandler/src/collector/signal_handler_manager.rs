// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::crash_handler::handle_fatal_signal;
use crate::shared::configuration::FaultHandlerConfiguration;
use crate::shared::error::FaultHandlerError;
use libc::{
    c_int, c_void, mmap, munmap, sigaltstack, siginfo_t, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE,
    PROT_READ, PROT_WRITE, SIGSTKSZ,
};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, Signal};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;

// Linux seems to have the most, supporting up to 64 inclusive
// https://man7.org/linux/man-pages/man7/signal.7.html
pub(crate) const MAX_SIGNALS: usize = 65;

pub(crate) struct FaultSignal {
    pub signal: Signal,
    pub name: &'static str,
}

pub(crate) const FAULT_SIGNALS: [FaultSignal; 5] = [
    FaultSignal {
        signal: Signal::SIGBUS,
        name: "Bus error",
    },
    FaultSignal {
        signal: Signal::SIGILL,
        name: "Illegal instruction",
    },
    FaultSignal {
        signal: Signal::SIGFPE,
        name: "Floating-point exception",
    },
    FaultSignal {
        signal: Signal::SIGABRT,
        name: "Aborted",
    },
    FaultSignal {
        signal: Signal::SIGSEGV,
        name: "Segmentation fault",
    },
];

/// The fault name printed for a fatal signal, or `None` if the signal is not one `enable` covers.
pub(crate) fn fault_name(signum: c_int) -> Option<&'static str> {
    FAULT_SIGNALS
        .iter()
        .find(|fault| fault.signal as c_int == signum)
        .map(|fault| fault.name)
}

/// A signal action replaced by one of our handlers.
///
/// `previous` is written by `capture` while `installed` is false, under the configuration lock,
/// and only read by `restore`/`reinstate` once `installed` is true. Signal handlers may call
/// `restore` concurrently with the configuration thread; the swap on `installed` decides which of
/// them actually restores.
pub(crate) struct SavedAction {
    installed: AtomicBool,
    previous: UnsafeCell<MaybeUninit<libc::sigaction>>,
}

// SAFETY: see the access discipline above.
unsafe impl Sync for SavedAction {}

impl SavedAction {
    pub(crate) const fn new() -> Self {
        Self {
            installed: AtomicBool::new(false),
            previous: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    pub(crate) fn is_installed(&self) -> bool {
        self.installed.load(SeqCst)
    }

    /// Records the action currently installed for `signum`.
    ///
    /// SAFETY:
    ///     Must hold the configuration lock, and the action must not be installed.
    pub(crate) unsafe fn capture(&self, signum: c_int) -> Result<(), FaultHandlerError> {
        debug_assert!(!self.is_installed());
        let mut old = MaybeUninit::<libc::sigaction>::zeroed();
        if libc::sigaction(signum, ptr::null(), old.as_mut_ptr()) != 0 {
            return Err(nix::Error::last().into());
        }
        *self.previous.get() = old;
        Ok(())
    }

    pub(crate) fn mark_installed(&self) {
        self.installed.store(true, SeqCst);
    }

    pub(crate) fn mark_uninstalled(&self) {
        self.installed.store(false, SeqCst);
    }

    /// Puts the recorded action back. Async-signal-safe. Returns whether anything was restored.
    pub(crate) fn restore(&self, signum: c_int) -> bool {
        if !self.installed.swap(false, SeqCst) {
            return false;
        }
        // SAFETY: `previous` was captured before `installed` was set.
        unsafe { libc::sigaction(signum, (*self.previous.get()).as_ptr(), ptr::null_mut()) };
        true
    }

    /// Puts the recorded action back while staying marked as installed, so that a chained call
    /// can be followed by reinstalling our handler. Async-signal-safe.
    pub(crate) fn reinstate(&self, signum: c_int) {
        if self.is_installed() {
            // SAFETY: `previous` was captured before `installed` was set.
            unsafe { libc::sigaction(signum, (*self.previous.get()).as_ptr(), ptr::null_mut()) };
        }
    }
}

static FATAL_ACTIONS: [SavedAction; 5] = [const { SavedAction::new() }; 5];
static ALT_STACK_CREATED: AtomicBool = AtomicBool::new(false);

/// Whether our alternate signal stack exists. Handlers installed later may run on it too.
pub(crate) fn alt_stack_created() -> bool {
    ALT_STACK_CREATED.load(SeqCst)
}

/// Installs the fatal signal handlers, recording the actions they replace.
///
/// PRECONDITIONS:
///     The handlers must not currently be installed.
/// SAFETY:
///     Must be called with the configuration lock held.
/// ATOMICITY:
///     Each signal's previous action is recorded before our handler replaces it, so a fault
///     landing half-way through finds either the old handler, or ours with a valid chain target.
///     On failure, the handlers installed so far are removed again.
pub(crate) fn install_fatal_handlers(
    config: &FaultHandlerConfiguration,
) -> Result<(), FaultHandlerError> {
    if config.create_alt_stack() && !ALT_STACK_CREATED.load(SeqCst) {
        // Safety: This function has no documented preconditions.
        unsafe { create_alt_stack()? };
        ALT_STACK_CREATED.store(true, SeqCst);
    }

    // Stack overflows are reported as SIGSEGV on the faulting thread, whose stack is exhausted:
    // the handler can only run on the alternate stack.
    let extra_saflags = if config.use_alt_stack() {
        SaFlags::SA_ONSTACK
    } else {
        SaFlags::empty()
    };
    // SA_NODEFER lets the signal be re-raised from inside its own handler.
    let sig_action = SigAction::new(
        SigHandler::SigAction(handle_fatal_signal),
        SaFlags::SA_NODEFER | extra_saflags,
        signal::SigSet::empty(),
    );

    for (fault, saved) in FAULT_SIGNALS.iter().zip(FATAL_ACTIONS.iter()) {
        // SAFETY: the configuration lock is held, and the handlers are not installed.
        let installed = unsafe { saved.capture(fault.signal as c_int) }.and_then(|()| {
            saved.mark_installed();
            // SAFETY: `handle_fatal_signal` only uses async-signal-safe operations.
            unsafe { signal::sigaction(fault.signal, &sig_action) }
                .map(|_| ())
                .map_err(FaultHandlerError::from)
        });
        if let Err(e) = installed {
            saved.mark_uninstalled();
            uninstall_fatal_handlers();
            return Err(e);
        }
    }
    Ok(())
}

/// Restores every fatal signal action we replaced. Async-signal-safe and idempotent.
pub(crate) fn uninstall_fatal_handlers() {
    for (fault, saved) in FAULT_SIGNALS.iter().zip(FATAL_ACTIONS.iter()) {
        saved.restore(fault.signal as c_int);
    }
}

/// Restores the action we replaced for one fatal signal. Async-signal-safe.
pub(crate) fn uninstall_fatal_handler(signum: c_int) {
    for (fault, saved) in FAULT_SIGNALS.iter().zip(FATAL_ACTIONS.iter()) {
        if fault.signal as c_int == signum {
            saved.restore(signum);
        }
    }
}

/// Installs `handler` for `signum` with raw `sigaction`, which unlike `nix::sys::signal::Signal`
/// also covers real-time signals. Async-signal-safe.
pub(crate) fn install_raw_handler(
    signum: c_int,
    handler: extern "C" fn(c_int, *mut siginfo_t, *mut c_void),
    flags: c_int,
) -> Result<(), nix::Error> {
    // SAFETY: an all-zero sigaction is valid; every field we rely on is set below.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handler as usize;
    action.sa_flags = flags | libc::SA_SIGINFO;
    // SAFETY: the mask is a valid, owned sigset.
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    // SAFETY: `action` is fully initialized.
    if unsafe { libc::sigaction(signum, &action, ptr::null_mut()) } != 0 {
        return Err(nix::Error::last());
    }
    Ok(())
}

/// Allocates a signal altstack, and puts a guard page at the end.
/// Inspired by https://github.com/rust-lang/rust/pull/69969/files
///
/// The altstack is a per-thread setting: it is only installed for the calling thread.
unsafe fn create_alt_stack() -> Result<(), FaultHandlerError> {
    // The greater of 16 pages or SIGSTKSZ: the default SIGSTKSZ (8KB) is tight once the handler
    // and the chained handlers run on it.
    let page_size = page_size::get();
    let sigalstack_base_size = std::cmp::max(SIGSTKSZ, 16 * page_size);
    let mapping_size = sigalstack_base_size + page_size;
    let mapping = mmap(
        ptr::null_mut(),
        mapping_size,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANON,
        -1,
        0,
    );
    if mapping == MAP_FAILED {
        return Err(FaultHandlerError::AltStack(
            "failed to allocate an alternative stack".to_string(),
        ));
    }
    let guard_result = libc::mprotect(mapping, page_size, PROT_NONE);
    if guard_result != 0 {
        munmap(mapping, mapping_size);
        return Err(FaultHandlerError::AltStack(
            "failed to set up alternative stack guard page".to_string(),
        ));
    }
    let stackp = mapping.add(page_size);

    let stack = libc::stack_t {
        ss_sp: stackp,
        ss_flags: 0,
        ss_size: sigalstack_base_size,
    };
    let rval = sigaltstack(&stack, ptr::null_mut());
    if rval != 0 {
        munmap(mapping, mapping_size);
        return Err(FaultHandlerError::AltStack(format!(
            "sigaltstack failed {rval}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_max_signals() {
        assert!(MAX_SIGNALS as libc::c_int > libc::SIGRTMAX());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_alt_stack_is_installed_for_calling_thread() {
        std::thread::spawn(|| {
            unsafe { create_alt_stack() }.unwrap();
            let mut current = MaybeUninit::<libc::stack_t>::zeroed();
            assert_eq!(unsafe { sigaltstack(ptr::null(), current.as_mut_ptr()) }, 0);
            let current = unsafe { current.assume_init() };
            assert_eq!(current.ss_flags & libc::SS_DISABLE, 0);
            assert!(current.ss_size >= 16 * page_size::get());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_fault_names() {
        assert_eq!(fault_name(libc::SIGSEGV), Some("Segmentation fault"));
        assert_eq!(fault_name(libc::SIGABRT), Some("Aborted"));
        assert_eq!(fault_name(libc::SIGUSR1), None);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_saved_action_restores_once() {
        // SIGWINCH is ignored by default, so briefly replacing it is harmless.
        extern "C" fn noop(_: c_int, _: *mut siginfo_t, _: *mut c_void) {}
        let saved = SavedAction::new();
        unsafe { saved.capture(libc::SIGWINCH) }.unwrap();
        saved.mark_installed();
        install_raw_handler(libc::SIGWINCH, noop, 0).unwrap();

        assert!(saved.restore(libc::SIGWINCH));
        assert!(!saved.restore(libc::SIGWINCH));
        let mut current = MaybeUninit::<libc::sigaction>::zeroed();
        unsafe { libc::sigaction(libc::SIGWINCH, ptr::null(), current.as_mut_ptr()) };
        assert_eq!(
            unsafe { current.assume_init() }.sa_sigaction,
            libc::SIG_DFL
        );
    }
}
