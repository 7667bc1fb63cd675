// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A small "interpreter" exercising the fault handler, driven by the integration tests.
//!
//! Usage: `faulthandler_test_app <mode> [output_file]`. Dumps go to `output_file` when given,
//! to stderr otherwise. Every mode runs with the main thread registered and two interpreter
//! frames on its stack: `func` at line 5, called from `<module>` at line 10.

#[cfg(not(unix))]
fn main() {}

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    unix::main()
}

#[cfg(unix)]
mod unix {
    use anyhow::{bail, Context};
    use libdd_faulthandler::{
        self as faulthandler, enter_frame, register_current_thread, CodeLocation,
        FaultHandlerConfiguration, RuntimeState, Sink, UserSignalConfiguration,
        WatchdogConfiguration,
    };
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use std::env;
    use std::fs::{File, OpenOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    static MODULE: CodeLocation = CodeLocation::new("<module>", "<string>");
    static FUNC: CodeLocation = CodeLocation::new("func", "<string>");
    static RUN: CodeLocation = CodeLocation::new("run", "<string>");

    const WATCHDOG_TIMEOUT: Duration = Duration::from_millis(500);

    #[inline(never)]
    unsafe fn segfault() {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            std::arch::asm!("mov eax, [0]", options(nostack));
        }

        #[cfg(target_arch = "aarch64")]
        {
            std::arch::asm!("mov x0, #0", "ldr x1, [x0]", options(nostack));
        }

        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
        {
            libc::raise(libc::SIGSEGV);
        }
    }

    #[inline(never)]
    #[allow(unconditional_recursion)]
    fn recurse(depth: u64) -> u64 {
        let buf = [depth as u8; 1024];
        std::hint::black_box(&buf);
        recurse(depth + 1) + std::hint::black_box(1)
    }

    fn raise(signal: Signal) -> anyhow::Result<()> {
        signal::raise(signal).with_context(|| format!("raising {signal}"))
    }

    static CHAINED_CALLS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn count_chained_call(_signum: libc::c_int) {
        CHAINED_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    fn init_logging() {
        if let Ok(filter) = env::var("FAULTHANDLER_TEST_LOG") {
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                .with_writer(std::io::stdout)
                .init();
        }
    }

    fn enable(sink: Sink, all_threads: bool) -> anyhow::Result<()> {
        faulthandler::enable(
            sink,
            FaultHandlerConfiguration::with_all_threads(all_threads),
        )
        .context("enabling the fault handler")
    }

    /// A registered interpreter thread, parked in `run` at line 22 until told to stop.
    fn spawn_waiter() -> anyhow::Result<(mpsc::Sender<()>, std::thread::JoinHandle<()>)> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let waiter = std::thread::Builder::new()
            .name("waiter".to_string())
            .spawn(move || {
                let registration = register_current_thread();
                let _frame = enter_frame(&RUN, 22);
                let _ = ready_tx.send(registration.is_ok());
                let _ = stop_rx.recv();
            })?;
        anyhow::ensure!(ready_rx.recv()?, "waiter failed to register");
        Ok((stop_tx, waiter))
    }

    fn run_mode(mode: &str, sink: Sink) -> anyhow::Result<()> {
        match mode {
            "sigsegv" => {
                enable(sink, true)?;
                unsafe { segfault() };
            }
            "sigsegv_single" => {
                enable(sink, false)?;
                unsafe { segfault() };
            }
            "sigsegv_raise" => {
                enable(sink, true)?;
                raise(Signal::SIGSEGV)?;
            }
            "sigabrt" => {
                enable(sink, true)?;
                std::process::abort();
            }
            "sigfpe" => {
                enable(sink, true)?;
                raise(Signal::SIGFPE)?;
            }
            "sigbus" => {
                enable(sink, true)?;
                raise(Signal::SIGBUS)?;
            }
            "sigill" => {
                enable(sink, true)?;
                raise(Signal::SIGILL)?;
            }
            "stack_overflow" => {
                enable(sink, true)?;
                std::hint::black_box(recurse(0));
            }
            "disable" => {
                enable(sink, true)?;
                faulthandler::disable();
                anyhow::ensure!(!faulthandler::is_enabled(), "still enabled");
                unsafe { segfault() };
            }
            "gc" => {
                enable(sink, true)?;
                faulthandler::set_gc_collecting(true);
                unsafe { segfault() };
            }
            "ext_modules" => {
                faulthandler::set_extension_modules(&["_testcapi", "numpy.core"]);
                enable(sink, true)?;
                unsafe { segfault() };
            }
            "finalizing" => {
                enable(sink, true)?;
                faulthandler::set_runtime_state(RuntimeState::Finalizing);
                unsafe { segfault() };
            }
            "threads_sigsegv" => {
                let (_stop, _waiter) = spawn_waiter()?;
                enable(sink, true)?;
                unsafe { segfault() };
            }
            "fatal_error" => {
                enable(sink, true)?;
                faulthandler::fatal_error(Some("func"), "xyz");
            }
            "fatal_error_disabled" => {
                faulthandler::fatal_error(None, "xyz");
            }
            "dump_traceback" => {
                faulthandler::dump_traceback(sink, false)?;
            }
            "dump_traceback_threads" => {
                let (stop, waiter) = spawn_waiter()?;
                faulthandler::dump_traceback(sink, true)?;
                stop.send(())?;
                waiter
                    .join()
                    .map_err(|_| anyhow::anyhow!("waiter panicked"))?;
            }
            "truncate" => {
                let long_name = CodeLocation::leak("x".repeat(550), "<string>");
                let _frame = enter_frame(long_name, 4);
                faulthandler::dump_traceback(sink, false)?;
            }
            "later" | "later_repeat" | "later_cancel" | "later_exit" => {
                let repeat = mode == "later_repeat";
                let exit = mode == "later_exit";
                let config = WatchdogConfiguration::new(WATCHDOG_TIMEOUT, repeat, exit)?;
                faulthandler::dump_traceback_later(sink, config)?;
                if mode == "later_cancel" {
                    faulthandler::cancel_dump_traceback_later();
                }
                std::thread::sleep(WATCHDOG_TIMEOUT * 5 / 2);
                faulthandler::cancel_dump_traceback_later();
                if exit {
                    bail!("the watchdog should have exited the process");
                }
            }
            "register" | "register_chain" => {
                let chain = mode == "register_chain";
                let counter = SigAction::new(
                    SigHandler::Handler(count_chained_call),
                    SaFlags::empty(),
                    SigSet::empty(),
                );
                // SAFETY: the handler only increments an atomic.
                unsafe { signal::sigaction(Signal::SIGUSR1, &counter) }?;
                let config = UserSignalConfiguration {
                    all_threads: false,
                    chain,
                };
                faulthandler::register(libc::SIGUSR1, sink, config)?;
                raise(Signal::SIGUSR1)?;
                println!("chained calls: {}", CHAINED_CALLS.load(Ordering::SeqCst));
                anyhow::ensure!(faulthandler::unregister(libc::SIGUSR1)?, "was registered");
                // The counting handler is back in place.
                raise(Signal::SIGUSR1)?;
                println!("calls after unregister: {}", CHAINED_CALLS.load(Ordering::SeqCst));
            }
            "unregister" => {
                faulthandler::register(libc::SIGUSR1, sink, UserSignalConfiguration::default())?;
                println!("unregistered: {}", faulthandler::unregister(libc::SIGUSR1)?);
                println!("unregistered: {}", faulthandler::unregister(libc::SIGUSR1)?);
            }
            _ => bail!("unknown mode {mode}"),
        }
        Ok(())
    }

    pub fn main() -> anyhow::Result<()> {
        init_logging();
        let mut args = env::args().skip(1);
        let mode = args.next().context("Unexpected number of arguments 1")?;
        let output: Option<File> = match args.next() {
            Some(path) => Some(
                OpenOptions::new()
                    .create(true)
                    .truncate(true)
                    .write(true)
                    .open(&path)
                    .with_context(|| format!("opening {path}"))?,
            ),
            None => None,
        };
        anyhow::ensure!(args.next().is_none(), "unexpected extra arguments");
        let sink = match &output {
            Some(file) => Sink::from_file(file)?,
            None => Sink::stderr(),
        };

        let _registration = register_current_thread()?;
        let module = enter_frame(&MODULE, 1);
        module.set_line(10);
        let _func = enter_frame(&FUNC, 5);
        run_mode(&mode, sink)
    }
}
