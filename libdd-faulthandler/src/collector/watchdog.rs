// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::emitters::{emit_all_threads, format_timeout_header, EmitterError};
use crate::runtime::gc_collecting;
use crate::shared::configuration::WatchdogConfiguration;
use crate::shared::error::FaultHandlerError;
use crate::shared::platform::exit_immediately;
use crate::shared::sink::{Sink, SinkWriter};
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const THREAD_NAME: &str = "faulthandler-watchdog";

/// One armed timer. Dropping it cancels the timer and waits for its thread to finish; a dump that
/// has already started is completed first.
#[derive(Debug)]
pub(crate) struct Watchdog {
    cancelled: Arc<AtomicBool>,
    // Dropping the sender wakes the thread up.
    wake: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub(crate) fn spawn(sink: Sink, config: WatchdogConfiguration) -> Result<Self, FaultHandlerError> {
        // Built here rather than when the timer fires.
        let header = format_timeout_header(config.timeout());
        let (wake, wait) = mpsc::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let thread_cancelled = Arc::clone(&cancelled);
        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || run(wait, &thread_cancelled, sink, config, &header))
            .map_err(FaultHandlerError::WatchdogSpawn)?;
        Ok(Self {
            cancelled,
            wake: Some(wake),
            thread: Some(thread),
        })
    }

    /// Whether the timer thread is still waiting or dumping.
    pub(crate) fn is_armed(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancelled.store(true, SeqCst);
        drop(self.wake.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run(
    wait: mpsc::Receiver<()>,
    cancelled: &AtomicBool,
    sink: Sink,
    config: WatchdogConfiguration,
    header: &str,
) {
    loop {
        match wait.recv_timeout(config.timeout()) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
        // A cancel may have landed just as the timeout expired.
        if cancelled.load(SeqCst) {
            return;
        }
        let _ = emit_timeout(&mut sink.writer(), header);
        if config.exit() {
            exit_immediately(1);
        }
        if !config.repeat() {
            return;
        }
    }
}

/// The watchdog's dump: the timeout header, then every thread. The watchdog thread itself is not
/// an interpreter thread, so none of them is marked current.
fn emit_timeout(w: &mut SinkWriter, header: &str) -> Result<(), EmitterError> {
    w.write_all(header.as_bytes())?;
    emit_all_threads(w, gc_collecting())
}
