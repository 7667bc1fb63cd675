// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Renders interpreter stacks into the fault handler's text format.
//!
//! Everything here may run inside a signal handler: no function allocates, and numbers are
//! formatted by hand into stack buffers. Output goes straight to the writer piece by piece, so
//! whatever was written before the process dies is kept.

use crate::runtime::{
    current_thread, extension_modules_line, for_each_thread, Frame, Frames, RuntimeState,
    ThreadHandle,
};
use crate::shared::constants::*;
use crate::shared::error::FaultHandlerError;
use std::io::Write;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("Failed to write to output: {0}")]
    WriteError(#[from] std::io::Error),
}

impl From<EmitterError> for FaultHandlerError {
    fn from(value: EmitterError) -> Self {
        match value {
            EmitterError::WriteError(e) => FaultHandlerError::Write(e),
        }
    }
}

fn write_decimal(buf: &mut [u8], mut val: u64) -> Option<usize> {
    if buf.is_empty() {
        return None;
    }
    let mut i = 0;
    loop {
        if i >= buf.len() {
            return None;
        }
        buf[i] = b'0' + (val % 10) as u8;
        val /= 10;
        i += 1;
        if val == 0 {
            break;
        }
    }
    buf[..i].reverse();
    Some(i)
}

/// Lowercase hex, zero-padded to `buf.len()` digits.
fn write_hex_padded(buf: &mut [u8], mut val: u64) {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    for byte in buf.iter_mut().rev() {
        *byte = DIGITS[(val & 0xf) as usize];
        val >>= 4;
    }
}

/// `digits` lowercase hex digits of `val`, at most 16.
pub(crate) fn emit_hex_padded(
    w: &mut impl Write,
    val: u64,
    digits: usize,
) -> Result<(), EmitterError> {
    let mut buf = [0u8; 16];
    let digits = digits.min(buf.len());
    write_hex_padded(&mut buf[..digits], val);
    w.write_all(&buf[..digits])?;
    Ok(())
}

fn emit_decimal(w: &mut impl Write, val: u64) -> Result<(), EmitterError> {
    let mut buf = [0u8; 20];
    if let Some(len) = write_decimal(&mut buf, val) {
        w.write_all(&buf[..len])?;
    }
    Ok(())
}

/// Writes `s` as printable ASCII, escaping anything else as `\xNN`, `\uNNNN` or `\UNNNNNNNN`.
/// Strings longer than `MAX_STRING_LENGTH` characters are cut and end with `...`.
pub fn emit_escaped(w: &mut impl Write, s: &str) -> Result<(), EmitterError> {
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_STRING_LENGTH {
            w.write_all(ELLIPSIS.as_bytes())?;
            break;
        }
        let code = ch as u32;
        if (0x20..0x7f).contains(&code) {
            w.write_all(&[code as u8])?;
            continue;
        }
        let mut buf = [0u8; 10];
        let len = if code <= 0xff {
            buf[..2].copy_from_slice(b"\\x");
            write_hex_padded(&mut buf[2..4], code as u64);
            4
        } else if code <= 0xffff {
            buf[..2].copy_from_slice(b"\\u");
            write_hex_padded(&mut buf[2..6], code as u64);
            6
        } else {
            buf[..2].copy_from_slice(b"\\U");
            write_hex_padded(&mut buf[2..10], code as u64);
            10
        };
        w.write_all(&buf[..len])?;
    }
    Ok(())
}

pub fn emit_frame(w: &mut impl Write, frame: &Frame) -> Result<(), EmitterError> {
    w.write_all(b"  File \"")?;
    emit_escaped(w, frame.source)?;
    w.write_all(b"\", line ")?;
    emit_decimal(w, frame.line as u64)?;
    w.write_all(b" in ")?;
    emit_escaped(w, frame.function_name)?;
    w.write_all(b"\n")?;
    Ok(())
}

/// Writes one line per frame, innermost first.
pub fn emit_frames(w: &mut impl Write, mut frames: Frames<'_>) -> Result<(), EmitterError> {
    let mut written = 0usize;
    for frame in frames.by_ref() {
        emit_frame(w, &frame)?;
        written += 1;
    }
    if written == 0 {
        w.write_all(NO_PYTHON_FRAME.as_bytes())?;
    } else if frames.truncated() {
        w.write_all(TRUNCATED_FRAMES.as_bytes())?;
    }
    Ok(())
}

/// `Current thread 0x...` or `Thread 0x...` with the id as 16 hex digits.
pub fn emit_thread_header(
    w: &mut impl Write,
    thread_id: u64,
    is_current: bool,
) -> Result<(), EmitterError> {
    let prefix = if is_current {
        CURRENT_THREAD_PREFIX
    } else {
        THREAD_PREFIX
    };
    w.write_all(prefix.as_bytes())?;
    emit_hex_padded(w, thread_id, 16)?;
    w.write_all(THREAD_HEADER_SUFFIX.as_bytes())?;
    Ok(())
}

/// Dumps a single thread under the `Stack (most recent call first):` header.
/// `None` is a thread the registry does not know about.
pub fn emit_traceback(
    w: &mut impl Write,
    thread: Option<ThreadHandle>,
    gc_collecting: bool,
) -> Result<(), EmitterError> {
    w.write_all(STACK_HEADER.as_bytes())?;
    if gc_collecting {
        w.write_all(GARBAGE_COLLECTING.as_bytes())?;
    }
    match thread {
        Some(thread) => emit_frames(w, thread.frames()),
        None => Ok(w.write_all(NO_PYTHON_FRAME.as_bytes())?),
    }
}

/// Dumps the `index`-th thread of an all-threads dump.
fn emit_nth_thread(
    w: &mut impl Write,
    thread: &ThreadHandle,
    index: usize,
    gc_collecting: bool,
) -> Result<(), EmitterError> {
    if index != 0 {
        w.write_all(b"\n")?;
    }
    if index >= MAX_NTHREADS {
        w.write_all(TRUNCATED_THREADS.as_bytes())?;
        return Ok(());
    }
    emit_thread_header(w, thread.thread_id(), thread.is_current())?;
    if gc_collecting && thread.is_current() {
        w.write_all(GARBAGE_COLLECTING.as_bytes())?;
    }
    emit_frames(w, thread.frames())
}

/// Dumps every registered thread in registry order, separated by blank lines. The calling thread,
/// if registered, is headed `Current thread`. After `MAX_NTHREADS` threads the rest is elided.
pub fn emit_all_threads(w: &mut impl Write, gc_collecting: bool) -> Result<(), EmitterError> {
    let mut count = 0usize;
    let mut result = Ok(());
    for_each_thread(|thread| {
        if result.is_err() || count > MAX_NTHREADS {
            return;
        }
        result = emit_nth_thread(w, &thread, count, gc_collecting);
        count += 1;
    });
    result
}

/// The dump shared by every trigger: all threads, or only the calling one.
pub fn emit_dump(
    w: &mut impl Write,
    all_threads: bool,
    gc_collecting: bool,
) -> Result<(), EmitterError> {
    if all_threads {
        emit_all_threads(w, gc_collecting)
    } else {
        emit_traceback(w, current_thread(), gc_collecting)
    }
}

/// `Fatal Python error: [<func>: ]<message>`, the runtime state if requested, and a blank line.
pub fn emit_fatal_header(
    w: &mut impl Write,
    func: Option<&str>,
    message: &str,
    runtime_state: Option<RuntimeState>,
) -> Result<(), EmitterError> {
    w.write_all(FATAL_ERROR_PREFIX.as_bytes())?;
    if let Some(func) = func {
        w.write_all(func.as_bytes())?;
        w.write_all(b": ")?;
    }
    w.write_all(message.as_bytes())?;
    w.write_all(b"\n")?;
    emit_runtime_state(w, runtime_state)
}

/// The optional `Python runtime state: <state>` line, then the blank line ending a fault header.
pub fn emit_runtime_state(
    w: &mut impl Write,
    runtime_state: Option<RuntimeState>,
) -> Result<(), EmitterError> {
    if let Some(state) = runtime_state {
        w.write_all(RUNTIME_STATE_PREFIX.as_bytes())?;
        w.write_all(state.as_str().as_bytes())?;
        w.write_all(b"\n")?;
    }
    w.write_all(b"\n")?;
    Ok(())
}

/// The published extension modules, preceded by a blank line. Nothing if none were published.
pub fn emit_extension_modules(w: &mut impl Write) -> Result<(), EmitterError> {
    if let Some(line) = extension_modules_line() {
        w.write_all(b"\n")?;
        w.write_all(line.as_bytes())?;
    }
    Ok(())
}

/// The watchdog header, `Timeout (H:MM:SS[.ffffff])!`. Built when the watchdog is armed, so this
/// one allocates.
pub(crate) fn format_timeout_header(timeout: Duration) -> String {
    let secs = timeout.as_secs();
    let micros = timeout.subsec_micros();
    let (hours, minutes, seconds) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if micros != 0 {
        format!("Timeout ({hours}:{minutes:02}:{seconds:02}.{micros:06})!\n")
    } else {
        format!("Timeout ({hours}:{minutes:02}:{seconds:02})!\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{enter_frame, register_current_thread, CodeLocation};
    use std::sync::{Arc, Barrier};

    static MODULE: CodeLocation = CodeLocation::new("<module>", "<string>");
    static FUNC: CodeLocation = CodeLocation::new("func", "<string>");

    fn render(f: impl FnOnce(&mut Vec<u8>) -> Result<(), EmitterError>) -> String {
        let mut buf = Vec::new();
        f(&mut buf).expect("to work ;-)");
        String::from_utf8(buf).expect("to be valid UTF8")
    }

    #[test]
    fn test_write_decimal() {
        let mut buf = [0u8; 20];
        let len = write_decimal(&mut buf, 0).unwrap();
        assert_eq!(&buf[..len], b"0");
        let len = write_decimal(&mut buf, u64::MAX).unwrap();
        assert_eq!(&buf[..len], b"18446744073709551615");
        assert_eq!(write_decimal(&mut buf[..2], 123), None);
    }

    #[test]
    fn test_escaping() {
        assert_eq!(render(|w| emit_escaped(w, "plain")), "plain");
        assert_eq!(render(|w| emit_escaped(w, "a\tb")), "a\\x09b");
        assert_eq!(render(|w| emit_escaped(w, "caf\u{e9}")), "caf\\xe9");
        assert_eq!(render(|w| emit_escaped(w, "\u{20ac}")), "\\u20ac");
        assert_eq!(render(|w| emit_escaped(w, "\u{1f600}")), "\\U0001f600");
    }

    #[test]
    fn test_truncation() {
        let exact = "x".repeat(MAX_STRING_LENGTH);
        assert_eq!(render(|w| emit_escaped(w, &exact)), exact);

        let long = "x".repeat(MAX_STRING_LENGTH + 50);
        let expected = format!("{}...", "x".repeat(MAX_STRING_LENGTH));
        assert_eq!(render(|w| emit_escaped(w, &long)), expected);
    }

    #[test]
    fn test_thread_header() {
        assert_eq!(
            render(|w| emit_thread_header(w, 0x7f3a, true)),
            "Current thread 0x0000000000007f3a (most recent call first):\n"
        );
        assert_eq!(
            render(|w| emit_thread_header(w, u64::MAX, false)),
            "Thread 0xffffffffffffffff (most recent call first):\n"
        );
    }

    #[test]
    fn test_single_thread_traceback() {
        let _registration = register_current_thread().unwrap();
        let _module = enter_frame(&MODULE, 6);
        let _func = enter_frame(&FUNC, 4);
        assert_eq!(
            render(|w| emit_dump(w, false, false)),
            "Stack (most recent call first):\n  \
             File \"<string>\", line 4 in func\n  \
             File \"<string>\", line 6 in <module>\n"
        );
    }

    #[test]
    fn test_unregistered_thread() {
        assert_eq!(
            render(|w| emit_traceback(w, current_thread(), false)),
            "Stack (most recent call first):\n  <no Python frame>\n"
        );
    }

    #[test]
    fn test_registered_thread_without_frames() {
        let _registration = register_current_thread().unwrap();
        assert_eq!(
            render(|w| emit_traceback(w, current_thread(), true)),
            "Stack (most recent call first):\n  Garbage-collecting\n  <no Python frame>\n"
        );
    }

    #[test]
    fn test_deep_stack_is_marked() {
        let _registration = register_current_thread().unwrap();
        let guards: Vec<_> = (0..MAX_FRAME_DEPTH as u32 + 1)
            .map(|line| enter_frame(&FUNC, line))
            .collect();
        let out = render(|w| emit_traceback(w, current_thread(), false));
        assert_eq!(out.lines().count(), MAX_FRAME_DEPTH + 2);
        assert!(out.ends_with("  File \"<string>\", line 1 in func\n  ...\n"));
        drop(guards);
    }

    #[test]
    fn test_all_threads_marks_current() {
        let _registration = register_current_thread().unwrap();
        let _func = enter_frame(&FUNC, 12);
        let out = render(|w| emit_all_threads(w, true));
        let current = regex::Regex::new(
            r#"(?m)^Current thread 0x[0-9a-f]{16} \(most recent call first\):\n  Garbage-collecting\n  File "<string>", line 12 in func$"#,
        )
        .unwrap();
        assert!(current.is_match(&out), "{out}");
    }

    #[test]
    fn test_unwound_deep_stack_is_marked() {
        let _registration = register_current_thread().unwrap();
        let mut guards = Vec::new();
        for line in 0..(MAX_FRAME_DEPTH as u32 + 20) {
            guards.push(enter_frame(&FUNC, line));
        }
        guards.truncate(MAX_FRAME_DEPTH - 5);
        let out = render(|w| emit_traceback(w, current_thread(), false));
        assert!(out.ends_with("  File \"<string>\", line 20 in func\n  ...\n"), "{out}");
        drop(guards);
    }

    #[test]
    fn test_threads_beyond_limit_are_elided() {
        let extra = MAX_NTHREADS + 1;
        let ready = Arc::new(Barrier::new(extra + 1));
        let stop = Arc::new(Barrier::new(extra + 1));
        let threads: Vec<_> = (0..extra)
            .map(|_| {
                let ready = Arc::clone(&ready);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    let _registration = register_current_thread().unwrap();
                    ready.wait();
                    stop.wait();
                })
            })
            .collect();
        ready.wait();

        let out = render(|w| emit_all_threads(w, false));
        stop.wait();
        for thread in threads {
            thread.join().unwrap();
        }

        assert!(out.ends_with("\n\n...\n"), "{out}");
        let headers = out
            .lines()
            .filter(|line| line.ends_with("(most recent call first):"))
            .count();
        assert_eq!(headers, MAX_NTHREADS);
    }

    #[test]
    fn test_fatal_header() {
        assert_eq!(
            render(|w| emit_fatal_header(w, None, "Segmentation fault", None)),
            "Fatal Python error: Segmentation fault\n\n"
        );
        assert_eq!(
            render(|w| emit_fatal_header(
                w,
                Some("main"),
                "xyz",
                Some(RuntimeState::Initialized)
            )),
            "Fatal Python error: main: xyz\nPython runtime state: initialized\n\n"
        );
    }

    #[test]
    fn test_timeout_header() {
        assert_eq!(
            format_timeout_header(Duration::from_millis(500)),
            "Timeout (0:00:00.500000)!\n"
        );
        assert_eq!(
            format_timeout_header(Duration::from_secs(3725)),
            "Timeout (1:02:05)!\n"
        );
        assert_eq!(
            format_timeout_header(Duration::from_secs(90_000)),
            "Timeout (25:00:00)!\n"
        );
    }
}
