// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A lock-free registry of interpreter call stacks, suitable for reading from a signal handler.
//!
//! The registry is a fixed array of slots. A thread claims a slot when it registers and owns the
//! slot's frame ring until it unregisters. Only the owning thread writes to the ring; any thread
//! (including one running a signal handler) may read it at any time.
//!
//! Readers never block and never observe freed memory:
//! - Rings are allocated the first time a slot is claimed and are never deallocated. A slot that is
//!   released and claimed again reuses its ring.
//! - Frames point to `&'static CodeLocation`s.
//! - Every field is an atomic. A reader racing with the owner may see a partial stack, but never a
//!   torn frame: each cell carries the logical index it was written for, and the reader re-checks
//!   it after loading the cell's contents.

use super::frame::{CodeLocation, Frame, StackSnapshot};
use crate::shared::constants::{MAX_FRAME_DEPTH, MAX_REGISTERED_THREADS};
use crate::shared::platform::current_thread_id;
use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("The current thread is already registered")]
    AlreadyRegistered,
    #[error("No free slot in the thread registry (capacity {0})")]
    Full(usize),
}

const FREE: u64 = 0;
const RESERVED: u64 = u64::MAX;
const NO_SLOT: usize = usize::MAX;
const INVALID_INDEX: usize = usize::MAX;

struct FrameCell {
    code: AtomicPtr<CodeLocation>,
    line: AtomicU32,
    /// Logical stack index this cell currently describes, or `INVALID_INDEX` while being written.
    index: AtomicUsize,
}

impl FrameCell {
    fn new() -> Self {
        Self {
            code: AtomicPtr::new(ptr::null_mut()),
            line: AtomicU32::new(0),
            index: AtomicUsize::new(INVALID_INDEX),
        }
    }
}

/// Ring of the innermost `MAX_FRAME_DEPTH` frames of a thread.
/// The frame at logical depth `i` lives in `cells[i % MAX_FRAME_DEPTH]`.
struct FrameRing {
    depth: AtomicUsize,
    cells: [FrameCell; MAX_FRAME_DEPTH],
}

impl FrameRing {
    fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            cells: std::array::from_fn(|_| FrameCell::new()),
        }
    }

    fn push(&self, code: &'static CodeLocation, line: u32) {
        // Only the owning thread writes, so a relaxed load of our own depth is enough.
        let depth = self.depth.load(Relaxed);
        let cell = &self.cells[depth % MAX_FRAME_DEPTH];
        cell.index.store(INVALID_INDEX, Release);
        cell.code
            .store(code as *const CodeLocation as *mut CodeLocation, Release);
        cell.line.store(line, Release);
        cell.index.store(depth, Release);
        self.depth.store(depth + 1, Release);
    }

    fn pop(&self) {
        let depth = self.depth.load(Relaxed);
        if depth > 0 {
            self.depth.store(depth - 1, Release);
        }
    }

    fn set_line(&self, line: u32) {
        let depth = self.depth.load(Relaxed);
        if depth > 0 {
            self.cells[(depth - 1) % MAX_FRAME_DEPTH]
                .line
                .store(line, Release);
        }
    }

    fn reset(&self) {
        self.depth.store(0, Release);
    }

    fn frames(&self) -> Frames<'_> {
        let depth = self.depth.load(Acquire);
        Frames {
            ring: Some(self),
            next: depth,
            bottom: depth.saturating_sub(MAX_FRAME_DEPTH),
            lost: false,
        }
    }
}

struct ThreadSlot {
    /// `FREE`, `RESERVED` while being claimed, or the owner's thread id.
    thread_id: AtomicU64,
    ring: AtomicPtr<FrameRing>,
}

impl ThreadSlot {
    const fn new() -> Self {
        Self {
            thread_id: AtomicU64::new(FREE),
            ring: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn ring(&self) -> Option<&'static FrameRing> {
        // SAFETY: rings come from `Box::into_raw` and are never freed.
        unsafe { self.ring.load(Acquire).as_ref() }
    }
}

// In this case, we actually WANT multiple copies of the interior mutable struct
#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: ThreadSlot = ThreadSlot::new();

static SLOTS: [ThreadSlot; MAX_REGISTERED_THREADS] = [EMPTY_SLOT; MAX_REGISTERED_THREADS];

thread_local! {
    static CURRENT_SLOT: Cell<usize> = const { Cell::new(NO_SLOT) };
}

fn current_ring() -> Option<&'static FrameRing> {
    let slot = CURRENT_SLOT.try_with(Cell::get).ok()?;
    SLOTS.get(slot)?.ring()
}

/// Iterator over the frames of a thread, innermost first. Performs no allocation.
pub struct Frames<'a> {
    ring: Option<&'a FrameRing>,
    next: usize,
    bottom: usize,
    /// Set when iteration stopped on a cell that no longer holds the expected frame.
    lost: bool,
}

impl Frames<'_> {
    fn empty() -> Self {
        Self {
            ring: None,
            next: 0,
            bottom: 0,
            lost: false,
        }
    }

    /// Whether outermost frames were dropped: the stack is deeper than the ring, or it was once
    /// and the cells of its outermost frames have since been reused.
    pub fn truncated(&self) -> bool {
        self.ring.is_some() && (self.bottom > 0 || self.lost)
    }

    fn stop_lost(&mut self) -> Option<Frame> {
        self.lost = true;
        self.next = self.bottom;
        None
    }
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        let ring = self.ring?;
        if self.next <= self.bottom {
            return None;
        }
        let index = self.next - 1;
        let cell = &ring.cells[index % MAX_FRAME_DEPTH];
        if cell.index.load(Acquire) != index {
            // Overwritten by a deeper frame, or being rewritten right now.
            return self.stop_lost();
        }
        let code = cell.code.load(Acquire);
        let line = cell.line.load(Acquire);
        if cell.index.load(Acquire) != index {
            return self.stop_lost();
        }
        // SAFETY: cells only ever point to `&'static CodeLocation`s.
        let code = unsafe { code.as_ref() }?;
        self.next = index;
        Some(Frame::new(code, line))
    }
}

/// A weak reference to a registered thread. It can only be used to read the thread's stack; if
/// the thread unregisters, the handle silently yields no frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadHandle {
    slot: usize,
    thread_id: u64,
    is_current: bool,
}

impl ThreadHandle {
    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// Whether this handle describes the thread it was obtained on.
    pub fn is_current(&self) -> bool {
        self.is_current
    }

    /// The thread's frames, innermost first. Performs no allocation.
    pub fn frames(&self) -> Frames<'static> {
        let slot = &SLOTS[self.slot];
        if slot.thread_id.load(Acquire) != self.thread_id {
            return Frames::empty();
        }
        match slot.ring() {
            Some(ring) => ring.frames(),
            None => Frames::empty(),
        }
    }

    pub fn snapshot(&self) -> StackSnapshot {
        let mut frames = self.frames();
        let collected = frames.by_ref().collect();
        StackSnapshot {
            thread_id: self.thread_id,
            is_current: self.is_current,
            frames: collected,
            truncated: frames.truncated(),
        }
    }
}

/// Calls `f` for every registered thread, in slot order. Takes no lock and performs no
/// allocation, so it is usable from a signal handler.
pub fn for_each_thread(mut f: impl FnMut(ThreadHandle)) {
    let current = current_thread_id();
    for (slot, entry) in SLOTS.iter().enumerate() {
        let thread_id = entry.thread_id.load(Acquire);
        if thread_id == FREE || thread_id == RESERVED {
            continue;
        }
        f(ThreadHandle {
            slot,
            thread_id,
            is_current: thread_id == current,
        });
    }
}

/// Every thread registered at the time of the call, including the caller if it is registered.
pub fn all_threads() -> Vec<ThreadHandle> {
    let mut threads = Vec::new();
    for_each_thread(|handle| threads.push(handle));
    threads
}

/// The calling thread's handle, if it is registered. Usable from a signal handler.
pub fn current_thread() -> Option<ThreadHandle> {
    let mut found = None;
    for_each_thread(|handle| {
        if found.is_none() && handle.is_current {
            found = Some(handle);
        }
    });
    found
}

/// A snapshot of the calling thread's stack.
pub fn capture_current_thread() -> Option<StackSnapshot> {
    current_thread().map(|handle| handle.snapshot())
}

/// Keeps the calling thread registered. Dropping it (on the same thread) releases the slot.
#[derive(Debug)]
pub struct ThreadRegistration {
    slot: usize,
    // Must be dropped on the thread that registered.
    _not_send: PhantomData<*const ()>,
}

impl ThreadRegistration {
    pub fn thread_id(&self) -> u64 {
        SLOTS[self.slot].thread_id.load(Acquire)
    }
}

impl Drop for ThreadRegistration {
    fn drop(&mut self) {
        let slot = &SLOTS[self.slot];
        if let Some(ring) = slot.ring() {
            ring.reset();
        }
        slot.thread_id.store(FREE, SeqCst);
        let _ = CURRENT_SLOT.try_with(|current| current.set(NO_SLOT));
    }
}

/// Publishes the calling thread's interpreter stack to the fault handler.
///
/// PRECONDITIONS:
///     None
/// ATOMICITY:
///     Claiming a slot is a single CAS. Readers ignore the slot until its ring is ready.
pub fn register_current_thread() -> Result<ThreadRegistration, RegistryError> {
    if CURRENT_SLOT.with(Cell::get) != NO_SLOT {
        return Err(RegistryError::AlreadyRegistered);
    }
    let thread_id = current_thread_id();
    for (index, slot) in SLOTS.iter().enumerate() {
        if slot
            .thread_id
            .compare_exchange(FREE, RESERVED, SeqCst, SeqCst)
            .is_err()
        {
            continue;
        }
        let ring = match slot.ring() {
            Some(ring) => ring,
            None => {
                let ring = Box::into_raw(Box::new(FrameRing::new()));
                slot.ring.store(ring, Release);
                // SAFETY: just allocated, never freed.
                unsafe { &*ring }
            }
        };
        ring.reset();
        slot.thread_id.store(thread_id, SeqCst);
        CURRENT_SLOT.with(|current| current.set(index));
        return Ok(ThreadRegistration {
            slot: index,
            _not_send: PhantomData,
        });
    }
    Err(RegistryError::Full(MAX_REGISTERED_THREADS))
}

/// Pops its frame when dropped.
#[derive(Debug)]
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub struct FrameGuard {
    pushed: bool,
    _not_send: PhantomData<*const ()>,
}

impl FrameGuard {
    /// Updates the line currently executing in this frame.
    pub fn set_line(&self, line: u32) {
        if self.pushed {
            if let Some(ring) = current_ring() {
                ring.set_line(line);
            }
        }
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        // Looked up again rather than stored: if the thread unregistered in the meantime, its old
        // slot may already belong to another thread.
        if self.pushed {
            if let Some(ring) = current_ring() {
                ring.pop();
            }
        }
    }
}

/// Pushes a frame onto the calling thread's stack.
///
/// Stack traces are best effort: on a thread that is not registered this does nothing, rather
/// than failing the interpreter.
pub fn enter_frame(code: &'static CodeLocation, line: u32) -> FrameGuard {
    let ring = current_ring();
    if let Some(ring) = ring {
        ring.push(code, line);
    }
    FrameGuard {
        pushed: ring.is_some(),
        _not_send: PhantomData,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static OUTER: CodeLocation = CodeLocation::new("<module>", "script.py");
    static MIDDLE: CodeLocation = CodeLocation::new("middle", "script.py");
    static INNER: CodeLocation = CodeLocation::new("inner", "lib.py");

    // Every test runs on its own thread, so registrations don't interfere.

    #[test]
    fn test_frames_innermost_first() {
        let _registration = register_current_thread().unwrap();
        let _outer = enter_frame(&OUTER, 10);
        let middle = enter_frame(&MIDDLE, 20);
        middle.set_line(21);
        let _inner = enter_frame(&INNER, 30);

        let snapshot = capture_current_thread().unwrap();
        assert!(snapshot.is_current);
        assert!(!snapshot.truncated);
        assert_eq!(
            snapshot.frames,
            vec![
                Frame::new(&INNER, 30),
                Frame::new(&MIDDLE, 21),
                Frame::new(&OUTER, 10),
            ]
        );
    }

    #[test]
    fn test_guard_pops_frame() {
        let _registration = register_current_thread().unwrap();
        let _outer = enter_frame(&OUTER, 1);
        {
            let _inner = enter_frame(&INNER, 2);
            assert_eq!(capture_current_thread().unwrap().frames.len(), 2);
        }
        let frames = capture_current_thread().unwrap().frames;
        assert_eq!(frames, vec![Frame::new(&OUTER, 1)]);
    }

    #[test]
    fn test_deep_stack_keeps_innermost_frames() {
        let _registration = register_current_thread().unwrap();
        let mut guards = Vec::new();
        for line in 0..(MAX_FRAME_DEPTH as u32 + 20) {
            guards.push(enter_frame(&MIDDLE, line));
        }
        let snapshot = capture_current_thread().unwrap();
        assert!(snapshot.truncated);
        assert_eq!(snapshot.frames.len(), MAX_FRAME_DEPTH);
        assert_eq!(snapshot.frames[0].line, MAX_FRAME_DEPTH as u32 + 19);
        assert_eq!(snapshot.frames[MAX_FRAME_DEPTH - 1].line, 20);

        // Unwinding back below the ring size loses the overwritten outermost frames, nothing else.
        guards.truncate(MAX_FRAME_DEPTH - 5);
        let snapshot = capture_current_thread().unwrap();
        assert_eq!(snapshot.frames[0].line, MAX_FRAME_DEPTH as u32 - 6);
        assert!(snapshot.frames.iter().all(|frame| frame.line >= 20));
        assert_eq!(snapshot.frames.len(), MAX_FRAME_DEPTH - 25);
        assert!(snapshot.truncated);
    }

    #[test]
    fn test_shallow_stack_is_not_truncated() {
        let _registration = register_current_thread().unwrap();
        let mut guards = Vec::new();
        for line in 0..MAX_FRAME_DEPTH as u32 {
            guards.push(enter_frame(&MIDDLE, line));
        }
        guards.truncate(10);
        let snapshot = capture_current_thread().unwrap();
        assert_eq!(snapshot.frames.len(), 10);
        assert!(!snapshot.truncated);
    }

    #[test]
    fn test_double_registration_fails() {
        let _registration = register_current_thread().unwrap();
        assert_eq!(
            register_current_thread().unwrap_err(),
            RegistryError::AlreadyRegistered
        );
    }

    #[test]
    fn test_unregistered_thread_is_best_effort() {
        let guard = enter_frame(&OUTER, 1);
        guard.set_line(2);
        assert!(capture_current_thread().is_none());
    }

    #[test]
    fn test_other_threads_are_listed() {
        let _registration = register_current_thread().unwrap();
        let _outer = enter_frame(&OUTER, 5);

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let waiter = std::thread::spawn(move || {
            let registration = register_current_thread().unwrap();
            let _frame = enter_frame(&INNER, 42);
            ready_tx.send(registration.thread_id()).unwrap();
            let _ = stop_rx.recv();
        });
        let waiter_id = ready_rx.recv().unwrap();

        let threads = all_threads();
        let waiter_handle = threads
            .iter()
            .find(|handle| handle.thread_id() == waiter_id)
            .unwrap();
        assert!(!waiter_handle.is_current());
        assert_eq!(
            waiter_handle.snapshot().frames,
            vec![Frame::new(&INNER, 42)]
        );
        assert!(threads.iter().any(|handle| handle.is_current()));

        stop_tx.send(()).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_slot_is_reused_after_unregistration() {
        let first = register_current_thread().unwrap();
        let frame = enter_frame(&OUTER, 1);
        drop(first);
        // The thread is no longer registered, so this pops nothing.
        drop(frame);
        let _second = register_current_thread().unwrap();
        assert!(capture_current_thread().unwrap().frames.is_empty());
    }
}
