// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel stacks and the two continuation primitives.
//!
//! `fork_executor` records a resume point in an executor and carries on in a
//! closure; restoring the executor later returns from the fork. `run_detached`
//! leaves the current kernel stack for the CPU's detached stack and marks the
//! abandoned stack consumed from there. Off target both run the closure in
//! place.

extern crate alloc;

use alloc::boxed::Box;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, Ordering};

use super::{Executor, SaveOrigin};
use crate::config::{DETACHED_STACK_SIZE, POISON_STACKS, STACK_POISON};
use crate::cpu::CpuContext;
use crate::hal::irq;

#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct StackChunk([u8; 16]);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StackState {
    Live = 0,
    Consumed = 1,
}

/// Heap-backed kernel stack of a thread.
pub struct KernelStack {
    base: NonNull<StackChunk>,
    chunks: usize,
    state: AtomicU8,
}

// SAFETY: the stack memory is only written by the owning thread or, while
// consumed, by `consume` on the CPU that abandoned it.
unsafe impl Send for KernelStack {}
unsafe impl Sync for KernelStack {}

impl KernelStack {
    pub fn new(size: usize) -> Self {
        assert!(size >= 16 && size % 16 == 0, "kernel stack size {size} not a multiple of 16");
        let chunks = size / 16;
        let memory: Box<[StackChunk]> = alloc::vec![StackChunk([0; 16]); chunks].into_boxed_slice();
        let base = NonNull::from(Box::leak(memory)).cast::<StackChunk>();
        Self { base, chunks, state: AtomicU8::new(StackState::Live as u8) }
    }

    pub fn base(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    /// Initial stack pointer; 16-byte aligned.
    pub fn top(&self) -> u64 {
        self.base() + (self.chunks * 16) as u64
    }

    pub fn state(&self) -> StackState {
        match self.state.load(Ordering::Acquire) {
            0 => StackState::Live,
            _ => StackState::Consumed,
        }
    }

    /// Marks the stack abandoned. Everything below `live_above` is dead and
    /// gets poisoned when stack poisoning is enabled.
    pub(crate) fn consume(&self, live_above: u64) {
        let previous = self.state.swap(StackState::Consumed as u8, Ordering::AcqRel);
        assert_eq!(previous, StackState::Live as u8, "kernel stack at {:#x} consumed twice", self.base());
        if POISON_STACKS {
            let end = live_above.clamp(self.base(), self.top());
            // SAFETY: [base, end) lies inside this stack and no frame lives there.
            unsafe {
                core::ptr::write_bytes(self.base.as_ptr().cast::<u8>(), STACK_POISON, (end - self.base()) as usize);
            }
        }
    }

    /// Makes a consumed stack usable again when its thread is re-invoked.
    pub(crate) fn revive(&self) {
        self.state.store(StackState::Live as u8, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn bytes(&self) -> &[u8] {
        // SAFETY: the allocation spans `chunks * 16` initialised bytes.
        unsafe { core::slice::from_raw_parts(self.base.as_ptr().cast::<u8>(), self.chunks * 16) }
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        // SAFETY: rebuilds the boxed slice leaked in `new`.
        unsafe {
            drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(self.base.as_ptr(), self.chunks)));
        }
    }
}

/// Per-CPU stack that runs continuations. Never freed while its CPU is live.
pub struct DetachedStack {
    stack: KernelStack,
}

impl DetachedStack {
    pub fn new() -> Self {
        Self { stack: KernelStack::new(DETACHED_STACK_SIZE) }
    }

    pub fn top(&self) -> u64 {
        self.stack.top()
    }
}

impl Default for DetachedStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
extern "C" {
    fn thor_fork_executor(general: *mut super::GeneralState, functor: extern "C" fn(*mut u8), context: *mut u8);
    fn thor_run_detached(function: extern "C" fn(*mut u8, u64) -> !, context: *mut u8, stack_top: u64) -> !;
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
extern "C" fn call_once<F: FnOnce()>(context: *mut u8) {
    // SAFETY: `context` is the `Option<F>` slot of the caller, still live.
    let slot = unsafe { &mut *context.cast::<Option<F>>() };
    if let Some(f) = slot.take() {
        f();
    }
}

/// Saves a resume point into `executor` and runs `f`. Restoring the executor
/// later makes this function return a second time, in the restored context.
///
/// # Safety
/// `executor` must be valid and not otherwise borrowed while `f` runs.
/// Interrupts must be masked.
pub unsafe fn fork_executor<F: FnOnce()>(executor: *mut Executor, f: F) {
    irq::assert_masked();
    let executor = &mut *executor;
    executor.set_origin(SaveOrigin::Fork);
    executor.capture_cpu_state();

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let mut slot = Some(f);
        thor_fork_executor(executor.general_mut(), call_once::<F>, (&mut slot as *mut Option<F>).cast());
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        // No resume point exists off target; mark the snapshot as unusable.
        executor.general_mut().rip = u64::MAX;
        f();
    }
}

/// Continuation handed to the detached trampoline.
struct DetachedCall<F> {
    abandoned: Option<*const KernelStack>,
    f: Option<F>,
}

/// Runs on the detached stack: consumes the abandoned stack below
/// `live_above`, then the continuation. `call` itself lives above
/// `live_above` and is read before anything is poisoned.
fn enter_detached<F: FnOnce()>(call: &mut DetachedCall<F>, live_above: u64) {
    let f = call.f.take();
    if let Some(stack) = call.abandoned.take() {
        // SAFETY: the stack outlives the continuation; its owner is dropped by `f`.
        unsafe { &*stack }.consume(live_above);
    }
    if let Some(f) = f {
        f();
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
extern "C" fn detached_entry<F: FnOnce()>(context: *mut u8, live_above: u64) -> ! {
    // SAFETY: `context` is the `DetachedCall` in the frame of `run_detached`,
    // which stays above `live_above` and is never poisoned.
    let call = unsafe { &mut *context.cast::<DetachedCall<F>>() };
    enter_detached(call, live_above);
    panic!("detached continuation returned");
}

/// Switches to the CPU's detached stack and runs `f` there. The abandoned
/// stack is consumed from the detached stack, never from itself.
///
/// On bare metal `f` must not return; it ends in a reschedule or a restore.
pub fn run_detached<F: FnOnce()>(cpu: &CpuContext, abandoned: Option<&KernelStack>, f: F) {
    irq::assert_masked();
    let mut call = DetachedCall { abandoned: abandoned.map(|stack| stack as *const KernelStack), f: Some(f) };

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        // SAFETY: the detached stack belongs to this CPU and is idle while
        // interrupts are masked.
        unsafe {
            thor_run_detached(detached_entry::<F>, (&mut call as *mut DetachedCall<F>).cast(), cpu.detached_stack().top())
        }
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = cpu.detached_stack();
        let live_above = abandoned.map_or(0, KernelStack::top);
        enter_detached(&mut call, live_above);
    }
}
