// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-CPU context and the current-CPU accessor
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Exercised by mm::tests and thread::tests through install()/current()
//! PUBLIC API: CpuContext, install(), current(), try_current()
//! DEPENDS_ON: hal::x86 (GS base), mm::binding, sched::Scheduler, executor::DetachedStack
//! INVARIANTS: A CpuContext outlives its CPU; only the owning CPU mutates its bindings
//!
//! On bare metal the kernel GS base points at the running CPU's context.
//! Host test builds keep the pointer in a thread-local so every test thread
//! acts as its own CPU.

extern crate alloc;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::executor::DetachedStack;
use crate::hal::{irq::IrqGuard, Tlb};
use crate::mm::{GlobalPageBinding, KernelPageSpace, PageBinding};
use crate::sched::Scheduler;
use crate::thread::Thread;
use crate::types::CpuId;

pub struct CpuContext {
    id: CpuId,
    tlb: &'static dyn Tlb,
    scheduler: &'static dyn Scheduler,
    page_binding: PageBinding,
    global_binding: GlobalPageBinding,
    detached: DetachedStack,
    active: spin::Mutex<Option<Arc<Thread>>>,
    next_trap_stack: AtomicU64,
}

impl CpuContext {
    pub fn new(id: CpuId, tlb: &'static dyn Tlb, scheduler: &'static dyn Scheduler, kernel: &KernelPageSpace) -> Self {
        Self {
            id,
            tlb,
            scheduler,
            page_binding: PageBinding::new(id, tlb, kernel.root_table()),
            global_binding: GlobalPageBinding::new(id, tlb),
            detached: DetachedStack::new(),
            active: spin::Mutex::new(None),
            next_trap_stack: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn tlb(&self) -> &'static dyn Tlb {
        self.tlb
    }

    pub fn scheduler(&self) -> &'static dyn Scheduler {
        self.scheduler
    }

    pub fn page_binding(&self) -> &PageBinding {
        &self.page_binding
    }

    pub fn global_binding(&self) -> &GlobalPageBinding {
        &self.global_binding
    }

    pub fn detached_stack(&self) -> &DetachedStack {
        &self.detached
    }

    /// Thread currently invoked on this CPU.
    pub fn active_thread(&self) -> Option<Arc<Thread>> {
        let _irq = IrqGuard::new();
        self.active.lock().clone()
    }

    pub(crate) fn set_active_thread(&self, thread: Option<Arc<Thread>>) -> Option<Arc<Thread>> {
        let _irq = IrqGuard::new();
        core::mem::replace(&mut *self.active.lock(), thread)
    }

    /// Stack the next trap from user mode lands on.
    pub fn next_trap_stack(&self) -> u64 {
        self.next_trap_stack.load(Ordering::Acquire)
    }

    pub(crate) fn set_next_trap_stack(&self, top: u64) {
        self.next_trap_stack.store(top, Ordering::Release);
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none", not(test)))]
mod backend {
    use super::CpuContext;
    use crate::hal::x86;

    pub(super) fn store(context: &'static CpuContext) {
        // SAFETY: the context is 'static.
        unsafe { x86::set_cpu_base(context as *const CpuContext as u64) };
    }

    pub(super) fn load() -> Option<&'static CpuContext> {
        let base = x86::cpu_base();
        // SAFETY: only `store` writes the GS base after boot.
        (base != 0).then(|| unsafe { &*(base as *const CpuContext) })
    }
}


#[cfg(not(any(test, all(target_arch = "x86_64", target_os = "none"))))]
mod backend {
    use super::CpuContext;
    use core::sync::atomic::{AtomicPtr, Ordering};

    static CURRENT: AtomicPtr<CpuContext> = AtomicPtr::new(core::ptr::null_mut());

    pub(super) fn store(context: &'static CpuContext) {
        CURRENT.store(context as *const CpuContext as *mut CpuContext, Ordering::Release);
    }

    pub(super) fn load() -> Option<&'static CpuContext> {
        let context = CURRENT.load(Ordering::Acquire);
        // SAFETY: only `store` writes the pointer, always from a 'static reference.
        unsafe { context.as_ref() }
    }
}

/// Makes `context` the running CPU's context.
pub fn install(context: &'static CpuContext) {
    backend::store(context);
    log_debug!(target: "thor::cpu", "cpu {} context installed", context.id());
}

pub fn try_current() -> Option<&'static CpuContext> {
    backend::load()
}

/// Context of the running CPU. Calling this before `install` is fatal.
#[track_caller]
pub fn current() -> &'static CpuContext {
    match backend::load() {
        Some(context) => context,
        None => panic!("no cpu context installed"),
    }
}
