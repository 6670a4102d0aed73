// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-CPU state cell that rejects reentry
//! OWNERS: @kernel-sync-team
//! PUBLIC API: CpuLocal::new(), CpuLocal::enter()
//! DEPENDS_ON: spin::Mutex (try_lock only), hal::irq
//! INVARIANTS: enter() never spins; a nested enter() on the owning CPU is a fatal bug
//!
//! Per-CPU bookkeeping such as `PageBinding` is only touched by its own CPU
//! with interrupts masked. Any second entry therefore means an interrupt
//! handler ran while the first entry was still in progress (or a callback
//! looped back in), which would corrupt the state silently. `CpuLocal`
//! turns that into an immediate panic naming the CPU.

use core::ops::{Deref, DerefMut};

use crate::hal::irq;
use crate::types::CpuId;

pub struct CpuLocal<T> {
    owner: CpuId,
    inner: spin::Mutex<T>,
}

impl<T> CpuLocal<T> {
    pub const fn new(owner: CpuId, value: T) -> Self {
        Self { owner, inner: spin::Mutex::new(value) }
    }

    pub fn owner(&self) -> CpuId {
        self.owner
    }

    /// Enters the cell. Interrupts must already be masked.
    #[track_caller]
    pub fn enter(&self) -> CpuLocalGuard<'_, T> {
        irq::assert_masked();
        match self.inner.try_lock() {
            Some(guard) => CpuLocalGuard { guard },
            None => {
                log_error!(target: "thor::sync", "cpu-local state of cpu {} reentered", self.owner);
                panic!("cpu-local state of cpu {} reentered", self.owner);
            }
        }
    }

    /// Returns true while some caller is inside the cell.
    pub fn is_entered(&self) -> bool {
        self.inner.is_locked()
    }
}

pub struct CpuLocalGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
}

impl<T> Deref for CpuLocalGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for CpuLocalGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_entries_are_fine() {
        let cell = CpuLocal::new(CpuId::from_raw(1), 0u32);
        *cell.enter() += 1;
        *cell.enter() += 1;
        assert_eq!(*cell.enter(), 2);
        assert!(!cell.is_entered());
    }

    #[test]
    #[should_panic(expected = "cpu-local state of cpu 2 reentered")]
    fn nested_entry_panics() {
        let cell = CpuLocal::new(CpuId::from_raw(2), ());
        let _outer = cell.enter();
        let _inner = cell.enter();
    }
}
