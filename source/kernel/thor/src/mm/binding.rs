// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-CPU attachment of address spaces
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: mm::tests (rebind/shootdown scenarios), mm::tests_prop
//! PUBLIC API: PageBinding::{rebind, unbind, shootdown}, GlobalPageBinding::{bind, shootdown, unbind}
//! DEPENDS_ON: mm::page_space (attach/drain), sync::CpuLocal, hal::Tlb
//! INVARIANTS: Register with the new space before loading its root; acknowledge the old space only after the load

extern crate alloc;

use alloc::sync::Arc;

use super::client_space::ClientPageSpace;
use super::kernel_space::KernelPageSpace;
use crate::hal::{irq::IrqGuard, Tlb};
use crate::sync::CpuLocal;
use crate::types::{CpuId, PhysicalAddr};

struct BindingState {
    bound: Option<Arc<ClientPageSpace>>,
    already_shot: u64,
}

/// Which client space a CPU currently runs on.
///
/// The binding keeps its space alive: a client space is dropped only after
/// every CPU has moved off it.
pub struct PageBinding {
    cpu: CpuId,
    tlb: &'static dyn Tlb,
    kernel_root: PhysicalAddr,
    state: CpuLocal<BindingState>,
}

impl PageBinding {
    pub fn new(cpu: CpuId, tlb: &'static dyn Tlb, kernel_root: PhysicalAddr) -> Self {
        Self { cpu, tlb, kernel_root, state: CpuLocal::new(cpu, BindingState { bound: None, already_shot: 0 }) }
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn bound_space(&self) -> Option<Arc<ClientPageSpace>> {
        let _irq = IrqGuard::new();
        self.state.enter().bound.clone()
    }

    pub fn is_bound_to(&self, space: &ClientPageSpace) -> bool {
        let _irq = IrqGuard::new();
        self.state.enter().bound.as_deref().is_some_and(|bound| core::ptr::eq(bound, space))
    }

    /// Highest shoot sequence of the bound space this CPU has handled.
    pub fn already_shot_sequence(&self) -> u64 {
        let _irq = IrqGuard::new();
        self.state.enter().already_shot
    }

    /// Switches this CPU to `space`. Interrupts must be masked.
    pub fn rebind(&self, space: Arc<ClientPageSpace>) {
        let mut state = self.state.enter();
        if let Some(bound) = &state.bound {
            assert!(!Arc::ptr_eq(bound, &space), "cpu {} rebinding to its current space", self.cpu);
        }

        // Shootdowns submitted from here on count this CPU.
        let target_seq = space.page_space().attach(self.cpu);
        self.tlb.load_root(space.root_table());
        log_trace!(target: "thor::binding", "cpu {} bound to root {:#x} at seq {}", self.cpu, space.root_table(), target_seq);

        let previous = state.bound.replace(space);
        let previous_seq = core::mem::replace(&mut state.already_shot, target_seq);
        if let Some(previous) = previous {
            // The root load above flushed everything the old space left behind.
            let drained = previous.page_space().drain(self.cpu, previous_seq, None, true);
            drop(state);
            drained.finish();
        }
    }

    /// Moves this CPU back to the bare kernel root. Interrupts must be masked.
    pub fn unbind(&self) {
        let mut state = self.state.enter();
        let Some(space) = state.bound.take() else {
            return;
        };
        self.tlb.load_root(self.kernel_root);
        let drained = space.page_space().drain(self.cpu, state.already_shot, None, true);
        state.already_shot = 0;
        drop(state);
        log_trace!(target: "thor::binding", "cpu {} unbound from root {:#x}", self.cpu, space.root_table());
        drained.finish();
    }

    /// Handles the shootdown IPI for the bound client space.
    /// Interrupts must be masked.
    pub fn shootdown(&self) {
        let mut state = self.state.enter();
        let Some(space) = state.bound.clone() else {
            return;
        };
        if space.page_space().is_retiring() {
            drop(state);
            self.unbind();
            return;
        }

        let drained = space.page_space().drain(self.cpu, state.already_shot, Some(self.tlb), false);
        debug_assert!(drained.sequence >= state.already_shot);
        state.already_shot = drained.sequence;
        drop(state);
        drained.finish();
    }
}

/// Registration of one CPU with the kernel space.
///
/// Kernel mappings are global, so no root switch ever flushes them; every
/// kernel shootdown is handled by explicit invalidation.
pub struct GlobalPageBinding {
    cpu: CpuId,
    tlb: &'static dyn Tlb,
    already_shot: CpuLocal<Option<u64>>,
}

impl GlobalPageBinding {
    pub fn new(cpu: CpuId, tlb: &'static dyn Tlb) -> Self {
        Self { cpu, tlb, already_shot: CpuLocal::new(cpu, None) }
    }

    pub fn is_bound(&self) -> bool {
        let _irq = IrqGuard::new();
        self.already_shot.enter().is_some()
    }

    pub fn bind(&self, kernel: &KernelPageSpace) {
        let _irq = IrqGuard::new();
        let mut already_shot = self.already_shot.enter();
        assert!(already_shot.is_none(), "cpu {} bound to the kernel space twice", self.cpu);
        *already_shot = Some(kernel.page_space().attach(self.cpu));
    }

    /// Handles the shootdown IPI for the kernel space. Interrupts must be masked.
    pub fn shootdown(&self, kernel: &KernelPageSpace) {
        let mut already_shot = self.already_shot.enter();
        let Some(seq) = *already_shot else {
            return;
        };
        let drained = kernel.page_space().drain(self.cpu, seq, Some(self.tlb), false);
        *already_shot = Some(drained.sequence);
        drop(already_shot);
        drained.finish();
    }

    /// Detaches a CPU that is leaving service. Its TLB is not touched again,
    /// so pending nodes are acknowledged without invalidation.
    pub fn unbind(&self, kernel: &KernelPageSpace) {
        let _irq = IrqGuard::new();
        let mut already_shot = self.already_shot.enter();
        let Some(seq) = already_shot.take() else {
            return;
        };
        let drained = kernel.page_space().drain(self.cpu, seq, None, true);
        drop(already_shot);
        drained.finish();
    }
}
