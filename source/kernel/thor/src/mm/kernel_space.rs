// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The kernel's own address space.
//!
//! Boot hands over a root whose upper half is fully populated; those 256
//! root entries never change afterwards, which is what lets every client
//! space share them by copy.

extern crate alloc;

use alloc::sync::Arc;

use super::page_space::{PageSpace, ShootNode, ShootdownOutcome};
use super::page_table::{CachingMode, Entry, Level, PageAccess, Pte, PteFlags, TableTag};
use crate::hal::{irq::IrqGuard, Tlb};
use crate::kernel::Platform;
use crate::types::{PhysicalAddr, VirtualAddr};

pub struct KernelPageSpace {
    root: PhysicalAddr,
    space: PageSpace,
    platform: &'static Platform,
    tables: spin::Mutex<()>,
}

impl KernelPageSpace {
    pub fn new(platform: &'static Platform, root: PhysicalAddr) -> Self {
        assert!(root.is_page_aligned(), "unaligned kernel root {:#x}", root);
        Self { root, space: PageSpace::new(platform.ipi), platform, tables: spin::Mutex::new(()) }
    }

    pub fn root_table(&self) -> PhysicalAddr {
        self.root
    }

    pub fn page_space(&self) -> &PageSpace {
        &self.space
    }

    /// Maps one global 4 KiB page. Mapping over a present entry is fatal.
    pub fn map_single_4k(&self, va: VirtualAddr, pa: PhysicalAddr, access: PageAccess, caching: CachingMode) {
        assert!(va.is_page_aligned() && pa.is_page_aligned(), "unaligned kernel mapping {:#x} -> {:#x}", va, pa);
        assert!(!va.is_lower_half(), "kernel mapping {:#x} below the kernel half", va);

        let mut flags = PteFlags::GLOBAL | caching.pte_bits();
        if access.contains(PageAccess::WRITE) {
            flags |= PteFlags::WRITE;
        }
        if !access.contains(PageAccess::EXECUTE) {
            flags |= PteFlags::NO_EXECUTE;
        }

        let _irq = IrqGuard::new();
        let _tables = self.tables.lock();
        let arena = self.platform.arena();
        let pt = arena.walk_create(self.root, va, TableTag::Supervisor);
        let slot = Level::Pt.index(va);
        let previous = pt.load(slot);
        if previous.is_present() {
            log_error!(target: "thor::mm", "kernel page {:#x} already maps {:#x}", va, previous.address());
            panic!("kernel page {:#x} is already mapped", va);
        }
        pt.store(slot, Pte::leaf(pa, flags));
    }

    /// Clears the present bit of a kernel page and returns its frame.
    /// The frame must not be reused before a shootdown of `va` completed.
    pub fn unmap_single_4k(&self, va: VirtualAddr) -> PhysicalAddr {
        let _irq = IrqGuard::new();
        let _tables = self.tables.lock();
        let arena = self.platform.arena();
        let Some(pt) = arena.walk_existing(self.root, va) else {
            panic!("unmapping kernel page {:#x} without a page table", va);
        };
        let previous = pt.clear_flags(Level::Pt.index(va), PteFlags::PRESENT);
        assert!(previous.is_present(), "kernel page {:#x} is not mapped", va);
        previous.address()
    }

    /// Frame and flags of the kernel page at `va`, if mapped.
    pub fn translate(&self, va: VirtualAddr) -> Option<(PhysicalAddr, PteFlags)> {
        let arena = self.platform.arena();
        let pt = arena.walk_existing(self.root, va)?;
        match pt.load(Level::Pt.index(va)).decode(Level::Pt) {
            Entry::Leaf { address, flags } => Some((address, flags)),
            Entry::Absent | Entry::Table { .. } => None,
        }
    }

    /// Queues `node` for every online CPU; the calling CPU invalidates
    /// synchronously.
    pub fn submit_shootdown(&self, node: Arc<ShootNode>) -> ShootdownOutcome {
        let _irq = IrqGuard::new();
        let local = crate::cpu::try_current()
            .filter(|cpu| cpu.global_binding().is_bound() && self.space.bound_cpus().contains(cpu.id()));
        let outcome = self.space.submit_shootdown_from(node, local.map(|cpu| cpu.id()));
        if let Some(cpu) = local {
            cpu.global_binding().shootdown(self);
        }
        outcome
    }

    /// Unmaps the window page through which the kernel reaches `pa` and
    /// drops its local translation, so a later use of a stale window pointer
    /// faults.
    pub fn poison_physical_access(&self, tlb: &dyn Tlb, pa: PhysicalAddr) {
        let va = self.window_page(pa);
        let _ = self.unmap_single_4k(va);
        tlb.invalidate_page(va);
    }

    /// Remaps the window page of `pa` read-only, so stale writers fault while
    /// readers keep working.
    pub fn poison_physical_write_access(&self, tlb: &dyn Tlb, pa: PhysicalAddr) {
        let va = self.window_page(pa);
        let _ = self.unmap_single_4k(va);
        self.map_single_4k(va, pa, PageAccess::READ, CachingMode::Null);
        tlb.invalidate_page(va);
    }

    fn window_page(&self, pa: PhysicalAddr) -> VirtualAddr {
        assert!(pa.is_page_aligned(), "unaligned physical page {:#x}", pa);
        let va = VirtualAddr::new(self.platform.window.access(pa).as_ptr() as u64);
        assert!(!va.is_lower_half(), "window page {:#x} of {:#x} is not a kernel mapping", va, pa);
        va
    }

    /// Root entry `slot` of the shared kernel half.
    pub(crate) fn upper_half_entry(&self, slot: usize) -> Pte {
        self.platform.arena().table(self.root).load(slot)
    }
}
