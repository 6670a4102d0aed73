// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process address space (private lower half, shared kernel half)
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + mm::tests
//! PUBLIC API: ClientPageSpace::{new, map_single_4k, unmap_single_4k, clean_single_4k, is_mapped, activate, submit_shootdown, walk, update_page_access}
//! DEPENDS_ON: mm::page_table::TableArena, mm::kernel_space, cpu::current()
//! INVARIANTS: Intermediate tables are either all-user or all-supervisor along a walk; leaf frames are never freed here

extern crate alloc;

use alloc::sync::Arc;
use core::fmt;

use super::kernel_space::KernelPageSpace;
use super::page_space::{PageSpace, ShootNode, ShootdownOutcome};
use super::page_table::{
    CachingMode, Entry, Level, PageAccess, PageStatus, PageTable, Pte, PteFlags, TableArena, TableTag, TABLE_ENTRIES,
};
use crate::config::{KERNEL_HALF_FIRST_SLOT, VERIFY_PAGE_TABLES};
use crate::hal::irq::IrqGuard;
use crate::kernel::Platform;
use crate::types::{PhysicalAddr, VirtualAddr};

pub struct ClientPageSpace {
    root: PhysicalAddr,
    space: PageSpace,
    platform: &'static Platform,
    tables: spin::Mutex<()>,
}

/// Snapshot of the leaf that translates one address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Walk {
    address: VirtualAddr,
    leaf: Pte,
}

impl Walk {
    pub fn address(&self) -> VirtualAddr {
        self.address
    }

    pub fn flags(&self) -> PageAccess {
        let flags = self.leaf.flags();
        let mut access = PageAccess::READ;
        if flags.contains(PteFlags::WRITE) {
            access |= PageAccess::WRITE;
        }
        if !flags.contains(PteFlags::NO_EXECUTE) {
            access |= PageAccess::EXECUTE;
        }
        access
    }

    pub fn physical(&self) -> PhysicalAddr {
        self.leaf.address()
    }

    pub fn is_user(&self) -> bool {
        self.leaf.flags().contains(PteFlags::USER)
    }
}

/// User/supervisor inconsistency found by `ClientPageSpace::verify`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TagViolation {
    pub address: VirtualAddr,
    pub level: Level,
}

impl fmt::Display for TagViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user/supervisor mix at {:#x} ({:?})", self.address, self.level)
    }
}

impl ClientPageSpace {
    pub fn new(platform: &'static Platform, kernel: &KernelPageSpace) -> Arc<Self> {
        let arena = platform.arena();
        let root = arena.allocate();
        let table = arena.table(root);
        for slot in KERNEL_HALF_FIRST_SLOT..TABLE_ENTRIES {
            let entry = kernel.upper_half_entry(slot);
            assert!(entry.is_present(), "kernel root slot {} is not populated", slot);
            table.store(slot, entry);
        }
        log_debug!(target: "thor::mm", "client space root {:#x}", root);
        Arc::new(Self { root, space: PageSpace::new(platform.ipi), platform, tables: spin::Mutex::new(()) })
    }

    pub fn root_table(&self) -> PhysicalAddr {
        self.root
    }

    pub fn page_space(&self) -> &PageSpace {
        &self.space
    }

    /// Queues `node` for every CPU bound to this space. A bound calling CPU
    /// invalidates synchronously and is not signalled.
    pub fn submit_shootdown(&self, node: Arc<ShootNode>) -> ShootdownOutcome {
        let _irq = IrqGuard::new();
        let local = crate::cpu::try_current().filter(|cpu| cpu.page_binding().is_bound_to(self));
        let outcome = self.space.submit_shootdown_from(node, local.map(|cpu| cpu.id()));
        if let Some(cpu) = local {
            cpu.page_binding().shootdown();
        }
        outcome
    }

    /// Maps one 4 KiB page of the lower half. Mapping over a present leaf is fatal.
    pub fn map_single_4k(
        &self,
        va: VirtualAddr,
        pa: PhysicalAddr,
        user_page: bool,
        access: PageAccess,
        caching: CachingMode,
    ) {
        assert!(va.is_page_aligned() && pa.is_page_aligned(), "unaligned mapping {:#x} -> {:#x}", va, pa);
        assert!(va.is_lower_half(), "client mapping {:#x} in the kernel half", va);

        let mut flags = caching.pte_bits();
        if user_page {
            flags |= PteFlags::USER;
        }
        if access.contains(PageAccess::WRITE) {
            flags |= PteFlags::WRITE;
        }
        if !access.contains(PageAccess::EXECUTE) {
            flags |= PteFlags::NO_EXECUTE;
        }

        let _irq = IrqGuard::new();
        let _tables = self.tables.lock();
        let pt = self.arena().walk_create(self.root, va, TableTag::from_user(user_page));
        let slot = Level::Pt.index(va);
        let previous = pt.load(slot);
        if previous.is_present() {
            log_error!(target: "thor::mm", "page {:#x} already maps {:#x}", va, previous.address());
            panic!("page {:#x} is already mapped", va);
        }
        pt.store(slot, Pte::leaf(pa, flags));

        if VERIFY_PAGE_TABLES {
            if let Err(violation) = self.verify_locked() {
                log_error!(target: "thor::mm", "{}", violation);
                panic!("page-table verification failed: {}", violation);
            }
        }
    }

    /// Removes the leaf for `va`. Absent levels yield an empty status.
    pub fn unmap_single_4k(&self, va: VirtualAddr) -> PageStatus {
        let _irq = IrqGuard::new();
        let _tables = self.tables.lock();
        match self.arena().walk_existing(self.root, va) {
            Some(pt) => PageStatus::of(pt.swap(Level::Pt.index(va), Pte::ABSENT)),
            None => PageStatus::empty(),
        }
    }

    /// Clears the dirty bit of a present, dirty leaf. Returns the status before clearing.
    pub fn clean_single_4k(&self, va: VirtualAddr) -> PageStatus {
        let _irq = IrqGuard::new();
        let _tables = self.tables.lock();
        let Some(pt) = self.arena().walk_existing(self.root, va) else {
            return PageStatus::empty();
        };
        let slot = Level::Pt.index(va);
        let status = PageStatus::of(pt.load(slot));
        if status.contains(PageStatus::DIRTY) {
            return PageStatus::of(pt.clear_flags(slot, PteFlags::DIRTY));
        }
        status
    }

    pub fn is_mapped(&self, va: VirtualAddr) -> bool {
        self.walk(va).is_some()
    }

    /// Reads the leaf translating `va` without allocating.
    pub fn walk(&self, va: VirtualAddr) -> Option<Walk> {
        let _irq = IrqGuard::new();
        let _tables = self.tables.lock();
        let pt = self.arena().walk_existing(self.root, va)?;
        let leaf = pt.load(Level::Pt.index(va));
        leaf.is_present().then_some(Walk { address: va, leaf })
    }

    /// Software access tracking hook. x86 sets accessed/dirty in hardware,
    /// so there is never anything to update.
    pub fn update_page_access(&self, _va: VirtualAddr) -> bool {
        false
    }

    /// Binds the current CPU to this space unless it already is.
    pub fn activate(self: &Arc<Self>) {
        self.activate_on(crate::cpu::current());
    }

    /// Same as `activate` for a context the caller already holds. `cpu` must
    /// be the running CPU.
    pub fn activate_on(self: &Arc<Self>, cpu: &crate::cpu::CpuContext) {
        let _irq = IrqGuard::new();
        let binding = cpu.page_binding();
        if binding.is_bound_to(self) {
            return;
        }
        binding.rebind(Arc::clone(self));
    }

    /// Checks that every table and leaf below a root slot carries the tag of
    /// the first table on its path.
    pub fn verify(&self) -> Result<(), TagViolation> {
        let _irq = IrqGuard::new();
        let _tables = self.tables.lock();
        self.verify_locked()
    }

    fn verify_locked(&self) -> Result<(), TagViolation> {
        let arena = self.arena();
        let root = arena.table(self.root);
        for slot in 0..KERNEL_HALF_FIRST_SLOT {
            if let Entry::Table { address, user } = root.load(slot).decode(Level::Pml4) {
                let base = (slot as u64) << Level::Pml4.shift();
                verify_subtree(arena, arena.table(address), Level::Pdpt, base, user)?;
            }
        }
        Ok(())
    }

    fn arena(&self) -> TableArena<'static> {
        self.platform.arena()
    }
}

fn verify_subtree(
    arena: TableArena<'_>,
    table: &PageTable,
    level: Level,
    base: u64,
    user: bool,
) -> Result<(), TagViolation> {
    for slot in 0..TABLE_ENTRIES {
        let address = VirtualAddr::new(base | ((slot as u64) << level.shift()));
        match table.load(slot).decode(level) {
            Entry::Absent => {}
            Entry::Table { address: next, user: tagged } => {
                if tagged != user {
                    return Err(TagViolation { address, level });
                }
                if let Some(below) = level.next() {
                    verify_subtree(arena, arena.table(next), below, address.as_u64(), user)?;
                }
            }
            Entry::Leaf { flags, .. } => {
                if flags.contains(PteFlags::USER) != user {
                    return Err(TagViolation { address, level });
                }
            }
        }
    }
    Ok(())
}

fn free_subtree(arena: TableArena<'_>, table: PhysicalAddr, level: Level) {
    if let Some(below) = level.next() {
        let entries = arena.table(table);
        for slot in 0..TABLE_ENTRIES {
            if let Entry::Table { address, .. } = entries.load(slot).decode(level) {
                free_subtree(arena, address, below);
            }
        }
    }
    arena.free(table);
}

impl Drop for ClientPageSpace {
    fn drop(&mut self) {
        let arena = self.arena();
        let root = arena.table(self.root);
        for slot in 0..KERNEL_HALF_FIRST_SLOT {
            if let Entry::Table { address, .. } = root.load(slot).decode(Level::Pml4) {
                free_subtree(arena, address, Level::Pdpt);
            }
        }
        arena.free(self.root);
        log_debug!(target: "thor::mm", "client space root {:#x} released", self.root);
    }
}

impl fmt::Debug for ClientPageSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientPageSpace").field("root", &self.root).finish_non_exhaustive()
    }
}
