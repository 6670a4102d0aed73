// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! x86-64 4-level page-table format and the table arena.
//!
//! Tables are never held as live pointers. Every access names a table by its
//! physical address and goes through the `PhysicalAccessWindow`; entries are
//! atomics because the MMU sets accessed/dirty bits concurrently.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use super::phys::{PhysicalAccessWindow, PhysicalAllocator};
use super::PAGE_SIZE;
use crate::types::{PhysicalAddr, VirtualAddr};

/// Entries per table at every level.
pub const TABLE_ENTRIES: usize = 512;
/// Physical-address bits of an entry.
pub const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;
/// Page-size bit of PDPT/PD entries; shares bit 7 with `PteFlags::PAT` in PT entries.
const HUGE_PAGE: u64 = 1 << 7;

/// PAT MSR layout assumed by `CachingMode::pte_bits`:
/// WB, WT, UC-, UC, WB, WC, UC-, UC.
pub const PAT_LAYOUT: u64 = 0x0007_0106_0007_0406;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Architectural bits of a 4 KiB page-table entry.
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const PAT = 1 << 7;
        const GLOBAL = 1 << 8;
        const NO_EXECUTE = 1 << 63;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Access rights requested by callers of the map operations.
    pub struct PageAccess: u32 {
        const WRITE = 1;
        const EXECUTE = 2;
        const READ = 4;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// State of a leaf observed by unmap/clean.
    pub struct PageStatus: u8 {
        const PRESENT = 1;
        const DIRTY = 2;
    }
}

impl PageStatus {
    pub(crate) fn of(pte: Pte) -> Self {
        let mut status = PageStatus::empty();
        if pte.is_present() {
            status |= PageStatus::PRESENT;
            if pte.flags().contains(PteFlags::DIRTY) {
                status |= PageStatus::DIRTY;
            }
        }
        status
    }
}

/// Memory type of a mapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CachingMode {
    #[default]
    Null,
    Uncached,
    WriteCombine,
    WriteThrough,
    WriteBack,
    Mmio,
    MmioNonPosted,
}

impl CachingMode {
    /// PAT index bits selecting this memory type under `PAT_LAYOUT`.
    pub const fn pte_bits(self) -> PteFlags {
        match self {
            CachingMode::Null | CachingMode::WriteBack => PteFlags::empty(),
            CachingMode::WriteThrough => PteFlags::WRITE_THROUGH,
            CachingMode::WriteCombine => PteFlags::PAT.union(PteFlags::WRITE_THROUGH),
            CachingMode::Uncached | CachingMode::Mmio | CachingMode::MmioNonPosted => {
                PteFlags::PAT.union(PteFlags::CACHE_DISABLE).union(PteFlags::WRITE_THROUGH)
            }
        }
    }
}

/// Translation level, root first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl Level {
    /// Address bit where this level's index starts.
    pub(crate) const fn shift(self) -> u32 {
        match self {
            Level::Pml4 => 39,
            Level::Pdpt => 30,
            Level::Pd => 21,
            Level::Pt => 12,
        }
    }

    /// Slot selected by `va` at this level.
    #[inline]
    pub const fn index(self, va: VirtualAddr) -> usize {
        ((va.as_u64() >> self.shift()) & 0x1FF) as usize
    }

    pub const fn next(self) -> Option<Level> {
        match self {
            Level::Pml4 => Some(Level::Pdpt),
            Level::Pdpt => Some(Level::Pd),
            Level::Pd => Some(Level::Pt),
            Level::Pt => None,
        }
    }
}

/// Raw 64-bit entry value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(u64);

/// Decoded entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Entry {
    Absent,
    Table { address: PhysicalAddr, user: bool },
    Leaf { address: PhysicalAddr, flags: PteFlags },
}

impl Pte {
    pub const ABSENT: Pte = Pte(0);

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_present(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    #[inline]
    pub const fn address(self) -> PhysicalAddr {
        PhysicalAddr::new(self.0 & ADDRESS_MASK)
    }

    #[inline]
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_retain(self.0 & !ADDRESS_MASK)
    }

    /// Entry pointing at a next-level table.
    pub fn table(address: PhysicalAddr, user: bool) -> Self {
        debug_assert!(address.is_page_aligned());
        let mut flags = PteFlags::PRESENT | PteFlags::WRITE;
        if user {
            flags |= PteFlags::USER;
        }
        Self(address.as_u64() | flags.bits())
    }

    /// 4 KiB leaf entry.
    pub fn leaf(address: PhysicalAddr, flags: PteFlags) -> Self {
        debug_assert!(address.is_page_aligned());
        Self(address.as_u64() | (flags | PteFlags::PRESENT).bits())
    }

    pub fn decode(self, level: Level) -> Entry {
        if !self.is_present() {
            return Entry::Absent;
        }
        if level == Level::Pt || self.0 & HUGE_PAGE != 0 {
            return Entry::Leaf { address: self.address(), flags: self.flags() };
        }
        Entry::Table { address: self.address(), user: self.flags().contains(PteFlags::USER) }
    }
}

/// One page-table page.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [AtomicU64; TABLE_ENTRIES],
}

static_assertions::const_assert_eq!(core::mem::size_of::<PageTable>(), PAGE_SIZE);

impl PageTable {
    #[inline]
    pub fn load(&self, slot: usize) -> Pte {
        Pte(self.entries[slot].load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, slot: usize, pte: Pte) {
        self.entries[slot].store(pte.0, Ordering::Release);
    }

    /// Replaces the entry, returning the value the MMU last saw.
    #[inline]
    pub fn swap(&self, slot: usize, pte: Pte) -> Pte {
        Pte(self.entries[slot].swap(pte.0, Ordering::AcqRel))
    }

    /// Clears `flags` in place, returning the previous value.
    #[inline]
    pub fn clear_flags(&self, slot: usize, flags: PteFlags) -> Pte {
        Pte(self.entries[slot].fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    pub fn zero(&self) {
        for entry in &self.entries {
            entry.store(0, Ordering::Relaxed);
        }
    }
}

/// User/supervisor tag of intermediate tables created or crossed by a walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TableTag {
    Supervisor,
    User,
}

impl TableTag {
    pub(crate) const fn from_user(user: bool) -> Self {
        if user {
            TableTag::User
        } else {
            TableTag::Supervisor
        }
    }

    const fn is_user(self) -> bool {
        matches!(self, TableTag::User)
    }
}

/// Page-table pages addressed by physical address through the access window.
#[derive(Clone, Copy)]
pub struct TableArena<'a> {
    allocator: &'a dyn PhysicalAllocator,
    window: &'a dyn PhysicalAccessWindow,
}

impl<'a> TableArena<'a> {
    pub fn new(allocator: &'a dyn PhysicalAllocator, window: &'a dyn PhysicalAccessWindow) -> Self {
        Self { allocator, window }
    }

    /// Views the table stored in frame `address`.
    pub fn table(&self, address: PhysicalAddr) -> &'a PageTable {
        debug_assert!(address.is_page_aligned());
        // SAFETY: the window contract guarantees an aligned, PAGE_SIZE-byte
        // mapping for allocated frames; PageTable is all atomics, so shared
        // references are sound even while other CPUs edit entries.
        unsafe { self.window.access(address).cast::<PageTable>().as_ref() }
    }

    /// Allocates and zeroes a table. Running out of memory here is fatal.
    pub fn allocate(&self) -> PhysicalAddr {
        match self.allocator.allocate(PAGE_SIZE) {
            Some(address) => {
                assert!(address.is_page_aligned(), "allocator returned unaligned frame {:#x}", address);
                self.table(address).zero();
                address
            }
            None => {
                log_error!(target: "thor::mm", "OOM while allocating a page table");
                panic!("out of memory while allocating a page table");
            }
        }
    }

    pub fn free(&self, address: PhysicalAddr) {
        self.allocator.free(address, PAGE_SIZE);
    }

    /// Walks from `root` to the PT covering `va`, creating missing tables with
    /// `tag`. Existing tables must carry the same tag.
    pub(crate) fn walk_create(&self, root: PhysicalAddr, va: VirtualAddr, tag: TableTag) -> &'a PageTable {
        let mut table = self.table(root);
        let mut level = Level::Pml4;
        while let Some(next) = level.next() {
            let slot = level.index(va);
            let address = match table.load(slot).decode(level) {
                Entry::Table { address, user } => {
                    if user != tag.is_user() {
                        log_error!(target: "thor::mm", "user/supervisor mix at {:#x} ({:?} slot {})", va, level, slot);
                        panic!("table tag mismatch at {:#x}: existing user={} requested user={}", va, user, tag.is_user());
                    }
                    address
                }
                Entry::Absent => {
                    let fresh = self.allocate();
                    table.store(slot, Pte::table(fresh, tag.is_user()));
                    fresh
                }
                Entry::Leaf { .. } => panic!("huge page in 4 KiB walk at {:#x} ({:?})", va, level),
            };
            table = self.table(address);
            level = next;
        }
        table
    }

    /// Walks from `root` to the PT covering `va` without allocating.
    pub(crate) fn walk_existing(&self, root: PhysicalAddr, va: VirtualAddr) -> Option<&'a PageTable> {
        let mut table = self.table(root);
        let mut level = Level::Pml4;
        while let Some(next) = level.next() {
            match table.load(level.index(va)).decode(level) {
                Entry::Table { address, .. } => table = self.table(address),
                Entry::Absent | Entry::Leaf { .. } => return None,
            }
            level = next;
        }
        Some(table)
    }
}
