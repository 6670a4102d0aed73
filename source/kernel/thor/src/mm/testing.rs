// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Host doubles for physical memory, TLBs and IPIs.

extern crate alloc;

use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use super::kernel_space::KernelPageSpace;
use super::page_table::{Pte, TableArena, TABLE_ENTRIES};
use super::phys::{PhysicalAccessWindow, PhysicalAllocator};
use super::PAGE_SIZE;
use crate::config::KERNEL_HALF_FIRST_SLOT;
use crate::hal::{ShootdownIpi, Tlb};
use crate::kernel::Platform;
use crate::types::{CpuId, CpuMask, PhysicalAddr, VirtualAddr};

pub(crate) fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE]);

/// Simulated physical memory: frames are heap pages keyed by a fake address.
pub(crate) struct FakeMemory {
    frames: spin::Mutex<BTreeMap<u64, Box<Frame>>>,
    next: AtomicU64,
    limit: Option<usize>,
}

impl FakeMemory {
    pub(crate) fn new() -> Self {
        Self { frames: spin::Mutex::new(BTreeMap::new()), next: AtomicU64::new(0x10_0000), limit: None }
    }

    /// Memory that refuses to hold more than `frames` live frames.
    pub(crate) fn with_limit(frames: usize) -> Self {
        Self { limit: Some(frames), ..Self::new() }
    }

    pub(crate) fn live_frames(&self) -> usize {
        self.frames.lock().len()
    }

    pub(crate) fn is_live(&self, address: PhysicalAddr) -> bool {
        self.frames.lock().contains_key(&address.as_u64())
    }
}

impl PhysicalAllocator for FakeMemory {
    fn allocate(&self, size: usize) -> Option<PhysicalAddr> {
        assert_eq!(size, PAGE_SIZE);
        let mut frames = self.frames.lock();
        if self.limit.is_some_and(|limit| frames.len() >= limit) {
            return None;
        }
        let address = self.next.fetch_add(PAGE_SIZE as u64, Ordering::Relaxed);
        // Stale bytes make missing zeroing visible.
        frames.insert(address, Box::new(Frame([0xEE; PAGE_SIZE])));
        Some(PhysicalAddr::new(address))
    }

    fn free(&self, address: PhysicalAddr, size: usize) {
        assert_eq!(size, PAGE_SIZE);
        assert!(self.frames.lock().remove(&address.as_u64()).is_some(), "double free of {:#x}", address);
    }
}

unsafe impl PhysicalAccessWindow for FakeMemory {
    fn access(&self, address: PhysicalAddr) -> NonNull<u8> {
        let mut frames = self.frames.lock();
        match frames.get_mut(&address.as_u64()) {
            Some(frame) => NonNull::from(&mut frame.0).cast(),
            None => panic!("access to unallocated frame {:#x}", address),
        }
    }
}

/// Something a `RecordingTlb` saw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TlbEvent {
    Invalidate { cpu: CpuId, address: VirtualAddr },
    LoadRoot { cpu: CpuId, root: PhysicalAddr },
}

#[derive(Default)]
pub(crate) struct TlbLog {
    events: spin::Mutex<Vec<TlbEvent>>,
}

impl TlbLog {
    pub(crate) fn events(&self) -> Vec<TlbEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn clear(&self) {
        self.events.lock().clear();
    }

    pub(crate) fn invalidations(&self, cpu: CpuId) -> Vec<VirtualAddr> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match *event {
                TlbEvent::Invalidate { cpu: c, address } if c == cpu => Some(address),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn last_root(&self, cpu: CpuId) -> Option<PhysicalAddr> {
        self.events.lock().iter().rev().find_map(|event| match *event {
            TlbEvent::LoadRoot { cpu: c, root } if c == cpu => Some(root),
            _ => None,
        })
    }
}

pub(crate) struct RecordingTlb {
    cpu: CpuId,
    log: &'static TlbLog,
}

impl RecordingTlb {
    pub(crate) fn new(cpu: CpuId, log: &'static TlbLog) -> Self {
        Self { cpu, log }
    }
}

impl Tlb for RecordingTlb {
    fn invalidate_page(&self, address: VirtualAddr) {
        self.log.events.lock().push(TlbEvent::Invalidate { cpu: self.cpu, address });
    }

    fn load_root(&self, root: PhysicalAddr) {
        self.log.events.lock().push(TlbEvent::LoadRoot { cpu: self.cpu, root });
    }
}

/// Collects shootdown IPIs until a test delivers them.
#[derive(Default)]
pub(crate) struct RecordingIpi {
    pending: spin::Mutex<CpuMask>,
    sent: AtomicU64,
}

impl RecordingIpi {
    /// Returns and clears the CPUs with an undelivered IPI.
    pub(crate) fn take(&self) -> CpuMask {
        core::mem::take(&mut *self.pending.lock())
    }

    pub(crate) fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl ShootdownIpi for RecordingIpi {
    fn send_shootdown(&self, targets: CpuMask) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.lock();
        *pending = CpuMask::from_bits(pending.bits() | targets.bits());
    }
}

/// Platform over fresh fake memory, plus handles to its doubles.
pub(crate) struct TestPlatform {
    pub(crate) platform: &'static Platform,
    pub(crate) memory: &'static FakeMemory,
    pub(crate) ipi: &'static RecordingIpi,
    pub(crate) tlb_log: &'static TlbLog,
}

impl TestPlatform {
    pub(crate) fn new() -> Self {
        Self::over(leak(FakeMemory::new()))
    }

    pub(crate) fn over(memory: &'static FakeMemory) -> Self {
        let ipi = leak(RecordingIpi::default());
        let platform = leak(Platform { allocator: memory, window: memory, ipi });
        Self { platform, memory, ipi, tlb_log: leak(TlbLog::default()) }
    }

    pub(crate) fn tlb(&self, cpu: u16) -> &'static RecordingTlb {
        leak(RecordingTlb::new(CpuId::from_raw(cpu), self.tlb_log))
    }

    /// Kernel root whose upper half is fully populated, as left by boot.
    pub(crate) fn kernel_root(&self) -> PhysicalAddr {
        let arena = TableArena::new(self.memory, self.memory);
        let root = arena.allocate();
        let table = arena.table(root);
        for slot in KERNEL_HALF_FIRST_SLOT..TABLE_ENTRIES {
            table.store(slot, Pte::table(arena.allocate(), false));
        }
        root
    }

    pub(crate) fn kernel_space(&self) -> KernelPageSpace {
        KernelPageSpace::new(self.platform, self.kernel_root())
    }
}
