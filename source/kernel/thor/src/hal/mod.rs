// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.

pub mod irq;
pub mod x86;

use crate::mm::PAGE_SIZE;
use crate::types::{CpuMask, PhysicalAddr, VirtualAddr};

/// Local TLB and translation-root operations of one CPU.
pub trait Tlb: Sync {
    /// Drops any cached translation for the page containing `address`.
    fn invalidate_page(&self, address: VirtualAddr);

    /// Switches the translation root. Flushes all non-global entries.
    fn load_root(&self, root: PhysicalAddr);

    /// Invalidates every page of `[address, address + size)`.
    fn invalidate_range(&self, address: VirtualAddr, size: usize) {
        let mut offset = 0;
        while offset < size {
            self.invalidate_page(address.offset(offset as u64));
            offset += PAGE_SIZE;
        }
    }
}

/// Delivery of the shootdown inter-processor interrupt.
pub trait ShootdownIpi: Sync {
    /// Raises the shootdown vector on every CPU in `targets`.
    fn send_shootdown(&self, targets: CpuMask);
}
