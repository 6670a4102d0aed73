// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical memory collaborators consumed by the page-table code.

use core::ptr::NonNull;

use crate::types::PhysicalAddr;

/// Frame allocator. `allocate` returns `None` when memory is exhausted.
pub trait PhysicalAllocator: Sync {
    fn allocate(&self, size: usize) -> Option<PhysicalAddr>;
    fn free(&self, address: PhysicalAddr, size: usize);
}

/// Makes physical pages addressable by the kernel.
///
/// # Safety
/// `access(pa)` for a page-aligned `pa` handed out by the paired allocator must
/// return a pointer that is page aligned, valid for reads and writes of
/// `PAGE_SIZE` bytes, and stays valid for as long as the frame is allocated.
pub unsafe trait PhysicalAccessWindow: Sync {
    fn access(&self, address: PhysicalAddr) -> NonNull<u8>;
}

/// Window over a linear mapping of all physical memory at `offset`.
pub struct DirectMapWindow {
    offset: u64,
}

impl DirectMapWindow {
    /// # Safety
    /// Physical memory must be mapped read/write at `offset` for the kernel's lifetime.
    pub const unsafe fn new(offset: u64) -> Self {
        Self { offset }
    }
}

unsafe impl PhysicalAccessWindow for DirectMapWindow {
    fn access(&self, address: PhysicalAddr) -> NonNull<u8> {
        let virt = self.offset.wrapping_add(address.as_u64());
        match NonNull::new(virt as *mut u8) {
            Some(ptr) => ptr,
            None => panic!("direct map window yields null for {:#x}", address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_map_adds_the_offset() {
        // SAFETY: the window is only asked for addresses, never dereferenced.
        let window = unsafe { DirectMapWindow::new(0xFFFF_8000_0000_0000) };
        let ptr = window.access(PhysicalAddr::new(0x20_3000));
        assert_eq!(ptr.as_ptr() as u64, 0xFFFF_8000_0020_3000);
    }
}
