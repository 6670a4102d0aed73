// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel heap backing `alloc` on bare metal
//! OWNERS: @kernel-mm-team
//! PUBLIC API: init(base, size)
//! DEPENDS_ON: linked_list_allocator::Heap, spin::Mutex
//! INVARIANTS: init() runs once before the first allocation; allocation masks interrupts

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use linked_list_allocator::Heap;

use crate::hal::irq::IrqGuard;

struct KernelHeap {
    heap: spin::Mutex<Heap>,
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let _irq = IrqGuard::new();
        match self.heap.lock().allocate_first_fit(layout) {
            Ok(block) => block.as_ptr(),
            Err(()) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, block: *mut u8, layout: Layout) {
        let _irq = IrqGuard::new();
        if let Some(block) = NonNull::new(block) {
            self.heap.lock().deallocate(block, layout);
        }
    }
}

#[global_allocator]
static HEAP: KernelHeap = KernelHeap { heap: spin::Mutex::new(Heap::empty()) };

/// Hands `[base, base + size)` to the kernel heap.
///
/// # Safety
/// The range must be mapped, writable and unused for the kernel's lifetime.
pub unsafe fn init(base: *mut u8, size: usize) {
    let _irq = IrqGuard::new();
    HEAP.heap.lock().init(base, size);
    log_info!(target: "thor::heap", "heap at {:p}, {:#x} bytes", base, size);
}
