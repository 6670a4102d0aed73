// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address spaces, x86-64 page tables and TLB shootdown
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per file + mm::tests + proptest (mm::tests_prop)
//! PUBLIC API: PageSpace, ShootNode, PageBinding, GlobalPageBinding, KernelPageSpace, ClientPageSpace
//! DEPENDS_ON: hal::{Tlb, ShootdownIpi}, phys::{PhysicalAllocator, PhysicalAccessWindow}
//! INVARIANTS: Table edits and TLB invalidation are separate steps; a frame is reusable only after its ShootNode completed

pub mod binding;
pub mod client_space;
pub mod kernel_space;
pub mod page_space;
pub mod page_table;
pub mod phys;

#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod tests_prop;

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

pub use binding::{GlobalPageBinding, PageBinding};
pub use client_space::{ClientPageSpace, Walk};
pub use kernel_space::KernelPageSpace;
pub use page_space::{PageSpace, ShootNode, ShootdownOutcome};
pub use page_table::{CachingMode, PageAccess, PageStatus};
pub use phys::{PhysicalAccessWindow, PhysicalAllocator};
