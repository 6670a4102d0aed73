// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: THOR kernel core: x86-64 paging, cross-CPU TLB shootdown and the thread run-state machine
//! OWNERS: @kernel-mm-team @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Host unit tests per module + proptest suites (mm::tests_prop, thread::tests)
//! PUBLIC API: mm::{PageSpace, ShootNode, KernelPageSpace, ClientPageSpace, PageBinding}, thread::Thread, kernel::Kernel
//! DEPENDS_ON: spin, bitflags, static_assertions, linked_list_allocator and x86_64 (bare metal only)
//! INVARIANTS: No unwrap in kernel paths; page-table edits never invalidate implicitly
//!
//! The crate builds for two environments. On `x86_64-unknown-none` the
//! architectural hooks (`invlpg`, CR3, GS-based CPU context, `iretq`) are
//! real. Everywhere else they are inert stubs so the bookkeeping can be
//! exercised by `cargo test` with simulated physical memory.

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::unwrap_used)]

extern crate alloc;

#[macro_use]
pub mod diag;
pub use diag::log;

pub mod config;
pub mod cpu;
pub mod executor;
pub mod hal;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod heap;
pub mod kernel;
pub mod mm;
#[cfg(all(feature = "panic_handler", target_arch = "x86_64", target_os = "none"))]
mod panic;
pub mod sched;
pub mod sync;
pub mod thread;
pub mod types;
pub mod uart;
