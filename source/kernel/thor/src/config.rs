// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Compile-time kernel-core tunables
//! OWNERS: @kernel-team
//! PUBLIC API: MAX_CPUS, KERNEL_STACK_SIZE, DETACHED_STACK_SIZE, STACK_POISON, feature switches
//! DEPENDS_ON: Cargo features (stack_poison, log_transitions, debug_pt_verify)
//! INVARIANTS: Values are constants; nothing here is mutable at run time

/// CPU ceiling; bounded by the width of `types::CpuMask`.
pub const MAX_CPUS: usize = 64;

/// Size of every thread's kernel (trap/syscall) stack.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Size of the per-CPU stack that runs continuations after a self-transition.
pub const DETACHED_STACK_SIZE: usize = 16 * 1024;

/// Byte written over kernel stacks that a thread has left for good.
pub const STACK_POISON: u8 = 0xA5;

/// Root-table slot where the shared kernel half begins.
pub const KERNEL_HALF_FIRST_SLOT: usize = 256;

/// Whether consumed kernel stacks are poisoned.
pub const POISON_STACKS: bool = cfg!(feature = "stack_poison");

/// Whether run-state transitions are logged at info level.
pub const LOG_TRANSITIONS: bool = cfg!(feature = "log_transitions");

/// Whether client page tables are re-verified after every map.
pub const VERIFY_PAGE_TABLES: bool = cfg!(feature = "debug_pt_verify");

static_assertions::const_assert!(MAX_CPUS <= 64);
static_assertions::const_assert_eq!(KERNEL_STACK_SIZE % 16, 0);
static_assertions::const_assert_eq!(DETACHED_STACK_SIZE % 16, 0);
