// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel synchronisation helpers
//! OWNERS: @kernel-sync-team
//! PUBLIC API: CpuLocal (reentrancy-checked per-CPU cell), IrqGuard (re-export)
//! DEPENDS_ON: spin, hal::irq
//! INVARIANTS: Per-CPU state is never entered twice on the same CPU

pub mod cpu_local;

pub use crate::hal::irq::IrqGuard;
pub use cpu_local::{CpuLocal, CpuLocalGuard};
