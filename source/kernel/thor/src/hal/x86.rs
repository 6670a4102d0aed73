// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Native x86-64 implementations of the HAL traits and register helpers
//! OWNERS: @kernel-arch-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: No host tests (inert stubs off target; exercised on hardware)
//! PUBLIC API: NativeTlb, X2ApicShootdown, tls_bases(), set_tls_bases(), cpu_base(), set_cpu_base(), fxsave(), fxrstor(), swapgs()
//! DEPENDS_ON: x86_64 crate (bare metal only)
//! INVARIANTS: PCIDs are not used, so every CR3 load flushes all non-global translations

use super::{ShootdownIpi, Tlb};
use crate::types::{CpuMask, PhysicalAddr, VirtualAddr};

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use x86_64::{
    registers::{
        control::{Cr3, Cr3Flags},
        model_specific::{FsBase, GsBase, KernelGsBase, Msr},
    },
    structures::paging::PhysFrame,
};

/// x2APIC interrupt command register.
const X2APIC_ICR: u32 = 0x830;

/// TLB of the CPU executing the call.
pub struct NativeTlb;

impl Tlb for NativeTlb {
    fn invalidate_page(&self, address: VirtualAddr) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new_truncate(address.as_u64()));
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        let _ = address;
    }

    fn load_root(&self, root: PhysicalAddr) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(root.as_u64()));
            Cr3::write(frame, Cr3Flags::empty());
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        let _ = root;
    }
}

/// Shootdown IPIs through the x2APIC. CPU ids equal APIC ids.
pub struct X2ApicShootdown {
    vector: u8,
}

impl X2ApicShootdown {
    pub const fn new(vector: u8) -> Self {
        Self { vector }
    }
}

impl ShootdownIpi for X2ApicShootdown {
    fn send_shootdown(&self, targets: CpuMask) {
        for cpu in targets.iter() {
            let command = (u64::from(cpu.as_raw()) << 32) | u64::from(self.vector);
            #[cfg(all(target_arch = "x86_64", target_os = "none"))]
            unsafe {
                Msr::new(X2APIC_ICR).write(command);
            }
            #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
            let _ = (command, X2APIC_ICR);
        }
    }
}

/// Client TLS bases: FS and the swapped-out user GS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TlsBases {
    pub fs: u64,
    pub gs: u64,
}

/// Reads the client TLS bases of the current CPU. `None` off target.
pub fn tls_bases() -> Option<TlsBases> {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        Some(TlsBases { fs: FsBase::read().as_u64(), gs: KernelGsBase::read().as_u64() })
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        None
    }
}

/// Installs client TLS bases.
///
/// # Safety
/// Must run with interrupts masked on the way back to the owning thread.
#[allow(unused_unsafe)]
pub unsafe fn set_tls_bases(bases: TlsBases) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        FsBase::write(x86_64::VirtAddr::new_truncate(bases.fs));
        KernelGsBase::write(x86_64::VirtAddr::new_truncate(bases.gs));
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = bases;
}

/// Returns the kernel GS base, which holds the current CPU context.
pub fn cpu_base() -> u64 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        GsBase::read().as_u64()
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        0
    }
}

/// # Safety
/// `base` must point at a `CpuContext` that outlives the CPU.
#[allow(unused_unsafe)]
pub unsafe fn set_cpu_base(base: u64) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        GsBase::write(x86_64::VirtAddr::new_truncate(base));
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = base;
}

/// Saves x87/SSE state into a 512-byte, 16-byte aligned area.
///
/// # Safety
/// `area` must be valid for 512 bytes and 16-byte aligned.
pub unsafe fn fxsave(area: *mut u8) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    core::arch::asm!("fxsave64 [{}]", in(reg) area, options(nostack, preserves_flags));
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = area;
}

/// # Safety
/// `area` must hold an image written by `fxsave` or a valid initial image.
pub unsafe fn fxrstor(area: *const u8) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    core::arch::asm!("fxrstor64 [{}]", in(reg) area, options(nostack, preserves_flags));
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = area;
}

/// # Safety
/// Only on the final path back to user mode.
pub unsafe fn swapgs() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    core::arch::asm!("swapgs", options(nostack, preserves_flags));
}
