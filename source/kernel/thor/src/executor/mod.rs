// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Saved register state of a thread and the paths in and out of it
//! OWNERS: @kernel-arch-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below (save paths, work redirection, FPU defaults)
//! PUBLIC API: Executor, GeneralState, FaultImage, IrqImage, SyscallImage, save_executor(), restore_executor()
//! DEPENDS_ON: hal::x86 (TLS bases, fxsave/fxrstor), switch.S
//! INVARIANTS: Frame structs mirror the trap stubs byte for byte; the syscall path never reads rbx/rcx/r11

extern crate alloc;

use alloc::boxed::Box;
use core::mem::offset_of;

use crate::hal::x86;

pub mod continuation;

pub use continuation::{fork_executor, run_detached, DetachedStack, KernelStack, StackState};

/// GDT layout shared with the trap stubs.
pub mod selectors {
    const fn selector(index: u16, rpl: u16) -> u16 {
        (index << 3) | rpl
    }

    pub const SYSTEM_IRQ_CODE: u16 = selector(4, 0);
    pub const EXECUTOR_FAULT_CODE: u16 = selector(5, 0);
    // syscall/sysret require the next four in this order.
    pub const EXECUTOR_SYSCALL_CODE: u16 = selector(6, 0);
    pub const EXECUTOR_KERNEL_DATA: u16 = selector(7, 0);
    pub const CLIENT_USER_COMPAT: u16 = selector(8, 3);
    pub const CLIENT_USER_DATA: u16 = selector(9, 3);
    pub const CLIENT_USER_CODE: u16 = selector(10, 3);
    pub const SYSTEM_IDLE_CODE: u16 = selector(11, 0);
    pub const SYSTEM_FIBER_CODE: u16 = selector(12, 0);

    /// Requested privilege level bits of a selector.
    pub const RPL_MASK: u16 = 3;

    /// Returns true if an `iretq` through `cs` enters ring 3, which needs
    /// the user GS base swapped in first.
    pub const fn returns_to_user(cs: u64) -> bool {
        cs as u16 & RPL_MASK == 3
    }
}

use selectors::*;

/// Interrupt flag in RFLAGS.
const RFLAGS_IF: u64 = 1 << 9;

/// General-purpose snapshot restored by `thor_restore_general`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneralState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub client_fs: u64,
    pub client_gs: u64,
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
core::arch::global_asm!(
    include_str!("switch.S"),
    OFF_RAX = const offset_of!(GeneralState, rax),
    OFF_RBX = const offset_of!(GeneralState, rbx),
    OFF_RCX = const offset_of!(GeneralState, rcx),
    OFF_RDX = const offset_of!(GeneralState, rdx),
    OFF_RDI = const offset_of!(GeneralState, rdi),
    OFF_RSI = const offset_of!(GeneralState, rsi),
    OFF_RBP = const offset_of!(GeneralState, rbp),
    OFF_R8 = const offset_of!(GeneralState, r8),
    OFF_R9 = const offset_of!(GeneralState, r9),
    OFF_R10 = const offset_of!(GeneralState, r10),
    OFF_R11 = const offset_of!(GeneralState, r11),
    OFF_R12 = const offset_of!(GeneralState, r12),
    OFF_R13 = const offset_of!(GeneralState, r13),
    OFF_R14 = const offset_of!(GeneralState, r14),
    OFF_R15 = const offset_of!(GeneralState, r15),
    OFF_RIP = const offset_of!(GeneralState, rip),
    OFF_CS = const offset_of!(GeneralState, cs),
    OFF_RFLAGS = const offset_of!(GeneralState, rflags),
    OFF_RSP = const offset_of!(GeneralState, rsp),
    OFF_SS = const offset_of!(GeneralState, ss),
    SEL_KERNEL_CODE = const EXECUTOR_SYSCALL_CODE,
    RPL_MASK = const RPL_MASK,
);

static_assertions::const_assert_eq!(offset_of!(GeneralState, rip), 15 * 8);
static_assertions::const_assert_eq!(core::mem::size_of::<GeneralState>(), 22 * 8);

/// FXSAVE area.
#[repr(C, align(64))]
#[derive(Clone)]
pub struct FxState([u8; 512]);

impl FxState {
    const FCW: usize = 0;
    const MXCSR: usize = 24;

    /// All x87 and SSE exceptions masked, extended precision.
    pub fn initial() -> Box<Self> {
        let mut state = Box::new(FxState([0; 512]));
        let fcw: u16 = 0x3F | (0b11 << 8);
        let mxcsr: u32 = 0x3F << 7;
        state.0[Self::FCW..Self::FCW + 2].copy_from_slice(&fcw.to_le_bytes());
        state.0[Self::MXCSR..Self::MXCSR + 4].copy_from_slice(&mxcsr.to_le_bytes());
        state
    }

    pub fn fcw(&self) -> u16 {
        u16::from_le_bytes([self.0[Self::FCW], self.0[Self::FCW + 1]])
    }

    pub fn mxcsr(&self) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.0[Self::MXCSR..Self::MXCSR + 4]);
        u32::from_le_bytes(raw)
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr()
    }

    fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }
}

/// Frame pushed by the fault stubs.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct FaultFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
    pub code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Frame pushed by the IRQ stubs.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct IrqFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Frame pushed by the syscall stub. rbx, rcx and r11 belong to the
/// syscall mechanism and are not part of it.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SyscallFrame {
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rax: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// Where the last snapshot of an executor came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOrigin {
    Fresh,
    Fault,
    Irq,
    Syscall,
    Fork,
}

mod sealed {
    pub trait Sealed {}
}

/// Trap image that `save_executor` can copy from.
pub trait ImageAccessor: sealed::Sealed {
    #[doc(hidden)]
    fn capture(&self, general: &mut GeneralState) -> SaveOrigin;
}

pub struct FaultImage<'a> {
    frame: &'a mut FaultFrame,
}

impl<'a> FaultImage<'a> {
    pub fn new(frame: &'a mut FaultFrame) -> Self {
        Self { frame }
    }

    pub fn ip(&self) -> u64 {
        self.frame.rip
    }

    pub fn code(&self) -> u64 {
        self.frame.code
    }

    /// Returns true if the fault was taken in kernel code.
    pub fn in_kernel_domain(&self) -> bool {
        let cs = self.frame.cs as u16;
        if [SYSTEM_IRQ_CODE, SYSTEM_IDLE_CODE, SYSTEM_FIBER_CODE, EXECUTOR_FAULT_CODE, EXECUTOR_SYSCALL_CODE].contains(&cs) {
            return true;
        }
        debug_assert!(cs == CLIENT_USER_CODE || cs == CLIENT_USER_COMPAT, "unexpected cs {cs:#x}");
        false
    }
}

impl sealed::Sealed for FaultImage<'_> {}

impl ImageAccessor for FaultImage<'_> {
    fn capture(&self, g: &mut GeneralState) -> SaveOrigin {
        let f = &*self.frame;
        (g.rax, g.rbx, g.rcx, g.rdx, g.rdi, g.rsi, g.rbp) = (f.rax, f.rbx, f.rcx, f.rdx, f.rdi, f.rsi, f.rbp);
        (g.r8, g.r9, g.r10, g.r11, g.r12, g.r13, g.r14, g.r15) = (f.r8, f.r9, f.r10, f.r11, f.r12, f.r13, f.r14, f.r15);
        (g.rip, g.cs, g.rflags, g.rsp, g.ss) = (f.rip, f.cs, f.rflags, f.rsp, f.ss);
        SaveOrigin::Fault
    }
}

pub struct IrqImage<'a> {
    frame: &'a mut IrqFrame,
}

impl<'a> IrqImage<'a> {
    pub fn new(frame: &'a mut IrqFrame) -> Self {
        Self { frame }
    }

    pub fn ip(&self) -> u64 {
        self.frame.rip
    }

    fn cs(&self) -> u16 {
        self.frame.cs as u16
    }

    /// The interrupted code belongs to a thread (user code or its kernel paths).
    pub fn in_thread_domain(&self) -> bool {
        matches!(self.cs(), EXECUTOR_FAULT_CODE | EXECUTOR_SYSCALL_CODE | CLIENT_USER_COMPAT | CLIENT_USER_CODE)
    }

    /// The interrupted code is user code whose state may be rewritten.
    pub fn in_manipulable_domain(&self) -> bool {
        matches!(self.cs(), CLIENT_USER_COMPAT | CLIENT_USER_CODE)
    }

    pub fn in_fiber_domain(&self) -> bool {
        self.cs() == SYSTEM_FIBER_CODE
    }

    pub fn in_idle_domain(&self) -> bool {
        self.cs() == SYSTEM_IDLE_CODE
    }
}

impl sealed::Sealed for IrqImage<'_> {}

impl ImageAccessor for IrqImage<'_> {
    fn capture(&self, g: &mut GeneralState) -> SaveOrigin {
        let f = &*self.frame;
        (g.rax, g.rbx, g.rcx, g.rdx, g.rdi, g.rsi, g.rbp) = (f.rax, f.rbx, f.rcx, f.rdx, f.rdi, f.rsi, f.rbp);
        (g.r8, g.r9, g.r10, g.r11, g.r12, g.r13, g.r14, g.r15) = (f.r8, f.r9, f.r10, f.r11, f.r12, f.r13, f.r14, f.r15);
        (g.rip, g.cs, g.rflags, g.rsp, g.ss) = (f.rip, f.cs, f.rflags, f.rsp, f.ss);
        SaveOrigin::Irq
    }
}

pub struct SyscallImage<'a> {
    frame: &'a mut SyscallFrame,
}

impl<'a> SyscallImage<'a> {
    pub fn new(frame: &'a mut SyscallFrame) -> Self {
        Self { frame }
    }

    pub fn number(&self) -> u64 {
        self.frame.rdi
    }

    /// Syscall arguments in ABI order.
    pub fn argument(&self, index: usize) -> Option<u64> {
        let f = &*self.frame;
        [f.rsi, f.rdx, f.rax, f.r8, f.r9, f.r10, f.r12, f.r13, f.r14].get(index).copied()
    }

    pub fn set_result(&mut self, error: u64, out0: u64, out1: u64) {
        self.frame.rdi = error;
        self.frame.rsi = out0;
        self.frame.rdx = out1;
    }
}

impl sealed::Sealed for SyscallImage<'_> {}

impl ImageAccessor for SyscallImage<'_> {
    fn capture(&self, g: &mut GeneralState) -> SaveOrigin {
        let f = &*self.frame;
        (g.rax, g.rdx, g.rdi, g.rsi, g.rbp) = (f.rax, f.rdx, f.rdi, f.rsi, f.rbp);
        (g.r8, g.r9, g.r10, g.r12, g.r13, g.r14, g.r15) = (f.r8, f.r9, f.r10, f.r12, f.r13, f.r14, f.r15);
        (g.rip, g.rflags, g.rsp) = (f.rip, f.rflags, f.rsp);
        // sysret reloads the fixed user selectors.
        g.cs = u64::from(CLIENT_USER_CODE);
        g.ss = u64::from(CLIENT_USER_DATA);
        SaveOrigin::Syscall
    }
}

/// Complete saved execution state of one thread.
pub struct Executor {
    general: GeneralState,
    fx: Box<FxState>,
    kernel_stack_top: u64,
    origin: SaveOrigin,
}

impl Executor {
    /// Executor that enters user mode at `ip` with stack `sp`. Traps taken
    /// while it runs land on `kernel_stack_top`.
    pub fn new_user(ip: u64, sp: u64, kernel_stack_top: u64) -> Self {
        let general = GeneralState {
            rip: ip,
            rsp: sp,
            rflags: RFLAGS_IF,
            cs: u64::from(CLIENT_USER_CODE),
            ss: u64::from(CLIENT_USER_DATA),
            ..GeneralState::default()
        };
        Self { general, fx: FxState::initial(), kernel_stack_top, origin: SaveOrigin::Fresh }
    }

    /// Kernel fiber entering `ip(argument)` on `stack_top`.
    pub fn new_fiber(ip: u64, stack_top: u64, argument: u64) -> Self {
        let general = GeneralState {
            rip: ip,
            rsp: stack_top,
            rdi: argument,
            rflags: RFLAGS_IF,
            cs: u64::from(SYSTEM_FIBER_CODE),
            ss: u64::from(EXECUTOR_KERNEL_DATA),
            ..GeneralState::default()
        };
        Self { general, fx: FxState::initial(), kernel_stack_top: 0, origin: SaveOrigin::Fresh }
    }

    pub fn general(&self) -> &GeneralState {
        &self.general
    }

    pub fn fx_state(&self) -> &FxState {
        &self.fx
    }

    pub fn kernel_stack_top(&self) -> u64 {
        self.kernel_stack_top
    }

    pub fn origin(&self) -> SaveOrigin {
        self.origin
    }

    pub(crate) fn general_mut(&mut self) -> &mut GeneralState {
        &mut self.general
    }

    pub(crate) fn set_origin(&mut self, origin: SaveOrigin) {
        self.origin = origin;
    }

    /// Captures TLS bases and extended state of the running CPU.
    pub(crate) fn capture_cpu_state(&mut self) {
        if let Some(bases) = x86::tls_bases() {
            self.general.client_fs = bases.fs;
            self.general.client_gs = bases.gs;
        }
        // SAFETY: FxState is 512 bytes and 64-byte aligned.
        unsafe { x86::fxsave(self.fx.as_mut_ptr()) };
    }

    /// Makes the next restore enter the work stub at `stub_ip`, which drains
    /// the thread's work queue and then `iretq`s into the saved context
    /// through the frame built here.
    ///
    /// The stub itself runs in ring 0, so the restore leaves GS alone. The
    /// stub swaps GS before its own `iretq` when the saved `cs` returns to
    /// user mode.
    ///
    /// # Safety
    /// `kernel_stack_top` must be the top of a writable stack with at least
    /// five free words below it.
    pub unsafe fn redirect_to_work(&mut self, stub_ip: u64) {
        let frame = [self.general.rip, self.general.cs, self.general.rflags, self.general.rsp, self.general.ss];
        let sp = (self.kernel_stack_top as *mut u64).sub(frame.len());
        core::ptr::copy_nonoverlapping(frame.as_ptr(), sp, frame.len());

        self.general.rip = stub_ip;
        self.general.cs = u64::from(EXECUTOR_SYSCALL_CODE);
        self.general.rflags &= !RFLAGS_IF;
        self.general.rsp = sp as u64;
        self.general.ss = 0;
    }
}

/// Trap images a thread can be interrupted from synchronously.
pub trait SynchronousImage: ImageAccessor {}

impl SynchronousImage for FaultImage<'_> {}
impl SynchronousImage for SyscallImage<'_> {}

/// Address `redirect_to_work` points a suspended executor at.
pub fn work_stub_address() -> u64 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        extern "C" {
            fn thor_work_stub();
        }
        thor_work_stub as usize as u64
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        crate::thread::run_current_work as usize as u64
    }
}

/// Copies a trap image plus FPU/TLS state into `executor`.
pub fn save_executor<I: ImageAccessor>(executor: &mut Executor, image: &I) {
    let origin = image.capture(&mut executor.general);
    executor.origin = origin;
    executor.capture_cpu_state();
}

/// Enters the saved state. Interrupts must be masked; the caller already
/// installed the executor's kernel stack as the next trap stack.
///
/// # Safety
/// `executor` must stay valid until the thread traps again.
pub unsafe fn restore_executor(executor: *const Executor) -> ! {
    let executor = &*executor;
    let cs = executor.general.cs as u16;
    assert!(
        matches!(cs, EXECUTOR_FAULT_CODE | EXECUTOR_SYSCALL_CODE | CLIENT_USER_CODE | SYSTEM_FIBER_CODE),
        "restoring executor with cs {:#x}",
        cs
    );

    x86::set_tls_bases(x86::TlsBases { fs: executor.general.client_fs, gs: executor.general.client_gs });
    x86::fxrstor(executor.fx.as_ptr());
    if returns_to_user(executor.general.cs) {
        x86::swapgs();
    }

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        extern "C" {
            fn thor_restore_general(general: *const GeneralState) -> !;
        }
        thor_restore_general(&executor.general)
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        panic!("restore_executor at rip {:#x} needs bare metal", executor.general.rip)
    }
}
