// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Thread run-state machine and cross-thread control
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (thread::tests) against a recording scheduler
//! PUBLIC API: Thread (self/cross transitions, observe, invoke), RunState, Interrupt, ThreadError
//! DEPENDS_ON: executor (save/fork/detached), sched::Scheduler, cpu::CpuContext, mm::ClientPageSpace
//! INVARIANTS: Thread lock only with interrupts masked; observers fire after the lock is released;
//!             stateSeq only grows; Terminated is final
//!
//! Self-transitions (`*_current`) run on the thread that changes state. They
//! leave through the same tail: scheduler bookkeeping, state capture, then a
//! continuation on the CPU's detached stack that unlocks, wakes observers and
//! commits the reschedule. On bare metal that tail does not come back; the
//! thread continues when it is invoked again. Host builds return once the
//! continuation has run.
//!
//! Cross-thread operations (`*_other`, `observe`) never block.

extern crate alloc;

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::config::KERNEL_STACK_SIZE;
use crate::cpu::{self, CpuContext};
use crate::executor::{
    fork_executor, restore_executor, run_detached, save_executor, work_stub_address, Executor, IrqImage,
    KernelStack, SynchronousImage, SyscallImage,
};
use crate::hal::irq::{self, IrqGuard};
use crate::mm::ClientPageSpace;
use crate::sched::Scheduler;
use crate::types::{CpuMask, ThreadId};

pub mod work_queue;

#[cfg(test)]
mod tests;

pub use work_queue::{WorkItem, WorkQueue};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// Running on a CPU.
    Active,
    /// Waiting for `unblock_other`.
    Blocked,
    /// Runnable; resumes in kernel code.
    Deferred,
    /// Runnable; resumes in user code.
    Suspended,
    /// Stopped until `resume_other`.
    Interrupted,
    Terminated,
}

/// Why a thread last entered `Interrupted`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Interrupt {
    #[default]
    Null,
    DivByZero,
    Requested,
    Panic,
    Breakpoint,
    PageFault,
    GeneralFault,
    IllegalInstruction,
    SuperCall,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Signal {
    None,
    Interrupt,
}

/// Errors of cross-thread operations.
#[must_use = "thread errors must be handled explicitly"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadError {
    /// The thread is not in a state that allows the operation.
    IllegalState,
    /// The thread has terminated.
    ThreadExited,
}

impl fmt::Display for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadError::IllegalState => f.write_str("illegal thread state"),
            ThreadError::ThreadExited => f.write_str("thread exited"),
        }
    }
}

/// State reported to an observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Observation {
    pub sequence: u64,
    pub interrupt: Interrupt,
}

pub type ObserveResult = Result<Observation, ThreadError>;

pub type Observer = Box<dyn FnOnce(ObserveResult) + Send>;

struct ThreadState {
    run_state: RunState,
    last_interrupt: Interrupt,
    sequence: u64,
    pending_kill: bool,
    pending_signal: Signal,
    observers: Vec<Observer>,
    executor: Executor,
    scheduler: Option<&'static dyn Scheduler>,
    affinity: CpuMask,
}

impl ThreadState {
    fn enter(&mut self, id: ThreadId, next: RunState) {
        log_transition!("thread {} {:?} -> {:?}", id, self.run_state, next);
        self.run_state = next;
    }

    #[track_caller]
    fn assert_active(&self, id: ThreadId) {
        assert_eq!(self.run_state, RunState::Active, "thread {} is not active", id);
    }
}

/// What the shared exit tail tells the scheduler and the observers.
struct Exit {
    suspend: bool,
    unassociate: bool,
    rehome: Option<&'static dyn Scheduler>,
    wake: Option<ObserveResult>,
}

impl Exit {
    const YIELD: Self = Self { suspend: false, unassociate: false, rehome: None, wake: None };
    const STOP: Self = Self { suspend: true, ..Self::YIELD };
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub struct Thread {
    id: ThreadId,
    state: spin::Mutex<ThreadState>,
    unblock_latch: AtomicBool,
    kernel_stack: KernelStack,
    address_space: Arc<ClientPageSpace>,
    work: WorkQueue,
}

impl Thread {
    /// New user thread entering `ip` with stack `sp`. Starts `Interrupted`
    /// at sequence 1; `resume_other` lets it run.
    pub fn new(address_space: Arc<ClientPageSpace>, ip: u64, sp: u64) -> Arc<Self> {
        let id = ThreadId::from_raw(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        let kernel_stack = KernelStack::new(KERNEL_STACK_SIZE);
        let executor = Executor::new_user(ip, sp, kernel_stack.top());
        log_debug!(target: "thor::thread", "thread {} created at ip {:#x}", id, ip);
        Arc::new(Self {
            id,
            state: spin::Mutex::new(ThreadState {
                run_state: RunState::Interrupted,
                last_interrupt: Interrupt::Null,
                sequence: 1,
                pending_kill: false,
                pending_signal: Signal::None,
                observers: Vec::new(),
                executor,
                scheduler: None,
                affinity: CpuMask::from_bits(u64::MAX),
            }),
            unblock_latch: AtomicBool::new(false),
            kernel_stack,
            address_space,
            work: WorkQueue::new(),
        })
    }

    /// Thread running on the current CPU, if any.
    pub fn current() -> Option<Arc<Thread>> {
        cpu::try_current()?.active_thread()
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn run_state(&self) -> RunState {
        self.lock().run_state
    }

    pub fn state_sequence(&self) -> u64 {
        self.lock().sequence
    }

    pub fn last_interrupt(&self) -> Interrupt {
        self.lock().last_interrupt
    }

    pub fn has_pending_kill(&self) -> bool {
        self.lock().pending_kill
    }

    pub fn address_space(&self) -> &Arc<ClientPageSpace> {
        &self.address_space
    }

    pub fn kernel_stack(&self) -> &KernelStack {
        &self.kernel_stack
    }

    pub fn work_queue(&self) -> &WorkQueue {
        &self.work
    }

    pub fn affinity(&self) -> CpuMask {
        self.lock().affinity
    }

    pub fn set_affinity(&self, mask: CpuMask) {
        assert!(!mask.is_empty(), "thread {} affinity must not be empty", self.id);
        self.lock().affinity = mask;
    }

    /// Hands the thread to `scheduler`. A thread has at most one scheduler.
    pub fn associate(self: &Arc<Self>, scheduler: &'static dyn Scheduler) {
        let mut state = self.lock();
        assert!(state.scheduler.is_none(), "thread {} associated twice", self.id);
        scheduler.associate(self);
        state.scheduler = Some(scheduler);
    }

    /// Queues `item` and wakes the thread if it is blocked.
    pub fn post_work(self: &Arc<Self>, item: WorkItem) {
        self.work.post(item);
        let mut state = self.lock();
        if state.run_state != RunState::Blocked {
            return;
        }
        state.enter(self.id, RunState::Deferred);
        self.resume_on(&state);
    }

    fn lock(&self) -> LockedState<'_> {
        let irq = IrqGuard::new();
        LockedState { guard: self.state.lock(), _irq: irq }
    }

    fn resume_on(self: &Arc<Self>, state: &ThreadState) {
        match state.scheduler {
            Some(scheduler) => scheduler.resume(Arc::clone(self)),
            None => panic!("thread {} resumed without a scheduler", self.id),
        }
    }

    // ------------------------------------------------------------------
    // Self-transitions
    // ------------------------------------------------------------------

    /// Blocks the current thread until `unblock_other`. Runs pending work
    /// first; returns at once if an unblock arrived since the last block.
    /// A single attempt: callers re-check their wait condition and block
    /// again if needed.
    pub fn block_current() {
        let cpu = cpu::current();
        let thread = active_on(cpu);
        loop {
            thread.work.run();

            let _irq = IrqGuard::new();
            let mut state = thread.state.lock();
            if thread.unblock_latch.swap(false, Ordering::AcqRel) {
                return;
            }
            if thread.work.check() {
                continue;
            }

            state.assert_active(thread.id);
            state.enter(thread.id, RunState::Blocked);
            leave_current(cpu, thread, state, Exit::STOP, None);
            return;
        }
    }

    /// Yields the CPU; the thread stays runnable and continues in kernel code.
    pub fn defer_current() {
        let _irq = IrqGuard::new();
        let cpu = cpu::current();
        let thread = active_on(cpu);
        let mut state = thread.state.lock();
        state.assert_active(thread.id);
        state.enter(thread.id, RunState::Deferred);
        leave_current(cpu, thread, state, Exit::YIELD, None);
    }

    /// Yields the CPU from an interrupt taken in kernel code of the thread.
    pub fn defer_current_irq(image: &IrqImage<'_>) {
        irq::assert_masked();
        let cpu = cpu::current();
        let thread = active_on(cpu);
        let mut state = thread.state.lock();
        state.assert_active(thread.id);
        state.enter(thread.id, RunState::Deferred);
        leave_current(cpu, thread, state, Exit::YIELD, Some(&|executor: &mut Executor| save_executor(executor, image)));
    }

    /// Preempts the thread at an interrupt taken in user code.
    pub fn suspend_current(image: &IrqImage<'_>) {
        irq::assert_masked();
        let cpu = cpu::current();
        let thread = active_on(cpu);
        let mut state = thread.state.lock();
        state.assert_active(thread.id);
        state.enter(thread.id, RunState::Suspended);
        leave_current(cpu, thread, state, Exit::YIELD, Some(&|executor: &mut Executor| save_executor(executor, image)));
    }

    /// Stops the thread with `kind` at a fault or syscall and wakes its
    /// observers.
    pub fn interrupt_current<I: SynchronousImage>(kind: Interrupt, image: &I) {
        irq::assert_masked();
        let cpu = cpu::current();
        let thread = active_on(cpu);
        let mut state = thread.state.lock();
        state.assert_active(thread.id);
        state.enter(thread.id, RunState::Interrupted);
        state.last_interrupt = kind;
        state.sequence += 1;
        let wake = Observation { sequence: state.sequence, interrupt: kind };
        log_debug!(target: "thor::thread", "thread {} interrupted: {:?}", thread.id, kind);
        leave_current(
            cpu,
            thread,
            state,
            Exit { wake: Some(Ok(wake)), ..Exit::STOP },
            Some(&|executor: &mut Executor| save_executor(executor, image)),
        );
    }

    /// Acts on a pending kill or interrupt request at syscall exit.
    pub fn raise_signals(image: &SyscallImage<'_>) {
        irq::assert_masked();
        let cpu = cpu::current();
        let thread = active_on(cpu);
        let mut state = thread.state.lock();
        state.assert_active(thread.id);

        let exit = if state.pending_kill {
            state.enter(thread.id, RunState::Terminated);
            state.sequence += 1;
            log_debug!(target: "thor::thread", "thread {} terminated", thread.id);
            Exit { unassociate: true, wake: Some(Err(ThreadError::ThreadExited)), ..Exit::STOP }
        } else if state.pending_signal == Signal::Interrupt {
            state.pending_signal = Signal::None;
            state.enter(thread.id, RunState::Interrupted);
            state.last_interrupt = Interrupt::Requested;
            state.sequence += 1;
            let wake = Observation { sequence: state.sequence, interrupt: Interrupt::Requested };
            Exit { wake: Some(Ok(wake)), ..Exit::STOP }
        } else {
            return;
        };
        leave_current(cpu, thread, state, exit, Some(&|executor: &mut Executor| save_executor(executor, image)));
    }

    /// Moves the current thread to `target`'s scheduler. `target` must be in
    /// the thread's affinity mask.
    pub fn migrate_current(target: &'static CpuContext) {
        let _irq = IrqGuard::new();
        let cpu = cpu::current();
        let thread = active_on(cpu);
        let mut state = thread.state.lock();
        state.assert_active(thread.id);
        assert!(
            state.affinity.contains(target.id()),
            "thread {} cannot migrate to cpu {} outside its affinity",
            thread.id,
            target.id()
        );
        state.enter(thread.id, RunState::Deferred);
        log_debug!(target: "thor::thread", "thread {} migrating cpu {} -> {}", thread.id, cpu.id(), target.id());
        let exit = Exit { unassociate: true, rehome: Some(target.scheduler()), ..Exit::STOP };
        leave_current(cpu, thread, state, exit, None);
    }

    /// Timer tick in the current thread. Preempts it if the scheduler asks
    /// to: `resumable` interrupts suspend the thread, others defer it.
    pub fn handle_preemption(image: &IrqImage<'_>, resumable: bool) {
        irq::assert_masked();
        let scheduler = cpu::current().scheduler();
        if !scheduler.maybe_reschedule() {
            scheduler.renew_schedule();
            return;
        }
        if resumable {
            Self::suspend_current(image);
        } else {
            Self::defer_current_irq(image);
        }
    }

    // ------------------------------------------------------------------
    // Cross-thread transitions
    // ------------------------------------------------------------------

    /// Wakes a thread blocked in `block_current`, or makes its next block
    /// return at once. Waking a blocked thread consumes the latch.
    pub fn unblock_other(self: &Arc<Self>) {
        if self.unblock_latch.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.lock();
        if state.run_state != RunState::Blocked {
            return;
        }
        self.unblock_latch.store(false, Ordering::Release);
        state.enter(self.id, RunState::Deferred);
        self.resume_on(&state);
    }

    /// Terminates a stopped thread now; a running one terminates at its next
    /// `raise_signals`.
    pub fn kill_other(&self) -> Result<(), ThreadError> {
        let mut state = self.lock();
        match state.run_state {
            RunState::Terminated => Ok(()),
            RunState::Suspended | RunState::Interrupted => {
                state.enter(self.id, RunState::Terminated);
                state.sequence += 1;
                if let Some(scheduler) = state.scheduler.take() {
                    scheduler.unassociate(self);
                }
                let observers = core::mem::take(&mut state.observers);
                drop(state);
                log_debug!(target: "thor::thread", "thread {} killed", self.id);
                wake_all(observers, Err(ThreadError::ThreadExited));
                Ok(())
            }
            _ => {
                state.pending_kill = true;
                Ok(())
            }
        }
    }

    /// Requests an `Interrupted` stop at the thread's next `raise_signals`.
    pub fn interrupt_other(&self) -> Result<(), ThreadError> {
        let mut state = self.lock();
        if state.run_state == RunState::Terminated {
            return Err(ThreadError::ThreadExited);
        }
        state.pending_signal = Signal::Interrupt;
        Ok(())
    }

    /// Restarts an `Interrupted` thread.
    pub fn resume_other(self: &Arc<Self>) -> Result<(), ThreadError> {
        let mut state = self.lock();
        match state.run_state {
            RunState::Interrupted => {
                state.enter(self.id, RunState::Suspended);
                self.resume_on(&state);
                Ok(())
            }
            RunState::Terminated => Err(ThreadError::ThreadExited),
            _ => Err(ThreadError::IllegalState),
        }
    }

    /// Calls `observer` once the thread has moved past `last_seen`. Resolves
    /// at once if it already has, or if `last_seen` is from the future.
    pub fn observe(&self, last_seen: u64, observer: impl FnOnce(ObserveResult) + Send + 'static) {
        let result = {
            let mut state = self.lock();
            if last_seen > state.sequence {
                Err(ThreadError::IllegalState)
            } else if last_seen == state.sequence && state.run_state != RunState::Terminated {
                state.observers.push(Box::new(observer));
                return;
            } else if state.run_state == RunState::Terminated {
                Err(ThreadError::ThreadExited)
            } else {
                Ok(Observation { sequence: state.sequence, interrupt: state.last_interrupt })
            }
        };
        observer(result);
    }

    pub fn pending_observers(&self) -> usize {
        self.lock().observers.len()
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Makes the thread the active one on `cpu`, which must be the running
    /// CPU, and returns the executor to restore.
    pub(crate) fn activate(self: &Arc<Self>, cpu: &CpuContext) -> *const Executor {
        irq::assert_masked();
        let mut state = self.state.lock();
        match state.run_state {
            RunState::Suspended if self.work.check() => {
                // SAFETY: the kernel stack is idle until the thread runs.
                unsafe { state.executor.redirect_to_work(work_stub_address()) };
            }
            RunState::Suspended | RunState::Deferred => {}
            other => panic!("thread {} invoked while {:?}", self.id, other),
        }
        state.enter(self.id, RunState::Active);
        let executor: *const Executor = &state.executor;
        drop(state);

        self.kernel_stack.revive();
        self.address_space.activate_on(cpu);
        let previous = cpu.set_active_thread(Some(Arc::clone(self)));
        debug_assert!(previous.is_none(), "cpu {} invoked thread {} over an active thread", cpu.id(), self.id);
        cpu.set_next_trap_stack(self.kernel_stack.top());
        executor
    }

    /// Dispatches the thread on the current CPU.
    pub fn invoke(self: Arc<Self>) -> ! {
        let _irq = IrqGuard::new();
        let executor = self.activate(cpu::current());
        // The CPU's reference keeps the executor alive.
        drop(self);
        // SAFETY: `executor` belongs to the CPU's active thread.
        unsafe { restore_executor(executor) }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        #[cfg(test)]
        if std::thread::panicking() {
            return;
        }
        let state = self.state.get_mut();
        debug_assert_eq!(state.run_state, RunState::Terminated, "thread {} dropped while alive", self.id);
        debug_assert!(state.observers.is_empty(), "thread {} dropped with observers", self.id);
    }
}

/// Thread lock held with interrupts masked.
struct LockedState<'a> {
    guard: spin::MutexGuard<'a, ThreadState>,
    _irq: IrqGuard,
}

impl core::ops::Deref for LockedState<'_> {
    type Target = ThreadState;

    fn deref(&self) -> &ThreadState {
        &self.guard
    }
}

impl core::ops::DerefMut for LockedState<'_> {
    fn deref_mut(&mut self) -> &mut ThreadState {
        &mut self.guard
    }
}

fn wake_all(observers: Vec<Observer>, result: ObserveResult) {
    for observer in observers {
        observer(result);
    }
}

/// Borrows the thread active on `cpu`.
#[track_caller]
fn active_on(cpu: &'static CpuContext) -> &'static Thread {
    let Some(active) = cpu.active_thread() else {
        panic!("no thread is active on cpu {}", cpu.id());
    };
    let thread = Arc::as_ptr(&active);
    drop(active);
    // SAFETY: the CPU holds a reference until `leave_current` hands it to
    // the detached continuation, which drops it after the thread lock.
    unsafe { &*thread }
}

/// Shared tail of every self-transition. `save` copies a trap image into the
/// executor; without one the current kernel context is forked instead.
fn leave_current(
    cpu: &'static CpuContext,
    thread: &'static Thread,
    mut state: spin::MutexGuard<'static, ThreadState>,
    exit: Exit,
    save: Option<&dyn Fn(&mut Executor)>,
) {
    irq::assert_masked();
    let local = cpu.scheduler();
    let Some(owner) = cpu.active_thread() else {
        panic!("thread {} left cpu {} without being active", thread.id, cpu.id());
    };

    local.update();
    if exit.suspend {
        local.suspend_current();
    }
    if exit.unassociate {
        if let Some(scheduler) = state.scheduler.take() {
            scheduler.unassociate(thread);
        }
    }
    if let Some(target) = exit.rehome {
        target.associate(&owner);
        state.scheduler = Some(target);
        target.resume(Arc::clone(&owner));
    }
    local.force_reschedule();

    let fork_into = match save {
        Some(save) => {
            save(&mut state.executor);
            None
        }
        None => Some(&mut state.executor as *mut Executor),
    };
    drop(cpu.set_active_thread(None));

    let observers = match exit.wake {
        Some(_) => core::mem::take(&mut state.observers),
        None => Vec::new(),
    };
    let finish = move || {
        drop(state);
        if let Some(result) = exit.wake {
            wake_all(observers, result);
        }
        drop(owner);
        local.commit_reschedule();
    };

    match fork_into {
        None => run_detached(cpu, Some(&thread.kernel_stack), finish),
        // SAFETY: the lock is held until the continuation runs, so nothing
        // else touches the executor while the fork writes it.
        Some(executor) => unsafe { fork_executor(executor, || run_detached(cpu, Some(&thread.kernel_stack), finish)) },
    }
}

/// Drains the active thread's work queue. Entered from the work stub with
/// interrupts masked.
#[cfg_attr(all(target_arch = "x86_64", target_os = "none"), export_name = "thor_run_current_work")]
pub(crate) extern "C" fn run_current_work() {
    if let Some(thread) = Thread::current() {
        thread.work.run();
    }
}
