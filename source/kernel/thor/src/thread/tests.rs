// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Run-state machine scenarios on one simulated CPU.

use super::*;
use crate::cpu::CpuContext;
use crate::executor::{FaultFrame, FaultImage, IrqFrame, IrqImage, SaveOrigin, StackState, SyscallFrame};
use crate::executor::selectors::CLIENT_USER_CODE;
use crate::mm::testing::{leak, TestPlatform};
use crate::mm::KernelPageSpace;
use crate::sched::testing::{RecordingScheduler, SchedEvent};
use crate::types::CpuId;
use std::sync::Mutex;

struct Rig {
    test: TestPlatform,
    kernel: &'static KernelPageSpace,
    sched: &'static RecordingScheduler,
    cpu: &'static CpuContext,
    space: Arc<ClientPageSpace>,
}

impl Rig {
    fn new() -> Self {
        let test = TestPlatform::new();
        let kernel = leak(test.kernel_space());
        let sched = leak(RecordingScheduler::default());
        let cpu = leak(CpuContext::new(CpuId::from_raw(0), test.tlb(0), sched, kernel));
        cpu::install(cpu);
        let space = ClientPageSpace::new(test.platform, kernel);
        Self { test, kernel, sched, cpu, space }
    }

    /// Fresh thread associated with the rig's scheduler, still Interrupted.
    fn spawn(&self) -> Arc<Thread> {
        let thread = Thread::new(Arc::clone(&self.space), 0x40_1000, 0x7FFF_F000);
        thread.associate(self.sched);
        thread
    }

    /// Takes the next ready thread and makes it active on the rig's CPU.
    fn dispatch(&self) -> Arc<Thread> {
        let thread = self.sched.pop_ready().expect("no ready thread");
        let _ = thread.activate(self.cpu);
        thread
    }

    /// Spawns, resumes and dispatches a thread.
    fn running(&self) -> Arc<Thread> {
        let thread = self.spawn();
        thread.resume_other().expect("fresh thread resumes");
        let active = self.dispatch();
        assert!(Arc::ptr_eq(&thread, &active));
        self.sched.take_events();
        thread
    }
}

fn syscall_exit() {
    let mut frame = SyscallFrame { rip: 0x40_2000, rsp: 0x7FFF_E000, rflags: 0x202, ..Default::default() };
    Thread::raise_signals(&SyscallImage::new(&mut frame));
}

/// Kills the active thread through the normal syscall-exit path.
fn terminate_active(thread: &Thread) {
    thread.kill_other().expect("kill never fails");
    syscall_exit();
    assert_eq!(thread.run_state(), RunState::Terminated);
}

type Seen = Arc<Mutex<Vec<ObserveResult>>>;

fn recorder() -> (Seen, impl FnOnce(ObserveResult) + Send + 'static) {
    let seen: Seen = Arc::default();
    let sink = Arc::clone(&seen);
    (seen, move |result| sink.lock().unwrap().push(result))
}

const STOP_EVENTS: [SchedEvent; 4] =
    [SchedEvent::Update, SchedEvent::SuspendCurrent, SchedEvent::ForceReschedule, SchedEvent::CommitReschedule];
const YIELD_EVENTS: [SchedEvent; 3] = [SchedEvent::Update, SchedEvent::ForceReschedule, SchedEvent::CommitReschedule];

#[test]
fn new_thread_starts_interrupted_at_sequence_one() {
    let rig = Rig::new();
    let thread = rig.spawn();
    assert_eq!(thread.run_state(), RunState::Interrupted);
    assert_eq!(thread.state_sequence(), 1);
    assert_eq!(thread.last_interrupt(), Interrupt::Null);
    assert_eq!(rig.sched.take_events(), [SchedEvent::Associate(thread.id())]);
    thread.kill_other().expect("kill never fails");
}

#[test]
fn requested_interrupt_wakes_observer() {
    let rig = Rig::new();
    let thread = rig.spawn();

    thread.resume_other().expect("interrupted thread resumes");
    assert_eq!(thread.run_state(), RunState::Suspended);
    assert!(rig.sched.events().contains(&SchedEvent::Resume(thread.id())));

    let _ = rig.dispatch();
    assert_eq!(thread.run_state(), RunState::Active);
    assert!(Arc::ptr_eq(&rig.cpu.active_thread().expect("active"), &thread));

    let (seen, observer) = recorder();
    thread.observe(1, observer);
    assert_eq!(thread.pending_observers(), 1);

    rig.sched.take_events();
    thread.interrupt_other().expect("live thread");
    assert_eq!(thread.run_state(), RunState::Active);
    syscall_exit();

    assert_eq!(thread.run_state(), RunState::Interrupted);
    assert_eq!(thread.state_sequence(), 2);
    assert_eq!(thread.last_interrupt(), Interrupt::Requested);
    assert_eq!(*seen.lock().unwrap(), [Ok(Observation { sequence: 2, interrupt: Interrupt::Requested })]);
    assert_eq!(rig.sched.take_events(), STOP_EVENTS);
    assert!(rig.cpu.active_thread().is_none());
    assert_eq!(thread.kernel_stack().state(), StackState::Consumed);

    thread.kill_other().expect("kill never fails");
}

#[test]
fn kill_while_active_waits_for_raise_signals() {
    let rig = Rig::new();
    let thread = rig.running();
    let (seen, observer) = recorder();
    thread.observe(1, observer);

    thread.kill_other().expect("kill never fails");
    assert_eq!(thread.run_state(), RunState::Active);
    assert!(thread.has_pending_kill());
    assert!(seen.lock().unwrap().is_empty());

    syscall_exit();
    assert_eq!(thread.run_state(), RunState::Terminated);
    assert_eq!(thread.state_sequence(), 2);
    assert_eq!(*seen.lock().unwrap(), [Err(ThreadError::ThreadExited)]);
    assert_eq!(
        rig.sched.take_events(),
        [
            SchedEvent::Update,
            SchedEvent::SuspendCurrent,
            SchedEvent::Unassociate(thread.id()),
            SchedEvent::ForceReschedule,
            SchedEvent::CommitReschedule,
        ]
    );
}

#[test]
fn raise_signals_without_requests_keeps_running() {
    let rig = Rig::new();
    let thread = rig.running();
    syscall_exit();
    assert_eq!(thread.run_state(), RunState::Active);
    assert!(rig.sched.events().is_empty());
    terminate_active(&thread);
}

#[test]
fn kill_of_stopped_thread_is_immediate() {
    let rig = Rig::new();
    let thread = rig.spawn();
    let (seen, observer) = recorder();
    thread.observe(1, observer);
    rig.sched.take_events();

    thread.kill_other().expect("kill never fails");
    assert_eq!(thread.run_state(), RunState::Terminated);
    assert_eq!(thread.state_sequence(), 2);
    assert_eq!(*seen.lock().unwrap(), [Err(ThreadError::ThreadExited)]);
    assert_eq!(rig.sched.take_events(), [SchedEvent::Unassociate(thread.id())]);

    // Terminated is final and silent.
    assert_eq!(thread.kill_other(), Ok(()));
    assert_eq!(thread.state_sequence(), 2);
}

#[test]
fn kill_of_suspended_thread_leaves_the_ready_queue() {
    let rig = Rig::new();
    let thread = rig.spawn();
    thread.resume_other().expect("interrupted thread resumes");
    assert_eq!(rig.sched.ready_len(), 1);
    thread.kill_other().expect("kill never fails");
    assert_eq!(rig.sched.ready_len(), 0);
}

#[test]
fn cross_thread_errors() {
    let rig = Rig::new();
    let thread = rig.spawn();
    thread.resume_other().expect("interrupted thread resumes");
    assert_eq!(thread.resume_other(), Err(ThreadError::IllegalState));

    thread.kill_other().expect("kill never fails");
    assert_eq!(thread.resume_other(), Err(ThreadError::ThreadExited));
    assert_eq!(thread.interrupt_other(), Err(ThreadError::ThreadExited));
}

#[test]
fn observe_resolves_stale_and_future_sequences_at_once() {
    let rig = Rig::new();
    let thread = rig.spawn();

    let (future, observer) = recorder();
    thread.observe(5, observer);
    assert_eq!(*future.lock().unwrap(), [Err(ThreadError::IllegalState)]);

    let (stale, observer) = recorder();
    thread.observe(0, observer);
    assert_eq!(*stale.lock().unwrap(), [Ok(Observation { sequence: 1, interrupt: Interrupt::Null })]);
    assert_eq!(thread.pending_observers(), 0);

    thread.kill_other().expect("kill never fails");
    let (exited, observer) = recorder();
    thread.observe(2, observer);
    assert_eq!(*exited.lock().unwrap(), [Err(ThreadError::ThreadExited)]);
}

#[test]
fn fault_interrupt_saves_the_fault_frame() {
    let rig = Rig::new();
    let thread = rig.running();
    let (seen, observer) = recorder();
    thread.observe(1, observer);

    let mut frame = FaultFrame { rip: 0x40_1234, cs: u64::from(CLIENT_USER_CODE), code: 4, ..Default::default() };
    Thread::interrupt_current(Interrupt::PageFault, &FaultImage::new(&mut frame));

    assert_eq!(thread.run_state(), RunState::Interrupted);
    assert_eq!(thread.last_interrupt(), Interrupt::PageFault);
    assert_eq!(*seen.lock().unwrap(), [Ok(Observation { sequence: 2, interrupt: Interrupt::PageFault })]);
    {
        let state = thread.state.lock();
        assert_eq!(state.executor.origin(), SaveOrigin::Fault);
        assert_eq!(state.executor.general().rip, 0x40_1234);
    }

    // An interrupted thread can be resumed and interrupted again.
    thread.resume_other().expect("interrupted thread resumes");
    let _ = rig.dispatch();
    let mut frame = FaultFrame { rip: 0x40_1300, cs: u64::from(CLIENT_USER_CODE), ..Default::default() };
    Thread::interrupt_current(Interrupt::Breakpoint, &FaultImage::new(&mut frame));
    assert_eq!(thread.state_sequence(), 3);

    thread.kill_other().expect("kill never fails");
}

#[test]
fn block_consumes_a_pending_unblock() {
    let rig = Rig::new();
    let thread = rig.running();

    thread.unblock_other();
    assert_eq!(thread.run_state(), RunState::Active);
    Thread::block_current();
    assert_eq!(thread.run_state(), RunState::Active);
    assert!(rig.sched.events().is_empty());

    Thread::block_current();
    assert_eq!(thread.run_state(), RunState::Blocked);
    assert_eq!(rig.sched.take_events(), STOP_EVENTS);
    assert_eq!(thread.state.lock().executor.origin(), SaveOrigin::Fork);

    thread.unblock_other();
    assert_eq!(thread.run_state(), RunState::Deferred);
    assert_eq!(rig.sched.take_events(), [SchedEvent::Resume(thread.id())]);

    // An unblock arriving while the thread is awake still counts.
    thread.unblock_other();
    assert!(rig.sched.events().is_empty());
    let _ = rig.dispatch();
    Thread::block_current();
    assert_eq!(thread.run_state(), RunState::Active);

    terminate_active(&thread);
}

#[test]
fn waking_a_blocked_thread_consumes_the_unblock() {
    let rig = Rig::new();
    let thread = rig.running();

    Thread::block_current();
    assert_eq!(thread.run_state(), RunState::Blocked);
    thread.unblock_other();
    assert_eq!(thread.run_state(), RunState::Deferred);
    rig.sched.take_events();

    let _ = rig.dispatch();
    Thread::block_current();
    assert_eq!(thread.run_state(), RunState::Blocked);
    assert_eq!(rig.sched.take_events(), STOP_EVENTS);

    thread.unblock_other();
    let _ = rig.dispatch();
    terminate_active(&thread);
}

#[test]
fn block_runs_queued_work_first_and_work_wakes_blocked_threads() {
    let rig = Rig::new();
    let thread = rig.running();
    let ran = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&ran);
    thread.post_work(Box::new(move || flag.store(true, Ordering::SeqCst)));
    assert_eq!(thread.run_state(), RunState::Active);

    Thread::block_current();
    assert!(ran.load(Ordering::SeqCst));
    assert_eq!(thread.run_state(), RunState::Blocked);
    rig.sched.take_events();

    thread.post_work(Box::new(|| {}));
    assert_eq!(thread.run_state(), RunState::Deferred);
    assert_eq!(rig.sched.take_events(), [SchedEvent::Resume(thread.id())]);

    let _ = rig.dispatch();
    Thread::block_current();
    assert!(thread.work_queue().is_empty());
    assert_eq!(thread.run_state(), RunState::Blocked);

    thread.kill_other().expect("kill never fails");
    assert!(thread.has_pending_kill());
    thread.unblock_other();
    let _ = rig.dispatch();
    terminate_active(&thread);
}

#[test]
fn defer_keeps_the_thread_runnable() {
    let rig = Rig::new();
    let thread = rig.running();
    Thread::defer_current();
    assert_eq!(thread.run_state(), RunState::Deferred);
    assert_eq!(rig.sched.take_events(), YIELD_EVENTS);
    assert_eq!(thread.state.lock().executor.origin(), SaveOrigin::Fork);

    let _ = thread.activate(rig.cpu);
    terminate_active(&thread);
}

#[test]
fn preemption_follows_the_scheduler() {
    let rig = Rig::new();
    let thread = rig.running();
    let mut frame = IrqFrame { rip: 0x40_5000, cs: u64::from(CLIENT_USER_CODE), ..Default::default() };

    Thread::handle_preemption(&IrqImage::new(&mut frame), true);
    assert_eq!(thread.run_state(), RunState::Active);
    assert_eq!(rig.sched.take_events(), [SchedEvent::RenewSchedule]);

    rig.sched.set_preempt(true);
    Thread::handle_preemption(&IrqImage::new(&mut frame), true);
    assert_eq!(thread.run_state(), RunState::Suspended);
    assert_eq!(rig.sched.take_events(), YIELD_EVENTS);
    {
        let state = thread.state.lock();
        assert_eq!(state.executor.origin(), SaveOrigin::Irq);
        assert_eq!(state.executor.general().rip, 0x40_5000);
    }

    let _ = thread.activate(rig.cpu);
    Thread::handle_preemption(&IrqImage::new(&mut frame), false);
    assert_eq!(thread.run_state(), RunState::Deferred);

    let _ = thread.activate(rig.cpu);
    terminate_active(&thread);
}

#[test]
fn suspended_resume_with_work_enters_the_work_stub() {
    let rig = Rig::new();
    let thread = rig.running();
    let mut frame = IrqFrame { rip: 0x40_6000, cs: u64::from(CLIENT_USER_CODE), ..Default::default() };
    Thread::suspend_current(&IrqImage::new(&mut frame));

    thread.post_work(Box::new(|| {}));
    assert_eq!(thread.run_state(), RunState::Suspended);
    let executor = thread.activate(rig.cpu);
    // SAFETY: the thread is alive and not running.
    let rip = unsafe { (*executor).general().rip };
    assert_eq!(rip, work_stub_address());

    run_current_work();
    assert!(thread.work_queue().is_empty());
    terminate_active(&thread);
}

#[test]
fn activation_binds_the_address_space_and_trap_stack() {
    let rig = Rig::new();
    let thread = rig.running();
    assert!(rig.cpu.page_binding().is_bound_to(&rig.space));
    assert_eq!(rig.test.tlb_log.last_root(rig.cpu.id()), Some(rig.space.root_table()));
    assert_eq!(rig.cpu.next_trap_stack(), thread.kernel_stack().top());
    assert_eq!(thread.kernel_stack().state(), StackState::Live);
    assert!(Arc::ptr_eq(&Thread::current().expect("active"), &thread));
    assert_eq!(rig.space.page_space().num_bindings(), 1);
    assert_eq!(rig.kernel.page_space().num_bindings(), 0);
    terminate_active(&thread);
}

#[test]
fn migration_moves_the_thread_to_the_target_scheduler() {
    let rig = Rig::new();
    let thread = rig.running();
    let remote_sched = leak(RecordingScheduler::default());
    let remote = leak(CpuContext::new(CpuId::from_raw(1), rig.test.tlb(1), remote_sched, rig.kernel));

    Thread::migrate_current(remote);
    assert_eq!(thread.run_state(), RunState::Deferred);
    assert_eq!(
        rig.sched.take_events(),
        [
            SchedEvent::Update,
            SchedEvent::SuspendCurrent,
            SchedEvent::Unassociate(thread.id()),
            SchedEvent::ForceReschedule,
            SchedEvent::CommitReschedule,
        ]
    );
    assert_eq!(remote_sched.events(), [SchedEvent::Associate(thread.id()), SchedEvent::Resume(thread.id())]);
    assert_eq!(remote_sched.ready_len(), 1);
}

#[test]
#[should_panic(expected = "outside its affinity")]
fn migration_respects_affinity() {
    let rig = Rig::new();
    let thread = rig.running();
    thread.set_affinity(CpuMask::single(CpuId::from_raw(0)));
    let remote = leak(CpuContext::new(CpuId::from_raw(1), rig.test.tlb(1), rig.sched, rig.kernel));
    Thread::migrate_current(remote);
}

#[test]
#[should_panic(expected = "is not active")]
fn self_transition_requires_an_active_thread() {
    let rig = Rig::new();
    let thread = rig.running();
    Thread::defer_current();
    // Reinstall without activating.
    let _ = rig.cpu.set_active_thread(Some(Arc::clone(&thread)));
    Thread::defer_current();
}

#[test]
#[should_panic(expected = "needs bare metal")]
fn invoke_restores_the_executor() {
    let rig = Rig::new();
    let thread = rig.spawn();
    thread.resume_other().expect("interrupted thread resumes");
    rig.sched.pop_ready().expect("ready").invoke();
}
