// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Scheduler seam consumed by the thread run-state machine
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler trait
//! DEPENDS_ON: thread::Thread
//! INVARIANTS: Calls arrive with interrupts masked; `commit_reschedule` does not return on bare metal
//!
//! Ready-queue policy lives behind this trait. The run-state machine only
//! reports transitions and asks for dispatch decisions.

extern crate alloc;

use alloc::sync::Arc;

use crate::thread::Thread;

#[cfg(test)]
pub(crate) mod testing;

/// Per-CPU scheduler as seen by thread transitions.
pub trait Scheduler: Sync {
    /// Accounts the time the current thread has run.
    fn update(&self);

    /// Removes the current thread from the running set.
    fn suspend_current(&self);

    /// Makes `thread` runnable on this scheduler.
    fn resume(&self, thread: Arc<Thread>);

    fn associate(&self, thread: &Arc<Thread>);

    fn unassociate(&self, thread: &Thread);

    /// Forces the next `commit_reschedule` to pick a new thread.
    fn force_reschedule(&self);

    /// Dispatches the next thread. Runs on the detached stack.
    fn commit_reschedule(&self);

    /// Returns true if the current thread should yield (timer preemption).
    fn maybe_reschedule(&self) -> bool;

    /// Restarts the current time slice.
    fn renew_schedule(&self);
}
