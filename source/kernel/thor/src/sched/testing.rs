// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Scheduler double that records every call.

extern crate alloc;

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use super::Scheduler;
use crate::thread::Thread;
use crate::types::ThreadId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SchedEvent {
    Update,
    SuspendCurrent,
    Resume(ThreadId),
    Associate(ThreadId),
    Unassociate(ThreadId),
    ForceReschedule,
    CommitReschedule,
    RenewSchedule,
}

#[derive(Default)]
pub(crate) struct RecordingScheduler {
    events: spin::Mutex<Vec<SchedEvent>>,
    ready: spin::Mutex<VecDeque<Arc<Thread>>>,
    preempt: AtomicBool,
}

impl RecordingScheduler {
    pub(crate) fn events(&self) -> Vec<SchedEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn take_events(&self) -> Vec<SchedEvent> {
        core::mem::take(&mut *self.events.lock())
    }

    pub(crate) fn pop_ready(&self) -> Option<Arc<Thread>> {
        self.ready.lock().pop_front()
    }

    pub(crate) fn ready_len(&self) -> usize {
        self.ready.lock().len()
    }

    /// Sets the answer of the next `maybe_reschedule` calls.
    pub(crate) fn set_preempt(&self, preempt: bool) {
        self.preempt.store(preempt, Ordering::SeqCst);
    }

    fn record(&self, event: SchedEvent) {
        self.events.lock().push(event);
    }
}

impl Scheduler for RecordingScheduler {
    fn update(&self) {
        self.record(SchedEvent::Update);
    }

    fn suspend_current(&self) {
        self.record(SchedEvent::SuspendCurrent);
    }

    fn resume(&self, thread: Arc<Thread>) {
        self.record(SchedEvent::Resume(thread.id()));
        self.ready.lock().push_back(thread);
    }

    fn associate(&self, thread: &Arc<Thread>) {
        self.record(SchedEvent::Associate(thread.id()));
    }

    fn unassociate(&self, thread: &Thread) {
        self.record(SchedEvent::Unassociate(thread.id()));
        self.ready.lock().retain(|queued| queued.id() != thread.id());
    }

    fn force_reschedule(&self) {
        self.record(SchedEvent::ForceReschedule);
    }

    fn commit_reschedule(&self) {
        self.record(SchedEvent::CommitReschedule);
    }

    fn maybe_reschedule(&self) -> bool {
        self.preempt.load(Ordering::SeqCst)
    }

    fn renew_schedule(&self) {
        self.record(SchedEvent::RenewSchedule);
    }
}
