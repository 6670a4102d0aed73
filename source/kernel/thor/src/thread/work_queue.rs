// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Deferred work executed in the context of one thread.

extern crate alloc;

use alloc::{boxed::Box, collections::VecDeque};

use crate::hal::irq::IrqGuard;

pub type WorkItem = Box<dyn FnOnce() + Send>;

/// FIFO of closures the owning thread runs before it blocks or returns to
/// user mode.
#[derive(Default)]
pub struct WorkQueue {
    items: spin::Mutex<VecDeque<WorkItem>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `item`. Returns true if the queue was empty before.
    pub fn post(&self, item: WorkItem) -> bool {
        let _irq = IrqGuard::new();
        let mut items = self.items.lock();
        let was_empty = items.is_empty();
        items.push_back(item);
        was_empty
    }

    /// Returns true if work is pending.
    pub fn check(&self) -> bool {
        let _irq = IrqGuard::new();
        !self.items.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        let _irq = IrqGuard::new();
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs items until the queue is empty, including items posted by the
    /// items themselves. The queue lock is not held while an item runs.
    pub fn run(&self) -> usize {
        let mut ran = 0;
        loop {
            let item = {
                let _irq = IrqGuard::new();
                self.items.lock().pop_front()
            };
            let Some(item) = item else {
                return ran;
            };
            item();
            ran += 1;
        }
    }
}
