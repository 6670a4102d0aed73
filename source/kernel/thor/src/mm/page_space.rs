// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-address-space shootdown bookkeeping
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + mm::tests scenarios + mm::tests_prop interleavings
//! PUBLIC API: PageSpace::{submit_shootdown, retire, shoot_sequence, num_bindings}, ShootNode, ShootdownOutcome
//! DEPENDS_ON: hal::{Tlb, ShootdownIpi}, hal::irq::IrqGuard
//! INVARIANTS: Sequences strictly increase per space; bindings_to_shoot reaches zero once; callbacks run outside the lock
//!
//! A submitter learns at submission time how many bindings must acknowledge
//! a node. Each bound CPU later walks the queue from the newest node back to
//! the last sequence it has already handled, so one IPI can retire several
//! nodes. Rebinding or unbinding acknowledges every pending node of the old
//! space without per-page invalidation because the root switch flushed the
//! TLB already.

extern crate alloc;

use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::PAGE_SIZE;
use crate::hal::{irq::IrqGuard, ShootdownIpi, Tlb};
use crate::types::{CpuId, CpuMask, VirtualAddr};

/// Callback run once a shootdown or retirement finished.
pub type Completion = Box<dyn FnOnce() + Send>;

/// Request to invalidate `[address, address + size)` on every bound CPU.
pub struct ShootNode {
    address: VirtualAddr,
    size: usize,
    sequence: AtomicU64,
    bindings_to_shoot: AtomicUsize,
    completion: spin::Mutex<Option<Completion>>,
}

impl ShootNode {
    pub fn new(address: VirtualAddr, size: usize, on_complete: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            address,
            size,
            sequence: AtomicU64::new(0),
            bindings_to_shoot: AtomicUsize::new(0),
            completion: spin::Mutex::new(Some(Box::new(on_complete))),
        })
    }

    pub fn address(&self) -> VirtualAddr {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Sequence assigned at submission; 0 until queued.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Bindings that still have to acknowledge this node.
    pub fn pending_bindings(&self) -> usize {
        self.bindings_to_shoot.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.completion.lock().is_none()
    }

    /// Returns true if this was the last outstanding acknowledgement.
    fn acknowledge(&self) -> bool {
        let previous = self.bindings_to_shoot.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "shoot node at {:#x} acknowledged too often", self.address);
        previous == 1
    }

    fn complete(&self) {
        let completion = self.completion.lock().take();
        match completion {
            Some(callback) => callback(),
            None => panic!("shoot node at {:#x} completed twice", self.address),
        }
    }
}

impl fmt::Debug for ShootNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShootNode")
            .field("address", &self.address)
            .field("size", &self.size)
            .field("sequence", &self.sequence())
            .field("pending", &self.pending_bindings())
            .finish()
    }
}

/// Result of `PageSpace::submit_shootdown`.
#[must_use = "a pending shootdown completes later through its callback"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShootdownOutcome {
    /// No CPU was bound; the callback already ran.
    Completed,
    /// Queued; IPIs were sent to the bound CPUs.
    Pending { sequence: u64 },
}

struct ShootState {
    num_bindings: usize,
    bound: CpuMask,
    sequence: u64,
    queue: VecDeque<Arc<ShootNode>>,
    retire: Option<Completion>,
}

/// Shootdown bookkeeping of one address space.
pub struct PageSpace {
    state: spin::Mutex<ShootState>,
    ipi: &'static dyn ShootdownIpi,
}

/// Nodes finished by a drain; completed once the caller released its locks.
#[must_use = "drained nodes must be finished after releasing locks"]
pub(crate) struct Drained {
    pub(crate) sequence: u64,
    completed: Vec<Arc<ShootNode>>,
    retired: Option<Completion>,
}

impl Drained {
    pub(crate) fn finish(self) {
        for node in self.completed {
            log_trace!(target: "thor::shootdown", "node seq {} at {:#x} complete", node.sequence(), node.address());
            node.complete();
        }
        if let Some(retired) = self.retired {
            retired();
        }
    }
}

impl PageSpace {
    pub fn new(ipi: &'static dyn ShootdownIpi) -> Self {
        Self {
            state: spin::Mutex::new(ShootState {
                num_bindings: 0,
                bound: CpuMask::EMPTY,
                sequence: 0,
                queue: VecDeque::new(),
                retire: None,
            }),
            ipi,
        }
    }

    pub fn num_bindings(&self) -> usize {
        let _irq = IrqGuard::new();
        self.state.lock().num_bindings
    }

    pub fn shoot_sequence(&self) -> u64 {
        let _irq = IrqGuard::new();
        self.state.lock().sequence
    }

    pub fn bound_cpus(&self) -> CpuMask {
        let _irq = IrqGuard::new();
        self.state.lock().bound
    }

    /// Nodes still waiting for acknowledgements.
    pub fn queued(&self) -> usize {
        let _irq = IrqGuard::new();
        self.state.lock().queue.len()
    }

    pub fn is_retiring(&self) -> bool {
        let _irq = IrqGuard::new();
        self.state.lock().retire.is_some()
    }

    /// Queues `node` for every bound CPU, or completes it at once if none is bound.
    pub fn submit_shootdown(&self, node: Arc<ShootNode>) -> ShootdownOutcome {
        self.submit_shootdown_from(node, None)
    }

    /// Like `submit_shootdown`, but `local` is left out of the IPI; the
    /// caller drains that CPU's binding itself.
    pub(crate) fn submit_shootdown_from(&self, node: Arc<ShootNode>, local: Option<CpuId>) -> ShootdownOutcome {
        assert!(
            node.address.is_page_aligned() && node.size % PAGE_SIZE == 0,
            "unaligned shootdown {:#x}+{:#x}",
            node.address,
            node.size
        );

        let (sequence, mut targets) = {
            let _irq = IrqGuard::new();
            let mut state = self.state.lock();
            if state.num_bindings == 0 {
                drop(state);
                node.complete();
                return ShootdownOutcome::Completed;
            }

            assert_eq!(node.sequence(), 0, "shoot node submitted twice");
            state.sequence += 1;
            node.sequence.store(state.sequence, Ordering::Release);
            node.bindings_to_shoot.store(state.num_bindings, Ordering::Release);
            state.queue.push_back(node);
            (state.sequence, state.bound)
        };

        log_trace!(target: "thor::shootdown", "queued seq {} for cpus {:#x}", sequence, targets.bits());
        if let Some(cpu) = local {
            targets.remove(cpu);
        }
        if !targets.is_empty() {
            self.ipi.send_shootdown(targets);
        }
        ShootdownOutcome::Pending { sequence }
    }

    /// Runs `on_retired` once no CPU is bound any more. Bound CPUs are poked
    /// so that they unbind on their next shootdown pass.
    pub fn retire(&self, on_retired: impl FnOnce() + Send + 'static) {
        let mut pending: Option<Completion> = Some(Box::new(on_retired));
        let targets = {
            let _irq = IrqGuard::new();
            let mut state = self.state.lock();
            if state.num_bindings > 0 {
                assert!(state.retire.is_none(), "address space retired twice");
                state.retire = pending.take();
            }
            state.bound
        };

        match pending {
            Some(retired) => retired(),
            None => self.ipi.send_shootdown(targets),
        }
    }

    /// Registers a binding of `cpu`; returns the sequence it starts from.
    pub(crate) fn attach(&self, cpu: CpuId) -> u64 {
        let _irq = IrqGuard::new();
        let mut state = self.state.lock();
        assert!(!state.bound.contains(cpu), "cpu {} bound twice to one space", cpu);
        state.num_bindings += 1;
        state.bound.insert(cpu);
        state.sequence
    }

    /// Acknowledges every node newer than `already_shot` for `cpu`.
    ///
    /// With `tlb` the node ranges are invalidated first; without it the
    /// caller guarantees an equivalent full flush. With `detach` the binding
    /// is dropped from the space afterwards.
    pub(crate) fn drain(&self, cpu: CpuId, already_shot: u64, tlb: Option<&dyn Tlb>, detach: bool) -> Drained {
        let _irq = IrqGuard::new();
        let mut state = self.state.lock();

        let mut completed = Vec::new();
        let mut index = state.queue.len();
        while index > 0 {
            index -= 1;
            let node = Arc::clone(&state.queue[index]);
            if node.sequence() <= already_shot {
                break;
            }
            if let Some(tlb) = tlb {
                tlb.invalidate_range(node.address, node.size);
            }
            if node.acknowledge() {
                state.queue.remove(index);
                completed.push(node);
            }
        }

        let mut retired = None;
        if detach {
            assert!(state.num_bindings > 0 && state.bound.contains(cpu), "cpu {} is not bound", cpu);
            state.num_bindings -= 1;
            state.bound.remove(cpu);
            if state.num_bindings == 0 {
                retired = state.retire.take();
            }
        }
        let sequence = state.sequence;
        drop(state);

        completed.reverse();
        Drained { sequence, completed, retired }
    }
}

impl Drop for PageSpace {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        debug_assert_eq!(state.num_bindings, 0, "page space dropped while bound");
        debug_assert!(state.queue.is_empty(), "page space dropped with pending shootdowns");
    }
}
