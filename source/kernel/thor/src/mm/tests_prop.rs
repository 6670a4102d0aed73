// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the shootdown protocol
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic. Random interleavings of submits, rebinds and IPI delivery.
//!
//! TEST_SCOPE:
//!   - Every ShootNode completes exactly once
//!   - A node completes only after each CPU bound at submission invalidated it or loaded another root
//!   - Shoot sequences strictly increase per space; a binding's acknowledged sequence never goes back
//!
//! TEST_SCENARIOS:
//!   - interleavings_complete_every_node_once(): 3 CPUs, 2 client spaces, up to 64 steps

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::testing::{leak, TestPlatform, TlbEvent, TlbLog};
use super::*;
use crate::cpu::CpuContext;
use crate::sched::testing::RecordingScheduler;
use crate::types::{CpuId, CpuMask, VirtualAddr};
use proptest::prelude::*;

const CPUS: u16 = 3;
const SPACES: usize = 2;

#[derive(Clone, Copy, Debug)]
enum Step {
    Submit { space: usize, pages: usize },
    Rebind { cpu: u16, space: usize },
    Unbind { cpu: u16 },
    Deliver { cpu: u16 },
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..SPACES, 1usize..4).prop_map(|(space, pages)| Step::Submit { space, pages }),
        (0..CPUS, 0..SPACES).prop_map(|(cpu, space)| Step::Rebind { cpu, space }),
        (0..CPUS).prop_map(|cpu| Step::Unbind { cpu }),
        (0..CPUS).prop_map(|cpu| Step::Deliver { cpu }),
    ]
}

/// What a completion callback checks against the TLB log.
struct Expectation {
    address: VirtualAddr,
    bound: CpuMask,
    log_start: usize,
    completions: AtomicUsize,
    honoured: AtomicBool,
}

impl Expectation {
    fn check(&self, log: &TlbLog) {
        let events = log.events();
        let seen = &events[self.log_start..];
        let honoured = self.bound.iter().all(|cpu| {
            seen.iter().any(|event| match *event {
                TlbEvent::Invalidate { cpu: c, address } => c == cpu && address == self.address,
                TlbEvent::LoadRoot { cpu: c, .. } => c == cpu,
            })
        });
        self.honoured.store(honoured, Ordering::SeqCst);
        self.completions.fetch_add(1, Ordering::SeqCst);
    }
}

proptest! {
    #[test]
    fn interleavings_complete_every_node_once(steps in prop::collection::vec(arb_step(), 1..64)) {
        let test = TestPlatform::new();
        let kernel = leak(test.kernel_space());
        let sched = leak(RecordingScheduler::default());
        let cpus: Vec<&'static CpuContext> =
            (0..CPUS).map(|id| leak(CpuContext::new(CpuId::from_raw(id), test.tlb(id), sched, kernel))).collect();
        let spaces: Vec<Arc<ClientPageSpace>> = (0..SPACES).map(|_| ClientPageSpace::new(test.platform, kernel)).collect();

        let mut pending_ipis = CpuMask::EMPTY;
        let mut expectations: Vec<&'static Expectation> = Vec::new();
        let mut last_sequence = [0u64; SPACES];
        let mut next_page = 0u64;

        for step in steps {
            match step {
                Step::Submit { space, pages } => {
                    let address = VirtualAddr::new(0x40_0000 + next_page * PAGE_SIZE as u64);
                    next_page += pages as u64;
                    let expectation: &'static Expectation = leak(Expectation {
                        address,
                        bound: spaces[space].page_space().bound_cpus(),
                        log_start: test.tlb_log.events().len(),
                        completions: AtomicUsize::new(0),
                        honoured: AtomicBool::new(false),
                    });
                    let log = test.tlb_log;
                    let node = ShootNode::new(address, pages * PAGE_SIZE, move || expectation.check(log));
                    match spaces[space].page_space().submit_shootdown(node) {
                        ShootdownOutcome::Completed => prop_assert!(expectation.bound.is_empty()),
                        ShootdownOutcome::Pending { sequence } => {
                            prop_assert!(sequence > last_sequence[space]);
                            last_sequence[space] = sequence;
                        }
                    }
                    expectations.push(expectation);
                }
                Step::Rebind { cpu, space } => {
                    let binding = cpus[usize::from(cpu)].page_binding();
                    if !binding.is_bound_to(&spaces[space]) {
                        binding.rebind(Arc::clone(&spaces[space]));
                    }
                }
                Step::Unbind { cpu } => cpus[usize::from(cpu)].page_binding().unbind(),
                Step::Deliver { cpu } => {
                    let cpu = CpuId::from_raw(cpu);
                    if pending_ipis.contains(cpu) {
                        pending_ipis.remove(cpu);
                        let binding = cpus[cpu.as_index()].page_binding();
                        let before = binding.already_shot_sequence();
                        binding.shootdown();
                        prop_assert!(binding.already_shot_sequence() >= before);
                    }
                }
            }
            pending_ipis = CpuMask::from_bits(pending_ipis.bits() | test.ipi.take().bits());

            for expectation in &expectations {
                prop_assert!(expectation.completions.load(Ordering::SeqCst) <= 1);
            }
        }

        // Quiesce: deliver what is left, then move every CPU off its space.
        for cpu in pending_ipis.iter() {
            cpus[cpu.as_index()].page_binding().shootdown();
        }
        for cpu in &cpus {
            cpu.page_binding().unbind();
        }

        for expectation in &expectations {
            prop_assert_eq!(expectation.completions.load(Ordering::SeqCst), 1);
            prop_assert!(expectation.honoured.load(Ordering::SeqCst));
        }
        for space in &spaces {
            prop_assert_eq!(space.page_space().queued(), 0);
            prop_assert_eq!(space.page_space().num_bindings(), 0);
        }
    }
}
