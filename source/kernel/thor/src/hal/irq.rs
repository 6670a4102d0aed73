// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Local interrupt masking.

/// Returns true if the local CPU accepts maskable interrupts.
#[inline]
pub fn enabled() -> bool {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        x86_64::instructions::interrupts::are_enabled()
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        false
    }
}

#[inline]
fn disable() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::interrupts::disable();
}

#[inline]
fn enable() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::interrupts::enable();
}

/// Panics in debug builds if interrupts are enabled.
#[inline]
#[track_caller]
pub fn assert_masked() {
    debug_assert!(!enabled(), "interrupts must be masked here");
}

/// Masks interrupts for its lifetime and restores the previous state on drop.
#[must_use = "interrupts are re-enabled as soon as the guard is dropped"]
pub struct IrqGuard {
    restore: bool,
}

impl IrqGuard {
    pub fn new() -> Self {
        let restore = enabled();
        disable();
        Self { restore }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.restore {
            enable();
        }
    }
}
