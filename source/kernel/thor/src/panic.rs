// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Panic handler for bare-metal kernel images
//! OWNERS: @kernel-team
//! PUBLIC API: panic handler (no_std, feature `panic_handler`)
//! DEPENDS_ON: uart::RawSerial, cpu::try_current()
//! INVARIANTS: No allocation; never takes the serial lock

use core::{fmt::Write, panic::PanicInfo};

use crate::{cpu, uart};

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();
    let mut w = uart::RawSerial;

    let _ = w.write_str("\nPANIC");
    if let Some(context) = cpu::try_current() {
        let _ = write!(w, " cpu={}", context.id());
    }
    if let Some(location) = info.location() {
        let _ = write!(w, " at {}:{}", location.file(), location.line());
    }
    let _ = write!(w, ": {}\n", info.message());

    loop {
        x86_64::instructions::hlt();
    }
}
