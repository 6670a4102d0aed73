// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Minimal 16550 serial support for boot diagnostics (COM1).

use core::fmt::{self, Write};
use spin::Mutex;

/// I/O port base of COM1.
const COM1_BASE: u16 = 0x3F8;
const UART_TX: u16 = 0x0;
const UART_LSR: u16 = 0x5;
const LSR_TX_IDLE: u8 = 1 << 5;

static COM1: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1_BASE));

/// Serial port capable of formatted writes.
#[derive(Clone, Copy)]
pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    /// Creates a port rooted at I/O base `base`.
    pub const fn new(base: u16) -> Self {
        Self { base }
    }

    /// Returns a guard for the boot serial singleton.
    pub fn lock() -> spin::MutexGuard<'static, SerialPort> {
        COM1.lock()
    }

    fn write_raw(&self, value: u8) {
        write_port(self.base, value);
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn write_port(base: u16, value: u8) {
    use x86_64::instructions::port::Port;

    let mut lsr: Port<u8> = Port::new(base + UART_LSR);
    let mut tx: Port<u8> = Port::new(base + UART_TX);
    unsafe {
        while lsr.read() & LSR_TX_IDLE == 0 {
            core::hint::spin_loop();
        }
        tx.write(value);
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn write_port(_base: u16, _value: u8) {
    let _ = (UART_TX, UART_LSR, LSR_TX_IDLE);
}

/// Lock-free writer for panic contexts where the mutex may already be held.
pub struct RawSerial;

impl Write for RawSerial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        SerialPort::new(COM1_BASE).write_str(s)
    }
}

impl Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                self.write_raw(b'\r');
            }
            self.write_raw(byte);
        }
        Ok(())
    }
}
