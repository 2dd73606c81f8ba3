// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Diagnostics that are safe to emit from a signal handler.
//!
//! `tracing` is used everywhere else in the crate, but a subscriber may allocate or lock, so
//! nothing on the fault path may call into it. These helpers format with `core::fmt` straight
//! into `write(2)` on stderr, and only when the debug flag of the installed configuration is set.

use super::unix_utils::FdWriter;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;

static DEBUG: AtomicBool = AtomicBool::new(false);

pub(crate) fn set_debug(enabled: bool) {
    DEBUG.store(enabled, SeqCst);
}

pub(crate) fn debug_enabled() -> bool {
    DEBUG.load(SeqCst)
}

#[doc(hidden)]
pub(crate) fn write_signal_safe(args: std::fmt::Arguments<'_>) {
    let mut w = FdWriter::stderr();
    let _ = w.write_all(b"faultbridge: ");
    let _ = w.write_fmt(args);
    let _ = w.write_all(b"\n");
}

/// Writes a line to stderr when the debug flag is set. Async-signal-safe.
macro_rules! sigsafe_debug {
    ($($arg:tt)*) => {
        if $crate::shared::log::debug_enabled() {
            $crate::shared::log::write_signal_safe(format_args!($($arg)*));
        }
    };
}

pub(crate) use sigsafe_debug;
