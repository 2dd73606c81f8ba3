// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

/// Distance from the interrupted stack pointer within which a SIGSEGV/SIGBUS address is taken
/// to be a hit on the stack guard page.
const STACK_OVERFLOW_WINDOW: usize = 64 * 1024;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, FromPrimitive, ToPrimitive,
)]
#[repr(C)]
pub enum FaultKind {
    SegmentationViolation,
    BusError,
    IllegalInstruction,
    Abort,
    FloatingPoint,
    Trap,
    StackOverflow,
    ManagedException,
    Unknown,
}

impl FaultKind {
    /// Classifies a signal. `fault_address` and `stack_pointer` come from the signal context and
    /// are only used to tell a stack overflow from other invalid accesses.
    pub fn from_signal(
        signum: i32,
        fault_address: Option<usize>,
        stack_pointer: Option<usize>,
    ) -> Self {
        match signum {
            libc::SIGSEGV | libc::SIGBUS
                if is_stack_overflow(fault_address, stack_pointer) =>
            {
                FaultKind::StackOverflow
            }
            libc::SIGSEGV => FaultKind::SegmentationViolation,
            libc::SIGBUS => FaultKind::BusError,
            libc::SIGILL => FaultKind::IllegalInstruction,
            libc::SIGABRT => FaultKind::Abort,
            libc::SIGFPE => FaultKind::FloatingPoint,
            libc::SIGTRAP => FaultKind::Trap,
            _ => FaultKind::Unknown,
        }
    }
}

fn is_stack_overflow(fault_address: Option<usize>, stack_pointer: Option<usize>) -> bool {
    match (fault_address, stack_pointer) {
        (Some(addr), Some(sp)) if addr != 0 && sp != 0 => {
            addr.abs_diff(sp) <= STACK_OVERFLOW_WINDOW
        }
        _ => false,
    }
}

/// Conditions recorded on a descriptor when the fault path did not run to plain completion.
/// These are never propagated as errors out of a handler.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, FromPrimitive, ToPrimitive,
)]
#[repr(C)]
pub enum FaultCondition {
    /// A fault arrived while another one was being captured.
    NestedFault,
    /// A managed fault was reported while a native fault was being handled.
    ManagedFaultDuringNativeHandling,
    /// A native fault arrived while a managed fault was being reported.
    NativeFaultDuringManagedHandling,
    /// Best-effort capture could not gather everything (missing context, truncated stack).
    CaptureIncomplete,
}

/// The signals the bridge monitors unless told otherwise.
/// A stack overflow arrives as SIGSEGV (or SIGBUS on some platforms) delivered on the alternate
/// stack.
pub fn default_signals() -> Vec<i32> {
    let mut signals = vec![
        libc::SIGABRT,
        libc::SIGBUS,
        libc::SIGFPE,
        libc::SIGILL,
        libc::SIGSEGV,
        libc::SIGTRAP,
    ];
    signals.sort();
    signals
}

pub fn signal_from_signum(signum: i32) -> anyhow::Result<nix::sys::signal::Signal> {
    nix::sys::signal::Signal::try_from(signum)
        .map_err(|_| anyhow::anyhow!("Unexpected signal number {signum}"))
}

/// Human readable name for the signals the bridge cares about.
pub fn signal_name(signum: i32) -> &'static str {
    match signum {
        0 => "NONE",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGILL => "SIGILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGSYS => "SIGSYS",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGTERM => "SIGTERM",
        libc::SIGINT => "SIGINT",
        libc::SIGKILL => "SIGKILL",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGUSR2 => "SIGUSR2",
        _ => "UNKNOWN",
    }
}
