// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

// Everything reachable from `capture_signal` runs inside a signal handler and must stay
// async-signal-safe: no allocation, no locks. It only uses
// <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
// - clock_gettime
// - getpid
// - gettid (syscall) / pthread_threadid_np
// plus reads of the signal context and of the interrupted stack.

use super::frame_pointer_walker::{walk_frame_pointers, WalkEnd};
use crate::crash_info::{
    CrashReportDescriptor, FaultCondition, FaultKind, FaultOrigin, RawFrame, Registers, Timestamp,
};
use crate::shared::configuration::StacktraceCollection;
use crate::shared::unix_utils::current_tid;
use libc::{siginfo_t, ucontext_t};

/// Builds a descriptor for a signal. Best effort: missing context or a truncated stack walk marks
/// the descriptor incomplete but never prevents it from being produced.
///
/// # Safety
/// `sig_info` and `ucontext` must be null or the pointers the kernel handed the signal handler.
pub(crate) unsafe fn capture_signal(
    signum: i32,
    sig_info: *const siginfo_t,
    ucontext: *const ucontext_t,
    collection: StacktraceCollection,
) -> CrashReportDescriptor {
    let mut descriptor =
        CrashReportDescriptor::new(FaultOrigin::Native, FaultKind::Unknown, signum);
    fill_process_info(&mut descriptor);

    if sig_info.is_null() {
        descriptor.mark_incomplete();
    } else {
        descriptor.si_code = (*sig_info).si_code;
        descriptor.fault_address = fault_address(signum, sig_info);
    }

    descriptor.registers = if ucontext.is_null() {
        descriptor.mark_incomplete();
        None
    } else {
        registers_from_ucontext(ucontext)
    };
    descriptor.kind = FaultKind::from_signal(
        signum,
        descriptor.fault_address,
        descriptor.registers.map(|r| r.sp),
    );

    match collection {
        StacktraceCollection::Disabled => {}
        StacktraceCollection::FramePointers => match descriptor.registers {
            Some(registers) => collect_frame_pointers(&mut descriptor, registers),
            None => descriptor.mark_incomplete(),
        },
        StacktraceCollection::Unwinder => {
            let fault_ip = descriptor.registers.map(|r| r.ip);
            collect_unwound(&mut descriptor, fault_ip);
        }
    }
    descriptor
}

/// Last-resort descriptor for a nested fault: identity and nesting only, no stack.
pub(crate) fn capture_minimal(
    signum: i32,
    origin: FaultOrigin,
    condition: FaultCondition,
) -> CrashReportDescriptor {
    let kind = if origin == FaultOrigin::Managed {
        FaultKind::ManagedException
    } else {
        FaultKind::from_signal(signum, None, None)
    };
    let mut descriptor = CrashReportDescriptor::new(origin, kind, signum);
    fill_process_info(&mut descriptor);
    descriptor.mark_nested(condition);
    descriptor
}

/// Descriptor for a fault reported by a managed runtime. Not called from a signal handler, but
/// kept allocation free so it behaves the same whichever thread reports.
pub(crate) fn capture_managed(
    error_type: &str,
    message: &str,
    collection: StacktraceCollection,
) -> CrashReportDescriptor {
    let mut descriptor =
        CrashReportDescriptor::new(FaultOrigin::Managed, FaultKind::ManagedException, 0);
    fill_process_info(&mut descriptor);
    descriptor.error_type.set(error_type);
    descriptor.message.set(message);
    if collection != StacktraceCollection::Disabled {
        // SAFETY: walking our own, intact stack.
        unsafe { collect_unwound(&mut descriptor, None) };
    }
    descriptor
}

fn fill_process_info(descriptor: &mut CrashReportDescriptor) {
    // SAFETY: No preconditions.
    descriptor.pid = unsafe { libc::getpid() };
    descriptor.tid = current_tid();
    descriptor.timestamp = Timestamp::now();
}

/// SIGILL, SIGFPE, SIGSEGV, SIGBUS, and SIGTRAP fill in si_addr with the address of the fault,
/// when the kernel raised them (`si_code > 0`). Signals sent from user space carry the sender's
/// pid and uid in the same slot.
/// https://man7.org/linux/man-pages/man2/sigaction.2.html
unsafe fn fault_address(signum: i32, sig_info: *const siginfo_t) -> Option<usize> {
    if (*sig_info).si_code <= 0 {
        return None;
    }
    match signum {
        libc::SIGILL | libc::SIGFPE | libc::SIGSEGV | libc::SIGBUS | libc::SIGTRAP => {
            Some((*sig_info).si_addr() as usize)
        }
        _ => None,
    }
}

#[allow(unreachable_code)]
unsafe fn registers_from_ucontext(ucontext: *const ucontext_t) -> Option<Registers> {
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        let gregs = &(*ucontext).uc_mcontext.gregs;
        return Some(RawFrame {
            ip: gregs[libc::REG_RIP as usize] as usize,
            sp: gregs[libc::REG_RSP as usize] as usize,
            bp: gregs[libc::REG_RBP as usize] as usize,
        });
    }
    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    {
        let mcontext = &(*ucontext).uc_mcontext;
        return Some(RawFrame {
            ip: mcontext.pc as usize,
            sp: mcontext.sp as usize,
            bp: mcontext.regs[29] as usize,
        });
    }
    // On MacOS, the actual machine context is behind a second pointer.
    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    {
        let mcontext = (*ucontext).uc_mcontext;
        if mcontext.is_null() {
            return None;
        }
        let ss = &(*mcontext).__ss;
        return Some(RawFrame {
            ip: ss.__rip as usize,
            sp: ss.__rsp as usize,
            bp: ss.__rbp as usize,
        });
    }
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    {
        let mcontext = (*ucontext).uc_mcontext;
        if mcontext.is_null() {
            return None;
        }
        let ss = &(*mcontext).__ss;
        return Some(RawFrame {
            ip: ss.__pc as usize,
            sp: ss.__sp as usize,
            bp: ss.__fp as usize,
        });
    }
    let _ = ucontext;
    None
}

unsafe fn collect_frame_pointers(descriptor: &mut CrashReportDescriptor, start: Registers) {
    if walk_frame_pointers(start, |frame| descriptor.push_frame(frame)) == WalkEnd::Broken {
        descriptor.mark_incomplete();
    }
}

/// SIGNAL SAFETY:
///     Getting a backtrace on rust is not guaranteed to be signal safe.
///     https://github.com/rust-lang/backtrace-rs/issues/414
///     Calculating the `ip` of the frames seems safe, but resolving the frames
///     sometimes crashes, so frames are never resolved here.
unsafe fn collect_unwound(descriptor: &mut CrashReportDescriptor, fault_ip: Option<usize>) {
    // Skip all stack frames until we encounter the faulting instruction pointer. The frames
    // before it belong to the handler and to the unwinder itself.
    let mut ip_found = fault_ip.is_none();
    loop {
        backtrace::trace_unsynchronized(|frame| {
            let ip = frame.ip() as usize;
            if Some(ip) == fault_ip {
                ip_found = true;
            }
            if !ip_found {
                return true;
            }
            descriptor.push_frame(RawFrame {
                ip,
                sp: frame.sp() as usize,
                bp: 0,
            })
        });
        if ip_found {
            break;
        }
        // Keep anything at all if the faulting frame is not found for some reason.
        descriptor.mark_incomplete();
        ip_found = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering::SeqCst;
    use std::sync::atomic::{AtomicBool, AtomicI32};

    #[test]
    #[cfg_attr(miri, ignore)]
    fn null_context_is_incomplete_not_missing() {
        let d = unsafe {
            capture_signal(
                libc::SIGSEGV,
                std::ptr::null(),
                std::ptr::null(),
                StacktraceCollection::FramePointers,
            )
        };
        assert_eq!(d.kind, FaultKind::SegmentationViolation);
        assert_eq!(d.origin, FaultOrigin::Native);
        assert!(d.incomplete);
        assert_eq!(d.condition, Some(FaultCondition::CaptureIncomplete));
        assert!(d.registers.is_none());
        assert!(d.frames().is_empty());
        assert_eq!(d.pid, std::process::id() as i32);
        assert_eq!(d.tid, current_tid());
        assert!(!d.is_nested);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn unwinder_without_context_keeps_frames() {
        let d = unsafe {
            capture_signal(
                libc::SIGABRT,
                std::ptr::null(),
                std::ptr::null(),
                StacktraceCollection::Unwinder,
            )
        };
        assert_eq!(d.kind, FaultKind::Abort);
        assert!(!d.frames().is_empty());
    }

    #[test]
    fn minimal_descriptor_is_nested() {
        let d = capture_minimal(
            libc::SIGBUS,
            FaultOrigin::Native,
            FaultCondition::NativeFaultDuringManagedHandling,
        );
        assert!(d.is_nested);
        assert_eq!(d.kind, FaultKind::BusError);
        assert_eq!(
            d.condition,
            Some(FaultCondition::NativeFaultDuringManagedHandling)
        );
        assert!(d.frames().is_empty());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn managed_descriptor() {
        let d = capture_managed(
            "java.lang.NullPointerException",
            "Attempt to invoke virtual method on a null object reference",
            StacktraceCollection::Unwinder,
        );
        assert_eq!(d.kind, FaultKind::ManagedException);
        assert_eq!(d.signum, 0);
        assert_eq!(d.error_type.as_str(), "java.lang.NullPointerException");
        assert!(d.message.as_str().starts_with("Attempt to invoke"));
        assert!(!d.frames().is_empty());
        assert!(!d.incomplete);

        let d = capture_managed("E", "m", StacktraceCollection::Disabled);
        assert!(d.frames().is_empty());
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    #[cfg_attr(miri, ignore)]
    fn registers_are_read_from_the_context() {
        let mut uc: ucontext_t = unsafe { std::mem::zeroed() };
        uc.uc_mcontext.gregs[libc::REG_RIP as usize] = 0x1111;
        uc.uc_mcontext.gregs[libc::REG_RSP as usize] = 0x7000_0000;
        uc.uc_mcontext.gregs[libc::REG_RBP as usize] = 0;
        let mut info: siginfo_t = unsafe { std::mem::zeroed() };
        info.si_signo = libc::SIGSEGV;
        info.si_code = 1;
        let d = unsafe {
            capture_signal(
                libc::SIGSEGV,
                &info,
                &uc,
                StacktraceCollection::FramePointers,
            )
        };
        assert_eq!(
            d.registers,
            Some(RawFrame {
                ip: 0x1111,
                sp: 0x7000_0000,
                bp: 0
            })
        );
        assert_eq!(d.si_code, 1);
        assert_eq!(d.fault_address, Some(0));
        assert_eq!(d.kind, FaultKind::SegmentationViolation);
        // Null frame pointer: just the faulting frame, and that is a complete walk.
        assert_eq!(d.frames().len(), 1);
        assert!(!d.incomplete);
    }

    static SEEN_SI_CODE: AtomicI32 = AtomicI32::new(i32::MIN);
    static SAW_FAULT_ADDRESS: AtomicBool = AtomicBool::new(true);

    extern "C" fn capture_trap(signum: i32, info: *mut siginfo_t, ucontext: *mut libc::c_void) {
        let d = unsafe {
            capture_signal(
                signum,
                info,
                ucontext as *const ucontext_t,
                StacktraceCollection::Disabled,
            )
        };
        SEEN_SI_CODE.store(d.si_code, SeqCst);
        SAW_FAULT_ADDRESS.store(d.fault_address.is_some(), SeqCst);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn sent_signal_has_no_fault_address() {
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, SIGTRAP};

        let _lock = crate::collector::test_utils::test_lock();
        let action = SigAction::new(
            SigHandler::SigAction(capture_trap),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let previous = unsafe { sigaction(SIGTRAP, &action).unwrap() };
        unsafe { libc::raise(libc::SIGTRAP) };
        unsafe { sigaction(SIGTRAP, &previous).unwrap() };

        // raise() is a user-space send: si_code is SI_USER or SI_TKILL.
        assert!(SEEN_SI_CODE.load(SeqCst) <= 0);
        assert!(!SAW_FAULT_ADDRESS.load(SeqCst));
    }
}
