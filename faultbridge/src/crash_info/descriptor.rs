// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The fixed-shape record produced by a capture.
//!
//! Everything here is `Copy` and lives inline: a descriptor is built on the (alternate) stack of
//! a signal handler, where the general-purpose allocator must not be touched.

use super::fault_kind::{FaultCondition, FaultKind};
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of native frames kept on a descriptor.
pub const MAX_BACKTRACE_FRAMES: usize = 128;

/// A raw stack frame containing register values.
///
/// - `ip`: Instruction pointer (RIP on x86_64, PC on aarch64)
/// - `sp`: Stack pointer (RSP on x86_64, SP on aarch64)
/// - `bp`: Base/frame pointer (RBP on x86_64, FP/X29 on aarch64)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawFrame {
    pub ip: usize,
    pub sp: usize,
    pub bp: usize,
}

/// Register snapshot of the interrupted context. Same layout as a frame.
pub type Registers = RawFrame;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromPrimitive, ToPrimitive,
)]
#[repr(C)]
pub enum FaultOrigin {
    Native,
    Managed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub secs: i64,
    pub nanos: i64,
}

impl Timestamp {
    /// `CLOCK_REALTIME`, read with the async-signal-safe `clock_gettime`.
    pub fn now() -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid out pointer.
        let rval = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
        if rval != 0 {
            return Self::default();
        }
        Self {
            secs: ts.tv_sec as i64,
            nanos: ts.tv_nsec as i64,
        }
    }
}

/// A string stored inline in a fixed buffer. Longer input is truncated on a char boundary.
#[derive(Clone, Copy)]
pub struct FixedStr<const N: usize> {
    len: usize,
    truncated: bool,
    buf: [u8; N],
}

impl<const N: usize> FixedStr<N> {
    pub const fn new() -> Self {
        Self {
            len: 0,
            truncated: false,
            buf: [0; N],
        }
    }

    pub fn from_str_truncated(s: &str) -> Self {
        let mut rval = Self::new();
        rval.set(s);
        rval
    }

    pub fn set(&mut self, s: &str) {
        let mut len = s.len().min(N);
        while !s.is_char_boundary(len) {
            len -= 1;
        }
        self.buf[..len].copy_from_slice(&s.as_bytes()[..len]);
        self.len = len;
        self.truncated = len < s.len();
    }

    pub fn as_str(&self) -> &str {
        // Only ever filled from a `&str`, cut on a char boundary.
        std::str::from_utf8(&self.buf[..self.len]).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

impl<const N: usize> Default for FixedStr<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl<const N: usize> PartialEq for FixedStr<N> {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

pub const MAX_ERROR_TYPE_LEN: usize = 128;
pub const MAX_MESSAGE_LEN: usize = 512;

/// Output of a capture, native or managed.
///
/// Ownership passes to the sink or the watcher once capture completes; the bridge keeps no copy.
#[derive(Clone, Copy)]
pub struct CrashReportDescriptor {
    pub origin: FaultOrigin,
    pub kind: FaultKind,
    /// 0 for managed faults
    pub signum: i32,
    pub si_code: i32,
    pub fault_address: Option<usize>,
    pub pid: i32,
    pub tid: i64,
    pub timestamp: Timestamp,
    pub registers: Option<Registers>,
    pub is_nested: bool,
    pub condition: Option<FaultCondition>,
    pub incomplete: bool,
    pub error_type: FixedStr<MAX_ERROR_TYPE_LEN>,
    pub message: FixedStr<MAX_MESSAGE_LEN>,
    frames: [RawFrame; MAX_BACKTRACE_FRAMES],
    frame_count: usize,
}

impl CrashReportDescriptor {
    pub fn new(origin: FaultOrigin, kind: FaultKind, signum: i32) -> Self {
        Self {
            origin,
            kind,
            signum,
            si_code: 0,
            fault_address: None,
            pid: 0,
            tid: 0,
            timestamp: Timestamp::default(),
            registers: None,
            is_nested: false,
            condition: None,
            incomplete: false,
            error_type: FixedStr::new(),
            message: FixedStr::new(),
            frames: [RawFrame::default(); MAX_BACKTRACE_FRAMES],
            frame_count: 0,
        }
    }

    pub fn frames(&self) -> &[RawFrame] {
        &self.frames[..self.frame_count]
    }

    /// Appends a frame. Returns false, and marks the descriptor incomplete, once full.
    pub fn push_frame(&mut self, frame: RawFrame) -> bool {
        if self.frame_count >= MAX_BACKTRACE_FRAMES {
            self.mark_incomplete();
            return false;
        }
        self.frames[self.frame_count] = frame;
        self.frame_count += 1;
        true
    }

    pub fn mark_incomplete(&mut self) {
        self.incomplete = true;
        if self.condition.is_none() {
            self.condition = Some(FaultCondition::CaptureIncomplete);
        }
    }

    pub fn mark_nested(&mut self, condition: FaultCondition) {
        self.is_nested = true;
        self.condition = Some(condition);
    }
}

impl fmt::Debug for CrashReportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrashReportDescriptor")
            .field("origin", &self.origin)
            .field("kind", &self.kind)
            .field("signum", &self.signum)
            .field("fault_address", &self.fault_address)
            .field("tid", &self.tid)
            .field("is_nested", &self.is_nested)
            .field("condition", &self.condition)
            .field("incomplete", &self.incomplete)
            .field("frames", &self.frame_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_str_truncates_on_char_boundary() {
        let s: FixedStr<4> = FixedStr::from_str_truncated("abcé");
        assert_eq!(s.as_str(), "abc");
        assert!(s.truncated());

        let s: FixedStr<8> = FixedStr::from_str_truncated("abcé");
        assert_eq!(s.as_str(), "abcé");
        assert!(!s.truncated());
        assert!(FixedStr::<8>::new().is_empty());
    }

    #[test]
    fn frames_are_bounded() {
        let mut d = CrashReportDescriptor::new(FaultOrigin::Native, FaultKind::Abort, 6);
        for i in 0..MAX_BACKTRACE_FRAMES {
            assert!(d.push_frame(RawFrame {
                ip: i,
                sp: 0,
                bp: 0
            }));
        }
        assert!(!d.incomplete);
        assert!(!d.push_frame(RawFrame::default()));
        assert!(d.incomplete);
        assert_eq!(d.condition, Some(FaultCondition::CaptureIncomplete));
        assert_eq!(d.frames().len(), MAX_BACKTRACE_FRAMES);
        assert_eq!(d.frames()[5].ip, 5);
    }

    #[test]
    fn nested_overrides_incomplete() {
        let mut d = CrashReportDescriptor::new(FaultOrigin::Native, FaultKind::Abort, 6);
        d.mark_incomplete();
        d.mark_nested(FaultCondition::NestedFault);
        assert!(d.is_nested);
        assert!(d.incomplete);
        assert_eq!(d.condition, Some(FaultCondition::NestedFault));
    }

    #[test]
    fn timestamp_is_recent() {
        let ts = Timestamp::now();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        assert!((now - ts.secs).abs() <= 2);
        assert!((0..1_000_000_000).contains(&ts.nanos));
    }
}
