// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stack walking by following saved frame pointers.
//!
//! On x86_64 and aarch64 a function built with frame pointers saves the caller's frame pointer at
//! `[fp]` and the return address at `[fp + 8]`. Starting from the faulting register state this
//! gives the call chain without calling into an unwinder, which may allocate or take locks.
//!
//! Every step is checked before it is followed: the frame pointer must be aligned, strictly
//! increasing (the stack grows down) and not jump by more than [`MAX_FRAME_SIZE`]. A chain that
//! fails a check ends the walk early and is reported as incomplete. Reading a pointer that passed
//! the checks can still fault on a corrupted stack; that fault is handled as a nested one.

use crate::crash_info::RawFrame;
use std::mem::size_of;

const MAX_FRAME_SIZE: usize = 1 << 20;

/// How a walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WalkEnd {
    /// Reached the outermost frame (null frame pointer or return address).
    Complete,
    /// A frame pointer failed a sanity check.
    Broken,
    /// `push` refused more frames.
    Full,
}

/// Walks from `start`, calling `push` for each frame including the first one.
///
/// # Safety
/// Reads memory at addresses derived from `start.bp`. Callers must either be on a live stack with
/// frame pointers or be prepared for a fault.
pub(crate) unsafe fn walk_frame_pointers(
    start: RawFrame,
    mut push: impl FnMut(RawFrame) -> bool,
) -> WalkEnd {
    if !push(start) {
        return WalkEnd::Full;
    }
    let word = size_of::<usize>();
    let mut fp = start.bp;
    let lower_bound = start.sp;
    loop {
        if fp == 0 {
            return WalkEnd::Complete;
        }
        if fp % word != 0 || fp < lower_bound {
            return WalkEnd::Broken;
        }
        let next_fp = std::ptr::read_volatile(fp as *const usize);
        let return_address = std::ptr::read_volatile((fp + word) as *const usize);
        if return_address == 0 {
            return WalkEnd::Complete;
        }
        let frame = RawFrame {
            ip: return_address,
            sp: fp + 2 * word,
            bp: next_fp,
        };
        if !push(frame) {
            return WalkEnd::Full;
        }
        if next_fp == 0 {
            return WalkEnd::Complete;
        }
        if next_fp <= fp || next_fp - fp > MAX_FRAME_SIZE {
            return WalkEnd::Broken;
        }
        fp = next_fp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Lays out `n` frames in `stack`, each 4 words apart, innermost first.
    fn fake_stack(stack: &mut [usize], n: usize) -> RawFrame {
        let base = stack.as_ptr() as usize;
        let word = size_of::<usize>();
        for i in 0..n {
            let slot = i * 4;
            stack[slot] = if i + 1 < n {
                base + (slot + 4) * word
            } else {
                0
            };
            stack[slot + 1] = 0x1000 + i;
        }
        RawFrame {
            ip: 0xdead,
            sp: base,
            bp: base,
        }
    }

    #[test]
    fn walks_a_well_formed_chain() {
        let mut stack = vec![0usize; 64];
        let start = fake_stack(&mut stack, 5);
        let mut frames = vec![];
        let end = unsafe {
            walk_frame_pointers(start, |f| {
                frames.push(f);
                true
            })
        };
        assert_eq!(end, WalkEnd::Complete);
        assert_eq!(frames.len(), 6);
        assert_eq!(frames[0].ip, 0xdead);
        let ips: Vec<usize> = frames[1..].iter().map(|f| f.ip).collect();
        assert_eq!(ips, vec![0x1000, 0x1001, 0x1002, 0x1003, 0x1004]);
    }

    #[test]
    fn stops_when_full() {
        let mut stack = vec![0usize; 64];
        let start = fake_stack(&mut stack, 10);
        let mut count = 0;
        let end = unsafe {
            walk_frame_pointers(start, |_| {
                count += 1;
                count < 3
            })
        };
        assert_eq!(end, WalkEnd::Full);
        assert_eq!(count, 3);
    }

    #[test]
    fn rejects_a_chain_going_backwards() {
        let mut stack = vec![0usize; 64];
        let start = fake_stack(&mut stack, 5);
        // Second frame points back at the first.
        stack[4] = stack.as_ptr() as usize;
        let mut count = 0;
        let end = unsafe {
            walk_frame_pointers(start, |_| {
                count += 1;
                true
            })
        };
        assert_eq!(end, WalkEnd::Broken);
        assert_eq!(count, 3);
    }

    #[test]
    fn rejects_misaligned_start() {
        let stack = vec![0usize; 4];
        let base = stack.as_ptr() as usize;
        let start = RawFrame {
            ip: 1,
            sp: base,
            bp: base + 1,
        };
        assert_eq!(
            unsafe { walk_frame_pointers(start, |_| true) },
            WalkEnd::Broken
        );
    }
}
