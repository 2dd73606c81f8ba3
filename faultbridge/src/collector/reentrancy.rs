// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide gate in front of the capture path.
//!
//! `Idle -> InHandler -> Idle` on normal completion, `InHandler -> NestedFault` when a second fault
//! (native or managed) arrives while the first is still being captured. The transition out of
//! `Idle` is a single compare-and-swap, so exactly one thread at a time is the top-level reporter.
//! No mutex is involved: a lock held by a thread that then faults would deadlock every later
//! fault.

use crate::crash_info::{FaultCondition, FaultOrigin};
use crate::shared::timeout::TimeoutManager;
use crate::shared::unix_utils::current_tid;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReentrancyState {
    Idle = 0,
    InHandler = 1,
    NestedFault = 2,
}

impl ReentrancyState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::InHandler,
            _ => Self::NestedFault,
        }
    }
}

static STATE: AtomicU8 = AtomicU8::new(ReentrancyState::Idle as u8);
static OWNER_TID: AtomicI64 = AtomicI64::new(0);
static OWNER_ORIGIN: AtomicU8 = AtomicU8::new(FaultOrigin::Native as u8);
static NESTED_FAULTS: AtomicU64 = AtomicU64::new(0);

/// Held by the top-level reporter. Dropping it returns the state to `Idle`.
#[derive(Debug)]
pub struct ReentrancyGuard {
    _private: (),
}

/// What a caller that lost the race learns about the fault already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NestedFault {
    pub condition: FaultCondition,
    /// The new fault was raised by the thread that holds the guard, i.e. from inside capture.
    pub same_thread: bool,
}

#[derive(Debug)]
pub enum Entry {
    TopLevel(ReentrancyGuard),
    Nested(NestedFault),
}

impl ReentrancyGuard {
    /// Async-signal-safe.
    pub fn enter(origin: FaultOrigin) -> Entry {
        let tid = current_tid();
        match STATE.compare_exchange(
            ReentrancyState::Idle as u8,
            ReentrancyState::InHandler as u8,
            SeqCst,
            SeqCst,
        ) {
            Ok(_) => {
                OWNER_TID.store(tid, SeqCst);
                OWNER_ORIGIN.store(origin as u8, SeqCst);
                Entry::TopLevel(Self { _private: () })
            }
            Err(_) => {
                // The holder may already be on its way out; it resets to Idle regardless.
                let _ = STATE.compare_exchange(
                    ReentrancyState::InHandler as u8,
                    ReentrancyState::NestedFault as u8,
                    SeqCst,
                    SeqCst,
                );
                NESTED_FAULTS.fetch_add(1, SeqCst);
                let owner_origin = if OWNER_ORIGIN.load(SeqCst) == FaultOrigin::Managed as u8 {
                    FaultOrigin::Managed
                } else {
                    FaultOrigin::Native
                };
                let condition = match (owner_origin, origin) {
                    (FaultOrigin::Managed, FaultOrigin::Native) => {
                        FaultCondition::NativeFaultDuringManagedHandling
                    }
                    (FaultOrigin::Native, FaultOrigin::Managed) => {
                        FaultCondition::ManagedFaultDuringNativeHandling
                    }
                    _ => FaultCondition::NestedFault,
                };
                Entry::Nested(NestedFault {
                    condition,
                    same_thread: OWNER_TID.load(SeqCst) == tid,
                })
            }
        }
    }

    pub fn state() -> ReentrancyState {
        ReentrancyState::from_u8(STATE.load(SeqCst))
    }

    /// Total number of faults that arrived while another one was being handled.
    pub fn nested_fault_count() -> u64 {
        NESTED_FAULTS.load(SeqCst)
    }

    /// Spins until the top-level reporter is done or the budget runs out.
    /// Returns whether the guard went back to `Idle`. Async-signal-safe.
    pub fn wait_for_idle(timeout_manager: &TimeoutManager) -> bool {
        loop {
            if Self::state() == ReentrancyState::Idle {
                return true;
            }
            if timeout_manager.expired() {
                return false;
            }
            // SAFETY: No preconditions.
            unsafe { libc::sched_yield() };
        }
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        OWNER_TID.store(0, SeqCst);
        STATE.store(ReentrancyState::Idle as u8, SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::test_utils::test_lock;
    use std::time::Duration;

    #[test]
    fn top_level_then_idle() {
        let _lock = test_lock();
        assert_eq!(ReentrancyGuard::state(), ReentrancyState::Idle);
        let entry = ReentrancyGuard::enter(FaultOrigin::Native);
        assert!(matches!(entry, Entry::TopLevel(_)));
        assert_eq!(ReentrancyGuard::state(), ReentrancyState::InHandler);
        drop(entry);
        assert_eq!(ReentrancyGuard::state(), ReentrancyState::Idle);
    }

    #[test]
    fn second_entry_is_nested() {
        let _lock = test_lock();
        let before = ReentrancyGuard::nested_fault_count();
        let outer = ReentrancyGuard::enter(FaultOrigin::Native);
        match ReentrancyGuard::enter(FaultOrigin::Native) {
            Entry::Nested(nested) => {
                assert_eq!(nested.condition, FaultCondition::NestedFault);
                assert!(nested.same_thread);
            }
            Entry::TopLevel(_) => panic!("second entry must not be top level"),
        }
        assert_eq!(ReentrancyGuard::state(), ReentrancyState::NestedFault);
        assert_eq!(ReentrancyGuard::nested_fault_count(), before + 1);
        drop(outer);
        assert_eq!(ReentrancyGuard::state(), ReentrancyState::Idle);
    }

    #[test]
    fn cross_boundary_conditions() {
        let _lock = test_lock();
        let outer = ReentrancyGuard::enter(FaultOrigin::Managed);
        let handle = std::thread::spawn(|| match ReentrancyGuard::enter(FaultOrigin::Native) {
            Entry::Nested(nested) => nested,
            Entry::TopLevel(_) => panic!("expected nested"),
        });
        let nested = handle.join().unwrap();
        assert_eq!(
            nested.condition,
            FaultCondition::NativeFaultDuringManagedHandling
        );
        assert!(!nested.same_thread);
        drop(outer);

        let outer = ReentrancyGuard::enter(FaultOrigin::Native);
        match ReentrancyGuard::enter(FaultOrigin::Managed) {
            Entry::Nested(nested) => assert_eq!(
                nested.condition,
                FaultCondition::ManagedFaultDuringNativeHandling
            ),
            Entry::TopLevel(_) => panic!("expected nested"),
        }
        drop(outer);
    }

    #[test]
    fn wait_for_idle_is_bounded() {
        let _lock = test_lock();
        let outer = ReentrancyGuard::enter(FaultOrigin::Native);
        let tm = TimeoutManager::new(Duration::from_millis(50));
        assert!(!ReentrancyGuard::wait_for_idle(&tm));

        let waiter = std::thread::spawn(|| {
            ReentrancyGuard::wait_for_idle(&TimeoutManager::new(Duration::from_secs(10)))
        });
        std::thread::sleep(Duration::from_millis(20));
        drop(outer);
        assert!(waiter.join().unwrap());
    }
}
