// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::capture::{capture_minimal, capture_signal};
use super::crash_marker::write_crash_marker;
use super::error::BridgeError;
use super::reentrancy::{Entry, NestedFault, ReentrancyGuard, ReentrancyState};
use super::signal_handler_manager::{chain_signal_handler, reset_default_and_raise};
use super::sinks::ReportSink;
use super::watcher_manager::WatcherChannel;
use crate::crash_info::{CrashReportDescriptor, FaultOrigin, Metadata};
use crate::shared::configuration::{BridgeConfiguration, HandlerStrategy};
use crate::shared::log::sigsafe_debug;
use crate::shared::timeout::TimeoutManager;
use crate::shared::unix_utils::terminate;
use libc::{c_void, siginfo_t, ucontext_t};
use std::ffi::CString;
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize};
use std::time::Duration;

// Note that this file makes use the following async-signal safe functions in a signal handler.
// <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
// - clock_gettime
// - close
// - kill
// - open
// - poll
// - raise
// - sigaction
// - sigprocmask
// - shutdown
// - waitpid
// - write

/// Everything the signal handler needs, prepared when the bridge is initialised.
pub(crate) struct BridgeState {
    pub(crate) config: BridgeConfiguration,
    pub(crate) sink: Box<dyn ReportSink>,
    pub(crate) watcher: Option<WatcherChannel>,
    pub(crate) crash_marker: Option<CString>,
}

// Using mutexes inside a signal handler is not allowed, so use `AtomicPtr` instead to get
// atomicity. These are always either null or from `Box::into_raw()`.
static STATE: AtomicPtr<BridgeState> = AtomicPtr::new(ptr::null_mut());
static METADATA: AtomicPtr<(Metadata, String)> = AtomicPtr::new(ptr::null_mut());
// Number of `StateRef`s alive. `STATE` is only freed once this drops to zero.
static READERS: AtomicUsize = AtomicUsize::new(0);
static ENABLED: AtomicBool = AtomicBool::new(true);
// At most one native report per installation.
static NATIVE_REPORTED: AtomicBool = AtomicBool::new(false);

/// A borrow of the published state that keeps it from being freed.
pub(crate) struct StateRef {
    state: &'static BridgeState,
}

impl StateRef {
    /// Async-signal-safe.
    pub(crate) fn acquire() -> Option<Self> {
        // Count ourselves in before looking, so that `retract_state` either sees us or we see
        // null.
        READERS.fetch_add(1, SeqCst);
        let ptr = STATE.load(SeqCst);
        if ptr.is_null() {
            READERS.fetch_sub(1, SeqCst);
            return None;
        }
        // SAFETY: non-null pointers come from `publish_state`, and are not freed while READERS
        // is non-zero.
        Some(Self {
            state: unsafe { &*ptr },
        })
    }
}

impl Deref for StateRef {
    type Target = BridgeState;

    fn deref(&self) -> &BridgeState {
        self.state
    }
}

impl Drop for StateRef {
    fn drop(&mut self) {
        READERS.fetch_sub(1, SeqCst);
    }
}

pub(crate) fn publish_state(state: BridgeState) -> Result<(), BridgeError> {
    let box_ptr = Box::into_raw(Box::new(state));
    if STATE
        .compare_exchange(ptr::null_mut(), box_ptr, SeqCst, SeqCst)
        .is_err()
    {
        // SAFETY: never published.
        drop(unsafe { Box::from_raw(box_ptr) });
        return Err(BridgeError::AlreadyInitialized);
    }
    NATIVE_REPORTED.store(false, SeqCst);
    Ok(())
}

/// Unpublishes the state and hands it back once no handler is using it. If a handler is still
/// using it when `timeout` runs out, the state is leaked and `None` is returned.
pub(crate) fn retract_state(timeout: Duration) -> Option<Box<BridgeState>> {
    let ptr = STATE.swap(ptr::null_mut(), SeqCst);
    if ptr.is_null() {
        return None;
    }
    let timeout_manager = TimeoutManager::new(timeout);
    while READERS.load(SeqCst) != 0 {
        if timeout_manager.expired() {
            tracing::warn!("A fault handler is still using the bridge state, leaking it");
            return None;
        }
        std::thread::yield_now();
    }
    // SAFETY: came from `publish_state`, and nobody else can reach it any more.
    Some(unsafe { Box::from_raw(ptr) })
}

/// Updates the metadata sent with every report.
///
/// PRECONDITIONS:
///     None
/// ATOMICITY:
///     This function uses a swap on an atomic pointer. The previous value is leaked rather than
///     freed if a fault is being handled at the time.
pub fn update_metadata(metadata: Metadata) -> anyhow::Result<()> {
    let metadata_string = serde_json::to_string(&metadata)?;
    let box_ptr = Box::into_raw(Box::new((metadata, metadata_string)));
    let old = METADATA.swap(box_ptr, SeqCst);
    free_metadata(old);
    Ok(())
}

pub(crate) fn clear_metadata() {
    free_metadata(METADATA.swap(ptr::null_mut(), SeqCst));
}

fn free_metadata(old: *mut (Metadata, String)) {
    if !old.is_null() && ReentrancyGuard::state() == ReentrancyState::Idle {
        // Safety: This can only come from a box above.
        unsafe {
            std::mem::drop(Box::from_raw(old));
        }
    }
}

/// The current metadata, for callers outside the signal handler.
pub fn current_metadata() -> Option<Metadata> {
    let ptr = METADATA.load(SeqCst);
    // SAFETY: null or from `update_metadata`.
    unsafe { ptr.as_ref() }.map(|(metadata, _)| metadata.clone())
}

fn metadata_str() -> Option<&'static str> {
    let ptr = METADATA.load(SeqCst);
    // SAFETY: null or from `update_metadata`; not freed while a fault is being handled.
    unsafe { ptr.as_ref() }.map(|(_, s)| s.as_str())
}

/// Disables fault capture.
/// Note that this does not restore the old signal handlers, but rather turns capture into a
/// no-op, and then chains the old handlers. This means that handlers registered after the bridge
/// will continue to work as expected.
///
/// # Atomicity
///   This function is atomic and idempotent.  Calling it multiple times is allowed.
pub fn disable() {
    ENABLED.store(false, SeqCst);
}

/// Enables fault capture, if it had been previously disabled.
/// If the bridge has not been initialized, this function will have no effect.
///
/// # Atomicity
///   This function is atomic and idempotent.  Calling it multiple times is allowed.
pub fn enable() {
    ENABLED.store(true, SeqCst);
}

pub fn is_enabled() -> bool {
    ENABLED.load(SeqCst)
}

/// Hands a descriptor to the watcher or to the sink, per strategy. Async-signal-safe.
///
/// `terminal` is set when the process is about to go away: the watcher channel is then closed
/// and waited on, and the crash marker written.
pub(crate) fn dispatch_report(
    state: &BridgeState,
    descriptor: &CrashReportDescriptor,
    terminal: bool,
) {
    let metadata = metadata_str();
    match (state.config.strategy(), &state.watcher) {
        (HandlerStrategy::OutOfProcess, Some(watcher)) => {
            if watcher.send(descriptor, metadata).is_err() {
                sigsafe_debug!("watcher unavailable, writing the report to the sink");
                state.sink.write_report(descriptor, metadata);
            }
            if terminal {
                watcher.finish(&TimeoutManager::new(state.config.timeout()));
            }
        }
        _ => state.sink.write_report(descriptor, metadata),
    }
    if terminal {
        if let Some(marker) = &state.crash_marker {
            write_crash_marker(marker, descriptor.timestamp);
        }
    }
}

pub(crate) extern "C" fn handle_posix_sigaction(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    // Capture first: chaining to a default action does not return.
    handle_posix_signal_impl(signum, sig_info, ucontext as *const ucontext_t);
    // SAFETY: the pointers are the ones the kernel gave us.
    unsafe { chain_signal_handler(signum, sig_info, ucontext) };
}

fn handle_posix_signal_impl(signum: i32, sig_info: *const siginfo_t, ucontext: *const ucontext_t) {
    if !ENABLED.load(SeqCst) {
        return;
    }
    let Some(state) = StateRef::acquire() else {
        return;
    };

    match ReentrancyGuard::enter(FaultOrigin::Native) {
        Entry::TopLevel(_guard) => {
            // In the case where some lower-level signal handler recovered the error we don't
            // want to report the same fault over and over. Make this one shot.
            if NATIVE_REPORTED.swap(true, SeqCst) {
                sigsafe_debug!("signal {signum} after a native report, chaining only");
                return;
            }
            sigsafe_debug!("capturing signal {signum}");
            // SAFETY: the pointers are the ones the kernel gave us.
            let descriptor = unsafe {
                capture_signal(signum, sig_info, ucontext, state.config.resolve_frames())
            };
            dispatch_report(&state, &descriptor, true);
        }
        Entry::Nested(nested) => handle_nested_fault(&state, signum, nested),
    }
}

/// The degraded path: never captures a stack and never re-enters the primary path.
fn handle_nested_fault(state: &BridgeState, signum: i32, nested: NestedFault) {
    sigsafe_debug!(
        "nested fault: signal {signum}, same thread: {}",
        nested.same_thread
    );
    let descriptor = capture_minimal(signum, FaultOrigin::Native, nested.condition);
    if nested.same_thread {
        // The capture path itself faulted. Record it and go down with this signal.
        state.sink.write_report(&descriptor, None);
        reset_default_and_raise(signum);
        terminate();
    }
    // Another thread is reporting. Let it finish so its report is not cut short, then chain.
    let timeout_manager = TimeoutManager::new(state.config.timeout());
    if !ReentrancyGuard::wait_for_idle(&timeout_manager) {
        sigsafe_debug!("timed out waiting for the reporting thread");
    }
    state.sink.write_report(&descriptor, None);
}
