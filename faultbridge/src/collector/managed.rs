// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry point for faults detected by a managed runtime rather than by a signal.

use super::capture::{capture_managed, capture_minimal};
use super::crash_handler::{dispatch_report, is_enabled, BridgeState, StateRef};
use super::error::BridgeError;
use super::reentrancy::{Entry, NestedFault, ReentrancyGuard};
use crate::crash_info::FaultOrigin;
use crate::shared::configuration::{ManagedFaultPolicy, StacktraceCollection};
use crate::shared::timeout::TimeoutManager;

/// A fault raised by managed code, as described by its runtime.
#[derive(Debug, Clone, Copy)]
pub struct ManagedFault<'a> {
    pub error_type: &'a str,
    pub message: &'a str,
    /// Also record the native stack of the reporting thread.
    pub capture_native_stack: bool,
}

impl<'a> ManagedFault<'a> {
    pub fn new(error_type: &'a str, message: &'a str) -> Self {
        Self {
            error_type,
            message,
            capture_native_stack: false,
        }
    }

    pub fn with_native_stack(mut self) -> Self {
        self.capture_native_stack = true;
        self
    }
}

/// What the managed runtime should do once the fault has been reported.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDecision {
    Continue,
    Terminate,
}

impl From<ManagedFaultPolicy> for FaultDecision {
    fn from(policy: ManagedFaultPolicy) -> Self {
        match policy {
            ManagedFaultPolicy::Continue => FaultDecision::Continue,
            ManagedFaultPolicy::Terminate => FaultDecision::Terminate,
        }
    }
}

/// Runs a managed fault through the same pipeline as a native one.
///
/// Unlike native faults, managed faults are not one-shot: every call produces a report. A call
/// made while another fault is being handled is counted as nested and only gets a minimal report,
/// without a stack.
pub(crate) fn report_managed_fault(fault: &ManagedFault) -> Result<FaultDecision, BridgeError> {
    let state = StateRef::acquire().ok_or(BridgeError::NotInitialized)?;
    let decision = FaultDecision::from(state.config.managed_fault_policy());
    if !is_enabled() {
        return Ok(decision);
    }

    match ReentrancyGuard::enter(FaultOrigin::Managed) {
        Entry::TopLevel(_guard) => {
            let collection = if fault.capture_native_stack {
                StacktraceCollection::Unwinder
            } else {
                StacktraceCollection::Disabled
            };
            let descriptor = capture_managed(fault.error_type, fault.message, collection);
            dispatch_report(&state, &descriptor, decision == FaultDecision::Terminate);
        }
        Entry::Nested(nested) => report_nested_managed_fault(&state, fault, nested),
    }
    Ok(decision)
}

fn report_nested_managed_fault(state: &BridgeState, fault: &ManagedFault, nested: NestedFault) {
    tracing::warn!(
        condition = ?nested.condition,
        same_thread = nested.same_thread,
        error_type = fault.error_type,
        "Managed fault raised while another fault was being handled"
    );
    let mut descriptor = capture_minimal(0, FaultOrigin::Managed, nested.condition);
    descriptor.error_type.set(fault.error_type);
    descriptor.message.set(fault.message);
    // On the reporting thread itself, waiting would only run out the clock.
    if !nested.same_thread {
        let timeout_manager = TimeoutManager::new(state.config.timeout());
        if !ReentrancyGuard::wait_for_idle(&timeout_manager) {
            tracing::debug!("Timed out waiting for the reporting thread");
        }
    }
    state.sink.write_report(&descriptor, None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_maps_to_decision() {
        assert_eq!(
            FaultDecision::from(ManagedFaultPolicy::Continue),
            FaultDecision::Continue
        );
        assert_eq!(
            FaultDecision::from(ManagedFaultPolicy::Terminate),
            FaultDecision::Terminate
        );
    }

    #[test]
    fn builder_flags() {
        let fault = ManagedFault::new("System.NullReferenceException", "boom");
        assert!(!fault.capture_native_stack);
        assert!(fault.with_native_stack().capture_native_stack);
    }
}
