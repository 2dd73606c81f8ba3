// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod alt_stack;
mod api;
mod capture;
mod crash_handler;
mod crash_marker;
mod emitters;
mod error;
mod frame_pointer_walker;
mod managed;
mod reentrancy;
mod saguard;
mod signal_handler_manager;
mod sinks;
#[cfg(test)]
mod test_utils;
mod watcher_manager;

pub use alt_stack::{current_alt_stack, AltStack};
pub use api::FaultBridge;
pub use crash_handler::{current_metadata, disable, enable, is_enabled, update_metadata};
pub use crash_marker::{clear_crash_marker, crashed_last_run};
pub use error::BridgeError;
pub use managed::{FaultDecision, ManagedFault};
pub use reentrancy::{Entry, NestedFault, ReentrancyGuard, ReentrancyState};
pub use signal_handler_manager::{HandlerRegistry, InstalledHandlerRecord};
pub use sinks::{FdSink, ReportSink};
