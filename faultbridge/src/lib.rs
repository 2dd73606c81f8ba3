// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Fault capture for native processes that host a managed runtime.
//!
//! The library has three parts, which communicate through the types in `crash_info`:
//!
//! 1. The collector (`collector` module), which runs in the process being watched. It owns an
//!    alternate signal stack, installs handlers for fatal signals, and when one fires captures a
//!    fixed-size [`CrashReportDescriptor`] using only async-signal-safe operations. The same
//!    pipeline is reachable from a managed runtime through [`FaultBridge::report_managed_fault`].
//!
//! 2. A sink or a watcher. With [`HandlerStrategy::InProcess`] the descriptor is handed
//!    synchronously to a [`ReportSink`] inside the signal handler. With
//!    [`HandlerStrategy::OutOfProcess`] it is written to a channel that was set up when the
//!    handlers were installed, and read by a separate watcher process.
//!
//! 3. The receiver (`receiver` module, `faultbridge-watcher` binary), which reads the delimited
//!    stream, builds an owned [`CrashReport`] and writes it out as JSON.
//!
//! After a native fault has been captured, control always chains to whatever handler was
//! installed before ours, so default behaviour (core dumps, runtime handlers) is preserved.
//!
//! Handling a fault is inherently unsafe: the faulting thread may hold locks, its stack may be
//! exhausted and its memory may be corrupted. The collector therefore never allocates, never
//! takes a lock and bounds every wait on the fault path. A second fault raised while the first
//! one is being captured is routed through a degraded path that records the nesting and chains
//! immediately.

#[cfg(all(unix, feature = "collector"))]
mod collector;
#[cfg(unix)]
mod crash_info;
#[cfg(all(unix, feature = "receiver"))]
mod receiver;
#[cfg(unix)]
mod shared;

#[cfg(all(unix, feature = "collector"))]
pub use collector::*;
#[cfg(unix)]
pub use crash_info::*;
#[cfg(all(unix, feature = "receiver"))]
pub use receiver::*;
#[cfg(unix)]
pub use shared::configuration::{
    BridgeConfiguration, HandlerStrategy, ManagedFaultPolicy, StacktraceCollection, WatcherConfig,
};
#[cfg(unix)]
pub use shared::constants;
#[cfg(unix)]
pub use shared::timeout::TimeoutManager;
