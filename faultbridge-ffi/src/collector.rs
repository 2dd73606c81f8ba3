// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::slice::Slice;
use crate::utils::{wrap_with_ffi_result, wrap_with_void_ffi_result};
use crate::{CharSlice, Result, VoidResult};
use ::function_name::named;
use anyhow::Context;
use faultbridge::{
    BridgeConfiguration, FaultBridge, FaultDecision, FdSink, HandlerStrategy, ManagedFault,
    ManagedFaultPolicy, Metadata, ReportSink, StacktraceCollection, WatcherConfig,
};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

// The C API has no handle: one bridge per process, owned here.
static BRIDGE: Mutex<Option<FaultBridge>> = Mutex::new(None);

fn bridge() -> anyhow::Result<MutexGuard<'static, Option<FaultBridge>>> {
    BRIDGE
        .lock()
        .map_err(|_| anyhow::anyhow!("bridge lock poisoned"))
}

#[repr(C)]
pub struct Config<'a> {
    pub strategy: HandlerStrategy,
    /// The signals to handle. Empty means the default set.
    pub signals: Slice<'a, i32>,
    pub create_alt_stack: bool,
    pub use_alt_stack: bool,
    pub resolve_frames: StacktraceCollection,
    pub managed_fault_policy: ManagedFaultPolicy,
    /// Bound on every wait done while handling a fault. 0 means the default.
    pub timeout_ms: u32,
    /// In-process strategy: file reports are appended to. Empty means stderr.
    pub report_path: CharSlice<'a>,
    /// Optional file written when a fault is captured.
    pub crash_marker_path: CharSlice<'a>,
    /// Out-of-process strategy: watcher binary to spawn. Takes precedence over `watcher_socket`.
    pub watcher_binary: CharSlice<'a>,
    /// Out-of-process strategy: socket of an already running watcher.
    pub watcher_socket: CharSlice<'a>,
    pub watcher_stderr_filename: CharSlice<'a>,
    pub watcher_stdout_filename: CharSlice<'a>,
}

impl<'a> Config<'a> {
    fn watcher(&self) -> anyhow::Result<Option<WatcherConfig>> {
        if let Some(binary) = self.watcher_binary.try_to_optional_string()? {
            return Ok(Some(WatcherConfig::spawn(
                binary,
                vec![],
                vec![],
                self.watcher_stderr_filename.try_to_optional_string()?,
                self.watcher_stdout_filename.try_to_optional_string()?,
            )?));
        }
        self.watcher_socket
            .try_to_optional_string()?
            .map(WatcherConfig::unix_socket)
            .transpose()
    }

    fn sink(&self) -> anyhow::Result<Box<dyn ReportSink>> {
        Ok(match self.report_path.try_to_optional_string()? {
            Some(path) => Box::new(FdSink::create(&path)?),
            None => Box::new(FdSink::stderr()),
        })
    }
}

impl<'a> TryFrom<&Config<'a>> for BridgeConfiguration {
    type Error = anyhow::Error;

    fn try_from(value: &Config<'a>) -> anyhow::Result<Self> {
        let timeout = (value.timeout_ms != 0)
            .then(|| Duration::from_millis(u64::from(value.timeout_ms)));
        let watcher = match value.strategy {
            HandlerStrategy::OutOfProcess => value.watcher()?,
            HandlerStrategy::InProcess => None,
        };
        let mut config = BridgeConfiguration::new(
            value.strategy,
            value.signals.as_slice().to_vec(),
            value.create_alt_stack,
            value.use_alt_stack,
            value.resolve_frames,
            value.managed_fault_policy,
            timeout,
            watcher,
        )?;
        config.set_crash_marker_path(value.crash_marker_path.try_to_optional_string()?);
        Ok(config.with_env_overrides())
    }
}

#[no_mangle]
#[must_use]
#[named]
/// Initialize the bridge: create the alternate stack, open the watcher channel (out-of-process)
/// and install the signal handlers.
///
/// # Preconditions
///   None.
/// # Safety
///   Bridge functions are not reentrant.
///   No other bridge functions should be called concurrently.
/// # Atomicity
///   Either everything is installed, or nothing is and an error is returned.
pub unsafe extern "C" fn fbr_init(config: Config) -> VoidResult {
    wrap_with_void_ffi_result!({
        let mut bridge = bridge()?;
        anyhow::ensure!(bridge.is_none(), "the bridge is already initialized");
        let sink = config.sink()?;
        let config = BridgeConfiguration::try_from(&config)?;
        *bridge = Some(FaultBridge::init_with_sink(config, sink)?);
    })
}

#[no_mangle]
#[must_use]
#[named]
/// Tears the bridge down: restores the previous signal handlers, closes the watcher channel and
/// releases the alternate stack.
///
/// # Preconditions
///   This function assumes that the bridge has previously been initialized.
/// # Safety
///   Bridge functions are not reentrant.
///   No other bridge functions should be called concurrently.
/// # Atomicity
///   This function is not atomic. A fault during its execution is still handled, but resources
///   it was using may be leaked.
pub unsafe extern "C" fn fbr_shutdown() -> VoidResult {
    wrap_with_void_ffi_result!({
        let bridge = bridge()?
            .take()
            .context("the bridge is not initialized")?;
        bridge.teardown()?;
    })
}

#[no_mangle]
#[must_use]
#[named]
/// Reports a fault detected by managed code, and returns whether the runtime should continue or
/// terminate. The native stack of the calling thread is recorded when `capture_native_stack` is
/// set.
///
/// # Safety
///   The slices must be valid.
/// # Atomicity
///   A managed fault raised while another fault is being handled is counted but not reported.
pub unsafe extern "C" fn fbr_report_managed_fault(
    error_type: CharSlice,
    message: CharSlice,
    capture_native_stack: bool,
) -> Result<FaultDecision> {
    wrap_with_ffi_result!({
        let fault = ManagedFault {
            error_type: error_type.try_to_utf8()?,
            message: message.try_to_utf8()?,
            capture_native_stack,
        };
        let bridge = bridge()?;
        let bridge = bridge.as_ref().context("the bridge is not initialized")?;
        anyhow::Ok(bridge.report_managed_fault(&fault))
    })
}

#[no_mangle]
#[must_use]
#[named]
/// Replaces the metadata attached to every report.
///
/// # Safety
///   The slices must be valid.
/// # Atomicity
///   This function uses an atomic swap, and can be called while a fault is being handled.
pub unsafe extern "C" fn fbr_update_metadata(
    library_name: CharSlice,
    library_version: CharSlice,
    family: CharSlice,
) -> VoidResult {
    wrap_with_void_ffi_result!({
        faultbridge::update_metadata(Metadata::new(
            library_name.try_to_utf8()?.to_string(),
            library_version.try_to_utf8()?.to_string(),
            family.try_to_utf8()?.to_string(),
            vec![],
        ))?;
    })
}

#[no_mangle]
#[must_use]
#[named]
/// Gives the calling thread an alternate stack of its own, so that a stack overflow on this
/// thread can be captured.
///
/// # Preconditions
///   The bridge is initialized.
/// # Safety
///   No safety concerns.
/// # Atomicity
///   Idempotent.
pub unsafe extern "C" fn fbr_alt_stack_install_current_thread() -> VoidResult {
    wrap_with_void_ffi_result!({
        let bridge = bridge()?;
        bridge
            .as_ref()
            .context("the bridge is not initialized")?
            .install_alt_stack_for_current_thread()?;
    })
}

#[no_mangle]
#[must_use]
#[named]
/// Disables and frees the calling thread's alternate stack. Call it before a thread that used
/// `fbr_alt_stack_install_current_thread` exits; a no-op for threads without one.
///
/// # Preconditions
///   The bridge is initialized.
/// # Safety
///   No safety concerns.
pub unsafe extern "C" fn fbr_alt_stack_uninstall_current_thread() -> VoidResult {
    wrap_with_void_ffi_result!({
        let bridge = bridge()?;
        bridge
            .as_ref()
            .context("the bridge is not initialized")?
            .uninstall_alt_stack_for_current_thread()?;
    })
}

#[no_mangle]
/// Resumes fault capture after `fbr_disable`.
///
/// # Safety
///   No safety concerns.
/// # Atomicity
///   This function is atomic and idempotent.
pub unsafe extern "C" fn fbr_enable() {
    faultbridge::enable()
}

#[no_mangle]
/// Turns fault capture into a no-op. Handlers stay installed and keep chaining to the previous
/// ones.
///
/// # Safety
///   No safety concerns.
/// # Atomicity
///   This function is atomic and idempotent.
pub unsafe extern "C" fn fbr_disable() {
    faultbridge::disable()
}
