// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::alt_stack::{current_alt_stack, AltStack};
use super::crash_handler::{publish_state, retract_state, update_metadata, BridgeState};
use super::error::BridgeError;
use super::managed::{report_managed_fault, FaultDecision, ManagedFault};
use super::signal_handler_manager::{HandlerRegistry, InstalledHandlerRecord};
use super::sinks::{FdSink, ReportSink};
use super::watcher_manager::WatcherChannel;
use crate::crash_info::Metadata;
use crate::shared::configuration::{BridgeConfiguration, HandlerStrategy, ManagedFaultPolicy};
use crate::shared::log;
use crate::shared::timeout::TimeoutManager;
use crate::shared::unix_utils::current_tid;
use std::collections::HashMap;
use std::ffi::CString;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

// One bridge per process: the handlers, the alternate stack and the published state are all
// process-wide.
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// The installed bridge. Dropping it tears everything down, as [`FaultBridge::teardown`] does,
/// but ignoring errors.
#[derive(Debug)]
pub struct FaultBridge {
    // Alternate stacks created by the bridge, keyed by the thread each one is installed on.
    alt_stacks: Mutex<HashMap<i64, AltStack>>,
    alt_stack_size: usize,
    policy: ManagedFaultPolicy,
    strategy: HandlerStrategy,
    timeout: Duration,
    torn_down: bool,
}

impl FaultBridge {
    /// Installs the bridge, writing in-process reports to stderr.
    pub fn init(config: BridgeConfiguration) -> Result<Self, BridgeError> {
        Self::init_with_sink(config, Box::new(FdSink::stderr()))
    }

    /// Installs the bridge.
    ///
    /// PRECONDITIONS:
    ///     No other `FaultBridge` is alive in this process.
    /// SAFETY:
    ///     Everything the signal handler will need (alternate stack, watcher channel, marker path)
    ///     is prepared here, before the handlers go live.
    /// ATOMICITY:
    ///     Either everything is installed, or nothing is and an error is returned.
    pub fn init_with_sink(
        config: BridgeConfiguration,
        sink: Box<dyn ReportSink>,
    ) -> Result<Self, BridgeError> {
        if INITIALIZED
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_err()
        {
            return Err(BridgeError::AlreadyInitialized);
        }
        match Self::install(config, sink) {
            Ok(bridge) => Ok(bridge),
            Err(e) => {
                INITIALIZED.store(false, SeqCst);
                Err(e)
            }
        }
    }

    fn install(
        config: BridgeConfiguration,
        sink: Box<dyn ReportSink>,
    ) -> Result<Self, BridgeError> {
        log::set_debug(config.debug());

        let mut alt_stacks = HashMap::new();
        if config.create_alt_stack() {
            match AltStack::new(config.alt_stack_size()).and_then(|s| s.install().map(|()| s)) {
                Ok(stack) => {
                    alt_stacks.insert(current_tid(), stack);
                }
                Err(e) if config.require_alt_stack() => return Err(e),
                Err(e) => tracing::warn!(error = %e, "Continuing without an alternate stack"),
            }
        }
        if config.use_alt_stack() && alt_stacks.is_empty() && current_alt_stack().is_none() {
            tracing::warn!(
                "Handlers use the alternate stack, but this thread has none: \
                 a stack overflow will not be captured"
            );
        }

        let watcher = match (config.strategy(), config.watcher()) {
            (HandlerStrategy::OutOfProcess, Some(watcher_config)) => {
                match WatcherChannel::open(watcher_config) {
                    Ok(watcher) => Some(watcher),
                    Err(e) => {
                        log_release_failure(release_alt_stacks(alt_stacks));
                        return Err(BridgeError::Watcher(e));
                    }
                }
            }
            _ => None,
        };

        let crash_marker = match config.crash_marker_path().map(CString::new).transpose() {
            Ok(marker) => marker,
            Err(e) => {
                finish_watcher(watcher.as_ref(), config.timeout());
                log_release_failure(release_alt_stacks(alt_stacks));
                return Err(BridgeError::setup("invalid crash marker path", e));
            }
        };

        let has_alt_stack = !alt_stacks.is_empty();
        let mut bridge = Self {
            alt_stacks: Mutex::new(alt_stacks),
            alt_stack_size: config.alt_stack_size(),
            policy: config.managed_fault_policy(),
            strategy: config.strategy(),
            timeout: config.timeout(),
            torn_down: false,
        };
        let signals = config.signals().to_vec();
        let use_alt_stack = config.use_alt_stack();
        if let Err(e) = publish_state(BridgeState {
            config,
            sink,
            watcher,
            crash_marker,
        }) {
            // The published state is not ours, so there is nothing to retract.
            bridge.torn_down = true;
            log_release_failure(bridge.take_alt_stacks().and_then(release_alt_stacks));
            return Err(e);
        }

        // From here on `bridge` owns everything, and dropping it undoes the install.
        let records = HandlerRegistry::install(bridge.strategy, &signals, use_alt_stack)?;
        tracing::info!(
            strategy = ?bridge.strategy,
            signals = records.len(),
            alt_stack = has_alt_stack,
            "Fault bridge installed"
        );
        Ok(bridge)
    }

    /// Runs a fault detected by managed code through the bridge, and tells the runtime whether
    /// to keep going.
    ///
    /// Never fails: if the fault cannot be reported, the configured policy is still returned.
    pub fn report_managed_fault(&self, fault: &ManagedFault) -> FaultDecision {
        match report_managed_fault(fault) {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(error = %e, "Managed fault could not be reported");
                self.policy.into()
            }
        }
    }

    /// Replaces the metadata attached to every report.
    pub fn update_metadata(&self, metadata: Metadata) -> anyhow::Result<()> {
        update_metadata(metadata)
    }

    /// Gives the calling thread an alternate stack of its own, of the configured size. Threads
    /// other than the one that initialised the bridge need this to capture their own stack
    /// overflows.
    ///
    /// Idempotent. Stacks are never shared between threads.
    pub fn install_alt_stack_for_current_thread(&self) -> Result<(), BridgeError> {
        let tid = current_tid();
        let mut stacks = self.alt_stacks()?;
        if let Some(stack) = stacks.get(&tid) {
            // Also covers a thread id reused after its previous thread exited.
            return stack.install();
        }
        let stack = AltStack::new(self.alt_stack_size)?;
        stack.install()?;
        tracing::debug!(tid, size = stack.size(), "Installed alternate stack for thread");
        stacks.insert(tid, stack);
        Ok(())
    }

    /// Disables and releases the alternate stack the bridge gave the calling thread. Threads
    /// should call this before exiting. A no-op if the thread has none.
    pub fn uninstall_alt_stack_for_current_thread(&self) -> Result<(), BridgeError> {
        let stack = self.alt_stacks()?.remove(&current_tid());
        stack.map_or(Ok(()), AltStack::uninstall)
    }

    /// Whether the calling thread is running with an alternate stack created by the bridge.
    pub fn current_thread_has_alt_stack(&self) -> bool {
        self.alt_stacks()
            .is_ok_and(|stacks| stacks.get(&current_tid()).is_some_and(AltStack::is_current))
    }

    fn alt_stacks(&self) -> Result<MutexGuard<'_, HashMap<i64, AltStack>>, BridgeError> {
        self.alt_stacks
            .lock()
            .map_err(|_| BridgeError::SetupFailed("alternate stack table poisoned".to_string()))
    }

    fn take_alt_stacks(&self) -> Result<HashMap<i64, AltStack>, BridgeError> {
        Ok(std::mem::take(&mut *self.alt_stacks()?))
    }

    pub fn strategy(&self) -> HandlerStrategy {
        self.strategy
    }

    pub fn records(&self) -> Vec<InstalledHandlerRecord> {
        HandlerRegistry::records()
    }

    /// Restores the previous handlers, closes the watcher channel and releases the alternate
    /// stacks.
    ///
    /// Resources a fault handler might still be using are leaked rather than freed, and
    /// [`BridgeError::HandlerActive`] is returned. Stacks still installed on other threads are
    /// leaked too, as only their own thread can disable them.
    pub fn teardown(mut self) -> Result<(), BridgeError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), BridgeError> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        let handlers = HandlerRegistry::uninstall();
        if let Some(state) = retract_state(self.timeout) {
            finish_watcher(state.watcher.as_ref(), self.timeout);
        }
        let alt_stack = self.take_alt_stacks().and_then(release_alt_stacks);
        INITIALIZED.store(false, SeqCst);
        tracing::info!("Fault bridge torn down");
        handlers.and(alt_stack)
    }
}

impl Drop for FaultBridge {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "Fault bridge teardown failed");
        }
    }
}

fn finish_watcher(watcher: Option<&WatcherChannel>, timeout: Duration) {
    if let Some(watcher) = watcher {
        watcher.finish(&TimeoutManager::new(timeout));
    }
}

fn release_alt_stacks(stacks: HashMap<i64, AltStack>) -> Result<(), BridgeError> {
    stacks
        .into_values()
        .map(AltStack::uninstall)
        .fold(Ok(()), |acc, released| acc.and(released))
}

fn log_release_failure(released: Result<(), BridgeError>) {
    if let Err(e) = released {
        tracing::warn!(error = %e, "Failed to release the alternate stacks");
    }
}
