// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use crate::crash_info::{default_signals, signal_from_signum};
use crate::shared::constants::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the signal handler does with a captured descriptor.
/// Fixed for as long as the handlers are installed.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerStrategy {
    /// Hand the descriptor to the configured `ReportSink` from inside the handler.
    InProcess,
    /// Write the descriptor to a watcher process over a channel opened at install time.
    OutOfProcess,
}

/// What a managed runtime is told to do after reporting one of its own faults.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagedFaultPolicy {
    Continue,
    Terminate,
}

/// Stacktrace collection occurs in the context of a crashing process.
/// If the stack is sufficiently corrupted, it is possible (but unlikely),
/// for stack trace collection itself to crash. That case is caught as a nested fault.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StacktraceCollection {
    Disabled,
    /// Follow saved frame pointers from the faulting register state. Needs code built with
    /// frame pointers, but never calls into an unwinder.
    FramePointers,
    /// `backtrace::trace_unsynchronized()`, skipping frames until the faulting instruction.
    Unwinder,
}

/// Where an out-of-process report goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatcherConfig {
    /// Spawn a watcher at install time and talk to it over its stdin.
    /// `args` does not include the program name.
    Spawn {
        path_to_watcher_binary: String,
        args: Vec<String>,
        env: Vec<(String, String)>,
        stderr_filename: Option<String>,
        stdout_filename: Option<String>,
    },
    /// Connect at install time to an already running watcher.
    /// On Linux, a path that does not start with `.` or `/` names an abstract socket.
    UnixSocket { path: String },
}

impl WatcherConfig {
    pub fn spawn(
        path_to_watcher_binary: String,
        args: Vec<String>,
        env: Vec<(String, String)>,
        stderr_filename: Option<String>,
        stdout_filename: Option<String>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !path_to_watcher_binary.is_empty(),
            "No watcher binary provided"
        );
        anyhow::ensure!(
            stderr_filename.is_none() && stdout_filename.is_none()
                || stderr_filename != stdout_filename,
            "Can't give the same filename for stderr ({stderr_filename:?}) \
             and stdout ({stdout_filename:?}), they will conflict with each other"
        );
        Ok(Self::Spawn {
            path_to_watcher_binary,
            args,
            env,
            stderr_filename,
            stdout_filename,
        })
    }

    pub fn unix_socket(path: String) -> anyhow::Result<Self> {
        anyhow::ensure!(!path.is_empty(), "No watcher socket path provided");
        Ok(Self::UnixSocket { path })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfiguration {
    alt_stack_size: usize,
    create_alt_stack: bool,
    // Path of a marker file written when a fault is captured, if any
    crash_marker_path: Option<String>,
    debug: bool,
    managed_fault_policy: ManagedFaultPolicy,
    require_alt_stack: bool,
    resolve_frames: StacktraceCollection,
    signals: Vec<i32>,
    strategy: HandlerStrategy,
    timeout: Duration,
    use_alt_stack: bool,
    watcher: Option<WatcherConfig>,
}

impl BridgeConfiguration {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        strategy: HandlerStrategy,
        mut signals: Vec<i32>,
        create_alt_stack: bool,
        use_alt_stack: bool,
        resolve_frames: StacktraceCollection,
        managed_fault_policy: ManagedFaultPolicy,
        timeout: Option<Duration>,
        watcher: Option<WatcherConfig>,
    ) -> anyhow::Result<Self> {
        // Requesting to create, but not use, the altstack is considered paradoxical.
        anyhow::ensure!(
            !create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        match strategy {
            HandlerStrategy::InProcess => anyhow::ensure!(
                watcher.is_none(),
                "A watcher was configured for the in-process strategy"
            ),
            HandlerStrategy::OutOfProcess => anyhow::ensure!(
                watcher.is_some(),
                "The out-of-process strategy needs a watcher"
            ),
        }
        if signals.is_empty() {
            signals = default_signals();
        } else {
            let before_len = signals.len();
            signals.sort();
            signals.dedup();
            anyhow::ensure!(
                before_len == signals.len(),
                "Signals contained duplicate elements"
            );
            signals
                .iter()
                .try_for_each(|x| signal_from_signum(*x).map(|_| ()))?;
        }

        Ok(Self {
            alt_stack_size: FAULTBRIDGE_DEFAULT_ALT_STACK_SIZE,
            create_alt_stack,
            crash_marker_path: None,
            debug: false,
            managed_fault_policy,
            require_alt_stack: false,
            resolve_frames,
            signals,
            strategy,
            timeout: timeout.unwrap_or(FAULTBRIDGE_DEFAULT_TIMEOUT),
            use_alt_stack,
            watcher,
        })
    }

    /// In-process capture of the default signal set on a freshly created alternate stack.
    pub fn in_process() -> Self {
        Self {
            alt_stack_size: FAULTBRIDGE_DEFAULT_ALT_STACK_SIZE,
            create_alt_stack: true,
            crash_marker_path: None,
            debug: false,
            managed_fault_policy: ManagedFaultPolicy::Continue,
            require_alt_stack: false,
            resolve_frames: StacktraceCollection::FramePointers,
            signals: default_signals(),
            strategy: HandlerStrategy::InProcess,
            timeout: FAULTBRIDGE_DEFAULT_TIMEOUT,
            use_alt_stack: true,
            watcher: None,
        }
    }

    /// Applies the `FAULTBRIDGE_*` environment overrides. Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok());
        self
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        match lookup(FAULTBRIDGE_CREATE_ALT_STACK_ENV).as_deref() {
            Some("1") | Some("true") => {
                self.create_alt_stack = true;
                self.use_alt_stack = true;
            }
            Some("0") | Some("false") => self.create_alt_stack = false,
            _ => {}
        }
        match lookup(FAULTBRIDGE_DEBUG_ENV).as_deref() {
            Some("1") | Some("true") => self.debug = true,
            Some("0") | Some("false") => self.debug = false,
            _ => {}
        }
        if let Some(ms) = lookup(FAULTBRIDGE_TIMEOUT_MS_ENV).and_then(|s| s.parse().ok()) {
            self.timeout = Duration::from_millis(ms);
        }
    }

    pub fn alt_stack_size(&self) -> usize {
        self.alt_stack_size
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn crash_marker_path(&self) -> Option<&str> {
        self.crash_marker_path.as_deref()
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn managed_fault_policy(&self) -> ManagedFaultPolicy {
        self.managed_fault_policy
    }

    pub fn require_alt_stack(&self) -> bool {
        self.require_alt_stack
    }

    pub fn resolve_frames(&self) -> StacktraceCollection {
        self.resolve_frames
    }

    pub fn signals(&self) -> &[i32] {
        &self.signals
    }

    pub fn strategy(&self) -> HandlerStrategy {
        self.strategy
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }

    pub fn watcher(&self) -> Option<&WatcherConfig> {
        self.watcher.as_ref()
    }

    pub fn set_alt_stack_size(&mut self, size: usize) {
        self.alt_stack_size = size;
    }

    pub fn set_create_alt_stack(&mut self, create_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !create_alt_stack || self.use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.create_alt_stack = create_alt_stack;
        Ok(())
    }

    pub fn set_use_alt_stack(&mut self, use_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.use_alt_stack = use_alt_stack;
        Ok(())
    }

    pub fn set_crash_marker_path(&mut self, path: Option<String>) {
        self.crash_marker_path = path;
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn set_managed_fault_policy(&mut self, policy: ManagedFaultPolicy) {
        self.managed_fault_policy = policy;
    }

    /// When set, failing to set up the alternate stack aborts initialization instead of
    /// continuing without stack overflow protection.
    pub fn set_require_alt_stack(&mut self, require: bool) {
        self.require_alt_stack = require;
    }

    pub fn set_resolve_frames(&mut self, resolve_frames: StacktraceCollection) {
        self.resolve_frames = resolve_frames;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}
