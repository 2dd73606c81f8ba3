// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The pre-established channel to an out-of-process watcher.
//!
//! Everything that needs allocation (spawning the watcher, connecting a socket) happens when the
//! bridge is initialised. At fault time only `write(2)`, `shutdown(2)`, `poll(2)`, `kill(2)` and
//! `waitpid(2)` are used.

use super::emitters::{emit_report, EmitterError};
use super::saguard::SaGuard;
use crate::crash_info::CrashReportDescriptor;
use crate::shared::configuration::WatcherConfig;
use crate::shared::timeout::TimeoutManager;
use crate::shared::unix_utils::{
    open_file_or_quiet, reap_child_non_blocking, wait_for_pollhup, FdWriter,
};
use anyhow::Context;
use nix::sys::signal;
use nix::unistd::Pid;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::process::{Command, Stdio};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;

#[derive(Debug)]
pub(crate) struct WatcherChannel {
    stream: UnixStream,
    // Set when we spawned the watcher and are responsible for reaping it.
    child: Option<Pid>,
    finished: AtomicBool,
}

impl WatcherChannel {
    pub(crate) fn open(config: &WatcherConfig) -> anyhow::Result<Self> {
        match config {
            WatcherConfig::Spawn {
                path_to_watcher_binary,
                args,
                env,
                stderr_filename,
                stdout_filename,
            } => Self::spawn(
                path_to_watcher_binary,
                args,
                env,
                stderr_filename.as_deref(),
                stdout_filename.as_deref(),
            ),
            WatcherConfig::UnixSocket { path } => Self::connect(path),
        }
    }

    fn spawn(
        path_to_watcher_binary: &str,
        args: &[String],
        env: &[(String, String)],
        stderr_filename: Option<&str>,
        stdout_filename: Option<&str>,
    ) -> anyhow::Result<Self> {
        let stderr = open_file_or_quiet(stderr_filename)?;
        let stdout = open_file_or_quiet(stdout_filename)?;
        let (ours, theirs) =
            UnixStream::pair().context("Failed to create Unix domain socket pair")?;

        let child = Command::new(path_to_watcher_binary)
            .args(args)
            .env_clear()
            .envs(env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::from(OwnedFd::from(theirs)))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .with_context(|| format!("Failed to spawn watcher {path_to_watcher_binary}"))?;
        let pid = Pid::from_raw(child.id() as i32);
        tracing::debug!(%pid, path_to_watcher_binary, "Spawned watcher");
        Ok(Self {
            stream: ours,
            child: Some(pid),
            finished: AtomicBool::new(false),
        })
    }

    fn connect(path: &str) -> anyhow::Result<Self> {
        anyhow::ensure!(!path.is_empty(), "No watcher socket path provided");
        #[cfg(target_os = "linux")]
        let stream = if path.starts_with(['.', '/']) {
            UnixStream::connect(path)
        } else {
            use std::os::linux::net::SocketAddrExt;
            let addr = std::os::unix::net::SocketAddr::from_abstract_name(path)?;
            UnixStream::connect_addr(&addr)
        };
        #[cfg(not(target_os = "linux"))]
        let stream = UnixStream::connect(path);
        let stream = stream.with_context(|| format!("Failed to connect to watcher at {path}"))?;
        tracing::debug!(path, "Connected to watcher");
        Ok(Self {
            stream,
            child: None,
            finished: AtomicBool::new(false),
        })
    }

    /// Writes one report. Async-signal-safe.
    pub(crate) fn send(
        &self,
        descriptor: &CrashReportDescriptor,
        metadata_str: Option<&str>,
    ) -> Result<(), EmitterError> {
        if self.finished.load(SeqCst) {
            return Err(EmitterError::WriteError(std::io::ErrorKind::BrokenPipe.into()));
        }
        // A watcher that went away must not kill us with SIGPIPE halfway through.
        let _guard = SaGuard::<2>::new(&[signal::SIGCHLD, signal::SIGPIPE])
            .map_err(|e| EmitterError::WriteError(e.into()))?;
        emit_report(
            &mut FdWriter::new(self.stream.as_raw_fd()),
            descriptor,
            metadata_str,
        )
    }

    /// Closes our side and waits, within the budget, for the watcher to finish reading. A watcher
    /// we spawned is then killed and reaped. Async-signal-safe; only the first call does anything.
    pub(crate) fn finish(&self, timeout_manager: &TimeoutManager) {
        if self.finished.swap(true, SeqCst) {
            return;
        }
        let fd = self.stream.as_raw_fd();
        // SAFETY: `fd` is owned by `self.stream` and still open.
        unsafe { libc::shutdown(fd, libc::SHUT_WR) };
        let _ = wait_for_pollhup(fd, timeout_manager);

        if let Some(pid) = self.child {
            // The watcher is done, it timed out, or something failed. SIGKILL ensures it ends
            // eventually; reap it for whatever time is left.
            let _ = signal::kill(pid, signal::SIGKILL);
            let _ = reap_child_non_blocking(pid, timeout_manager);
        }
    }

    pub(crate) fn child(&self) -> Option<Pid> {
        self.child
    }
}
