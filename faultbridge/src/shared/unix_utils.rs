// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::timeout::TimeoutManager;
use anyhow::Context;
use libc::{_exit, nfds_t, poll, pollfd, EXIT_FAILURE, POLLHUP};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::RawFd;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum ReapError {
    #[error("Timeout waiting for child process to exit")]
    Timeout,
    #[error("Error waiting for child process to exit: {0}")]
    WaitError(#[from] nix::Error),
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum PollError {
    #[error("Poll failed with errno: {0}")]
    PollError(i32),
    #[error("Poll returned unexpected result: revents = {0}")]
    UnexpectedResult(i16),
}

/// `io::Write` over a raw file descriptor, usable from a signal handler.
///
/// Writes go straight to `write(2)`: there is no buffering, no allocation and no locking. The
/// descriptor is borrowed, never closed.
#[derive(Debug, Clone, Copy)]
pub struct FdWriter {
    fd: RawFd,
}

impl FdWriter {
    pub const fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    pub const fn stderr() -> Self {
        Self::new(libc::STDERR_FILENO)
    }
}

impl io::Write for FdWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            // SAFETY: `buf` is a valid slice for the duration of the call.
            let rval = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
            if rval >= 0 {
                return Ok(rval as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Opens a file for writing (in append mode) or opens /dev/null
/// * If the filename is provided, it will try to open (creating if needed) the specified file.
///   Failure to do so is an error.
/// * If the filename is not provided, it will open /dev/null. Some systems can fail to provide
///   `/dev/null` (e.g., chroot jails), so this failure is also an error.
pub fn open_file_or_quiet(filename: Option<&str>) -> anyhow::Result<File> {
    filename.map_or_else(
        || {
            OpenOptions::new()
                .write(true)
                .open("/dev/null")
                .context("Failed to open /dev/null")
        },
        |f| {
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(f)
                .with_context(|| format!("Failed to open or create file: {f}"))
        },
    )
}

/// Non-blocking child reaper
/// * If the child process has exited, return true
/// * If the child process cannot be found, return false
/// * If the child is still alive when the budget runs out, or some other error occurs, return an
///   error. Either way, after this returns, you probably don't have to do anything else.
// `waitpid()` is characterized as async-signal safe by POSIX.
pub fn reap_child_non_blocking(
    pid: Pid,
    timeout_manager: &TimeoutManager,
) -> Result<bool, ReapError> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if timeout_manager.expired() {
                    return Err(ReapError::Timeout);
                }
                // SAFETY: No preconditions.
                unsafe { libc::sched_yield() };
            }
            Ok(_status) => return Ok(true),
            // Somebody else reaped it (or SIGCHLD is ignored); nothing left to do.
            Err(nix::Error::ECHILD) => return Ok(false),
            Err(e) => return Err(ReapError::WaitError(e)),
        }
    }
}

/// Kills the program without raising an abort or calling at_exit
pub fn terminate() -> ! {
    // Safety: No preconditions
    unsafe { _exit(EXIT_FAILURE) }
}

/// Waits for the peer of `target_fd` to hang up.
/// true if successful wait, false if timeout occurred.
pub fn wait_for_pollhup(
    target_fd: RawFd,
    timeout_manager: &TimeoutManager,
) -> Result<bool, PollError> {
    let mut poll_fds = [pollfd {
        fd: target_fd,
        events: POLLHUP,
        revents: 0,
    }];

    loop {
        let timeout_ms = timeout_manager.remaining_ms();
        // SAFETY: `poll_fds` outlives the call and its length is passed alongside it.
        let poll_result =
            unsafe { poll(poll_fds.as_mut_ptr(), poll_fds.len() as nfds_t, timeout_ms) };
        match poll_result {
            -1 => match nix::Error::last_raw() {
                libc::EAGAIN | libc::EINTR => continue,
                errno => return Err(PollError::PollError(errno)),
            },
            0 => return Ok(false),
            _ => {
                let revents = poll_fds[0].revents;
                if revents & POLLHUP != 0 {
                    return Ok(true);
                } else {
                    return Err(PollError::UnexpectedResult(revents));
                }
            }
        }
    }
}

/// Kernel id of the calling thread. Async-signal-safe.
pub fn current_tid() -> i64 {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        // SAFETY: No preconditions.
        unsafe { libc::syscall(libc::SYS_gettid) as i64 }
    }
    #[cfg(target_os = "macos")]
    {
        let mut tid: u64 = 0;
        // SAFETY: a null thread handle means the calling thread; `tid` is a valid out pointer.
        unsafe { libc::pthread_threadid_np(0, &mut tid) };
        tid as i64
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
    {
        // SAFETY: No preconditions.
        unsafe { libc::pthread_self() as i64 }
    }
}
