// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A file whose existence records that the previous run captured a fault.
//!
//! The marker is written from the signal handler, so the path is converted to a `CString` when
//! the bridge is initialised and only `open(2)`, `write(2)` and `close(2)` are used at fault time.

use crate::crash_info::Timestamp;
use crate::shared::unix_utils::FdWriter;
use anyhow::Context;
use std::ffi::CString;
use std::io::Write;
use std::path::Path;

/// Writes the fault time into the marker file. Async-signal-safe. Failures are ignored.
pub(crate) fn write_crash_marker(path: &CString, timestamp: Timestamp) {
    // SAFETY: `path` is a valid NUL terminated string.
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
            0o644 as libc::c_uint,
        )
    };
    if fd < 0 {
        return;
    }
    let _ = writeln!(FdWriter::new(fd), "{}.{:09}", timestamp.secs, timestamp.nanos);
    // SAFETY: `fd` was opened above.
    unsafe { libc::close(fd) };
}

/// Whether a marker was left by a previous run.
pub fn crashed_last_run(path: impl AsRef<Path>) -> bool {
    path.as_ref().exists()
}

/// Removes the marker. A missing marker is not an error.
pub fn clear_crash_marker(path: impl AsRef<Path>) -> anyhow::Result<()> {
    let path = path.as_ref();
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            Err(e).with_context(|| format!("Failed to remove crash marker {}", path.display()))
        }
        _ => Ok(()),
    }
}
