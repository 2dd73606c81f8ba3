// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::emitters::emit_report;
use crate::crash_info::CrashReportDescriptor;
use crate::shared::unix_utils::{open_file_or_quiet, FdWriter};
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};

/// Receives descriptors synchronously, from inside the signal handler.
///
/// Implementations must be async-signal-safe: no allocation, no locks, no `tracing`. Writing
/// with `write(2)` to a descriptor opened ahead of time is the expected shape. Errors cannot be
/// reported anywhere useful and are dropped.
pub trait ReportSink: Send + Sync {
    /// `metadata_str` is the serialised [`crate::Metadata`], when one was set.
    fn write_report(&self, report: &CrashReportDescriptor, metadata_str: Option<&str>);
}

/// Writes the delimited report stream to a file descriptor.
#[derive(Debug)]
pub struct FdSink {
    fd: RawFd,
    // Keeps an owned descriptor open for the lifetime of the sink.
    _file: Option<File>,
}

impl FdSink {
    pub fn stderr() -> Self {
        Self {
            fd: libc::STDERR_FILENO,
            _file: None,
        }
    }

    /// Opens (creating if needed) `path` in append mode.
    pub fn create(path: &str) -> anyhow::Result<Self> {
        let file = open_file_or_quiet(Some(path))?;
        Ok(Self {
            fd: file.as_raw_fd(),
            _file: Some(file),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl ReportSink for FdSink {
    fn write_report(&self, report: &CrashReportDescriptor, metadata_str: Option<&str>) {
        let _ = emit_report(&mut FdWriter::new(self.fd), report, metadata_str);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash_info::{FaultKind, FaultOrigin};
    use crate::shared::constants::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn file_sink_appends_reports() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports.txt");
        let sink = FdSink::create(path.to_str().unwrap()).unwrap();
        let d = CrashReportDescriptor::new(FaultOrigin::Native, FaultKind::Abort, libc::SIGABRT);
        sink.write_report(&d, None);
        sink.write_report(&d, Some("{}"));
        drop(sink);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.matches(FAULTBRIDGE_DONE).count(), 2);
        assert_eq!(contents.matches(FAULTBRIDGE_BEGIN_METADATA).count(), 1);
    }
}
