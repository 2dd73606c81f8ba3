// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::descriptor::{CrashReportDescriptor, FaultOrigin, RawFrame, Timestamp};
use super::fault_kind::{signal_name, FaultCondition, FaultKind};
use super::metadata::Metadata;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultInfo {
    pub origin: FaultOrigin,
    pub kind: FaultKind,
    pub signum: i32,
    pub signame: String,
    pub si_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_address: Option<String>,
    pub is_nested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<FaultCondition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcInfo {
    pub pid: i32,
    pub tid: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub error_type: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFrame {
    pub ip: String,
    pub sp: String,
    pub fp: String,
}

impl From<RawFrame> for ReportFrame {
    fn from(frame: RawFrame) -> Self {
        Self {
            ip: hex(frame.ip),
            sp: hex(frame.sp),
            fp: hex(frame.bp),
        }
    }
}

fn hex(v: usize) -> String {
    format!("{v:#018x}")
}

/// Owned, serialisable form of a fault report, as written by the watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashReport {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// The stream was cut short, or capture itself was partial.
    pub incomplete: bool,
    pub fault: FaultInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proc_info: Option<ProcInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registers: Option<ReportFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<ReportFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_messages: Vec<String>,
}

impl CrashReport {
    /// Converts a descriptor directly. Allocates: never call this from a signal handler.
    pub fn from_descriptor(
        descriptor: &CrashReportDescriptor,
        metadata: Option<Metadata>,
    ) -> anyhow::Result<Self> {
        let mut builder = CrashReportBuilder::new();
        builder.with_fault(FaultInfo::from(descriptor), descriptor.incomplete)?;
        builder.with_proc_info(ProcInfo {
            pid: descriptor.pid,
            tid: descriptor.tid,
        })?;
        builder.with_timestamp(descriptor.timestamp)?;
        if let Some(registers) = descriptor.registers {
            builder.with_registers(registers.into())?;
        }
        if descriptor.origin == FaultOrigin::Managed {
            builder.with_error(ErrorData {
                error_type: descriptor.error_type.as_str().to_string(),
                message: descriptor.message.as_str().to_string(),
            })?;
        }
        for frame in descriptor.frames() {
            builder.with_frame((*frame).into())?;
        }
        if let Some(metadata) = metadata {
            builder.with_metadata(metadata)?;
        }
        builder.with_complete()?;
        builder.build()
    }
}

impl From<&CrashReportDescriptor> for FaultInfo {
    fn from(d: &CrashReportDescriptor) -> Self {
        Self {
            origin: d.origin,
            kind: d.kind,
            signum: d.signum,
            signame: signal_name(d.signum).to_string(),
            si_code: d.si_code,
            fault_address: d.fault_address.map(hex),
            is_nested: d.is_nested,
            condition: d.condition,
        }
    }
}

/// Accumulates the sections of a report as they arrive.
#[derive(Debug)]
pub struct CrashReportBuilder {
    pub uuid: Uuid,
    capture_incomplete: bool,
    error: Option<ErrorData>,
    fault: Option<FaultInfo>,
    log_messages: Vec<String>,
    metadata: Option<Metadata>,
    proc_info: Option<ProcInfo>,
    registers: Option<ReportFrame>,
    stack: Vec<ReportFrame>,
    stream_complete: bool,
    timestamp: Option<DateTime<Utc>>,
}

impl Default for CrashReportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashReportBuilder {
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            capture_incomplete: false,
            error: None,
            fault: None,
            log_messages: vec![],
            metadata: None,
            proc_info: None,
            registers: None,
            stack: vec![],
            stream_complete: false,
            timestamp: None,
        }
    }

    pub fn with_fault(&mut self, fault: FaultInfo, capture_incomplete: bool) -> anyhow::Result<()> {
        anyhow::ensure!(self.fault.is_none(), "Fault section received twice");
        self.fault = Some(fault);
        self.capture_incomplete = capture_incomplete;
        Ok(())
    }

    pub fn with_error(&mut self, error: ErrorData) -> anyhow::Result<()> {
        self.error = Some(error);
        Ok(())
    }

    pub fn with_frame(&mut self, frame: ReportFrame) -> anyhow::Result<()> {
        self.stack.push(frame);
        Ok(())
    }

    pub fn with_log_message(&mut self, message: String) -> anyhow::Result<()> {
        self.log_messages.push(message);
        Ok(())
    }

    pub fn with_metadata(&mut self, metadata: Metadata) -> anyhow::Result<()> {
        self.metadata = Some(metadata);
        Ok(())
    }

    pub fn with_proc_info(&mut self, proc_info: ProcInfo) -> anyhow::Result<()> {
        self.proc_info = Some(proc_info);
        Ok(())
    }

    pub fn with_registers(&mut self, registers: ReportFrame) -> anyhow::Result<()> {
        self.registers = Some(registers);
        Ok(())
    }

    pub fn with_timestamp(&mut self, ts: Timestamp) -> anyhow::Result<()> {
        let nanos = u32::try_from(ts.nanos).context("nanoseconds out of range")?;
        self.timestamp =
            Some(DateTime::from_timestamp(ts.secs, nanos).context("timestamp out of range")?);
        Ok(())
    }

    /// Called once the end-of-report marker has been seen.
    pub fn with_complete(&mut self) -> anyhow::Result<()> {
        self.stream_complete = true;
        Ok(())
    }

    pub fn has_data(&self) -> bool {
        self.fault.is_some()
            || self.metadata.is_some()
            || self.proc_info.is_some()
            || !self.stack.is_empty()
    }

    pub fn build(self) -> anyhow::Result<CrashReport> {
        let fault = self.fault.context("Report is missing its fault section")?;
        Ok(CrashReport {
            uuid: self.uuid.to_string(),
            timestamp: self.timestamp.map(|t| t.to_rfc3339()),
            incomplete: !self.stream_complete || self.capture_incomplete,
            fault,
            proc_info: self.proc_info,
            registers: self.registers,
            error: self.error,
            stack: self.stack,
            metadata: self.metadata,
            log_messages: self.log_messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segv_descriptor() -> CrashReportDescriptor {
        let mut d = CrashReportDescriptor::new(
            FaultOrigin::Native,
            FaultKind::SegmentationViolation,
            libc::SIGSEGV,
        );
        d.fault_address = Some(0);
        d.pid = 42;
        d.tid = 43;
        d.timestamp = Timestamp {
            secs: 1_700_000_000,
            nanos: 5,
        };
        d.push_frame(RawFrame {
            ip: 0x1234,
            sp: 0x10,
            bp: 0x20,
        });
        d
    }

    #[test]
    fn descriptor_converts_to_report() -> anyhow::Result<()> {
        let report = CrashReport::from_descriptor(&segv_descriptor(), None)?;
        assert!(!report.incomplete);
        assert_eq!(report.fault.signame, "SIGSEGV");
        assert_eq!(
            report.fault.fault_address.as_deref(),
            Some("0x0000000000000000")
        );
        assert_eq!(report.proc_info, Some(ProcInfo { pid: 42, tid: 43 }));
        assert_eq!(report.stack.len(), 1);
        assert_eq!(report.stack[0].ip, "0x0000000000001234");
        assert!(report.error.is_none());
        assert_eq!(
            report.timestamp.as_deref(),
            Some("2023-11-14T22:13:20.000000005+00:00")
        );
        Ok(())
    }

    #[test]
    fn managed_descriptor_carries_error() -> anyhow::Result<()> {
        let mut d =
            CrashReportDescriptor::new(FaultOrigin::Managed, FaultKind::ManagedException, 0);
        d.error_type.set("NullPointerException");
        d.message.set("boom");
        let report = CrashReport::from_descriptor(&d, Some(Metadata::default()))?;
        assert_eq!(
            report.error,
            Some(ErrorData {
                error_type: "NullPointerException".to_string(),
                message: "boom".to_string()
            })
        );
        assert_eq!(report.fault.signame, "NONE");
        assert!(report.metadata.is_some());
        Ok(())
    }

    #[test]
    fn builder_without_fault_fails() {
        let mut builder = CrashReportBuilder::new();
        assert!(!builder.has_data());
        builder.with_proc_info(ProcInfo { pid: 1, tid: 1 }).unwrap();
        assert!(builder.has_data());
        assert!(builder.build().is_err());
    }

    #[test]
    fn unfinished_stream_is_incomplete() -> anyhow::Result<()> {
        let mut builder = CrashReportBuilder::new();
        builder.with_fault(FaultInfo::from(&segv_descriptor()), false)?;
        assert!(builder
            .with_fault(FaultInfo::from(&segv_descriptor()), false)
            .is_err());
        let report = builder.build()?;
        assert!(report.incomplete);
        Ok(())
    }
}
