// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::crash_info::{
    signal_name, CrashReport, CrashReportBuilder, ErrorData, FaultCondition, FaultInfo, FaultKind,
    FaultOrigin, ProcInfo, RawFrame, ReportFrame, Timestamp,
};
use crate::shared::constants::*;
use anyhow::Context;
use num_traits::FromPrimitive;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, Lines};

/// The collector sends data in blocks.
/// This enum tracks which block we're currently in. Multi-line blocks (the stack trace) are
/// appended to the builder one line at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StdinState {
    Done,
    Fault,
    Message,
    Metadata,
    ProcInfo,
    Registers,
    StackTrace,
    Timestamp,
    Waiting,
}

// The fault block carries enums as their numeric codes, so the handler never has to format a
// name.
#[derive(Debug, Deserialize)]
struct WireFault {
    origin: u32,
    kind: u32,
    signum: i32,
    si_code: i32,
    fault_address: Option<usize>,
    is_nested: bool,
    incomplete: bool,
    condition: Option<u32>,
}

impl WireFault {
    fn into_fault_info(self) -> anyhow::Result<(FaultInfo, bool)> {
        let origin = FaultOrigin::from_u32(self.origin)
            .with_context(|| format!("Unknown fault origin {}", self.origin))?;
        let kind = FaultKind::from_u32(self.kind).unwrap_or(FaultKind::Unknown);
        let condition = self
            .condition
            .map(|c| FaultCondition::from_u32(c).with_context(|| format!("Unknown condition {c}")))
            .transpose()?;
        let info = FaultInfo {
            origin,
            kind,
            signum: self.signum,
            signame: signal_name(self.signum).to_string(),
            si_code: self.si_code,
            fault_address: self.fault_address.map(|a| format!("{a:#018x}")),
            is_nested: self.is_nested,
            condition,
        };
        Ok((info, self.incomplete))
    }
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    ip: usize,
    sp: usize,
    fp: usize,
}

impl From<WireFrame> for ReportFrame {
    fn from(frame: WireFrame) -> Self {
        RawFrame {
            ip: frame.ip,
            sp: frame.sp,
            bp: frame.fp,
        }
        .into()
    }
}

#[derive(Debug, Deserialize)]
struct WireTimestamp {
    secs: i64,
    nanos: i64,
}

/// A state machine that processes data from the collector line by line.
/// Once a block is read, its data is added to `builder`.
pub(crate) fn process_line(
    builder: &mut CrashReportBuilder,
    line: &str,
    state: StdinState,
) -> anyhow::Result<StdinState> {
    let next = match state {
        StdinState::Done => {
            tracing::warn!(line, "Unexpected line after the report is done");
            StdinState::Done
        }

        StdinState::Fault if line.starts_with(FAULTBRIDGE_END_FAULT) => StdinState::Waiting,
        StdinState::Fault => {
            let wire: WireFault = serde_json::from_str(line).context("Malformed fault block")?;
            let (fault, capture_incomplete) = wire.into_fault_info()?;
            builder.with_fault(fault, capture_incomplete)?;
            StdinState::Fault
        }

        StdinState::Message if line.starts_with(FAULTBRIDGE_END_MESSAGE) => StdinState::Waiting,
        StdinState::Message => {
            let error: ErrorData = serde_json::from_str(line).context("Malformed message block")?;
            builder.with_error(error)?;
            StdinState::Message
        }

        StdinState::Metadata if line.starts_with(FAULTBRIDGE_END_METADATA) => StdinState::Waiting,
        StdinState::Metadata => {
            let metadata = serde_json::from_str(line).context("Malformed metadata block")?;
            builder.with_metadata(metadata)?;
            StdinState::Metadata
        }

        StdinState::ProcInfo if line.starts_with(FAULTBRIDGE_END_PROCINFO) => StdinState::Waiting,
        StdinState::ProcInfo => {
            let proc_info: ProcInfo = serde_json::from_str(line).context("Malformed procinfo")?;
            builder.with_proc_info(proc_info)?;
            StdinState::ProcInfo
        }

        StdinState::Registers if line.starts_with(FAULTBRIDGE_END_REGISTERS) => {
            StdinState::Waiting
        }
        StdinState::Registers => {
            let frame: WireFrame = serde_json::from_str(line).context("Malformed registers")?;
            builder.with_registers(frame.into())?;
            StdinState::Registers
        }

        StdinState::StackTrace if line.starts_with(FAULTBRIDGE_END_STACKTRACE) => {
            StdinState::Waiting
        }
        StdinState::StackTrace => {
            let frame: WireFrame = serde_json::from_str(line).context(line.to_string())?;
            builder.with_frame(frame.into())?;
            StdinState::StackTrace
        }

        StdinState::Timestamp if line.starts_with(FAULTBRIDGE_END_TIMESTAMP) => {
            StdinState::Waiting
        }
        StdinState::Timestamp => {
            let ts: WireTimestamp = serde_json::from_str(line).context("Malformed timestamp")?;
            builder.with_timestamp(Timestamp {
                secs: ts.secs,
                nanos: ts.nanos,
            })?;
            StdinState::Timestamp
        }

        StdinState::Waiting if line.starts_with(FAULTBRIDGE_BEGIN_FAULT) => StdinState::Fault,
        StdinState::Waiting if line.starts_with(FAULTBRIDGE_BEGIN_MESSAGE) => StdinState::Message,
        StdinState::Waiting if line.starts_with(FAULTBRIDGE_BEGIN_METADATA) => {
            StdinState::Metadata
        }
        StdinState::Waiting if line.starts_with(FAULTBRIDGE_BEGIN_PROCINFO) => {
            StdinState::ProcInfo
        }
        StdinState::Waiting if line.starts_with(FAULTBRIDGE_BEGIN_REGISTERS) => {
            StdinState::Registers
        }
        StdinState::Waiting if line.starts_with(FAULTBRIDGE_BEGIN_STACKTRACE) => {
            StdinState::StackTrace
        }
        StdinState::Waiting if line.starts_with(FAULTBRIDGE_BEGIN_TIMESTAMP) => {
            StdinState::Timestamp
        }
        StdinState::Waiting if line.starts_with(FAULTBRIDGE_DONE) => {
            builder.with_complete()?;
            StdinState::Done
        }
        StdinState::Waiting => {
            tracing::warn!(line, "Unexpected line while receiving a report");
            StdinState::Waiting
        }
    };
    Ok(next)
}

#[derive(Debug)]
pub(crate) enum ReportStatus {
    /// The stream closed (or went quiet) before a report started.
    NoReport,
    Report(CrashReport),
    /// The stream stopped part way through a report. Nothing more can be read from it.
    PartialReport(CrashReport, StdinState),
}

/// Reads one report from `lines`, until
/// 1. The end-of-report marker is received, in which case the report is complete and more may
///    follow on the same stream.
/// 2. The stream closes, times out or turns out corrupted, in which case whatever was received
///    is returned marked incomplete.
///
/// The timeout only starts ticking once the first line of the report has arrived: a process can
/// keep the channel open for a long time between reports.
pub(crate) async fn receive_report_from_stream<R>(
    timeout: Duration,
    lines: &mut Lines<R>,
) -> anyhow::Result<ReportStatus>
where
    R: AsyncBufRead + Unpin,
{
    let mut builder = CrashReportBuilder::new();
    let mut stdin_state = StdinState::Waiting;
    let mut deadline: Option<Instant> = None;
    let mut remaining_timeout = Duration::MAX;
    let mut lines_seen = 0usize;

    loop {
        let next = match tokio::time::timeout(remaining_timeout, lines.next_line()).await {
            Err(elapsed) => {
                tracing::warn!(%elapsed, "Timed out receiving report");
                builder.with_log_message(format!("Timed out after {timeout:?}"))?;
                break;
            }
            Ok(Err(io_err)) => {
                tracing::warn!(%io_err, "IO error receiving report");
                builder.with_log_message(format!("IO error: {io_err}"))?;
                break;
            }
            Ok(Ok(None)) => break,
            Ok(Ok(Some(line))) => line,
        };
        lines_seen += 1;

        match process_line(&mut builder, &next, stdin_state) {
            Ok(next_state) => {
                stdin_state = next_state;
                if stdin_state == StdinState::Done {
                    break;
                }
            }
            Err(e) => {
                // If the input is corrupted, stop and salvage what we can
                tracing::warn!(error = %e, "Corrupted report stream");
                builder.with_log_message(format!("Corrupted input: {e:#}"))?;
                break;
            }
        }
        let deadline = *deadline.get_or_insert_with(|| Instant::now() + timeout);
        remaining_timeout = deadline.saturating_duration_since(Instant::now());
    }

    if lines_seen == 0 {
        return Ok(ReportStatus::NoReport);
    }
    if stdin_state == StdinState::Done {
        return Ok(ReportStatus::Report(builder.build()?));
    }
    if !builder.has_data() {
        return Ok(ReportStatus::NoReport);
    }
    builder.with_log_message(format!("Stream ended while in state {stdin_state:?}"))?;
    let report = builder
        .build()
        .context("Partial report is missing its fault section")?;
    Ok(ReportStatus::PartialReport(report, stdin_state))
}
