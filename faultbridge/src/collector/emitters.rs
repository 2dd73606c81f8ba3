// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::crash_info::{CrashReportDescriptor, FaultOrigin, RawFrame};
use crate::shared::constants::*;
use std::io::Write;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("Failed to write to output: {0}")]
    WriteError(#[from] std::io::Error),
}

/// Writes a descriptor as the delimited report stream read by the receiver.
///
/// SIGNAL SAFETY:
///     Only `write!` into the given handle, with integers and borrowed strings as arguments.
///     `core::fmt` does not allocate for these. Each section is flushed as soon as it is complete,
///     so a fault half way through still leaves the earlier sections readable.
pub(crate) fn emit_report(
    w: &mut impl Write,
    descriptor: &CrashReportDescriptor,
    metadata_str: Option<&str>,
) -> Result<(), EmitterError> {
    if let Some(metadata_str) = metadata_str {
        emit_metadata(w, metadata_str)?;
    }
    emit_fault(w, descriptor)?;
    emit_procinfo(w, descriptor)?;
    emit_timestamp(w, descriptor)?;
    if let Some(registers) = descriptor.registers {
        emit_registers(w, &registers)?;
    }
    if descriptor.origin == FaultOrigin::Managed {
        emit_message(w, descriptor)?;
    }
    // Do this last, so even if it crashes, we still get the other info.
    if !descriptor.frames().is_empty() {
        emit_stacktrace(w, descriptor.frames())?;
    }
    writeln!(w, "{FAULTBRIDGE_DONE}")?;
    w.flush()?;
    Ok(())
}

fn emit_metadata(w: &mut impl Write, metadata_str: &str) -> Result<(), EmitterError> {
    writeln!(w, "{FAULTBRIDGE_BEGIN_METADATA}")?;
    writeln!(w, "{metadata_str}")?;
    writeln!(w, "{FAULTBRIDGE_END_METADATA}")?;
    w.flush()?;
    Ok(())
}

fn emit_fault(w: &mut impl Write, d: &CrashReportDescriptor) -> Result<(), EmitterError> {
    writeln!(w, "{FAULTBRIDGE_BEGIN_FAULT}")?;
    write!(w, "{{")?;
    write!(w, "\"origin\": {}", d.origin as i32)?;
    write!(w, ", \"kind\": {}", d.kind as i32)?;
    write!(w, ", \"signum\": {}", d.signum)?;
    write!(w, ", \"si_code\": {}", d.si_code)?;
    match d.fault_address {
        Some(addr) => write!(w, ", \"fault_address\": {addr}")?,
        None => write!(w, ", \"fault_address\": null")?,
    }
    write!(w, ", \"is_nested\": {}", d.is_nested)?;
    write!(w, ", \"incomplete\": {}", d.incomplete)?;
    match d.condition {
        Some(condition) => write!(w, ", \"condition\": {}", condition as i32)?,
        None => write!(w, ", \"condition\": null")?,
    }
    writeln!(w, "}}")?;
    writeln!(w, "{FAULTBRIDGE_END_FAULT}")?;
    w.flush()?;
    Ok(())
}

fn emit_procinfo(w: &mut impl Write, d: &CrashReportDescriptor) -> Result<(), EmitterError> {
    writeln!(w, "{FAULTBRIDGE_BEGIN_PROCINFO}")?;
    writeln!(w, "{{\"pid\": {}, \"tid\": {}}}", d.pid, d.tid)?;
    writeln!(w, "{FAULTBRIDGE_END_PROCINFO}")?;
    w.flush()?;
    Ok(())
}

fn emit_timestamp(w: &mut impl Write, d: &CrashReportDescriptor) -> Result<(), EmitterError> {
    writeln!(w, "{FAULTBRIDGE_BEGIN_TIMESTAMP}")?;
    writeln!(
        w,
        "{{\"secs\": {}, \"nanos\": {}}}",
        d.timestamp.secs, d.timestamp.nanos
    )?;
    writeln!(w, "{FAULTBRIDGE_END_TIMESTAMP}")?;
    w.flush()?;
    Ok(())
}

fn emit_frame(w: &mut impl Write, frame: &RawFrame) -> Result<(), EmitterError> {
    writeln!(
        w,
        "{{\"ip\": {}, \"sp\": {}, \"fp\": {}}}",
        frame.ip, frame.sp, frame.bp
    )?;
    Ok(())
}

fn emit_registers(w: &mut impl Write, registers: &RawFrame) -> Result<(), EmitterError> {
    writeln!(w, "{FAULTBRIDGE_BEGIN_REGISTERS}")?;
    emit_frame(w, registers)?;
    writeln!(w, "{FAULTBRIDGE_END_REGISTERS}")?;
    w.flush()?;
    Ok(())
}

fn emit_message(w: &mut impl Write, d: &CrashReportDescriptor) -> Result<(), EmitterError> {
    writeln!(w, "{FAULTBRIDGE_BEGIN_MESSAGE}")?;
    write!(w, "{{\"error_type\": ")?;
    write_json_str(w, d.error_type.as_str())?;
    write!(w, ", \"message\": ")?;
    write_json_str(w, d.message.as_str())?;
    writeln!(w, "}}")?;
    writeln!(w, "{FAULTBRIDGE_END_MESSAGE}")?;
    w.flush()?;
    Ok(())
}

fn emit_stacktrace(w: &mut impl Write, frames: &[RawFrame]) -> Result<(), EmitterError> {
    writeln!(w, "{FAULTBRIDGE_BEGIN_STACKTRACE}")?;
    for frame in frames {
        emit_frame(w, frame)?;
        // Flush eagerly to ensure that each frame gets emitted even if the next one fails
        w.flush()?;
    }
    writeln!(w, "{FAULTBRIDGE_END_STACKTRACE}")?;
    w.flush()?;
    Ok(())
}

/// Writes `s` as a JSON string literal without allocating.
fn write_json_str(w: &mut impl Write, s: &str) -> Result<(), EmitterError> {
    w.write_all(b"\"")?;
    let bytes = s.as_bytes();
    let mut start = 0;
    for (i, &b) in bytes.iter().enumerate() {
        let escape: Option<&[u8]> = match b {
            b'"' => Some(b"\\\""),
            b'\\' => Some(b"\\\\"),
            b'\n' => Some(b"\\n"),
            b'\r' => Some(b"\\r"),
            b'\t' => Some(b"\\t"),
            0..=0x1f => None,
            _ => continue,
        };
        w.write_all(&bytes[start..i])?;
        match escape {
            Some(e) => w.write_all(e)?,
            None => write!(w, "\\u{b:04x}")?,
        }
        start = i + 1;
    }
    w.write_all(&bytes[start..])?;
    w.write_all(b"\"")?;
    Ok(())
}
