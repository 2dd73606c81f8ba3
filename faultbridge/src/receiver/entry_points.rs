// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::receive_report::{receive_report_from_stream, ReportStatus};
use crate::crash_info::CrashReport;
use crate::shared::constants::*;
use anyhow::Context;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    net::UnixListener,
};

const DEFAULT_WATCHER_TIMEOUT: Duration = Duration::from_millis(4000);

/*-----------------------------------------
|                Public API               |
------------------------------------------*/

/// Reads reports from stdin until it closes. This is how a spawned watcher runs.
pub fn receiver_entry_point_stdin() -> anyhow::Result<()> {
    let stream = BufReader::new(tokio::io::stdin());
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(receiver_entry_point(
        receiver_timeout(),
        &ReportOutput::from_env(),
        stream,
    ))?;
    Ok(())
}

pub async fn async_receiver_entry_point_unix_listener(
    listener: &UnixListener,
) -> anyhow::Result<()> {
    let (unix_stream, _) = listener.accept().await?;
    let stream = BufReader::new(unix_stream);
    receiver_entry_point(receiver_timeout(), &ReportOutput::from_env(), stream).await
}

/// Serves bridges connecting to `socket_path`, one connection at a time.
pub async fn async_receiver_entry_point_unix_socket(
    socket_path: impl AsRef<str>,
    one_shot: bool,
) -> anyhow::Result<()> {
    let listener = get_receiver_unix_socket(socket_path)?;
    loop {
        let res = async_receiver_entry_point_unix_listener(&listener).await;
        if one_shot {
            return res;
        }
        if let Err(e) = res {
            tracing::warn!(error = %e, "Failed to receive from connection");
        }
    }
}

pub fn receiver_entry_point_unix_socket(socket_path: impl AsRef<str>) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async_receiver_entry_point_unix_socket(socket_path, true))?;
    Ok(())
    // Dropping the stream closes it, allowing the collector to exit if it was waiting.
}

pub fn get_receiver_unix_socket(socket_path: impl AsRef<str>) -> anyhow::Result<UnixListener> {
    fn path_bind(socket_path: impl AsRef<str>) -> anyhow::Result<UnixListener> {
        let socket_path = socket_path.as_ref();
        if std::fs::metadata(socket_path).is_ok() {
            std::fs::remove_file(socket_path).with_context(|| {
                format!("could not delete previous socket at {:?}", socket_path)
            })?;
        }
        Ok(UnixListener::bind(socket_path)?)
    }

    #[cfg(target_os = "linux")]
    let unix_listener = if socket_path.as_ref().starts_with(['.', '/']) {
        path_bind(socket_path)
    } else {
        use std::os::linux::net::SocketAddrExt;
        std::os::unix::net::SocketAddr::from_abstract_name(socket_path.as_ref())
            .and_then(|addr| {
                std::os::unix::net::UnixListener::bind_addr(&addr)
                    .and_then(|listener| {
                        listener.set_nonblocking(true)?;
                        Ok(listener)
                    })
                    .and_then(UnixListener::from_std)
            })
            .map_err(anyhow::Error::msg)
    };
    #[cfg(not(target_os = "linux"))]
    let unix_listener = path_bind(socket_path);
    unix_listener.context("Could not create the unix socket")
}

/// Where received reports are written, one JSON document per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutput {
    Stdout,
    /// Appended to, so that several watchers (or runs) can share a file.
    File(PathBuf),
}

impl ReportOutput {
    pub fn from_env() -> Self {
        match std::env::var_os(FAULTBRIDGE_WATCHER_OUTPUT_ENV) {
            Some(path) if !path.is_empty() => Self::File(path.into()),
            _ => Self::Stdout,
        }
    }

    pub fn write_report(&self, report: &CrashReport) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(report)?;
        line.push(b'\n');
        match self {
            Self::Stdout => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&line)?;
                stdout.flush()?;
            }
            Self::File(path) => {
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                file.write_all(&line)?;
            }
        }
        Ok(())
    }
}

/// Receives reports from a collector via a stream, formats each into `CrashReport` json, and
/// writes it to `output`.
///
/// At a high-level, this exists because doing anything in a signal handler is dangerous, so the
/// handler only writes a raw descriptor and the watcher does the rest.
///
/// Reads until the stream closes. A stream cut short mid-report ends the loop after the partial
/// report has been written.
pub(crate) async fn receiver_entry_point(
    timeout: Duration,
    output: &ReportOutput,
    stream: impl AsyncBufRead + std::marker::Unpin,
) -> anyhow::Result<()> {
    let mut lines = stream.lines();
    let mut received = 0usize;
    loop {
        match receive_report_from_stream(timeout, &mut lines).await? {
            ReportStatus::NoReport => break,
            ReportStatus::Report(report) => {
                output.write_report(&report)?;
                received += 1;
            }
            ReportStatus::PartialReport(report, state) => {
                tracing::warn!(?state, uuid = report.uuid, "Received a partial report");
                output.write_report(&report)?;
                received += 1;
                break;
            }
        }
    }
    tracing::debug!(received, "Report stream closed");
    Ok(())
}

fn receiver_timeout() -> Duration {
    std::env::var(FAULTBRIDGE_WATCHER_TIMEOUT_MS_ENV)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_WATCHER_TIMEOUT)
}
