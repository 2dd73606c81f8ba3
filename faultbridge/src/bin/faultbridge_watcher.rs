// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Out-of-process watcher. Reads reports from stdin, or with `--unix-socket <path>` from the
//! first bridge that connects to `path`, and writes them as JSON lines.

#[cfg(not(unix))]
fn main() {}

#[cfg(unix)]
#[cfg(feature = "receiver")]
fn main() -> anyhow::Result<()> {
    use faultbridge::constants::FAULTBRIDGE_WATCHER_LOG_ENV;
    use tracing_subscriber::EnvFilter;

    // Stdout may be where reports go, so logs go to stderr.
    let filter = std::env::var(FAULTBRIDGE_WATCHER_LOG_ENV).unwrap_or_else(|_| "warn".to_string());
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut args = std::env::args().skip(1);
    match (args.next().as_deref(), args.next()) {
        (None, _) => faultbridge::receiver_entry_point_stdin(),
        (Some("--unix-socket"), Some(path)) => faultbridge::receiver_entry_point_unix_socket(path),
        (Some(arg), _) => {
            anyhow::bail!("Usage: faultbridge-watcher [--unix-socket <path>], got {arg}")
        }
    }
}
