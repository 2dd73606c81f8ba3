// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

pub const FAULTBRIDGE_BEGIN_FAULT: &str = "FAULTBRIDGE_BEGIN_FAULT";
pub const FAULTBRIDGE_BEGIN_MESSAGE: &str = "FAULTBRIDGE_BEGIN_MESSAGE";
pub const FAULTBRIDGE_BEGIN_METADATA: &str = "FAULTBRIDGE_BEGIN_METADATA";
pub const FAULTBRIDGE_BEGIN_PROCINFO: &str = "FAULTBRIDGE_BEGIN_PROCINFO";
pub const FAULTBRIDGE_BEGIN_REGISTERS: &str = "FAULTBRIDGE_BEGIN_REGISTERS";
pub const FAULTBRIDGE_BEGIN_STACKTRACE: &str = "FAULTBRIDGE_BEGIN_STACKTRACE";
pub const FAULTBRIDGE_BEGIN_TIMESTAMP: &str = "FAULTBRIDGE_BEGIN_TIMESTAMP";
pub const FAULTBRIDGE_DONE: &str = "FAULTBRIDGE_DONE";
pub const FAULTBRIDGE_END_FAULT: &str = "FAULTBRIDGE_END_FAULT";
pub const FAULTBRIDGE_END_MESSAGE: &str = "FAULTBRIDGE_END_MESSAGE";
pub const FAULTBRIDGE_END_METADATA: &str = "FAULTBRIDGE_END_METADATA";
pub const FAULTBRIDGE_END_PROCINFO: &str = "FAULTBRIDGE_END_PROCINFO";
pub const FAULTBRIDGE_END_REGISTERS: &str = "FAULTBRIDGE_END_REGISTERS";
pub const FAULTBRIDGE_END_STACKTRACE: &str = "FAULTBRIDGE_END_STACKTRACE";
pub const FAULTBRIDGE_END_TIMESTAMP: &str = "FAULTBRIDGE_END_TIMESTAMP";

pub const FAULTBRIDGE_DEFAULT_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const FAULTBRIDGE_DEFAULT_ALT_STACK_SIZE: usize = 64 * 1024;

/// Overrides `create_alt_stack` (and implies `use_alt_stack`) when set to `0` or `1`.
pub const FAULTBRIDGE_CREATE_ALT_STACK_ENV: &str = "FAULTBRIDGE_CREATE_ALT_STACK";
pub const FAULTBRIDGE_DEBUG_ENV: &str = "FAULTBRIDGE_DEBUG";
pub const FAULTBRIDGE_TIMEOUT_MS_ENV: &str = "FAULTBRIDGE_TIMEOUT_MS";
pub const FAULTBRIDGE_WATCHER_TIMEOUT_MS_ENV: &str = "FAULTBRIDGE_WATCHER_TIMEOUT_MS";
/// File the watcher appends reports to, one JSON document per line. Stdout when unset.
pub const FAULTBRIDGE_WATCHER_OUTPUT_ENV: &str = "FAULTBRIDGE_WATCHER_OUTPUT";
pub const FAULTBRIDGE_WATCHER_LOG_ENV: &str = "FAULTBRIDGE_WATCHER_LOG";
