// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::shared::configuration::HandlerStrategy;

/// Errors surfaced by setup and teardown. Nothing on the fault path returns one of these: faults
/// that go wrong are recorded on the descriptor as a [`crate::FaultCondition`] instead.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Setup failed: {0}")]
    SetupFailed(String),
    #[error("Handlers installed with strategy {installed:?}, cannot install with {requested:?}")]
    StrategyMismatch {
        installed: HandlerStrategy,
        requested: HandlerStrategy,
    },
    #[error("A fault handler may still be running on this resource")]
    HandlerActive,
    #[error("Invalid signal number {0}")]
    InvalidSignal(i32),
    #[error("The bridge is not initialized")]
    NotInitialized,
    #[error("The bridge is already initialized")]
    AlreadyInitialized,
    #[error("Watcher error: {0:#}")]
    Watcher(#[source] anyhow::Error),
}

impl BridgeError {
    pub(crate) fn setup(context: &str, err: impl std::fmt::Display) -> Self {
        Self::SetupFailed(format!("{context}: {err}"))
    }
}
