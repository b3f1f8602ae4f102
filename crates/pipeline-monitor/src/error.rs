// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised while configuring or operating the monitor
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Sweeper already running")]
    SweepAlreadyRunning,

    #[error("Sweeper task failed: {0}")]
    SweepTask(String),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
}

/// Errors an [`crate::sink::EventSink`] may report for a single event
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Sink closed")]
    Closed,

    #[error("Failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),
}
