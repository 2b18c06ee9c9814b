// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use edr_protocol::{HandshakeError, ProtocolError};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Manager already started")]
    AlreadyStarted,

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Invalid search pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons an ingestion session ends early
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Failed to store events: {0}")]
    Store(#[from] StoreError),

    #[error("Store task failed: {0}")]
    StoreTask(#[from] tokio::task::JoinError),

    #[error("Unexpected {0} frame")]
    UnexpectedFrame(&'static str),

    #[error("Handshake timed out")]
    HandshakeTimeout,
}
