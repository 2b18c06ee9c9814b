// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use edr_protocol::{HandshakeError, ProtocolError};

/// Errors surfaced by the forwarder API
#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Forwarder already running")]
    AlreadyRunning,

    #[error("Forwarder closed")]
    Closed,

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Errors raised by the on-disk event queue
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Reasons a batch could not be delivered to the manager. All of them are recoverable: the
/// batch is queued and retried later.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Failed to connect to manager: {0}")]
    Connect(std::io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Manager answered with an unexpected {0} frame")]
    UnexpectedFrame(&'static str),

    #[error("Manager acknowledged batch {got} instead of {expected}")]
    AckMismatch { expected: u64, got: u64 },

    #[error("Connection closed by manager")]
    ConnectionClosed,

    #[error("Not connected to manager")]
    NotConnected,

    #[error("Timed out")]
    Timeout,

    #[error("Cancelled")]
    Cancelled,
}
