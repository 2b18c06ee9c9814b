// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use uuid::Uuid;

/// Errors raised while reading or writing wire frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame exceeds maximum length of {0} bytes")]
    FrameTooLarge(usize),
}

/// Errors raised by either side of the authentication handshake.
///
/// Any of these aborts the connection: no event is accepted on a connection whose handshake
/// returned an error.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Endpoint {0} is not registered")]
    UnknownEndpoint(Uuid),

    #[error("Endpoint {0} failed to prove possession of its key")]
    ClientAuth(Uuid),

    #[error("Manager failed to prove possession of the expected server key")]
    ServerAuth,

    #[error("Handshake rejected by peer: {0}")]
    Rejected(String),

    #[error("Unexpected {0} frame during handshake")]
    UnexpectedFrame(&'static str),

    #[error("Connection closed during handshake")]
    ConnectionClosed,

    #[error("Invalid key material")]
    InvalidKey,
}
