// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mutual pre-shared-key authentication between a forwarder and a manager.
//!
//! ```text
//!   forwarder                                   manager
//!       │  hello { uuid, client_nonce }            │
//!       │ ───────────────────────────────────────> │  registry lookup (unknown => rejected)
//!       │  challenge { server_nonce, server_proof? }│
//!       │ <─────────────────────────────────────── │
//!   verify server_proof (if a server key is expected)
//!       │  proof { client_proof }                  │
//!       │ ───────────────────────────────────────> │  verify client_proof
//!       │  accepted | rejected                     │
//!       │ <─────────────────────────────────────── │
//! ```
//!
//! Both proofs are HMAC-SHA256 over a role label, the endpoint UUID and both nonces, so a
//! proof captured on one connection is useless on another.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use uuid::Uuid;

use crate::errors::HandshakeError;
use crate::frame::{Frame, FrameReader, FrameWriter};

type HmacSha256 = Hmac<Sha256>;

const CLIENT_CONTEXT: &[u8] = b"edr-client";
const SERVER_CONTEXT: &[u8] = b"edr-server";
const FIELD_DELIM: u8 = 0x00;
const NONCE_SIZE: usize = 32;

/// Identity a forwarder presents to a manager.
#[derive(Debug, Clone, Copy)]
pub struct ClientCredentials<'a> {
    pub uuid: Uuid,
    pub key: &'a str,
    /// Key the manager must prove it holds; `None` trusts any manager
    pub server_key: Option<&'a str>,
}

pub fn new_nonce() -> String {
    let mut bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn keyed_transcript(
    key: &str,
    context: &[u8],
    uuid: &Uuid,
    client_nonce: &str,
    server_nonce: &str,
) -> Result<HmacSha256, HandshakeError> {
    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| HandshakeError::InvalidKey)?;
    mac.update(context);
    mac.update(&[FIELD_DELIM]);
    mac.update(uuid.as_bytes());
    mac.update(client_nonce.as_bytes());
    mac.update(&[FIELD_DELIM]);
    mac.update(server_nonce.as_bytes());
    Ok(mac)
}

fn verify(mac: Result<HmacSha256, HandshakeError>, proof: &str) -> bool {
    let Ok(proof) = hex::decode(proof) else {
        return false;
    };
    match mac {
        Ok(mac) => mac.verify_slice(&proof).is_ok(),
        Err(_) => false,
    }
}

pub fn client_proof(
    key: &str,
    uuid: &Uuid,
    client_nonce: &str,
    server_nonce: &str,
) -> Result<String, HandshakeError> {
    let mac = keyed_transcript(key, CLIENT_CONTEXT, uuid, client_nonce, server_nonce)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_client_proof(
    key: &str,
    uuid: &Uuid,
    client_nonce: &str,
    server_nonce: &str,
    proof: &str,
) -> bool {
    verify(
        keyed_transcript(key, CLIENT_CONTEXT, uuid, client_nonce, server_nonce),
        proof,
    )
}

pub fn server_proof(
    server_key: &str,
    uuid: &Uuid,
    client_nonce: &str,
    server_nonce: &str,
) -> Result<String, HandshakeError> {
    let mac = keyed_transcript(server_key, SERVER_CONTEXT, uuid, client_nonce, server_nonce)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_server_proof(
    server_key: &str,
    uuid: &Uuid,
    client_nonce: &str,
    server_nonce: &str,
    proof: &str,
) -> bool {
    verify(
        keyed_transcript(server_key, SERVER_CONTEXT, uuid, client_nonce, server_nonce),
        proof,
    )
}

async fn expect_frame<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
) -> Result<Frame, HandshakeError> {
    match reader.read_frame().await? {
        Some(Frame::Rejected { reason }) => Err(HandshakeError::Rejected(reason)),
        Some(frame) => Ok(frame),
        None => Err(HandshakeError::ConnectionClosed),
    }
}

/// Forwarder side of the handshake.
///
/// Returns `Ok(())` only once the manager accepted the proof. When an expected server key is
/// configured and the manager cannot prove it, the forwarder aborts before sending its own
/// proof.
pub async fn client_handshake<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    credentials: ClientCredentials<'_>,
) -> Result<(), HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let uuid = credentials.uuid;
    let client_nonce = new_nonce();
    writer
        .write_frame(&Frame::Hello {
            uuid,
            nonce: client_nonce.clone(),
        })
        .await?;

    let (server_nonce, proof) = match expect_frame(reader).await? {
        Frame::Challenge {
            nonce,
            server_proof,
        } => (nonce, server_proof),
        other => return Err(HandshakeError::UnexpectedFrame(other.kind())),
    };

    match (credentials.server_key, proof.as_deref()) {
        (Some(expected), Some(proof)) => {
            if !verify_server_proof(expected, &uuid, &client_nonce, &server_nonce, proof) {
                return Err(HandshakeError::ServerAuth);
            }
        }
        (Some(_), None) => return Err(HandshakeError::ServerAuth),
        (None, Some(_)) => debug!("No server key configured, not verifying manager proof"),
        (None, None) => {}
    }

    let proof = client_proof(credentials.key, &uuid, &client_nonce, &server_nonce)?;
    writer.write_frame(&Frame::Proof { proof }).await?;

    match expect_frame(reader).await? {
        Frame::Accepted => Ok(()),
        other => Err(HandshakeError::UnexpectedFrame(other.kind())),
    }
}

/// Manager side of the handshake.
///
/// `lookup` resolves the shared key of an endpoint; endpoints it does not know are rejected.
/// Returns the authenticated endpoint UUID.
pub async fn server_handshake<R, W, F>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    lookup: F,
    server_key: Option<&str>,
) -> Result<Uuid, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(&Uuid) -> Option<String>,
{
    let (uuid, client_nonce) = match expect_frame(reader).await? {
        Frame::Hello { uuid, nonce } => (uuid, nonce),
        other => return Err(HandshakeError::UnexpectedFrame(other.kind())),
    };

    let Some(key) = lookup(&uuid) else {
        reject(writer, "unknown endpoint").await;
        return Err(HandshakeError::UnknownEndpoint(uuid));
    };

    let server_nonce = new_nonce();
    let server_proof = server_key
        .map(|server_key| server_proof(server_key, &uuid, &client_nonce, &server_nonce))
        .transpose()?;
    writer
        .write_frame(&Frame::Challenge {
            nonce: server_nonce.clone(),
            server_proof,
        })
        .await?;

    let proof = match expect_frame(reader).await? {
        Frame::Proof { proof } => proof,
        other => return Err(HandshakeError::UnexpectedFrame(other.kind())),
    };

    if !verify_client_proof(&key, &uuid, &client_nonce, &server_nonce, &proof) {
        reject(writer, "authentication failed").await;
        return Err(HandshakeError::ClientAuth(uuid));
    }

    writer.write_frame(&Frame::Accepted).await?;
    Ok(uuid)
}

async fn reject<W: AsyncWrite + Unpin>(writer: &mut FrameWriter<W>, reason: &str) {
    // the connection is dropped right after, a failed write changes nothing
    if let Err(e) = writer
        .write_frame(&Frame::Rejected {
            reason: reason.to_string(),
        })
        .await
    {
        debug!("Failed to notify peer of rejection: {}", e);
    }
}
