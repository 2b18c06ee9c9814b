// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Newline-delimited JSON framing used between forwarders and managers.
//!
//! Each frame is a single JSON object terminated by `\n`, tagged by its `type` field. Frames
//! larger than the configured maximum are rejected before they are buffered in full.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::errors::ProtocolError;
use crate::event::Event;

/// Default upper bound on the size of a single frame (16 MiB)
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Forwarder introduces itself with its endpoint UUID and a fresh nonce
    Hello { uuid: Uuid, nonce: String },
    /// Manager answers with its own nonce, and a proof of its server key when it has one
    Challenge {
        nonce: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_proof: Option<String>,
    },
    /// Forwarder proves possession of the endpoint key
    Proof { proof: String },
    Accepted,
    Rejected { reason: String },
    /// A batch of events; `seq` is echoed back by the matching [`Frame::Ack`]
    Events { seq: u64, events: Vec<Event> },
    /// Sent by the manager once the batch has been written to its store
    Ack { seq: u64 },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Challenge { .. } => "challenge",
            Frame::Proof { .. } => "proof",
            Frame::Accepted => "accepted",
            Frame::Rejected { .. } => "rejected",
            Frame::Events { .. } => "events",
            Frame::Ack { .. } => "ack",
        }
    }
}

pub struct FrameReader<R> {
    inner: BufReader<R>,
    line: String,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_len(inner, MAX_FRAME_LENGTH)
    }

    pub fn with_max_len(inner: R, max_len: usize) -> Self {
        FrameReader {
            inner: BufReader::new(inner),
            line: String::new(),
            max_len,
        }
    }

    /// Reads the next frame. Returns `Ok(None)` when the peer closed the connection cleanly.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        self.line.clear();
        let limit = self.max_len as u64 + 1;
        let read = (&mut self.inner)
            .take(limit)
            .read_line(&mut self.line)
            .await?;
        if read == 0 {
            return Ok(None);
        }
        if !self.line.ends_with('\n') && read as u64 >= limit {
            return Err(ProtocolError::FrameTooLarge(self.max_len));
        }
        let frame = serde_json::from_str(self.line.trim_end())?;
        Ok(Some(frame))
    }
}

pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        FrameWriter { inner }
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        self.inner.write_all(&line).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Splits a TCP stream into a frame reader and a frame writer.
pub fn framed(stream: TcpStream) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>) {
    let (read_half, write_half) = stream.into_split();
    (FrameReader::new(read_half), FrameWriter::new(write_half))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_frames_cross_a_duplex_stream() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let events = vec![Event::new(json!({"image": "cmd.exe"}))];
        writer
            .write_frame(&Frame::Events {
                seq: 7,
                events: events.clone(),
            })
            .await
            .unwrap();
        writer.write_frame(&Frame::Accepted).await.unwrap();
        writer.shutdown().await.unwrap();

        assert_eq!(
            reader.read_frame().await.unwrap(),
            Some(Frame::Events { seq: 7, events })
        );
        assert_eq!(reader.read_frame().await.unwrap(), Some(Frame::Accepted));
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }

    #[test]
    fn test_frame_wire_shape() {
        let line = serde_json::to_string(&Frame::Ack { seq: 3 }).unwrap();
        assert_eq!(line, r#"{"type":"ack","seq":3}"#);

        let line = serde_json::to_string(&Frame::Challenge {
            nonce: "ab".to_string(),
            server_proof: None,
        })
        .unwrap();
        assert_eq!(line, r#"{"type":"challenge","nonce":"ab"}"#);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::with_max_len(server, 32);

        writer
            .write_frame(&Frame::Rejected {
                reason: "x".repeat(64),
            })
            .await
            .unwrap();

        assert!(matches!(
            reader.read_frame().await,
            Err(ProtocolError::FrameTooLarge(32))
        ));
    }

    #[tokio::test]
    async fn test_malformed_frame() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(server);
        client.write_all(b"{\"type\":\"nope\"}\n").await.unwrap();

        assert!(matches!(
            reader.read_frame().await,
            Err(ProtocolError::Malformed(_))
        ));
    }
}
