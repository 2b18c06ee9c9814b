// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Minimal manager speaking the forwarder protocol, recording what it receives

use edr_protocol::frame::framed;
use edr_protocol::handshake::server_handshake;
use edr_protocol::{Event, Frame};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckMode {
    /// Acknowledge every batch
    Always,
    /// Read batches but never acknowledge them
    Never,
}

pub struct MockManager {
    pub addr: SocketAddr,
    pub received: Arc<Mutex<Vec<Event>>>,
    pub sessions: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl MockManager {
    pub async fn start(uuid: Uuid, key: &str, server_key: Option<&str>, ack: AckMode) -> Self {
        Self::start_at("127.0.0.1:0", uuid, key, server_key, ack).await
    }

    pub async fn start_at(
        addr: &str,
        uuid: Uuid,
        key: &str,
        server_key: Option<&str>,
        ack: AckMode,
    ) -> Self {
        let listener = TcpListener::bind(addr)
            .await
            .expect("Failed to bind mock manager");
        let addr = listener.local_addr().expect("Failed to get local addr");

        let keys = Arc::new(HashMap::from([(uuid, key.to_string())]));
        let server_key = server_key.map(str::to_string);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sessions = Arc::new(AtomicUsize::new(0));
        let cancel_token = CancellationToken::new();

        let received_clone = received.clone();
        let sessions_clone = sessions.clone();
        let token = cancel_token.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let keys = keys.clone();
                let server_key = server_key.clone();
                let received = received_clone.clone();
                let sessions = sessions_clone.clone();
                let token = token.clone();

                tokio::spawn(async move {
                    let (mut reader, mut writer) = framed(stream);
                    let lookup = |uuid: &Uuid| keys.get(uuid).cloned();
                    if server_handshake(&mut reader, &mut writer, lookup, server_key.as_deref())
                        .await
                        .is_err()
                    {
                        return;
                    }
                    sessions.fetch_add(1, Ordering::SeqCst);

                    loop {
                        let frame = tokio::select! {
                            biased;
                            _ = token.cancelled() => return,
                            frame = reader.read_frame() => frame,
                        };
                        let Ok(Some(Frame::Events { seq, events })) = frame else {
                            return;
                        };
                        received.lock().unwrap().extend(events);
                        if ack == AckMode::Always
                            && writer.write_frame(&Frame::Ack { seq }).await.is_err()
                        {
                            return;
                        }
                    }
                });
            }
        });

        MockManager {
            addr,
            received,
            sessions,
            handle,
            cancel_token,
        }
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    /// Stops accepting connections and closes the open sessions
    pub fn stop(&self) {
        self.cancel_token.cancel();
        self.handle.abort();
    }
}

impl Drop for MockManager {
    fn drop(&mut self) {
        self.stop();
    }
}
