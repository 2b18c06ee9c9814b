// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TCP listener and ingestion sessions.
//!
//! Every accepted connection runs the server side of the handshake and then an ingestion
//! session: each `events` frame is written to the store and flushed before its `ack` goes
//! out, so a forwarder never drops events the manager has not persisted.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use edr_protocol::frame::framed;
use edr_protocol::handshake::server_handshake;
use edr_protocol::{Frame, FrameReader, FrameWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{self, JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::errors::{ManagerError, SessionError};
use crate::registry::EndpointRegistry;
use crate::searcher::EventSearcher;
use crate::store::EventStore;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct Manager {
    config: Arc<ManagerConfig>,
    registry: EndpointRegistry,
    store: Arc<EventStore>,
    cancel_token: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    /// Creates a manager and opens its store. Endpoints listed in the configuration are
    /// registered right away.
    pub fn new(config: ManagerConfig) -> Result<Self, ManagerError> {
        config.validate()?;
        let store = EventStore::open(config.store.clone())?;
        let registry = EndpointRegistry::new();
        for (uuid, key) in &config.endpoints {
            registry.add_endpoint(*uuid, key.clone());
        }
        if !registry.is_empty() {
            info!("MANAGER | Registered {} endpoints from configuration", registry.len());
        }

        Ok(Manager {
            config: Arc::new(config),
            registry,
            store: Arc::new(store),
            cancel_token: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            server: Mutex::new(None),
        })
    }

    pub fn add_endpoint(&self, uuid: Uuid, key: impl Into<String>) {
        if self.registry.add_endpoint(uuid, key).is_some() {
            debug!("MANAGER | Replaced key of endpoint {}", uuid);
        }
    }

    /// Unregisters an endpoint. Sessions already authenticated keep running; new handshakes
    /// are rejected.
    pub fn remove_endpoint(&self, uuid: &Uuid) -> bool {
        let removed = self.registry.remove_endpoint(uuid);
        if removed {
            info!("MANAGER | Removed endpoint {}", uuid);
        }
        removed
    }

    /// Binds the listener and starts accepting forwarders in the background. Returns the bound
    /// address.
    pub async fn run(&self) -> Result<SocketAddr, ManagerError> {
        if self.stopped.load(Ordering::SeqCst) || self.started.swap(true, Ordering::SeqCst) {
            return Err(ManagerError::AlreadyStarted);
        }

        let bind_error = |source| ManagerError::Bind {
            addr: self.config.listen_addr.clone(),
            source,
        };
        let listener = match TcpListener::bind(&self.config.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(bind_error(e));
            }
        };
        let addr = listener.local_addr().map_err(bind_error)?;

        let server = Server {
            ctx: SessionContext {
                config: Arc::clone(&self.config),
                registry: self.registry.clone(),
                store: Arc::clone(&self.store),
                cancel_token: self.cancel_token.clone(),
            },
        };
        let handle = tokio::spawn(server.serve(listener));
        *self.server.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!("MANAGER | Listening for forwarders on {}", addr);
        Ok(addr)
    }

    /// Stops accepting connections and ends every session once its current batch is stored
    /// and acknowledged, then closes the store. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("MANAGER | Shutting down");
        self.cancel_token.cancel();

        let handle = self
            .server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("MANAGER | Listener task failed: {}", e);
            }
        }

        let store = Arc::clone(&self.store);
        if let Err(e) = task::spawn_blocking(move || store.close_all()).await {
            error!("STORE | Failed to close the store: {}", e);
        }
        info!("MANAGER | Stopped");
    }

    /// Searcher reading this manager's store
    pub fn event_searcher(&self) -> EventSearcher {
        let store = self.store.config();
        EventSearcher::new(store.root.clone(), store.basename.clone())
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[derive(Clone)]
struct SessionContext {
    config: Arc<ManagerConfig>,
    registry: EndpointRegistry,
    store: Arc<EventStore>,
    cancel_token: CancellationToken,
}

struct Server {
    ctx: SessionContext,
}

impl Server {
    async fn serve(self, listener: TcpListener) {
        let mut sessions = JoinSet::new();

        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = self.ctx.cancel_token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("MANAGER | Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
                finished = async {
                    match sessions.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("MANAGER | Session panicked: {:?}", e);
                        }
                    }
                    continue;
                },
            };
            sessions.spawn(handle_connection(stream, peer, self.ctx.clone()));
        }
        drop(listener);

        let grace = self.ctx.config.shutdown_grace;
        let drained = timeout(grace, async {
            while let Some(finished) = sessions.join_next().await {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!("MANAGER | Session panicked: {:?}", e);
                    }
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "MANAGER | {} sessions did not stop within {:?}, aborting them",
                sessions.len(),
                grace
            );
            sessions.shutdown().await;
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: SessionContext) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("MANAGER | Failed to set TCP_NODELAY: {}", e);
    }
    let (mut reader, mut writer) = framed(stream);

    let uuid = match authenticate(&mut reader, &mut writer, &ctx).await {
        Ok(Some(uuid)) => uuid,
        Ok(None) => return,
        Err(e) => {
            warn!("MANAGER | Rejected connection from {}: {}", peer, e);
            return;
        }
    };
    info!("MANAGER | Endpoint {} connected from {}", uuid, peer);

    match ingest(uuid, &mut reader, &mut writer, &ctx).await {
        Ok(stored) => info!(
            "MANAGER | Endpoint {} disconnected after {} events",
            uuid, stored
        ),
        Err(e) => warn!("MANAGER | Session of endpoint {} ended: {}", uuid, e),
    }
    if let Err(e) = writer.shutdown().await {
        debug!("MANAGER | Failed to shut connection down: {}", e);
    }
}

/// Runs the handshake; `Ok(None)` when the manager shut down meanwhile.
async fn authenticate(
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &mut FrameWriter<OwnedWriteHalf>,
    ctx: &SessionContext,
) -> Result<Option<Uuid>, SessionError> {
    let lookup = |uuid: &Uuid| ctx.registry.key_for(uuid);
    let handshake = server_handshake(reader, writer, lookup, ctx.config.server_key.as_deref());

    tokio::select! {
        biased;
        _ = ctx.cancel_token.cancelled() => Ok(None),
        result = timeout(ctx.config.handshake_timeout, handshake) => match result {
            Ok(uuid) => Ok(Some(uuid?)),
            Err(_) => Err(SessionError::HandshakeTimeout),
        },
    }
}

/// Stores batches until the forwarder disconnects or the manager shuts down. A batch that was
/// read is always stored and acknowledged before the session stops.
async fn ingest(
    uuid: Uuid,
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &mut FrameWriter<OwnedWriteHalf>,
    ctx: &SessionContext,
) -> Result<u64, SessionError> {
    let mut stored = 0u64;
    loop {
        let frame = tokio::select! {
            biased;
            _ = ctx.cancel_token.cancelled() => break,
            frame = reader.read_frame() => frame?,
        };
        match frame {
            None => break,
            Some(Frame::Events { seq, events }) => {
                let count = events.len();
                let store = Arc::clone(&ctx.store);
                task::spawn_blocking(move || store.append(uuid, &events)).await??;
                writer.write_frame(&Frame::Ack { seq }).await?;
                stored += count as u64;
                debug!(
                    "MANAGER | Stored batch {} of {} events from endpoint {}",
                    seq, count, uuid
                );
            }
            Some(other) => return Err(SessionError::UnexpectedFrame(other.kind())),
        }
    }
    Ok(stored)
}
