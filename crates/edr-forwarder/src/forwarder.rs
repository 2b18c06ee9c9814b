// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forwarder client.
//!
//! Events handed to [`Forwarder::pipe_event`] go through a bounded buffer to a single delivery
//! loop. The loop sends them in batches over an authenticated connection and only considers
//! them delivered once the manager acknowledged the batch. Anything that cannot be delivered
//! is written to the [`EventQueue`] and replayed, oldest segment first, once the manager is
//! reachable again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use edr_protocol::frame::framed;
use edr_protocol::handshake::{client_handshake, ClientCredentials};
use edr_protocol::{Event, Frame, FrameReader, FrameWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ForwarderConfig;
use crate::disk_guardian::DiskGuardian;
use crate::errors::{DeliveryError, ForwarderError};
use crate::queue::EventQueue;

#[derive(Debug, Default)]
struct ForwarderStats {
    sent: AtomicU64,
    queued: AtomicU64,
    dropped: AtomicU64,
    replayed: AtomicU64,
    since_cleanup: AtomicU64,
}

impl ForwarderStats {
    fn processed(&self, count: usize) {
        self.since_cleanup
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Point-in-time view of the forwarder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Events acknowledged by the manager on first attempt
    pub sent: u64,
    /// Events written to the on-disk queue
    pub queued: u64,
    /// Events lost because the queue could not be written
    pub dropped: u64,
    /// Queued events acknowledged by the manager on replay
    pub replayed: u64,
}

pub struct Forwarder {
    config: Arc<ForwarderConfig>,
    queue: Arc<Mutex<EventQueue>>,
    guardian: DiskGuardian,
    tx: mpsc::Sender<Event>,
    rx: Mutex<Option<mpsc::Receiver<Event>>>,
    cancel_token: CancellationToken,
    shutdown: CancellationToken,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<ForwarderStats>,
}

impl Forwarder {
    /// Creates a forwarder and opens its queue. Nothing is sent before [`Forwarder::run`].
    ///
    /// Cancelling `cancel_token` stops the delivery loop at its next suspension point; events
    /// still buffered are then written to the queue instead of being sent.
    pub fn new(
        config: ForwarderConfig,
        cancel_token: CancellationToken,
    ) -> Result<Self, ForwarderError> {
        config.validate()?;
        let queue = EventQueue::open(config.queue.clone())?;
        let guardian = DiskGuardian::new(&config.queue);
        let (tx, rx) = mpsc::channel(config.buffer_capacity);
        let shutdown = cancel_token.child_token();

        Ok(Forwarder {
            config: Arc::new(config),
            queue: Arc::new(Mutex::new(queue)),
            guardian,
            tx,
            rx: Mutex::new(Some(rx)),
            cancel_token,
            shutdown,
            closed: AtomicBool::new(false),
            task: Mutex::new(None),
            stats: Arc::new(ForwarderStats::default()),
        })
    }

    /// Spawns the delivery loop on the current tokio runtime.
    pub fn run(&self) -> Result<(), ForwarderError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ForwarderError::Closed);
        }
        let rx = lock(&self.rx)
            .take()
            .ok_or(ForwarderError::AlreadyRunning)?;

        let delivery = DeliveryLoop {
            config: Arc::clone(&self.config),
            queue: Arc::clone(&self.queue),
            guardian: self.guardian,
            stats: Arc::clone(&self.stats),
            rx,
            cancel_token: self.cancel_token.clone(),
            shutdown: self.shutdown.clone(),
            connection: None,
            next_seq: 0,
        };
        info!(
            "FORWARDER | Starting forwarder for endpoint {} towards {}",
            self.config.uuid, self.config.manager_addr
        );
        *lock(&self.task) = Some(tokio::spawn(delivery.run()));
        Ok(())
    }

    /// Hands an event over for delivery.
    ///
    /// Never blocks on the network: when the buffer is full the event is written to the queue
    /// right away. Fails with [`ForwarderError::Closed`] once the forwarder is closed.
    pub fn pipe_event(&self, event: Event) -> Result<(), ForwarderError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ForwarderError::Closed);
        }
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                debug!("FORWARDER | Buffer full, writing event to the queue");
                persist(&self.queue, &self.stats, std::slice::from_ref(&event));
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(ForwarderError::Closed),
        }
    }

    /// Stops the forwarder.
    ///
    /// The delivery loop drains the buffer, makes a last delivery attempt, and persists whatever
    /// is left. Waits at most `shutdown_grace` for it, then aborts the loop.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let handle = lock(&self.task).take();
        match handle {
            Some(mut handle) => match timeout(self.config.shutdown_grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("FORWARDER | Delivery loop failed: {}", e),
                Err(_) => {
                    warn!(
                        "FORWARDER | Delivery loop did not stop within {:?}, aborting it",
                        self.config.shutdown_grace
                    );
                    handle.abort();
                }
            },
            None => {
                // never started, the buffer still holds the events
                if let Some(mut rx) = lock(&self.rx).take() {
                    rx.close();
                    let mut pending = Vec::new();
                    while let Ok(event) = rx.try_recv() {
                        pending.push(event);
                    }
                    persist(&self.queue, &self.stats, &pending);
                }
            }
        }

        if let Err(e) = lock(&self.queue).flush() {
            error!("QUEUE | Failed to flush queue on close: {}", e);
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.stats.sent.load(Ordering::Relaxed),
            queued: self.stats.queued.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            replayed: self.stats.replayed.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        // lets a detached delivery loop persist its buffer and stop
        self.shutdown.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Writes events to the queue. An event that cannot be written is dropped.
fn persist(queue: &Mutex<EventQueue>, stats: &ForwarderStats, events: &[Event]) {
    if events.is_empty() {
        return;
    }
    let written = lock(queue).push_batch(events);
    stats.queued.fetch_add(written as u64, Ordering::Relaxed);
    stats
        .dropped
        .fetch_add((events.len() - written) as u64, Ordering::Relaxed);
    stats.processed(events.len());
}

struct Connection {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
}

impl Connection {
    async fn exchange(&mut self, frame: &Frame, seq: u64) -> Result<(), DeliveryError> {
        self.writer.write_frame(frame).await?;
        match self.reader.read_frame().await? {
            Some(Frame::Ack { seq: got }) if got == seq => Ok(()),
            Some(Frame::Ack { seq: got }) => Err(DeliveryError::AckMismatch { expected: seq, got }),
            Some(other) => Err(DeliveryError::UnexpectedFrame(other.kind())),
            None => Err(DeliveryError::ConnectionClosed),
        }
    }
}

struct DeliveryLoop {
    config: Arc<ForwarderConfig>,
    queue: Arc<Mutex<EventQueue>>,
    guardian: DiskGuardian,
    stats: Arc<ForwarderStats>,
    rx: mpsc::Receiver<Event>,
    cancel_token: CancellationToken,
    shutdown: CancellationToken,
    connection: Option<Connection>,
    next_seq: u64,
}

impl DeliveryLoop {
    async fn run(mut self) {
        let mut retry = interval(self.config.retry_sleep);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = retry.tick() => self.maintain().await,
                Some(event) = self.rx.recv() => {
                    let batch = self.collect_batch(event);
                    self.deliver(batch).await;
                }
            }
            self.maybe_cleanup();
        }

        self.finish().await;
    }

    fn collect_batch(&mut self, first: Event) -> Vec<Event> {
        let mut batch = Vec::with_capacity(self.config.batch_size);
        batch.push(first);
        while batch.len() < self.config.batch_size {
            match self.rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        batch
    }

    /// Sends a batch on the live connection, queueing it when that is not possible.
    async fn deliver(&mut self, batch: Vec<Event>) {
        if self.connection.is_some() {
            match self.send_batch(&batch).await {
                Ok(()) => {
                    self.stats
                        .sent
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    self.stats.processed(batch.len());
                    return;
                }
                Err(e) => {
                    warn!(
                        "FORWARDER | Failed to deliver {} events, queueing them: {}",
                        batch.len(),
                        e
                    );
                    self.connection = None;
                }
            }
        }
        persist(&self.queue, &self.stats, &batch);
    }

    async fn send_batch(&mut self, events: &[Event]) -> Result<(), DeliveryError> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let Some(connection) = self.connection.as_mut() else {
            return Err(DeliveryError::NotConnected);
        };
        let frame = Frame::Events {
            seq,
            events: events.to_vec(),
        };

        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => Err(DeliveryError::Cancelled),
            result = timeout(self.config.send_timeout, connection.exchange(&frame, seq)) => {
                result.unwrap_or_else(|_| Err(DeliveryError::Timeout))
            }
        }
    }

    async fn connect(&mut self) -> Result<(), DeliveryError> {
        let config = Arc::clone(&self.config);
        let attempt = async {
            let stream = TcpStream::connect(&config.manager_addr)
                .await
                .map_err(DeliveryError::Connect)?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!("FORWARDER | Failed to set TCP_NODELAY: {}", e);
            }
            let (mut reader, mut writer) = framed(stream);
            let credentials = ClientCredentials {
                uuid: config.uuid,
                key: &config.key,
                server_key: config.server_key.as_deref(),
            };
            client_handshake(&mut reader, &mut writer, credentials).await?;
            Ok::<_, DeliveryError>(Connection { reader, writer })
        };

        let connection = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => return Err(DeliveryError::Cancelled),
            result = timeout(config.handshake_timeout, attempt) => {
                result.unwrap_or_else(|_| Err(DeliveryError::Timeout))?
            }
        };
        self.connection = Some(connection);
        info!(
            "FORWARDER | Connected to manager at {}",
            self.config.manager_addr
        );
        Ok(())
    }

    fn log_connect_error(&self, error: &DeliveryError) {
        match error {
            DeliveryError::Handshake(e) => warn!(
                "FORWARDER | Handshake with manager {} failed: {}",
                self.config.manager_addr, e
            ),
            DeliveryError::Cancelled => {}
            e => debug!(
                "FORWARDER | Manager {} unreachable: {}",
                self.config.manager_addr, e
            ),
        }
    }

    /// Retry tick: reconnects when needed, then replays the queue.
    async fn maintain(&mut self) {
        if self.connection.is_none() {
            if let Err(e) = self.connect().await {
                self.log_connect_error(&e);
                return;
            }
        }
        self.replay_queue().await;
    }

    /// Replays queued segments oldest first. A segment is deleted only once every one of its
    /// events has been acknowledged; replay stops at the first failure.
    async fn replay_queue(&mut self) {
        let segments = {
            let mut queue = lock(&self.queue);
            if let Err(e) = queue.rotate() {
                error!("QUEUE | Failed to rotate active segment: {}", e);
            }
            match queue.inactive_segments() {
                Ok(segments) => segments,
                Err(e) => {
                    error!("QUEUE | Failed to list queued segments: {}", e);
                    return;
                }
            }
        };

        for segment in segments {
            if self.connection.is_none() || self.cancel_token.is_cancelled() {
                return;
            }
            let events = match EventQueue::read_segment(&segment.path) {
                Ok(events) => events,
                Err(e) => {
                    warn!(
                        "QUEUE | Failed to read queued segment {}: {}",
                        segment.path.display(),
                        e
                    );
                    continue;
                }
            };

            for chunk in events.chunks(self.config.batch_size) {
                if let Err(e) = self.send_batch(chunk).await {
                    warn!(
                        "FORWARDER | Replay of {} interrupted: {}",
                        segment.path.display(),
                        e
                    );
                    self.connection = None;
                    return;
                }
                self.stats
                    .replayed
                    .fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }

            match EventQueue::remove_segment(&segment.path) {
                Ok(()) => debug!(
                    "FORWARDER | Replayed {} events from {}",
                    events.len(),
                    segment.path.display()
                ),
                Err(e) => error!(
                    "QUEUE | Failed to remove replayed segment {}: {}",
                    segment.path.display(),
                    e
                ),
            }
        }
    }

    fn maybe_cleanup(&self) {
        if self.stats.since_cleanup.load(Ordering::Relaxed) < self.config.event_threshold {
            return;
        }
        self.stats.since_cleanup.store(0, Ordering::Relaxed);
        self.cleanup();
    }

    fn cleanup(&self) {
        let queue = lock(&self.queue);
        match self.guardian.cleanup(&queue) {
            Ok(report) if report.deleted > 0 => info!(
                "QUEUE | Deleted {} segments ({} bytes) to stay under the disk space threshold, {} bytes still queued",
                report.deleted, report.freed_bytes, report.remaining_bytes
            ),
            Ok(_) => {}
            Err(e) => error!("QUEUE | Queue cleanup failed: {}", e),
        }
    }

    async fn finish(mut self) {
        self.rx.close();
        let mut pending = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            pending.push(event);
        }

        let queue_empty = lock(&self.queue).is_empty().unwrap_or(false);
        if self.cancel_token.is_cancelled() {
            persist(&self.queue, &self.stats, &pending);
        } else if pending.is_empty() && queue_empty {
            debug!("FORWARDER | Nothing left to deliver");
        } else {
            if self.connection.is_none() {
                if let Err(e) = self.connect().await {
                    self.log_connect_error(&e);
                }
            }
            if self.connection.is_some() {
                self.replay_queue().await;
            }
            let batch_size = self.config.batch_size;
            for chunk in pending.chunks(batch_size) {
                self.deliver(chunk.to_vec()).await;
            }
        }

        if let Err(e) = lock(&self.queue).flush() {
            error!("QUEUE | Failed to flush queue: {}", e);
        }
        self.cleanup();

        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.writer.shutdown().await {
                debug!("FORWARDER | Failed to shut connection down: {}", e);
            }
        }

        let left = lock(&self.queue).queued_bytes().unwrap_or_default();
        let stats = &self.stats;
        info!(
            "FORWARDER | Stopped: {} sent, {} replayed, {} queued, {} dropped, {} bytes left in the queue",
            stats.sent.load(Ordering::Relaxed),
            stats.replayed.load(Ordering::Relaxed),
            stats.queued.load(Ordering::Relaxed),
            stats.dropped.load(Ordering::Relaxed),
            left
        );
    }
}
