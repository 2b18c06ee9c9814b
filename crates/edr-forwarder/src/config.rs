// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use edr_protocol::util::{env_duration_ms, env_parse, env_string};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::ForwarderError;

const MEGABYTE: u64 = 1024 * 1024;

/// Maximum size of a queue segment before it is rotated
pub const DEFAULT_SEGMENT_SIZE: u64 = 10 * MEGABYTE;
/// Disk budget for inactive queue segments, enough for ten full segments
pub const DISK_SPACE_THRESHOLD: u64 = 100 * MEGABYTE;
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(3600);
pub const MIN_ROTATION_INTERVAL: Duration = Duration::from_secs(1);
/// Number of processed events between two disk guardian passes
pub const DEFAULT_EVENT_THRESHOLD: u64 = 1_000;
pub const DEFAULT_RETRY_SLEEP: Duration = Duration::from_secs(2);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_BUFFER_CAPACITY: usize = 1_000;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const DEFAULT_MANAGER_ADDR: &str = "127.0.0.1:1519";
const DEFAULT_QUEUE_DIR: &str = "queue";

/// On-disk queue settings
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Directory exclusively owned by the forwarder
    pub dir: PathBuf,
    /// Maximum age of the active segment before rotation
    pub rotation_interval: Duration,
    /// Maximum size of a segment, in bytes
    pub segment_size: u64,
    /// Budget for inactive segments, in bytes
    pub disk_space_threshold: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_QUEUE_DIR),
            rotation_interval: DEFAULT_ROTATION_INTERVAL,
            segment_size: DEFAULT_SEGMENT_SIZE,
            disk_space_threshold: DISK_SPACE_THRESHOLD,
        }
    }
}

/// Forwarder configuration
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Address of the manager, e.g. "10.0.0.1:1519"
    pub manager_addr: String,
    /// Identity of this endpoint, registered on the manager
    pub uuid: Uuid,
    /// Key shared with the manager for this endpoint
    pub key: String,
    /// Key the manager has to prove it holds; `None` trusts any manager
    pub server_key: Option<String>,
    pub queue: QueueConfig,
    pub event_threshold: u64,
    /// Interval between reconnection and replay attempts
    pub retry_sleep: Duration,
    /// Bound on sending a batch and receiving its acknowledgement
    pub send_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Capacity of the in-memory buffer between `pipe_event` and the delivery loop
    pub buffer_capacity: usize,
    /// Maximum number of events per batch on the wire
    pub batch_size: usize,
    pub shutdown_grace: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            manager_addr: DEFAULT_MANAGER_ADDR.to_string(),
            uuid: Uuid::nil(),
            key: String::new(),
            server_key: None,
            queue: QueueConfig::default(),
            event_threshold: DEFAULT_EVENT_THRESHOLD,
            retry_sleep: DEFAULT_RETRY_SLEEP,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl ForwarderConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ForwarderError> {
        let defaults = Self::default();
        let uuid = match env_string("EDR_FORWARDER_UUID") {
            Some(uuid) => Uuid::parse_str(&uuid).map_err(|e| {
                ForwarderError::InvalidConfig(format!("EDR_FORWARDER_UUID is not a UUID: {e}"))
            })?,
            None => defaults.uuid,
        };

        let queue = QueueConfig {
            dir: env_string("EDR_FORWARDER_QUEUE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.queue.dir),
            rotation_interval: env_duration_ms("EDR_FORWARDER_ROTATION_INTERVAL_MS")
                .unwrap_or(defaults.queue.rotation_interval),
            segment_size: env_parse("EDR_FORWARDER_SEGMENT_SIZE")
                .unwrap_or(defaults.queue.segment_size),
            disk_space_threshold: env_parse("EDR_FORWARDER_DISK_SPACE_THRESHOLD")
                .unwrap_or(defaults.queue.disk_space_threshold),
        };

        let config = Self {
            manager_addr: env_string("EDR_FORWARDER_MANAGER_ADDR")
                .unwrap_or(defaults.manager_addr),
            uuid,
            key: env_string("EDR_FORWARDER_KEY").unwrap_or(defaults.key),
            server_key: env_string("EDR_FORWARDER_SERVER_KEY"),
            queue,
            event_threshold: env_parse("EDR_FORWARDER_EVENT_THRESHOLD")
                .unwrap_or(defaults.event_threshold),
            retry_sleep: env_duration_ms("EDR_FORWARDER_RETRY_SLEEP_MS")
                .unwrap_or(defaults.retry_sleep),
            send_timeout: env_duration_ms("EDR_FORWARDER_SEND_TIMEOUT_MS")
                .unwrap_or(defaults.send_timeout),
            handshake_timeout: env_duration_ms("EDR_FORWARDER_HANDSHAKE_TIMEOUT_MS")
                .unwrap_or(defaults.handshake_timeout),
            buffer_capacity: env_parse("EDR_FORWARDER_BUFFER_CAPACITY")
                .unwrap_or(defaults.buffer_capacity),
            batch_size: env_parse("EDR_FORWARDER_BATCH_SIZE").unwrap_or(defaults.batch_size),
            shutdown_grace: env_duration_ms("EDR_FORWARDER_SHUTDOWN_GRACE_MS")
                .unwrap_or(defaults.shutdown_grace),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ForwarderError> {
        let invalid = |msg: &str| Err(ForwarderError::InvalidConfig(msg.to_string()));

        if self.manager_addr.trim().is_empty() {
            return invalid("manager address cannot be empty");
        }
        if self.uuid.is_nil() {
            return invalid("endpoint UUID must be set");
        }
        if self.key.is_empty() {
            return invalid("endpoint key must be set");
        }
        if self.queue.segment_size == 0 {
            return invalid("queue segment size must be greater than 0");
        }
        if self.queue.disk_space_threshold < self.queue.segment_size {
            return invalid("disk space threshold must hold at least one segment");
        }
        if self.queue.rotation_interval < MIN_ROTATION_INTERVAL {
            return Err(ForwarderError::InvalidConfig(format!(
                "rotation interval must be at least {:?}",
                MIN_ROTATION_INTERVAL
            )));
        }
        if self.event_threshold == 0 {
            return invalid("event threshold must be greater than 0");
        }
        if self.retry_sleep.is_zero() {
            return invalid("retry sleep must be greater than 0");
        }
        if self.send_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return invalid("timeouts must be greater than 0");
        }
        if self.buffer_capacity == 0 || self.batch_size == 0 {
            return invalid("buffer capacity and batch size must be greater than 0");
        }
        Ok(())
    }
}
