// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use edr_protocol::util::{env_bool, env_duration_ms, env_parse, env_string};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::ManagerError;

const MEGABYTE: u64 = 1024 * 1024;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:1519";
pub const DEFAULT_LOG_BASENAME: &str = "events";
pub const DEFAULT_SEGMENT_SIZE: u64 = 100 * MEGABYTE;
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(3600);
pub const MIN_ROTATION_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const DEFAULT_LOG_ROOT: &str = "logs";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Layout and rotation of the event store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory, one subdirectory per endpoint
    pub root: PathBuf,
    /// Segments are named `<basename>.<seq>.log`
    pub basename: String,
    pub rotation_interval: Duration,
    /// Maximum size of a segment, in bytes
    pub segment_size: u64,
    /// Compress closed segments with zstd
    pub compress: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_LOG_ROOT),
            basename: DEFAULT_LOG_BASENAME.to_string(),
            rotation_interval: DEFAULT_ROTATION_INTERVAL,
            segment_size: DEFAULT_SEGMENT_SIZE,
            compress: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub listen_addr: String,
    /// Key the manager proves it holds to forwarders expecting it
    pub server_key: Option<String>,
    pub store: StoreConfig,
    pub handshake_timeout: Duration,
    /// Time given to sessions to finish their batch on shutdown
    pub shutdown_grace: Duration,
    pub log_level: String,
    /// Endpoints registered at startup
    pub endpoints: Vec<(Uuid, String)>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            server_key: None,
            store: StoreConfig::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            endpoints: Vec::new(),
        }
    }
}

impl ManagerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ManagerError> {
        let defaults = Self::default();
        let endpoints = match env_string("EDR_MANAGER_ENDPOINTS") {
            Some(list) => parse_endpoints(&list)?,
            None => defaults.endpoints,
        };

        let store = StoreConfig {
            root: env_string("EDR_MANAGER_LOG_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.store.root),
            basename: env_string("EDR_MANAGER_LOG_BASENAME").unwrap_or(defaults.store.basename),
            rotation_interval: env_duration_ms("EDR_MANAGER_ROTATION_INTERVAL_MS")
                .unwrap_or(defaults.store.rotation_interval),
            segment_size: env_parse("EDR_MANAGER_SEGMENT_SIZE")
                .unwrap_or(defaults.store.segment_size),
            compress: env_bool("EDR_MANAGER_COMPRESS").unwrap_or(defaults.store.compress),
        };

        let config = Self {
            listen_addr: env_string("EDR_MANAGER_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            server_key: env_string("EDR_MANAGER_SERVER_KEY"),
            store,
            handshake_timeout: env_duration_ms("EDR_MANAGER_HANDSHAKE_TIMEOUT_MS")
                .unwrap_or(defaults.handshake_timeout),
            shutdown_grace: env_duration_ms("EDR_MANAGER_SHUTDOWN_GRACE_MS")
                .unwrap_or(defaults.shutdown_grace),
            log_level: env_string("EDR_MANAGER_LOG_LEVEL")
                .map(|level| level.to_lowercase())
                .unwrap_or(defaults.log_level),
            endpoints,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ManagerError> {
        let invalid = |msg: &str| Err(ManagerError::InvalidConfig(msg.to_string()));

        if self.listen_addr.trim().is_empty() {
            return invalid("listen address cannot be empty");
        }
        if self.server_key.as_deref() == Some("") {
            return invalid("server key cannot be empty");
        }
        let basename = &self.store.basename;
        if basename.is_empty() || basename.contains(['/', '\\']) {
            return invalid("log basename must be a plain file name");
        }
        if self.store.segment_size == 0 {
            return invalid("segment size must be greater than 0");
        }
        if self.store.rotation_interval < MIN_ROTATION_INTERVAL {
            return Err(ManagerError::InvalidConfig(format!(
                "rotation interval must be at least {:?}",
                MIN_ROTATION_INTERVAL
            )));
        }
        if self.handshake_timeout.is_zero() {
            return invalid("handshake timeout must be greater than 0");
        }
        if let Some((uuid, _)) = self.endpoints.iter().find(|(_, key)| key.is_empty()) {
            return Err(ManagerError::InvalidConfig(format!(
                "endpoint {uuid} has an empty key"
            )));
        }
        Ok(())
    }
}

/// Parses a `uuid:key,uuid:key` endpoint list
fn parse_endpoints(list: &str) -> Result<Vec<(Uuid, String)>, ManagerError> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (uuid, key) = entry.split_once(':').ok_or_else(|| {
                ManagerError::InvalidConfig(format!("endpoint entry '{entry}' is not uuid:key"))
            })?;
            let uuid = Uuid::parse_str(uuid.trim()).map_err(|e| {
                ManagerError::InvalidConfig(format!("invalid endpoint UUID '{uuid}': {e}"))
            })?;
            Ok((uuid, key.trim().to_string()))
        })
        .collect()
}
