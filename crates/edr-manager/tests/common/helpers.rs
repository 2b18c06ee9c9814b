// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for end-to-end tests between forwarders and a manager

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use edr_forwarder::{ForwarderConfig, QueueConfig};
use edr_manager::{EventSearcher, ManagerConfig, StoreConfig};
use edr_protocol::{generate_key, Event, DEFAULT_KEY_SIZE};
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

pub struct Endpoint {
    pub uuid: Uuid,
    pub key: String,
}

impl Endpoint {
    pub fn generate() -> Self {
        Endpoint {
            uuid: Uuid::new_v4(),
            key: generate_key(DEFAULT_KEY_SIZE),
        }
    }
}

pub fn manager_config(root: &Path) -> ManagerConfig {
    ManagerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        store: StoreConfig {
            root: root.to_path_buf(),
            segment_size: 64 * 1024,
            ..Default::default()
        },
        handshake_timeout: Duration::from_secs(2),
        shutdown_grace: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn forwarder_config(
    queue_dir: &Path,
    manager_addr: String,
    endpoint: &Endpoint,
) -> ForwarderConfig {
    ForwarderConfig {
        manager_addr,
        uuid: endpoint.uuid,
        key: endpoint.key.clone(),
        queue: QueueConfig {
            dir: queue_dir.to_path_buf(),
            ..Default::default()
        },
        retry_sleep: Duration::from_millis(100),
        send_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        shutdown_grace: Duration::from_secs(10),
        ..Default::default()
    }
}

pub fn emit_events(count: usize) -> impl Iterator<Item = Event> {
    (0..count).map(|i| {
        let event_id = if i % 7 == 0 { 1 } else { 3 };
        let data = json!({
            "seq": i,
            "channel": "Microsoft-Windows-Sysmon/Operational",
            "event_id": event_id,
        });
        if i % 50 == 0 {
            Event::new_detection(data)
        } else {
            Event::new(data)
        }
    })
}

pub fn all_time() -> (DateTime<Utc>, DateTime<Utc>) {
    (DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)
}

/// Distinct `seq` values stored for the searched endpoints
pub fn stored_seqs(searcher: &EventSearcher) -> HashSet<u64> {
    let (start, end) = all_time();
    searcher
        .events(start, end, "", None, 0)
        .expect("search failed")
        .filter_map(|e| e.data["seq"].as_u64())
        .collect()
}

pub async fn wait_for(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
