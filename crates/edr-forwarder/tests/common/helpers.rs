// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for forwarder integration tests

use edr_forwarder::{EventQueue, ForwarderConfig, QueueConfig};
use edr_protocol::{generate_key, Event, DEFAULT_KEY_SIZE};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpListener;
use uuid::Uuid;

/// Address nothing listens on
pub async fn unused_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    listener.local_addr().expect("Failed to get local addr").to_string()
}

pub fn test_config(dir: &Path, manager_addr: String) -> ForwarderConfig {
    ForwarderConfig {
        manager_addr,
        uuid: Uuid::new_v4(),
        key: generate_key(DEFAULT_KEY_SIZE),
        queue: QueueConfig {
            dir: dir.to_path_buf(),
            ..Default::default()
        },
        retry_sleep: Duration::from_millis(100),
        send_timeout: Duration::from_millis(500),
        handshake_timeout: Duration::from_millis(500),
        shutdown_grace: Duration::from_secs(10),
        ..Default::default()
    }
}

pub fn emit_events(count: usize) -> impl Iterator<Item = Event> {
    (0..count).map(|i| {
        let data = json!({ "seq": i, "image": "C:\\Windows\\System32\\cmd.exe" });
        if i % 10 == 0 {
            Event::new_detection(data)
        } else {
            Event::new(data)
        }
    })
}

/// Number of events still sitting in the queue directory
pub fn queued_events(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .expect("Failed to read queue dir")
        .map(|entry| {
            let path = entry.expect("Failed to read entry").path();
            EventQueue::read_segment(&path)
                .map(|events| events.len())
                .unwrap_or(0)
        })
        .sum()
}

/// Polls `condition` until it holds or `deadline` expires
pub async fn wait_for(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}
