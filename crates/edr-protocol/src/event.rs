// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The event record shipped from forwarders to managers.
//!
//! The payload is opaque to the transport: only the creation timestamp (used by the searcher)
//! and the detection flag are interpreted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Creation time of the event on the endpoint
    pub timestamp: DateTime<Utc>,
    /// Whether the detection engine flagged this event
    #[serde(default)]
    pub detection: bool,
    /// Opaque event payload
    #[serde(default)]
    pub data: Value,
}

impl Event {
    /// Creates a regular event stamped with the current time.
    pub fn new(data: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            detection: false,
            data,
        }
    }

    /// Creates a detection event stamped with the current time.
    pub fn new_detection(data: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            detection: true,
            data,
        }
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_detection(&self) -> bool {
        self.detection
    }

    /// Serializes the event as a single JSON line, without the trailing newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}
