// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Endpoint-side forwarding of EDR events.
//!
//! A [`forwarder::Forwarder`] accepts events from the local agent and guarantees each of them
//! is either acknowledged by the manager or persisted in the [`queue::EventQueue`]. Queued
//! segments are replayed once the manager is reachable again, and the
//! [`disk_guardian::DiskGuardian`] keeps the queue within its disk budget.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod disk_guardian;
pub mod errors;
pub mod forwarder;
pub mod queue;

pub use config::{ForwarderConfig, QueueConfig};
pub use disk_guardian::{CleanupReport, DiskGuardian};
pub use errors::{DeliveryError, ForwarderError, QueueError};
pub use forwarder::{Forwarder, StatsSnapshot};
pub use queue::{EventQueue, SegmentInfo};
