// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Server side of the EDR event pipeline.
//!
//! The [`manager::Manager`] authenticates forwarders against the [`registry::EndpointRegistry`],
//! writes the events they send to a per-endpoint [`store::EventStore`], and acknowledges each
//! batch once it is on disk. The [`searcher::EventSearcher`] reads the store back by time range.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod errors;
pub mod manager;
pub mod registry;
pub mod searcher;
pub mod store;

pub use config::{ManagerConfig, StoreConfig};
pub use errors::{ManagerError, SearchError, SessionError, StoreError};
pub use manager::Manager;
pub use registry::EndpointRegistry;
pub use searcher::{EventSearcher, SearchIter};
pub use store::EventStore;
