// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared building blocks of the EDR event-forwarding pipeline.
//!
//! Forwarders and managers speak newline-delimited JSON [`frame::Frame`]s over TCP. Every
//! connection starts with the mutual pre-shared-key exchange implemented in [`handshake`]
//! before a single [`event::Event`] is allowed on the wire.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod errors;
pub mod event;
pub mod frame;
pub mod handshake;
pub mod key;
pub mod util;

pub use errors::{HandshakeError, ProtocolError};
pub use event::Event;
pub use frame::{Frame, FrameReader, FrameWriter};
pub use key::{generate_key, DEFAULT_KEY_SIZE};
