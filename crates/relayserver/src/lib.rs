// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Relay broker: peers announce content over WebSockets and the relay brokers blob transfers
//! between them and HTTP clients.

pub mod bridge;
pub mod connections;
mod opts;
pub mod peer;
pub mod peer_messages;
pub mod router;
mod server;
pub mod socket;
pub mod throttle;

pub use opts::{CacheBackend, Config, Opts};
pub use peer::{serve_peer, PeerSession};
pub use router::{RelayRouter, RelaySettings};
pub use server::{run, serve, HttpSettings};
pub use socket::QueuedSocket;
