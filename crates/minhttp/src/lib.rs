// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Minimal HTTP/1 serving tools for the relay: a connection-limited server with graceful
//! shutdown, response helpers, and WebSocket upgrades

pub mod response;
pub mod server;
pub mod signal;
pub mod websocket;

pub use server::Server;
