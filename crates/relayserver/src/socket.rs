// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Handles to peer connections that the router can send frames through

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

/// Process-unique identity of one peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SocketError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
}

/// Outgoing half of a peer connection.
///
/// Sending never waits on the network; frames are queued for the connection's writer.
pub trait PeerSocket: Send + Sync + 'static {
    fn id(&self) -> ConnectionId;

    fn send_text(&self, text: String) -> Result<(), SocketError>;
}

pub type SocketHandle = Arc<dyn PeerSocket>;

/// [`PeerSocket`] backed by an unbounded queue, drained by whoever owns the receiver.
#[derive(Debug)]
pub struct QueuedSocket {
    id: ConnectionId,
    outgoing: mpsc::UnboundedSender<String>,
}

impl QueuedSocket {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outgoing, receiver) = mpsc::unbounded_channel();
        let socket = Self {
            id: ConnectionId::next(),
            outgoing,
        };
        (socket, receiver)
    }

    /// Shorthand for a [`SocketHandle`] plus the receiver of everything sent through it.
    pub fn handle() -> (SocketHandle, mpsc::UnboundedReceiver<String>) {
        let (socket, receiver) = Self::new();
        (Arc::new(socket), receiver)
    }
}

impl PeerSocket for QueuedSocket {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send_text(&self, text: String) -> Result<(), SocketError> {
        self.outgoing
            .send(text)
            .map_err(|_| SocketError::Closed(self.id))
    }
}
