// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The task that owns one peer's WebSocket

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::select;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, info_span, warn, Instrument};

use minhttp::websocket::WebSocket;

use crate::router::RelayRouter;
use crate::socket::{QueuedSocket, SocketHandle};

/// How long queued frames may take to flush once the peer's session is over.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What a connection has told the router about itself so far.
pub struct PeerSession {
    socket: SocketHandle,
    pub(crate) peer_id: Option<String>,
    pub(crate) topic: Option<String>,
}

impl PeerSession {
    pub fn new(socket: SocketHandle) -> Self {
        Self {
            socket,
            peer_id: None,
            topic: None,
        }
    }

    pub fn socket(&self) -> &SocketHandle {
        &self.socket
    }

    /// Set by the most recent `subscribe`.
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }
}

/// Reads frames from `socket` and hands them to `router` until the peer goes away or the
/// server shuts down.
pub async fn serve_peer(
    router: Arc<RelayRouter>,
    socket: WebSocket,
    mut shutdown: watch::Receiver<bool>,
) {
    let (handle, mut outgoing) = QueuedSocket::handle();
    let span = info_span!("peer", conn = %handle.id());

    async move {
        info!("Peer connected");
        let (mut sink, mut incoming) = socket.split();

        let mut writer = tokio::spawn(
            async move {
                while let Some(text) = outgoing.recv().await {
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        warn!("Couldn't send frame: {err}");
                        return;
                    }
                }
                // Every handle is gone, so nothing more will be sent
                let _ = sink.close().await;
            }
            .in_current_span(),
        );

        let mut session = PeerSession::new(handle);
        loop {
            let received = select! {
                _ = shutdown.wait_for(|&done| done) => {
                    info!("Closing peer connection for shutdown");
                    break;
                }
                received = incoming.next() => received,
            };
            match received {
                Some(Ok(Message::Text(text))) => router.handle_text(&mut session, &text).await,
                Some(Ok(Message::Close(frame))) => {
                    debug!("Peer closed the connection: {frame:?}");
                    break;
                }
                // tungstenite answers pings itself
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("Peer connection failed: {err}");
                    break;
                }
                None => break,
            }
        }

        router.disconnect(&session);
        drop(session);
        if timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
            writer.abort();
        }
        info!("Peer disconnected");
    }
    .instrument(span)
    .await
}
