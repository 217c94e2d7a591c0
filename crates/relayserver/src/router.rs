// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The relay protocol: subscriptions, announcements, and brokering blob transfers between
//! peers.

use std::collections::HashSet;
use std::fmt::Display;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};

use relay_cache::{ByteStream, PutBlob, RelayCache};
use relay_types::{Frame, Message, PeerMessage, RequestId};

use crate::bridge::{
    BridgeRegistry, BridgeSettings, FirstChunkError, OfferError, Producer, ProducerError,
};
use crate::connections::{ConnectionInfo, ConnectionRegistry};
use crate::peer::PeerSession;
use crate::peer_messages::PeerMessageRegistry;
use crate::socket::{SocketError, SocketHandle};

#[derive(Clone, Debug, PartialEq)]
pub struct RelaySettings {
    pub bridge: BridgeSettings,
    /// Uploads are fed into the bridge in pieces of at most this many bytes.
    pub chunk_size: usize,
    /// How long each candidate peer gets to start uploading.
    pub first_chunk_timeout: Duration,
    pub max_peer_attempts: usize,
    /// Try candidate peers in random order, spreading load. Otherwise they're tried by peer id.
    pub shuffle_candidates: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bridge: BridgeSettings::default(),
            chunk_size: 32 * 1024,
            first_chunk_timeout: Duration::from_secs(5),
            max_peer_attempts: 3,
            shuffle_candidates: true,
        }
    }
}

/// Why one candidate peer couldn't serve a blob.
#[derive(thiserror::Error, Debug)]
pub enum AttemptError {
    #[error("Peer connection not available")]
    NotConnected,
    #[error("Failed to send request: {0}")]
    Send(#[from] SocketError),
    #[error("Peer did not respond in time")]
    NoResponse,
    #[error("Peer aborted the transfer")]
    Aborted,
}

impl From<FirstChunkError> for AttemptError {
    fn from(err: FirstChunkError) -> Self {
        match err {
            FirstChunkError::TimedOut(_) => AttemptError::NoResponse,
            FirstChunkError::Aborted => AttemptError::Aborted,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("No peers found for content: {0}")]
    NoPeers(String),
    #[error("{key} (tried {attempts} peer(s), last error: {last_error})")]
    AllAttemptsFailed {
        key: String,
        attempts: usize,
        last_error: String,
    },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum UploadError {
    #[error("Missing Content-Type, Content-Length or requestId")]
    MissingHeaders,
    #[error("There was no request for requestId: {0}")]
    UnknownRequest(RequestId),
    #[error("Request {0} was cancelled or already completed")]
    Cancelled(RequestId),
    #[error("Transfer cancelled: receiving peer disconnected")]
    ReceiverGone,
    #[error("Transfer failed: receiver timeout")]
    ReceiverTimeout,
    #[error("Transfer incomplete: expected {expected} bytes, received {received} bytes")]
    Incomplete { expected: u64, received: u64 },
    #[error("Transfer interrupted: {0}")]
    Body(String),
    #[error("Transfer failed: could not signal completion")]
    EofTimeout,
}

impl From<OfferError> for UploadError {
    fn from(err: OfferError) -> Self {
        match err {
            OfferError::TimedOut(_) => UploadError::ReceiverTimeout,
            OfferError::ReceiverGone => UploadError::ReceiverGone,
        }
    }
}

/// A blob ready to be streamed to a client.
pub struct BlobBody {
    pub content_type: String,
    pub length: u64,
    pub stream: ByteStream,
    pub from_cache: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub connections: usize,
    pub peer_messages: usize,
    pub cached_bytes: u64,
    pub in_flight_transfers: usize,
}

/// Removes a key from the set of blobs being prefetched when the prefetch ends.
struct FetchGuard {
    fetching: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl FetchGuard {
    /// `None` if `key` is already being fetched.
    fn claim(fetching: &Arc<Mutex<HashSet<String>>>, key: &str) -> Option<Self> {
        fetching.lock().unwrap().insert(key.to_owned()).then(|| Self {
            fetching: fetching.clone(),
            key: key.to_owned(),
        })
    }
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        self.fetching.lock().unwrap().remove(&self.key);
    }
}

pub struct RelayRouter {
    connections: ConnectionRegistry,
    peer_messages: PeerMessageRegistry,
    bridges: Arc<BridgeRegistry>,
    cache: Option<Arc<dyn RelayCache>>,
    fetching: Arc<Mutex<HashSet<String>>>,
    settings: RelaySettings,
}

impl RelayRouter {
    pub fn new(cache: Option<Arc<dyn RelayCache>>, settings: RelaySettings) -> Self {
        Self {
            connections: ConnectionRegistry::default(),
            peer_messages: PeerMessageRegistry::default(),
            bridges: Arc::new(BridgeRegistry::new(settings.bridge)),
            cache,
            fetching: Default::default(),
            settings,
        }
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn peer_messages(&self) -> &PeerMessageRegistry {
        &self.peer_messages
    }

    pub fn bridges(&self) -> &Arc<BridgeRegistry> {
        &self.bridges
    }

    pub fn cache(&self) -> Option<&Arc<dyn RelayCache>> {
        self.cache.as_ref()
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Number of registered `(peer, topic)` connections.
    pub fn connection_count(&self) -> usize {
        self.connections.size()
    }

    pub fn is_fetching(&self, key: &str) -> bool {
        self.fetching.lock().unwrap().contains(key)
    }

    pub async fn status(&self) -> RelayStatus {
        let cached_bytes = match &self.cache {
            Some(cache) => cache.current_size().await,
            None => 0,
        };
        RelayStatus {
            connections: self.connection_count(),
            peer_messages: self.peer_messages.size(),
            cached_bytes,
            in_flight_transfers: self.bridges.len(),
        }
    }

    /// Handles one text frame received on `session`'s connection.
    ///
    /// Bad frames are logged and dropped; the connection stays usable.
    pub async fn handle_text(self: &Arc<Self>, session: &mut PeerSession, text: &str) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("Ignoring frame: {err}");
                return;
            }
        };
        debug!("Received {} frame", frame.action());
        match frame {
            Frame::Subscribe { peer_id, topic } => self.subscribe(session, peer_id, topic).await,
            Frame::Message { message } => self.publish(session, message, text).await,
            Frame::RequestBlob { key, .. } => {
                warn!("Ignoring requestBlob for {key}: peers may not request blobs this way")
            }
        }
    }

    async fn subscribe(&self, session: &mut PeerSession, peer_id: String, topic: String) {
        info!("Peer {peer_id} subscribed to topic {topic:?}");
        session.peer_id = Some(peer_id.clone());
        session.topic = Some(topic.clone());
        if peer_id.is_empty() || topic.is_empty() {
            warn!("Not registering a subscription with an empty peer id or topic");
            return;
        }

        let info = ConnectionInfo::new(&peer_id, &topic, session.socket().clone());
        if let Some(replaced) = self.connections.add(info) {
            if replaced.connection_id() != session.socket().id() {
                info!(
                    "Replaced connection {} for {peer_id}:{topic}",
                    replaced.connection_id()
                );
            }
        }

        // A peer that already claims something has seen the topic before
        if !self.peer_messages.has_peer(&peer_id) {
            self.replay(session.socket(), &topic).await;
        }
    }

    /// Sends the topic's history, oldest first and once per key: claimed messages, then
    /// cached ones.
    async fn replay(&self, socket: &SocketHandle, topic: &str) {
        let claimed = self
            .peer_messages
            .find_by_topic(topic)
            .into_iter()
            .map(|claim| claim.message);
        let cached = match &self.cache {
            Some(cache) => cache.get_messages(topic).await,
            None => vec![],
        };

        let mut sent = HashSet::new();
        for message in claimed.chain(cached) {
            if !sent.insert(message.key.clone()) {
                continue;
            }
            if let Err(err) = socket.send_text(Frame::from(message).to_json()) {
                warn!("Stopping replay: {err}");
                return;
            }
        }
        debug!("Replayed {} messages in topic {topic:?}", sent.len());
    }

    async fn publish(self: &Arc<Self>, session: &PeerSession, message: Message, text: &str) {
        let (Some(peer_id), Some(_)) = (session.peer_id(), session.topic()) else {
            warn!("Received message {} before subscription, ignoring", message.key);
            return;
        };
        self.peer_messages
            .add(PeerMessage::new(peer_id, message.clone()));

        if let Some(cache) = &self.cache {
            if let Err(err) = cache.put_message(&message).await {
                error!("Couldn't cache message {}: {err}", message.key);
            }
            self.start_prefetch(cache, &message, peer_id).await;
        }

        let mut relayed = 0;
        for info in self.connections.find_by_topic(&message.topic) {
            if info.peer_id == peer_id || self.peer_messages.has_message(&info.peer_id, &message.key)
            {
                continue;
            }
            match info.socket.send_text(text.to_owned()) {
                Ok(()) => relayed += 1,
                Err(err) => warn!("Failed to relay {} to {}: {err}", message.key, info.peer_id),
            }
        }
        debug!("Relayed {} to {relayed} peers", message.key);
    }

    /// Drops everything registered through `session`'s connection.
    ///
    /// The peer's claims are kept while it still has other connections open.
    pub fn disconnect(&self, session: &PeerSession) {
        let removed = self.connections.remove_by_socket(session.socket().id());
        if let Some(peer_id) = session.peer_id() {
            if self.connections.find_by_peer_id(peer_id).is_empty() {
                let claims = self.peer_messages.remove_by_peer_id(peer_id);
                info!("Removed {claims} messages for peer {peer_id}");
            }
        }
        debug!("Dropped {} subscriptions", removed.len());
    }

    /// Opens a bridge, asks `peer_id` to upload `key` into it, and waits for the upload to
    /// start.
    async fn attempt(&self, key: &str, peer_id: &str) -> Result<ByteStream, AttemptError> {
        let pending = self.bridges.open();
        let request_id = pending.request_id().clone();
        let connection = self
            .connections
            .find_by_peer_id(peer_id)
            .into_iter()
            .next()
            .ok_or(AttemptError::NotConnected)?;
        connection
            .socket
            .send_text(Frame::request_blob(key, &request_id).to_json())?;
        debug!("Requested {key} from {peer_id} as {request_id}");

        let result = pending.first_chunk(self.settings.first_chunk_timeout).await;
        if let Err(FirstChunkError::TimedOut(_)) = result {
            // A late upload must not be accepted into nothing
            self.bridges.mark_cancelled(&request_id);
        }
        Ok(result?)
    }

    /// Produces the blob `key`, from the cache if possible and otherwise from a peer that
    /// claims it.
    pub async fn fetch_blob(&self, key: &str) -> Result<BlobBody, FetchError> {
        if let Some(cache) = &self.cache {
            if let Some(blob) = cache.get_blob(key).await {
                info!("Serving blob from cache: {key}");
                return Ok(BlobBody {
                    content_type: blob.message.content_type.clone(),
                    length: blob.size_bytes(),
                    stream: blob.open_stream(),
                    from_cache: true,
                });
            }
        }

        let candidates = self.candidates(key);
        if candidates.is_empty() {
            info!("No peers have the requested key: {key}");
            return Err(FetchError::NoPeers(key.to_owned()));
        }

        let attempts = candidates.len().min(self.settings.max_peer_attempts.max(1));
        let mut last_error = None;
        for (index, candidate) in candidates.iter().take(attempts).enumerate() {
            info!(
                "Requesting blob {key} from peer {} (attempt {}/{attempts})",
                candidate.peer_id,
                index + 1
            );
            match self.attempt(key, &candidate.peer_id).await {
                Ok(stream) => {
                    return Ok(BlobBody {
                        content_type: candidate.message.content_type.clone(),
                        length: candidate.message.length,
                        stream,
                        from_cache: false,
                    })
                }
                Err(err) => {
                    warn!("Peer {} couldn't provide {key}: {err}", candidate.peer_id);
                    last_error = Some(err);
                }
            }
        }

        let last_error = last_error.map_or_else(|| "Unknown error".to_owned(), |e| e.to_string());
        info!("Failed to get content for key {key} after {attempts} attempts: {last_error}");
        Err(FetchError::AllAttemptsFailed {
            key: key.to_owned(),
            attempts,
            last_error,
        })
    }

    /// Content type and length of `key`, without transferring it.
    pub async fn describe_blob(&self, key: &str) -> Option<(String, u64)> {
        if let Some(cache) = &self.cache {
            if let Some(blob) = cache.get_blob(key).await {
                return Some((blob.message.content_type.clone(), blob.size_bytes()));
            }
        }
        self.peer_messages
            .find_by_key(key)
            .into_iter()
            .next()
            .map(|claim| (claim.message.content_type, claim.message.length))
    }

    /// One claim per peer, in the order they should be tried.
    fn candidates(&self, key: &str) -> Vec<PeerMessage> {
        let mut candidates = self.peer_messages.find_by_key(key);
        candidates.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        candidates.dedup_by(|a, b| a.peer_id == b.peer_id);
        if self.settings.shuffle_candidates {
            candidates.shuffle(&mut rand::thread_rng());
        }
        candidates
    }

    /// Feeds a peer's upload for `request_id` into the waiting bridge.
    ///
    /// Returns the number of bytes relayed. Any failure once the upload has been accepted
    /// cancels `request_id` and aborts the receiving side.
    pub async fn send_blob<S, E>(
        &self,
        request_id: &RequestId,
        content_type: Option<&str>,
        content_length: Option<u64>,
        body: S,
    ) -> Result<u64, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let (Some(_), Some(expected)) = (content_type, content_length) else {
            return Err(UploadError::MissingHeaders);
        };
        let producer = self.bridges.producer(request_id).map_err(|err| match err {
            ProducerError::Unknown => UploadError::UnknownRequest(request_id.clone()),
            ProducerError::Cancelled => {
                info!("Rejecting sendBlob for cancelled requestId: {request_id}");
                UploadError::Cancelled(request_id.clone())
            }
        })?;

        match self.copy_into_bridge(&producer, expected, body).await {
            Ok(total) => {
                info!("Successfully relayed {total} bytes for request {request_id}");
                Ok(total)
            }
            Err(err) => {
                warn!("Upload for request {request_id} failed: {err}");
                self.bridges.mark_cancelled(request_id);
                if !producer.is_closed() {
                    producer.abort().await;
                }
                self.bridges.remove(request_id);
                Err(err)
            }
        }
    }

    async fn copy_into_bridge<S, E>(
        &self,
        producer: &Producer,
        expected: u64,
        body: S,
    ) -> Result<u64, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let chunk_size = self.settings.chunk_size.max(1);
        let mut body = pin!(body);
        let mut total = 0u64;
        while total < expected {
            if producer.is_closed() {
                return Err(UploadError::ReceiverGone);
            }
            let Some(chunk) = body.next().await else {
                break;
            };
            let mut chunk = chunk.map_err(|err| UploadError::Body(err.to_string()))?;
            // Anything past the declared length is ignored
            chunk.truncate((expected - total).min(chunk.len() as u64) as usize);
            while !chunk.is_empty() {
                let piece = chunk.split_to(chunk_size.min(chunk.len()));
                total += piece.len() as u64;
                producer.offer(piece).await?;
            }
        }
        if total != expected {
            return Err(UploadError::Incomplete {
                expected,
                received: total,
            });
        }
        producer.finish().await.map_err(|err| match err {
            OfferError::TimedOut(_) => UploadError::EofTimeout,
            OfferError::ReceiverGone => UploadError::ReceiverGone,
        })?;
        Ok(total)
    }

    /// Kicks off caching of `message`'s blob from `source`, unless it's cached, too large to
    /// cache, or already being fetched.
    async fn start_prefetch(
        self: &Arc<Self>,
        cache: &Arc<dyn RelayCache>,
        message: &Message,
        source: &str,
    ) {
        if !cache.limits().admits(message.length) {
            debug!("Not prefetching {}: too large to cache", message.key);
            return;
        }
        if cache.get_blob(&message.key).await.is_some() {
            return;
        }
        let Some(guard) = FetchGuard::claim(&self.fetching, &message.key) else {
            debug!("Blob {} is already being fetched", message.key);
            return;
        };

        let router = self.clone();
        let cache = cache.clone();
        let message = message.clone();
        let source = source.to_owned();
        let span = info_span!("prefetch", key = %message.key);
        tokio::spawn(
            async move {
                let _guard = guard;
                router.prefetch(cache.as_ref(), &message, &source).await;
            }
            .instrument(span),
        );
    }

    async fn prefetch(&self, cache: &dyn RelayCache, message: &Message, source: &str) {
        info!("Fetching blob for caching from peer {source}");
        let stream = match self.attempt(&message.key, source).await {
            Ok(stream) => stream,
            Err(err) => {
                info!("Couldn't fetch blob for caching: {err}");
                return;
            }
        };
        match cache.put_blob(message, Box::new(move || stream)).await {
            Ok(PutBlob::Stored { bytes }) => info!("Cached blob ({bytes} bytes)"),
            Ok(PutBlob::TooLarge { limit }) => info!("Blob exceeds the {limit} byte cache limit"),
            Err(err) => warn!("Couldn't cache blob: {err}"),
        }
    }
}
