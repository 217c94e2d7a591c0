// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Streaming bridge: turns a peer's upload into the body of a different, waiting response.
//!
//! Each in-flight transfer is a bounded queue keyed by [`RequestId`]. The fetching side
//! [`open`](BridgeRegistry::open)s an entry and waits for the first chunk; the uploading side
//! looks the entry up with [`producer`](BridgeRegistry::producer) and offers chunks to it.
//! The entry is removed exactly once, when the consuming side goes away.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{stream, StreamExt};
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TryRecvError};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use relay_cache::ByteStream;
use relay_types::RequestId;

/// Largest item the consuming stream yields when it merges already-queued chunks.
const COALESCE_LIMIT: usize = 64 * 1024;

/// How long an abort notice may wait for queue space.
const ABORT_TIMEOUT: Duration = Duration::from_secs(1);

/// Item carried by a bridge queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BridgeChunk {
    Data(Bytes),
    /// The upload completed.
    Eof,
    /// The upload failed; the consumer must not treat what it got as complete.
    Abort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BridgeSettings {
    /// Chunks buffered per transfer before the uploader has to wait.
    pub queue_capacity: usize,
    pub offer_timeout: Duration,
    pub eof_timeout: Duration,
    /// A consumer waiting longer than this for the next chunk ends the stream.
    pub idle_timeout: Duration,
    /// Cancellation records are only swept once there are more than this many.
    pub cancelled_retention: usize,
    pub cancelled_ttl: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            offer_timeout: Duration::from_secs(120),
            eof_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            cancelled_retention: 1000,
            cancelled_ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// Why the first chunk of a transfer never arrived.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum FirstChunkError {
    #[error("no data within {0:?}")]
    TimedOut(Duration),
    #[error("the upload was aborted")]
    Aborted,
}

/// Why an uploader can't feed a transfer.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ProducerError {
    #[error("unknown request id")]
    Unknown,
    #[error("request was cancelled")]
    Cancelled,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum OfferError {
    #[error("receiver did not accept data within {0:?}")]
    TimedOut(Duration),
    #[error("receiver is gone")]
    ReceiverGone,
}

pub struct BridgeRegistry {
    settings: BridgeSettings,
    entries: Mutex<HashMap<RequestId, mpsc::Sender<BridgeChunk>>>,
    cancelled: Mutex<HashMap<RequestId, Instant>>,
    opened: AtomicU64,
}

impl BridgeRegistry {
    pub fn new(settings: BridgeSettings) -> Self {
        Self {
            settings,
            entries: Default::default(),
            cancelled: Default::default(),
            opened: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Allocates a fresh request id and the queue its upload will feed.
    pub fn open(self: &Arc<Self>) -> PendingTransfer {
        let request_id = RequestId::new_unique();
        let (sender, receiver) = mpsc::channel(self.settings.queue_capacity.max(1));
        self.entries
            .lock()
            .unwrap()
            .insert(request_id.clone(), sender);
        self.opened.fetch_add(1, Ordering::Relaxed);
        debug!("Opened bridge {request_id}");
        PendingTransfer {
            receiver,
            idle_timeout: self.settings.idle_timeout,
            guard: EntryGuard {
                registry: self.clone(),
                request_id,
            },
        }
    }

    /// Uploader's handle on `request_id`. Cancelled ids are rejected even if still open.
    pub fn producer(&self, request_id: &RequestId) -> Result<Producer, ProducerError> {
        if self.is_cancelled(request_id) {
            return Err(ProducerError::Cancelled);
        }
        let sender = self
            .entries
            .lock()
            .unwrap()
            .get(request_id)
            .cloned()
            .ok_or(ProducerError::Unknown)?;
        Ok(Producer {
            request_id: request_id.clone(),
            sender,
            offer_timeout: self.settings.offer_timeout,
            eof_timeout: self.settings.eof_timeout,
        })
    }

    /// Drops the entry for `request_id`. Returns whether there was one.
    pub fn remove(&self, request_id: &RequestId) -> bool {
        self.entries.lock().unwrap().remove(request_id).is_some()
    }

    pub fn is_cancelled(&self, request_id: &RequestId) -> bool {
        self.cancelled.lock().unwrap().contains_key(request_id)
    }

    /// Records that late uploads for `request_id` must be rejected.
    ///
    /// Once more than `cancelled_retention` ids are recorded, records older than
    /// `cancelled_ttl` are swept.
    pub fn mark_cancelled(&self, request_id: &RequestId) {
        let mut cancelled = self.cancelled.lock().unwrap();
        cancelled.insert(request_id.clone(), Instant::now());
        if cancelled.len() > self.settings.cancelled_retention {
            let ttl = self.settings.cancelled_ttl;
            let before = cancelled.len();
            cancelled.retain(|_, at| at.elapsed() < ttl);
            debug!(
                "Swept {} expired cancellation records",
                before - cancelled.len()
            );
        }
    }

    pub fn cancelled_len(&self) -> usize {
        self.cancelled.lock().unwrap().len()
    }

    /// Number of transfers currently in flight.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries ever opened.
    pub fn opened_total(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }
}

/// Removes a bridge entry when the consuming side is dropped.
struct EntryGuard {
    registry: Arc<BridgeRegistry>,
    request_id: RequestId,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        if self.registry.remove(&self.request_id) {
            debug!("Closed bridge {}", self.request_id);
        }
    }
}

/// Consuming side of a transfer whose upload hasn't started yet.
pub struct PendingTransfer {
    receiver: mpsc::Receiver<BridgeChunk>,
    idle_timeout: Duration,
    guard: EntryGuard,
}

impl PendingTransfer {
    pub fn request_id(&self) -> &RequestId {
        &self.guard.request_id
    }

    /// Waits up to `wait` for the upload to begin, then hands over the transfer as a stream
    /// that starts with that first chunk.
    ///
    /// On failure the entry is freed.
    pub async fn first_chunk(mut self, wait: Duration) -> Result<ByteStream, FirstChunkError> {
        let first = match timeout(wait, self.receiver.recv()).await {
            Err(_) => return Err(FirstChunkError::TimedOut(wait)),
            Ok(Some(BridgeChunk::Data(bytes))) => Some(bytes),
            Ok(Some(BridgeChunk::Eof)) => None,
            Ok(Some(BridgeChunk::Abort) | None) => return Err(FirstChunkError::Aborted),
        };
        let finish = first.is_none().then_some(Finish::Eof);
        Ok(self.into_stream(first, finish))
    }

    fn into_stream(self, pending: Option<Bytes>, finish: Option<Finish>) -> ByteStream {
        let consumer = Consumer {
            receiver: self.receiver,
            idle_timeout: self.idle_timeout,
            guard: self.guard,
            pending,
            finish,
        };
        stream::unfold(consumer, Consumer::next_item).boxed()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Finish {
    Eof,
    Abort,
}

struct Consumer {
    receiver: mpsc::Receiver<BridgeChunk>,
    idle_timeout: Duration,
    guard: EntryGuard,
    pending: Option<Bytes>,
    /// How the stream ends once `pending` is drained.
    finish: Option<Finish>,
}

impl Consumer {
    async fn next_item(mut self) -> Option<(io::Result<Bytes>, Self)> {
        let first = match self.pending.take() {
            Some(bytes) => bytes,
            None => match self.finish {
                Some(Finish::Eof) => return None,
                Some(Finish::Abort) => {
                    self.finish = Some(Finish::Eof);
                    return Some((Err(aborted(&self.guard.request_id)), self));
                }
                None => match timeout(self.idle_timeout, self.receiver.recv()).await {
                    Ok(Some(BridgeChunk::Data(bytes))) => bytes,
                    Ok(Some(BridgeChunk::Eof)) => return None,
                    Ok(Some(BridgeChunk::Abort) | None) => {
                        self.finish = Some(Finish::Eof);
                        return Some((Err(aborted(&self.guard.request_id)), self));
                    }
                    Err(_) => {
                        warn!(
                            "Bridge {} idle for {:?}, ending stream",
                            self.guard.request_id, self.idle_timeout
                        );
                        return None;
                    }
                },
            },
        };
        let item = self.coalesce(first);
        Some((Ok(item), self))
    }

    /// Appends chunks that are already queued, without waiting for more.
    fn coalesce(&mut self, first: Bytes) -> Bytes {
        if self.finish.is_some() || first.len() >= COALESCE_LIMIT {
            return first;
        }
        let mut merged: Option<BytesMut> = None;
        let mut size = first.len();
        while size < COALESCE_LIMIT {
            match self.receiver.try_recv() {
                Ok(BridgeChunk::Data(bytes)) => {
                    size += bytes.len();
                    merged
                        .get_or_insert_with(|| BytesMut::from(&first[..]))
                        .extend_from_slice(&bytes);
                }
                Ok(BridgeChunk::Eof) => {
                    self.finish = Some(Finish::Eof);
                    break;
                }
                Ok(BridgeChunk::Abort) | Err(TryRecvError::Disconnected) => {
                    self.finish = Some(Finish::Abort);
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
        merged.map_or(first, BytesMut::freeze)
    }
}

fn aborted(request_id: &RequestId) -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionAborted,
        format!("upload for {request_id} was aborted"),
    )
}

/// Uploading side of a transfer.
pub struct Producer {
    request_id: RequestId,
    sender: mpsc::Sender<BridgeChunk>,
    offer_timeout: Duration,
    eof_timeout: Duration,
}

impl Producer {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Whether the consuming side has gone away.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub async fn offer(&self, chunk: Bytes) -> Result<(), OfferError> {
        self.send(BridgeChunk::Data(chunk), self.offer_timeout).await
    }

    /// Signals a complete upload.
    pub async fn finish(&self) -> Result<(), OfferError> {
        self.send(BridgeChunk::Eof, self.eof_timeout).await
    }

    /// Tells the consumer the upload failed. Best effort.
    pub async fn abort(&self) {
        if let Err(err) = self.send(BridgeChunk::Abort, ABORT_TIMEOUT).await {
            info!("Couldn't deliver abort for {}: {err}", self.request_id);
        }
    }

    async fn send(&self, chunk: BridgeChunk, wait: Duration) -> Result<(), OfferError> {
        self.sender
            .send_timeout(chunk, wait)
            .await
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => OfferError::TimedOut(wait),
                SendTimeoutError::Closed(_) => OfferError::ReceiverGone,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::TryStreamExt;

    fn registry() -> Arc<BridgeRegistry> {
        Arc::new(BridgeRegistry::new(BridgeSettings::default()))
    }

    async fn collect(stream: ByteStream) -> io::Result<Vec<u8>> {
        stream
            .try_fold(Vec::new(), |mut all, chunk| async move {
                all.extend_from_slice(&chunk);
                Ok(all)
            })
            .await
    }

    #[tokio::test]
    async fn reassembles_chunks_until_eof() {
        let registry = registry();
        let pending = registry.open();
        let producer = registry.producer(pending.request_id()).unwrap();

        producer.offer(Bytes::from_static(b"AB")).await.unwrap();
        let stream = pending.first_chunk(Duration::from_secs(5)).await.unwrap();
        producer.offer(Bytes::from_static(b"CD")).await.unwrap();
        producer.finish().await.unwrap();

        assert_eq!(collect(stream).await.unwrap(), b"ABCD");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn merges_chunks_that_are_already_queued() {
        let registry = registry();
        let pending = registry.open();
        let producer = registry.producer(pending.request_id()).unwrap();
        for chunk in [&b"AB"[..], b"CD", b"EF"] {
            producer.offer(Bytes::from_static(chunk)).await.unwrap();
        }
        producer.finish().await.unwrap();

        let mut stream = pending.first_chunk(Duration::from_secs(5)).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "ABCDEF");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn empty_uploads_are_empty_streams() {
        let registry = registry();
        let pending = registry.open();
        registry
            .producer(pending.request_id())
            .unwrap()
            .finish()
            .await
            .unwrap();
        let stream = pending.first_chunk(Duration::from_secs(5)).await.unwrap();
        assert!(collect(stream).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn first_chunk_timeout_frees_the_entry() {
        let registry = registry();
        let pending = registry.open();
        assert_eq!(registry.len(), 1);
        let result = pending.first_chunk(Duration::from_secs(5)).await;
        assert_eq!(
            result.err(),
            Some(FirstChunkError::TimedOut(Duration::from_secs(5)))
        );
        assert!(registry.is_empty());
        assert_eq!(registry.opened_total(), 1);
    }

    #[tokio::test]
    async fn abort_after_data_is_an_error() {
        let registry = registry();
        let pending = registry.open();
        let producer = registry.producer(pending.request_id()).unwrap();
        producer.offer(Bytes::from_static(b"AB")).await.unwrap();
        producer.abort().await;

        let mut stream = pending.first_chunk(Duration::from_secs(5)).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "AB");
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn abort_before_data_fails_the_attempt() {
        let registry = registry();
        let pending = registry.open();
        registry
            .producer(pending.request_id())
            .unwrap()
            .abort()
            .await;
        let result = pending.first_chunk(Duration::from_secs(5)).await;
        assert_eq!(result.err(), Some(FirstChunkError::Aborted));
        assert!(registry.is_empty());
    }

    #[tracing_test::traced_test]
    #[tokio::test(start_paused = true)]
    async fn idle_consumers_end_the_stream() {
        let registry = registry();
        let pending = registry.open();
        let producer = registry.producer(pending.request_id()).unwrap();
        producer.offer(Bytes::from_static(b"AB")).await.unwrap();

        let stream = pending.first_chunk(Duration::from_secs(5)).await.unwrap();
        assert_eq!(collect(stream).await.unwrap(), b"AB");
        assert!(logs_contain("idle for 30s"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn dropping_the_consumer_stops_the_producer() {
        let registry = registry();
        let pending = registry.open();
        let producer = registry.producer(pending.request_id()).unwrap();
        producer.offer(Bytes::from_static(b"AB")).await.unwrap();

        let stream = pending.first_chunk(Duration::from_secs(5)).await.unwrap();
        drop(stream);
        assert!(registry.is_empty());
        assert!(producer.is_closed());
        assert_eq!(
            producer.offer(Bytes::from_static(b"CD")).await,
            Err(OfferError::ReceiverGone)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn full_queues_time_out_offers() {
        let registry = Arc::new(BridgeRegistry::new(BridgeSettings {
            queue_capacity: 1,
            ..Default::default()
        }));
        let pending = registry.open();
        let producer = registry.producer(pending.request_id()).unwrap();
        producer.offer(Bytes::from_static(b"AB")).await.unwrap();
        assert_eq!(
            producer.offer(Bytes::from_static(b"CD")).await,
            Err(OfferError::TimedOut(Duration::from_secs(120)))
        );
        drop(pending);
    }

    #[tokio::test]
    async fn producers_need_a_live_uncancelled_entry() {
        let registry = registry();
        assert_eq!(
            registry.producer(&RequestId::from("nope")).err(),
            Some(ProducerError::Unknown)
        );

        let pending = registry.open();
        registry.mark_cancelled(pending.request_id());
        assert_eq!(
            registry.producer(pending.request_id()).err(),
            Some(ProducerError::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_expired_cancellations_once_over_retention() {
        let registry = Arc::new(BridgeRegistry::new(BridgeSettings {
            cancelled_retention: 3,
            ..Default::default()
        }));
        for id in ["a", "b", "c"] {
            registry.mark_cancelled(&RequestId::from(id));
        }
        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        assert_eq!(registry.cancelled_len(), 3);
        assert!(registry.is_cancelled(&RequestId::from("a")));

        registry.mark_cancelled(&RequestId::from("d"));
        assert_eq!(registry.cancelled_len(), 1);
        assert!(!registry.is_cancelled(&RequestId::from("a")));
        assert!(registry.is_cancelled(&RequestId::from("d")));
    }
}
