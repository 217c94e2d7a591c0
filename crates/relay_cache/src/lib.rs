// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Caches for relay announcements and the blobs they describe.
//!
//! A [`RelayCache`] stores [`Message`] metadata indefinitely and blob bytes under a size budget.
//! When the budget is exceeded, the blobs with the oldest message timestamps are evicted first.
//! Evicting a blob never evicts its metadata: a later lookup reports the blob as known but not
//! cached, and the message can still be replayed to new subscribers. Only
//! [`clear`](RelayCache::clear) forgets metadata.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::TryStreamExt;

use relay_types::Message;

pub mod disk;
mod index;
pub mod memory;
pub mod store;

pub use disk::DiskRelayCache;
pub use memory::InMemoryRelayCache;
pub use store::{ByteStore, FsByteStore};

/// Fallible stream of blob bytes.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Deferred source of blob bytes handed to [`RelayCache::put_blob`].
///
/// It's only invoked once the cache has decided it wants the blob, so a blob that is too
/// large to cache is never opened.
pub type OpenStream = Box<dyn FnOnce() -> ByteStream + Send>;

/// A cache hit: metadata plus a way to (re)open the bytes without holding them in memory.
#[derive(Clone)]
pub struct CachedBlob {
    pub message: Message,
    open: Arc<dyn Fn() -> ByteStream + Send + Sync>,
}

impl CachedBlob {
    pub fn new(message: Message, open: impl Fn() -> ByteStream + Send + Sync + 'static) -> Self {
        Self {
            message,
            open: Arc::new(open),
        }
    }

    pub fn open_stream(&self) -> ByteStream {
        (self.open)()
    }

    pub fn size_bytes(&self) -> u64 {
        self.message.length
    }
}

impl fmt::Debug for CachedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CachedBlob(key={}, size={})", self.message.key, self.size_bytes())
    }
}

/// Size policy shared by every cache backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheLimits {
    /// Budget for the total size of cached blobs, 0 meaning unbounded.
    pub max_size_bytes: u64,
    /// A single blob larger than `max_size_bytes / max_blob_divisor` is never cached.
    pub max_blob_divisor: u64,
}

impl CacheLimits {
    pub const DEFAULT_MAX_BLOB_DIVISOR: u64 = 10;

    pub fn unbounded() -> Self {
        Self::with_budget(0)
    }

    pub fn with_budget(max_size_bytes: u64) -> Self {
        Self {
            max_size_bytes,
            max_blob_divisor: Self::DEFAULT_MAX_BLOB_DIVISOR,
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.max_size_bytes > 0
    }

    /// Largest single blob that may be cached, if there is a limit at all.
    pub fn max_blob_bytes(&self) -> Option<u64> {
        self.is_bounded()
            .then(|| self.max_size_bytes / self.max_blob_divisor.max(1))
    }

    pub fn admits(&self, length: u64) -> bool {
        self.max_blob_bytes().map_or(true, |limit| length <= limit)
    }
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Result of a successful [`RelayCache::put_blob`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutBlob {
    Stored { bytes: u64 },
    /// The blob exceeds the single-blob limit and was skipped; this is not an error.
    TooLarge { limit: u64 },
}

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("couldn't read blob {key} from its source: {source}")]
    Source {
        key: String,
        source: std::io::Error,
    },
    #[error("couldn't encode message metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Storage for relay messages and blobs.
///
/// Implementations serialize [`put_blob`](Self::put_blob),
/// [`purge_by_size_limit`](Self::purge_by_size_limit) and [`clear`](Self::clear) against each
/// other, while lookups proceed concurrently and are never blocked by a blob that is still
/// being downloaded.
#[async_trait]
pub trait RelayCache: Send + Sync {
    fn limits(&self) -> CacheLimits;

    /// Remember `message` (metadata only).
    async fn put_message(&self, message: &Message) -> Result<(), CacheError>;

    /// Read the blob for `message` to completion and store it under the size policy.
    ///
    /// The message is stored alongside. A declared/actual length mismatch is logged, not
    /// treated as an error.
    async fn put_blob(&self, message: &Message, data: OpenStream) -> Result<PutBlob, CacheError>;

    /// Look up cached bytes for `key`. A known message whose bytes aren't cached is `None`.
    async fn get_blob(&self, key: &str) -> Option<CachedBlob>;

    /// Messages in `topic`, oldest first.
    async fn get_messages(&self, topic: &str) -> Vec<Message>;

    /// Every message, oldest first.
    async fn get_all_messages(&self) -> Vec<Message>;

    async fn number_of_messages(&self) -> usize;

    /// Evict the oldest blobs until the total is back under budget. No-op when under budget.
    async fn purge_by_size_limit(&self);

    /// Total bytes of cached blobs.
    async fn current_size(&self) -> u64;

    async fn clear(&self) -> Result<(), CacheError>;

    async fn close(&self);
}

/// Buffers a whole blob, pre-allocating for its declared length.
pub(crate) async fn read_to_end(
    mut data: ByteStream,
    declared_length: u64,
) -> std::io::Result<Bytes> {
    // Don't trust the declared length too far when pre-allocating
    let capacity = declared_length.min(16 * 1024 * 1024) as usize;
    let mut buffer = BytesMut::with_capacity(capacity);
    while let Some(chunk) = data.try_next().await? {
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

/// Messages sorted oldest first, ties broken by key so the order is deterministic.
pub(crate) fn oldest_first<'a>(messages: impl Iterator<Item = &'a Message>) -> Vec<Message> {
    let mut messages: Vec<Message> = messages.cloned().collect();
    messages.sort_by(|a, b| (a.timestamp, &a.key).cmp(&(b.timestamp, &b.key)));
    messages
}
