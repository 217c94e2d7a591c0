// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [`RelayCache`] that persists messages and blobs to a [`ByteStore`]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use relay_types::Message;

use crate::index::BlobIndex;
use crate::store::{ByteStore, FsByteStore};
use crate::{oldest_first, CacheError, CacheLimits, CachedBlob, OpenStream, PutBlob, RelayCache};

/// Keeps message metadata and blob bytes on disk, so both survive a restart.
///
/// Message metadata is also mirrored in memory for fast topic queries; blob bytes are only
/// ever streamed from storage.
pub struct DiskRelayCache {
    limits: CacheLimits,
    blobs: Arc<dyn ByteStore>,
    metadata: Arc<dyn ByteStore>,
    state: RwLock<DiskState>,
    /// Serializes writers of blob bytes (put, purge, clear).
    writer: Mutex<()>,
}

#[derive(Default)]
struct DiskState {
    messages: HashMap<String, Message>,
    index: BlobIndex,
}

/// Keys may contain anything, so they are hex-encoded before being used as names.
fn entry_name(key: &str) -> String {
    hex::encode(key)
}

fn key_from_entry_name(name: &str) -> Option<String> {
    String::from_utf8(hex::decode(name).ok()?).ok()
}

impl DiskRelayCache {
    /// Opens the cache rooted at `root`, loading whatever a previous run left there.
    pub async fn open(root: impl AsRef<Path>, limits: CacheLimits) -> Result<Self, CacheError> {
        let root = root.as_ref();
        let blobs = FsByteStore::create(root.join("blobs")).await?;
        let metadata = FsByteStore::create(root.join("messages")).await?;
        info!("Opening disk cache at {}", root.display());
        Self::with_stores(Arc::new(blobs), Arc::new(metadata), limits).await
    }

    pub async fn with_stores(
        blobs: Arc<dyn ByteStore>,
        metadata: Arc<dyn ByteStore>,
        limits: CacheLimits,
    ) -> Result<Self, CacheError> {
        let cache = Self {
            limits,
            blobs,
            metadata,
            state: Default::default(),
            writer: Mutex::new(()),
        };
        cache.load().await?;
        cache.purge_by_size_limit().await;
        Ok(cache)
    }

    async fn load(&self) -> Result<(), CacheError> {
        let mut loaded = DiskState::default();

        for name in self.metadata.list().await? {
            let read = self.metadata.read(&name).await.map_err(CacheError::from);
            match read.and_then(|json| Ok(serde_json::from_slice::<Message>(&json)?)) {
                Ok(message) => {
                    loaded.messages.insert(message.key.clone(), message);
                }
                Err(err) => warn!("Skipping unreadable cached message {name}: {err}"),
            }
        }

        for name in self.blobs.list().await? {
            let message = key_from_entry_name(&name).and_then(|key| loaded.messages.get(&key));
            let Some(message) = message else {
                warn!("Removing cached blob {name} with no message");
                if let Err(err) = self.blobs.remove(&name).await {
                    error!("Couldn't delete orphaned blob {name}: {err}");
                }
                continue;
            };
            match self.blobs.size(&name).await {
                Ok(Some(size)) => loaded.index.insert(&message.key, message.timestamp, size),
                Ok(None) => {}
                Err(err) => warn!("Skipping unreadable cached blob {name}: {err}"),
            }
        }

        info!(
            "Loaded {} cached messages and {} bytes of blobs",
            loaded.messages.len(),
            loaded.index.total_bytes()
        );
        *self.state.write().await = loaded;
        Ok(())
    }

    async fn store_message(&self, message: &Message) -> Result<(), CacheError> {
        let json = serde_json::to_vec(message)?;
        self.metadata
            .write(&entry_name(&message.key), json.into())
            .await?;
        Ok(())
    }

    /// Must be called with the writer gate held.
    async fn purge_locked(&self) {
        let victims = {
            let state = self.state.read().await;
            state.index.eviction_candidates(self.limits.max_size_bytes)
        };
        if victims.is_empty() {
            return;
        }
        info!(
            "Cache size exceeds limit ({} bytes), evicting {} oldest blobs",
            self.limits.max_size_bytes,
            victims.len()
        );
        for key in victims {
            // Forget the blob before deleting it so no new reader is handed a missing file.
            self.state.write().await.index.remove(&key);
            if let Err(err) = self.blobs.remove(&entry_name(&key)).await {
                error!("Couldn't delete evicted blob {key}: {err}");
            }
        }
        debug!("Cache size is now {} bytes", self.current_size().await);
    }
}

#[async_trait]
impl RelayCache for DiskRelayCache {
    fn limits(&self) -> CacheLimits {
        self.limits
    }

    async fn put_message(&self, message: &Message) -> Result<(), CacheError> {
        let _writer = self.writer.lock().await;
        self.store_message(message).await?;
        let mut state = self.state.write().await;
        state.messages.insert(message.key.clone(), message.clone());
        debug!("Cached message: {}", message.key);
        Ok(())
    }

    async fn put_blob(&self, message: &Message, data: OpenStream) -> Result<PutBlob, CacheError> {
        let _writer = self.writer.lock().await;

        if let Some(limit) = self.limits.max_blob_bytes() {
            if message.length > limit {
                info!(
                    "Not caching {}: {} bytes exceeds the per-blob limit of {limit} bytes",
                    message.key, message.length
                );
                return Ok(PutBlob::TooLarge { limit });
            }
        }

        let name = entry_name(&message.key);
        let size = self
            .blobs
            .write_stream(&name, data())
            .await
            .map_err(|source| CacheError::Source {
                key: message.key.clone(),
                source,
            })?;
        if size != message.length {
            warn!(
                "Blob {} is {size} bytes but was announced as {} bytes",
                message.key, message.length
            );
        }
        if let Some(limit) = self.limits.max_blob_bytes().filter(|&limit| size > limit) {
            info!("Not caching {}: actual size {size} exceeds {limit}", message.key);
            self.state.write().await.index.remove(&message.key);
            self.blobs.remove(&name).await?;
            return Ok(PutBlob::TooLarge { limit });
        }

        if let Err(err) = self.store_message(message).await {
            self.state.write().await.index.remove(&message.key);
            if let Err(err) = self.blobs.remove(&name).await {
                error!("Couldn't delete blob {} after its message failed: {err}", message.key);
            }
            return Err(err);
        }
        {
            let mut state = self.state.write().await;
            state.messages.insert(message.key.clone(), message.clone());
            state.index.insert(&message.key, message.timestamp, size);
        }
        info!("Cached blob: {} ({size} bytes)", message.key);
        self.purge_locked().await;
        Ok(PutBlob::Stored { bytes: size })
    }

    async fn get_blob(&self, key: &str) -> Option<CachedBlob> {
        let state = self.state.read().await;
        if !state.index.contains(key) {
            return None;
        }
        let message = state.messages.get(key)?.clone();
        let blobs = self.blobs.clone();
        let name = entry_name(key);
        Some(CachedBlob::new(message, move || blobs.open(&name)))
    }

    async fn get_messages(&self, topic: &str) -> Vec<Message> {
        let state = self.state.read().await;
        oldest_first(state.messages.values().filter(|m| m.topic == topic))
    }

    async fn get_all_messages(&self) -> Vec<Message> {
        let state = self.state.read().await;
        oldest_first(state.messages.values())
    }

    async fn number_of_messages(&self) -> usize {
        self.state.read().await.messages.len()
    }

    async fn purge_by_size_limit(&self) {
        if !self.limits.is_bounded() {
            return;
        }
        let _writer = self.writer.lock().await;
        self.purge_locked().await;
    }

    async fn current_size(&self) -> u64 {
        self.state.read().await.index.total_bytes()
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let _writer = self.writer.lock().await;
        {
            let mut state = self.state.write().await;
            state.messages.clear();
            state.index.clear();
        }
        self.blobs.clear().await?;
        self.metadata.clear().await?;
        info!("Cleared cache");
        Ok(())
    }

    async fn close(&self) {
        // Everything is already durable; wait for an in-progress write to finish.
        let _writer = self.writer.lock().await;
        debug!("Closed disk cache");
    }
}
