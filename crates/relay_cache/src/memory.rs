// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! [`RelayCache`] that keeps blob bytes in memory

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use relay_types::Message;

use crate::index::BlobIndex;
use crate::{
    oldest_first, read_to_end, CacheError, CacheLimits, CachedBlob, OpenStream, PutBlob,
    RelayCache,
};

/// Holds messages and blob bytes in process memory. Nothing survives a restart.
pub struct InMemoryRelayCache {
    limits: CacheLimits,
    state: RwLock<MemoryState>,
    /// Serializes writers of blob bytes (put, purge, clear).
    writer: Mutex<()>,
}

#[derive(Default)]
struct MemoryState {
    messages: HashMap<String, Message>,
    blobs: HashMap<String, Bytes>,
    index: BlobIndex,
}

impl MemoryState {
    fn purge(&mut self, limits: &CacheLimits) {
        let victims = self.index.eviction_candidates(limits.max_size_bytes);
        if victims.is_empty() {
            return;
        }
        info!(
            "Cache size ({} bytes) exceeds limit ({} bytes), evicting {} oldest blobs",
            self.index.total_bytes(),
            limits.max_size_bytes,
            victims.len()
        );
        for key in &victims {
            self.blobs.remove(key);
            self.index.remove(key);
        }
        debug!("Cache size is now {} bytes", self.index.total_bytes());
    }
}

impl InMemoryRelayCache {
    pub fn new(limits: CacheLimits) -> Self {
        Self {
            limits,
            state: Default::default(),
            writer: Mutex::new(()),
        }
    }
}

impl Default for InMemoryRelayCache {
    fn default() -> Self {
        Self::new(CacheLimits::unbounded())
    }
}

#[async_trait]
impl RelayCache for InMemoryRelayCache {
    fn limits(&self) -> CacheLimits {
        self.limits
    }

    async fn put_message(&self, message: &Message) -> Result<(), CacheError> {
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

        let bytes = read_to_end(data(), message.length)
            .await
            .map_err(|source| CacheError::Source {
                key: message.key.clone(),
                source,
            })?;
        let size = bytes.len() as u64;
        if size != message.length {
            warn!(
                "Blob {} is {size} bytes but was announced as {} bytes",
                message.key, message.length
            );
        }
        if let Some(limit) = self.limits.max_blob_bytes().filter(|&limit| size > limit) {
            info!("Not caching {}: actual size {size} exceeds {limit}", message.key);
            return Ok(PutBlob::TooLarge { limit });
        }

        let mut state = self.state.write().await;
        state.messages.insert(message.key.clone(), message.clone());
        state.blobs.insert(message.key.clone(), bytes);
        state.index.insert(&message.key, message.timestamp, size);
        info!("Cached blob: {} ({size} bytes)", message.key);
        state.purge(&self.limits);
        Ok(PutBlob::Stored { bytes: size })
    }

    async fn get_blob(&self, key: &str) -> Option<CachedBlob> {
        let state = self.state.read().await;
        let bytes = state.blobs.get(key)?.clone();
        let message = state.messages.get(key)?.clone();
        Some(CachedBlob::new(message, move || {
            stream::once(futures::future::ready(Ok::<_, std::io::Error>(bytes.clone()))).boxed()
        }))
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
        self.state.write().await.purge(&self.limits);
    }

    async fn current_size(&self) -> u64 {
        self.state.read().await.index.total_bytes()
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let _writer = self.writer.lock().await;
        let mut state = self.state.write().await;
        *state = MemoryState::default();
        info!("Cleared cache");
        Ok(())
    }

    async fn close(&self) {
        // Nothing outlives the process anyway; release the memory now.
        let _ = self.clear().await;
    }
}
