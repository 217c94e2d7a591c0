// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persistent key/value byte storage used by [`DiskRelayCache`](crate::DiskRelayCache)

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{stream, Stream, StreamExt, TryStreamExt};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::ByteStream;

/// Size of the chunks [`FsByteStore::open`] reads files in.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Suffix of entries that are still being written.
const PARTIAL_SUFFIX: &str = ".part";

/// Distinguishes concurrent writes to the same name.
static NEXT_PARTIAL: AtomicU64 = AtomicU64::new(0);

/// Flat namespace of named byte strings.
///
/// Names are opaque to the store; callers are expected to pick names that are safe for the
/// backing medium.
#[async_trait]
pub trait ByteStore: Send + Sync + 'static {
    /// Streams `data` into `name`, returning the number of bytes written.
    ///
    /// If `data` fails, nothing is left under `name` (a previous value may be lost).
    async fn write_stream(&self, name: &str, data: ByteStream) -> std::io::Result<u64>;

    async fn write(&self, name: &str, data: Bytes) -> std::io::Result<()>;

    async fn read(&self, name: &str) -> std::io::Result<Bytes>;

    /// Lazily opens `name` for streaming; errors surface when the stream is polled.
    fn open(&self, name: &str) -> ByteStream;

    /// Size of `name`, or `None` if it doesn't exist.
    async fn size(&self, name: &str) -> std::io::Result<Option<u64>>;

    /// Removes `name`; removing something that doesn't exist is fine.
    async fn remove(&self, name: &str) -> std::io::Result<()>;

    /// Every complete entry.
    async fn list(&self) -> std::io::Result<Vec<String>>;

    async fn clear(&self) -> std::io::Result<()>;
}

/// [`ByteStore`] keeping one file per name in a directory.
#[derive(Clone, Debug)]
pub struct FsByteStore {
    dir: PathBuf,
}

impl FsByteStore {
    /// Opens (creating if needed) the directory `dir`, deleting writes left unfinished by a
    /// previous process.
    pub async fn create(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_owned();
        fs::create_dir_all(&dir).await?;
        let store = Self { dir };
        store.sweep_partials().await?;
        Ok(store)
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn partial_path(&self, name: &str) -> PathBuf {
        let n = NEXT_PARTIAL.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!("{name}.{n}{PARTIAL_SUFFIX}"))
    }

    async fn sweep_partials(&self) -> std::io::Result<()> {
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let partial = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(PARTIAL_SUFFIX));
            if !partial {
                continue;
            }
            if let Err(err) = fs::remove_file(entry.path()).await {
                warn!("Couldn't delete unfinished write {:?}: {err}", entry.path());
            } else {
                debug!("Deleted unfinished write {:?}", entry.path());
            }
        }
        Ok(())
    }
}

async fn copy_into(file: &mut File, mut data: ByteStream) -> std::io::Result<u64> {
    let mut written = 0;
    while let Some(chunk) = data.try_next().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_data().await?;
    Ok(written)
}

#[async_trait]
impl ByteStore for FsByteStore {
    async fn write_stream(&self, name: &str, data: ByteStream) -> std::io::Result<u64> {
        // Write to a partial file and rename it into place only once complete.
        let partial = self.partial_path(name);
        let mut file = File::create(&partial).await?;
        let written = copy_into(&mut file, data).await;
        drop(file);
        match written {
            Ok(written) => {
                fs::rename(&partial, self.path(name)).await?;
                Ok(written)
            }
            Err(err) => {
                let _ = fs::remove_file(&partial).await;
                Err(err)
            }
        }
    }

    async fn write(&self, name: &str, data: Bytes) -> std::io::Result<()> {
        let data = stream::once(futures::future::ready(Ok(data))).boxed();
        self.write_stream(name, data).await.map(drop)
    }

    async fn read(&self, name: &str) -> std::io::Result<Bytes> {
        fs::read(self.path(name)).await.map(Bytes::from)
    }

    fn open(&self, name: &str) -> ByteStream {
        let path = self.path(name);
        stream::once(async move { File::open(path).await.map(file_chunks) })
            .try_flatten()
            .boxed()
    }

    async fn size(&self, name: &str) -> std::io::Result<Option<u64>> {
        match fs::metadata(self.path(name)).await {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn remove(&self, name: &str) -> std::io::Result<()> {
        match fs::remove_file(self.path(name)).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    async fn list(&self) -> std::io::Result<Vec<String>> {
        let mut names = vec![];
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !name.ends_with(PARTIAL_SUFFIX) {
                names.push(name);
            }
        }
        Ok(names)
    }

    async fn clear(&self) -> std::io::Result<()> {
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }
}

/// Reads `file` as a stream of chunks, ending after the first error.
fn file_chunks(file: File) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
    stream::unfold(Some(file), |file| async move {
        let mut file = file?;
        let mut buffer = BytesMut::with_capacity(READ_CHUNK_SIZE);
        match file.read_buf(&mut buffer).await {
            Ok(0) => None,
            Ok(_) => Some((Ok(buffer.freeze()), Some(file))),
            Err(err) => Some((Err(err), None)),
        }
    })
}
