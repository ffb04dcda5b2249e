//! The chunking file saver.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::io::{AsyncRead, AsyncReadExt};

use backhaul_core::blob::tag_chunk;
use backhaul_core::{BlobStore, Result, Score};
use backhaul_fs::FileSystem;

/// Chunk size used when none is configured: 16 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 16 << 20;

/// Worker count used when none is configured: one per CPU, minus one for
/// the reader, but at least one.
pub fn default_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

/// Saves the contents of one path as a list of chunk scores.
#[async_trait]
pub trait PathSaver: Debug + Send + Sync + 'static {
    /// Store the file at `path` in chunks, returning the chunk scores in
    /// file order.
    async fn save_path(&self, path: &Path) -> Result<Vec<Score>>;
}

/// Splits a reader into fixed-size chunks and stores them concurrently.
///
/// Reads are sequential; up to `workers` store calls run at once, and the
/// returned score list preserves chunk order regardless of completion
/// order. An empty file produces an empty list and no store calls.
pub struct FileSaver {
    blobs: Arc<dyn BlobStore>,
    fs: Arc<dyn FileSystem>,
    chunk_size: usize,
    workers: usize,
}

impl Debug for FileSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSaver")
            .field("chunk_size", &self.chunk_size)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl FileSaver {
    /// A zero chunk size is rejected; a zero worker count is raised to 1.
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        fs: Arc<dyn FileSystem>,
        chunk_size: usize,
        workers: usize,
    ) -> Result<Self> {
        if chunk_size == 0 {
            bail!("chunk size must be positive");
        }
        Ok(Self {
            blobs,
            fs,
            chunk_size,
            workers: workers.max(1),
        })
    }

    pub fn with_defaults(blobs: Arc<dyn BlobStore>, fs: Arc<dyn FileSystem>) -> Self {
        Self::new(blobs, fs, DEFAULT_CHUNK_SIZE, default_workers())
            .expect("default chunk size is positive")
    }

    /// Chunk `reader` and store every chunk, preserving order.
    pub async fn save(&self, mut reader: Box<dyn AsyncRead + Send + Unpin>) -> Result<Vec<Score>> {
        let mut in_flight = FuturesUnordered::new();
        let mut results: Vec<Option<Score>> = Vec::new();
        let mut next_index = 0usize;
        let mut done_reading = false;

        loop {
            while !done_reading && in_flight.len() < self.workers {
                match read_chunk(&mut *reader, self.chunk_size)
                    .await
                    .context("reading chunk")?
                {
                    Some(chunk) => {
                        let blobs = Arc::clone(&self.blobs);
                        let index = next_index;
                        next_index += 1;
                        results.push(None);
                        in_flight.push(async move {
                            blobs
                                .store(tag_chunk(&chunk))
                                .await
                                .with_context(|| format!("storing chunk {index}"))
                                .map(|score| (index, score))
                        });
                    }
                    None => done_reading = true,
                }
            }

            if in_flight.is_empty() {
                if done_reading {
                    break;
                }
                continue;
            }

            let (index, score) = in_flight.next().await.expect("in_flight is non-empty")?;
            results[index] = Some(score);
        }

        Ok(results.into_iter().map(|score| score.expect("every index is filled before completion")).collect())
    }
}

#[async_trait]
impl PathSaver for FileSaver {
    async fn save_path(&self, path: &Path) -> Result<Vec<Score>> {
        let reader = self.fs.open_for_reading(path).await?;
        self.save(reader).await
    }
}

/// Read exactly `size` bytes unless EOF arrives first; `None` at EOF.
async fn read_chunk(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    size: usize,
) -> std::io::Result<Option<Bytes>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Ok(None);
    }
    buf.truncate(filled);
    Ok(Some(Bytes::from(buf)))
}
