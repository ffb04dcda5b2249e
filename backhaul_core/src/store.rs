//! Storage seams: score-addressed blobs and raw named objects.

use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;

use crate::score::Score;

/// Result alias used on every trait method in this workspace.
pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;

/// A store of blobs addressed by their score.
///
/// Implementations compose by wrapping: each layer of the blob-store stack
/// implements this trait over an inner `BlobStore`. All methods are safe for
/// concurrent callers.
#[async_trait]
pub trait BlobStore: Debug + Send + Sync + 'static {
    /// Store a blob, returning the score it can be loaded under.
    ///
    /// A successful return does not imply durability; only a successful
    /// [`flush`](Self::flush) does.
    async fn store(&self, blob: Bytes) -> Result<Score>;

    /// Load the blob previously stored under `score`.
    async fn load(&self, score: Score) -> Result<Bytes>;

    /// Whether a blob with this score is already known to the store.
    async fn contains(&self, score: Score) -> Result<bool>;

    /// Wait until every previously accepted `store` is durable, returning
    /// the first write error observed since the last flush.
    async fn flush(&self) -> Result<()>;
}

/// The narrow interface onto a remote object store.
///
/// This is the seam the object-store SDK plugs in behind; see
/// `blob_stores/memory` and `blob_stores/s3`. Implementations map failures
/// they consider retryable to [`Transient`](crate::error::Transient) and
/// missing objects to [`NotFound`](crate::error::NotFound); retrying is the
/// caller's business.
#[async_trait]
pub trait ObjectStore: Debug + Send + Sync + 'static {
    /// Create or replace the object called `name`.
    async fn put(&self, name: &str, data: Bytes) -> Result<()>;

    /// Read the full contents of the object called `name`.
    async fn get(&self, name: &str) -> Result<Bytes>;

    /// Whether an object called `name` exists.
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Names of all objects starting with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}
