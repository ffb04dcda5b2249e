//! The known-score write filter.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;

use backhaul_core::{BlobStore, Result, Score};

/// Skips inner writes for blobs whose score is already in the shared
/// existing-scores set, and records every successful write into it.
///
/// The set is owned by the caller: it is seeded from the persistent state
/// of earlier runs and saved again afterwards, so a blob uploaded last
/// week is never uploaded twice.
pub struct ExistingScoresStore<S> {
    scores: Arc<DashSet<Score>>,
    inner: Arc<S>,
}

impl<S> fmt::Debug for ExistingScoresStore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExistingScoresStore")
            .field("known", &self.scores.len())
            .finish_non_exhaustive()
    }
}

impl<S: BlobStore> ExistingScoresStore<S> {
    pub fn new(scores: Arc<DashSet<Score>>, inner: Arc<S>) -> Self {
        Self { scores, inner }
    }
}

#[async_trait]
impl<S: BlobStore> BlobStore for ExistingScoresStore<S> {
    async fn store(&self, blob: Bytes) -> Result<Score> {
        let score = Score::compute(&blob);
        if self.scores.contains(&score) {
            return Ok(score);
        }
        let score = self.inner.store(blob).await?;
        self.scores.insert(score);
        Ok(score)
    }

    async fn load(&self, score: Score) -> Result<Bytes> {
        self.inner.load(score).await
    }

    async fn contains(&self, score: Score) -> Result<bool> {
        Ok(self.scores.contains(&score))
    }

    /// Flush is absorbed by the buffering layer above this one; reaching
    /// this method means the stack was composed wrong.
    async fn flush(&self) -> Result<()> {
        panic!("flush must not reach the existing-scores layer");
    }
}
