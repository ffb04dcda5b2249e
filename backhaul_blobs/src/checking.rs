//! Round-trip integrity checks.

use std::fmt;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;

use backhaul_core::{BlobStore, Result, Score};

/// Verifies that the inner store's answers are consistent with the bytes
/// that actually moved.
///
/// On `store`, the returned score must equal the score of the stored
/// bytes; on `load`, the returned bytes must hash to the requested score.
/// Catches silent corruption anywhere beneath it.
pub struct CheckingStore<S> {
    inner: Arc<S>,
}

impl<S> fmt::Debug for CheckingStore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckingStore").finish_non_exhaustive()
    }
}

impl<S: BlobStore> CheckingStore<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: BlobStore> BlobStore for CheckingStore<S> {
    async fn store(&self, blob: Bytes) -> Result<Score> {
        let expected = Score::compute(&blob);
        let returned = self.inner.store(blob).await?;
        if returned != expected {
            bail!("score mismatch: stored blob hashes to {expected}, inner store returned {returned}");
        }
        Ok(returned)
    }

    async fn load(&self, score: Score) -> Result<Bytes> {
        let blob = self.inner.load(score).await?;
        let actual = Score::compute(&blob);
        if actual != score {
            bail!("score mismatch: blob loaded for {score} hashes to {actual}");
        }
        Ok(blob)
    }

    async fn contains(&self, score: Score) -> Result<bool> {
        self.inner.contains(score).await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectBlobStore;
    use backhaul_core::ObjectStore;
    use backhaul_store_memory::MemoryObjectStore;
    use tokio_util::sync::CancellationToken;

    fn checked() -> (Arc<MemoryObjectStore>, CheckingStore<ObjectBlobStore>) {
        let objects = Arc::new(MemoryObjectStore::new());
        let inner = ObjectBlobStore::new(objects.clone(), "blobs/", CancellationToken::new());
        (objects, CheckingStore::new(Arc::new(inner)))
    }

    #[tokio::test]
    async fn clean_round_trip_passes() {
        let (_, store) = checked();
        let score = store.store(Bytes::from_static(b"burrito")).await.unwrap();
        assert_eq!(&store.load(score).await.unwrap()[..], b"burrito");
    }

    #[tokio::test]
    async fn corrupted_object_fails_load() {
        let (objects, store) = checked();
        let score = store.store(Bytes::from_static(b"burrito")).await.unwrap();

        // Flip the stored bytes behind the stack's back.
        let name = format!("blobs/{}", score.to_hex());
        objects
            .put(&name, Bytes::from_static(b"enchilada"))
            .await
            .unwrap();

        let err = store.load(score).await.unwrap_err();
        assert!(format!("{err:#}").contains("score mismatch"));
    }

    #[tokio::test]
    async fn lying_inner_store_fails_store() {
        #[derive(Debug)]
        struct Liar;

        #[async_trait]
        impl BlobStore for Liar {
            async fn store(&self, _blob: Bytes) -> Result<Score> {
                Ok(Score::EMPTY)
            }
            async fn load(&self, _score: Score) -> Result<Bytes> {
                unreachable!()
            }
            async fn contains(&self, _score: Score) -> Result<bool> {
                Ok(false)
            }
            async fn flush(&self) -> Result<()> {
                Ok(())
            }
        }

        let store = CheckingStore::new(Arc::new(Liar));
        let err = store.store(Bytes::from_static(b"taco")).await.unwrap_err();
        assert!(format!("{err:#}").contains("score mismatch"));
    }
}
