//! The innermost layer: blobs as named objects in an [`ObjectStore`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use backhaul_core::error::{Cancelled, Transient, is_kind};
use backhaul_core::{BlobStore, ObjectStore, Result, Score};

const RETRY_BASE_MS: u64 = 1;
const RETRY_CAP_MS: u64 = 16_384;
const RETRY_JITTER_MS: u64 = 1_000;
/// Retries after the first attempt; the final backoff hits the cap.
const RETRY_LIMIT: u32 = 15;

/// Stores each blob as the object `"<prefix><40-hex-score>"`.
///
/// Transient object-store failures are retried with truncated exponential
/// backoff; every other failure surfaces immediately. Backoff sleeps race
/// the cancellation token.
pub struct ObjectBlobStore {
    objects: Arc<dyn ObjectStore>,
    prefix: String,
    cancel: CancellationToken,
}

impl fmt::Debug for ObjectBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBlobStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl ObjectBlobStore {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            objects,
            prefix: prefix.into(),
            cancel,
        }
    }

    /// The object name a score maps to under this store's prefix.
    pub fn object_name(&self, score: Score) -> String {
        format!("{}{}", self.prefix, score.to_hex())
    }

    /// The score encoded in an object name, if the name carries this
    /// store's prefix.
    pub fn score_for_name(&self, name: &str) -> Option<Score> {
        name.strip_prefix(&self.prefix)?.parse().ok()
    }

    async fn with_retries<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Cancelled.into());
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_kind::<Transient>(&err) && attempt < RETRY_LIMIT => {
                    let backoff = (RETRY_BASE_MS << attempt).min(RETRY_CAP_MS);
                    let jitter = rand::rng().random_range(0..=RETRY_JITTER_MS);
                    let delay = Duration::from_millis(backoff + jitter);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = format!("{err:#}"),
                        "transient object-store failure; backing off"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(Cancelled.into()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl BlobStore for ObjectBlobStore {
    async fn store(&self, blob: Bytes) -> Result<Score> {
        let score = Score::compute(&blob);
        let name = self.object_name(score);
        self.with_retries(|| {
            let blob = blob.clone();
            let name = name.clone();
            async move { self.objects.put(&name, blob).await }
        })
        .await
        .with_context(|| format!("storing object {name}"))?;
        Ok(score)
    }

    async fn load(&self, score: Score) -> Result<Bytes> {
        let name = self.object_name(score);
        self.with_retries(|| {
            let name = name.clone();
            async move { self.objects.get(&name).await }
        })
        .await
        .with_context(|| format!("loading object {name}"))
    }

    async fn contains(&self, score: Score) -> Result<bool> {
        self.objects.exists(&self.object_name(score)).await
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
