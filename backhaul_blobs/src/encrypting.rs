//! The outermost layer: authenticated encryption.

use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;

use backhaul_core::{BlobStore, Crypter, Result, Score};

/// Encrypts plaintext on the way down and decrypts on the way up.
///
/// Sits above every score-computing layer: the crypter is deterministic,
/// so the ciphertext, and with it the score, is a pure function of the
/// plaintext and the key. Decryption failures are surfaced with the
/// not-authentic kind intact so the caller can tell tampering from IO.
pub struct EncryptingStore<S> {
    crypter: Arc<dyn Crypter>,
    inner: Arc<S>,
}

impl<S> fmt::Debug for EncryptingStore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptingStore").finish_non_exhaustive()
    }
}

impl<S: BlobStore> EncryptingStore<S> {
    pub fn new(crypter: Arc<dyn Crypter>, inner: Arc<S>) -> Self {
        Self { crypter, inner }
    }
}

#[async_trait]
impl<S: BlobStore> BlobStore for EncryptingStore<S> {
    async fn store(&self, blob: Bytes) -> Result<Score> {
        let ciphertext = self.crypter.encrypt(&blob).context("encrypting blob")?;
        self.inner.store(ciphertext.into()).await
    }

    async fn load(&self, score: Score) -> Result<Bytes> {
        let ciphertext = self.inner.load(score).await?;
        let plaintext = self
            .crypter
            .decrypt(&ciphertext)
            .with_context(|| format!("decrypting blob {score}"))?;
        Ok(plaintext.into())
    }

    async fn contains(&self, score: Score) -> Result<bool> {
        self.inner.contains(score).await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }
}
