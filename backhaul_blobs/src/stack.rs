//! Composition of the full stack.

use std::sync::Arc;

use dashmap::DashSet;
use tokio_util::sync::CancellationToken;

use backhaul_core::{BlobStore, Crypter, ObjectStore, Score};

use crate::{BufferingStore, CheckingStore, EncryptingStore, ExistingScoresStore, ObjectBlobStore};

/// Tunables for one stack instance.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Object-name prefix for blob objects.
    pub prefix: String,
    /// Largest number of blob bytes the buffering layer may hold.
    pub max_buffered_bytes: usize,
    /// Largest number of writes in flight at once.
    pub max_requests_in_flight: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            prefix: "blobs/".to_string(),
            // Room for a handful of full-size chunks.
            max_buffered_bytes: 1 << 29,
            max_requests_in_flight: 16,
        }
    }
}

/// Build the layered store over an object store and a crypter.
///
/// `existing` is the shared known-score set, seeded from persistent state;
/// the stack inserts every score it makes durable. The returned store owns
/// the full composition; `flush` on it drains the buffering layer and
/// reports the first write error.
pub fn build(
    objects: Arc<dyn ObjectStore>,
    crypter: Arc<dyn Crypter>,
    existing: Arc<DashSet<Score>>,
    config: StackConfig,
    cancel: CancellationToken,
) -> Arc<dyn BlobStore> {
    let store = ObjectBlobStore::new(objects, config.prefix, cancel.clone());
    let store = CheckingStore::new(Arc::new(store));
    let store = ExistingScoresStore::new(existing, Arc::new(store));
    let store = BufferingStore::new(
        Arc::new(store),
        config.max_buffered_bytes,
        config.max_requests_in_flight,
        cancel,
    );
    let store = EncryptingStore::new(crypter, Arc::new(store));
    Arc::new(store)
}
