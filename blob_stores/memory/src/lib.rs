//! In-memory [`ObjectStore`] used by tests and hermetic runs.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use backhaul_core::error::NotFound;
use backhaul_core::{ObjectStore, Result};

type FaultFactory = Box<dyn Fn() -> anyhow::Error + Send + Sync>;

/// Objects in a `DashMap`, plus fault injection for exercising the retry
/// and error paths of the layers above.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, Bytes>,
    puts: AtomicUsize,
    put_faults: Mutex<Option<(usize, FaultFactory)>>,
}

impl std::fmt::Debug for MemoryObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryObjectStore")
            .field("objects", &self.objects.len())
            .finish_non_exhaustive()
    }
}

impl MemoryObjectStore {
    /// Creates a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects currently held.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Total `put` calls observed, including failed ones.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Make the next `count` puts fail with an error built by `fault`.
    pub fn fail_next_puts<F>(&self, count: usize, fault: F)
    where
        F: Fn() -> anyhow::Error + Send + Sync + 'static,
    {
        *self.put_faults.lock().unwrap() = Some((count, Box::new(fault)));
    }

    fn take_put_fault(&self) -> Option<anyhow::Error> {
        let mut guard = self.put_faults.lock().unwrap();
        match guard.as_mut() {
            Some((remaining, fault)) if *remaining > 0 => {
                *remaining -= 1;
                Some(fault())
            }
            _ => {
                *guard = None;
                None
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, name: &str, data: Bytes) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_put_fault() {
            return Err(err);
        }
        self.objects.insert(name.to_string(), data);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Bytes> {
        match self.objects.get(name) {
            Some(data) => Ok(data.clone()),
            None => Err(NotFound.into()),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.objects.contains_key(name))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backhaul_core::error::is_kind;

    #[tokio::test]
    async fn put_get_exists() {
        let store = MemoryObjectStore::new();
        store
            .put("blobs/abc", Bytes::from_static(b"taco"))
            .await
            .unwrap();
        assert!(store.exists("blobs/abc").await.unwrap());
        assert!(!store.exists("blobs/def").await.unwrap());
        assert_eq!(&store.get("blobs/abc").await.unwrap()[..], b"taco");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemoryObjectStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert!(is_kind::<NotFound>(&err));
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let store = MemoryObjectStore::new();
        for name in ["blobs/b", "blobs/a", "marker"] {
            store.put(name, Bytes::new()).await.unwrap();
        }
        assert_eq!(
            store.list("blobs/").await.unwrap(),
            vec!["blobs/a".to_string(), "blobs/b".to_string()]
        );
    }

    #[tokio::test]
    async fn injected_faults_burn_off() {
        let store = MemoryObjectStore::new();
        store.fail_next_puts(2, || anyhow::anyhow!("boom"));
        assert!(store.put("a", Bytes::new()).await.is_err());
        assert!(store.put("a", Bytes::new()).await.is_err());
        store.put("a", Bytes::new()).await.unwrap();
        assert_eq!(store.put_count(), 3);
    }
}
