//! Write buffering with bounded memory and parallelism.

use std::collections::HashMap;
use std::fmt;
use std::pin::pin;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio_util::sync::CancellationToken;

use backhaul_core::error::Cancelled;
use backhaul_core::{BlobStore, Result, Score};

/// Decouples producers from backend latency.
///
/// `store` admits a blob once both limits allow it, pre-computes its
/// score, short-circuits through the inner store's `contains`, and hands
/// the actual write to a background task; the caller gets the score back
/// immediately. `flush` waits for the in-flight map to drain and reports
/// the first write error observed since construction. Flush is absorbed
/// here: it is deliberately not forwarded to the inner store.
///
/// Invariants, held under one mutex: the in-flight map never exceeds
/// `max_requests` entries; the byte counter equals the sum of in-flight
/// blob lengths and never exceeds `max_bytes`.
pub struct BufferingStore<S> {
    inner: Arc<S>,
    max_bytes: usize,
    max_requests: usize,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Notify,
}

struct State {
    in_flight: HashMap<Score, usize>,
    buffered_bytes: usize,
    first_error: Option<SharedError>,
}

impl Shared {
    fn release(&self, state: &mut State, score: Score) {
        if let Some(len) = state.in_flight.remove(&score) {
            state.buffered_bytes -= len;
        }
        self.wakeup.notify_waiters();
    }
}

/// First write error, kept sticky so that every later `flush` reports the
/// same failure. Wraps the original chain so kind matching still works.
#[derive(Debug, Clone)]
struct SharedError(Arc<anyhow::Error>);

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref().as_ref())
    }
}

impl<S> fmt::Debug for BufferingStore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferingStore")
            .field("max_bytes", &self.max_bytes)
            .field("max_requests", &self.max_requests)
            .finish_non_exhaustive()
    }
}

impl<S: BlobStore> BufferingStore<S> {
    /// Both limits must be positive.
    pub fn new(
        inner: Arc<S>,
        max_bytes: usize,
        max_requests: usize,
        cancel: CancellationToken,
    ) -> Self {
        assert!(max_bytes > 0, "max_bytes must be positive");
        assert!(max_requests > 0, "max_requests must be positive");
        Self {
            inner,
            max_bytes,
            max_requests,
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    in_flight: HashMap::new(),
                    buffered_bytes: 0,
                    first_error: None,
                }),
                wakeup: Notify::new(),
            }),
            cancel,
        }
    }

    /// Wait until `admit` returns true of the locked state, then return
    /// the guard. Raced against cancellation.
    async fn wait_for(&self, admit: impl Fn(&State) -> bool) -> Result<MutexGuard<'_, State>> {
        loop {
            let state = self.shared.state.lock().await;
            if admit(&state) {
                return Ok(state);
            }

            // Register for the next notification before releasing the
            // lock, or a release in between would be missed.
            let mut notified = pin!(self.shared.wakeup.notified());
            notified.as_mut().enable();
            drop(state);

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Cancelled.into()),
                _ = notified => {}
            }
        }
    }
}

#[async_trait]
impl<S: BlobStore> BlobStore for BufferingStore<S> {
    async fn store(&self, blob: Bytes) -> Result<Score> {
        let len = blob.len();
        if len > self.max_bytes {
            bail!(
                "blob is {len} bytes; the write buffer admits at most {} bytes",
                self.max_bytes
            );
        }

        let score = Score::compute(&blob);

        let mut state = self
            .wait_for(|state| {
                state.in_flight.contains_key(&score)
                    || (state.in_flight.len() < self.max_requests
                        && state.buffered_bytes + len <= self.max_bytes)
            })
            .await?;

        // A concurrent caller is already writing this exact blob.
        if state.in_flight.contains_key(&score) {
            return Ok(score);
        }

        state.in_flight.insert(score, len);
        state.buffered_bytes += len;
        drop(state);

        // Already durable: release the slot and skip the write.
        match self.inner.contains(score).await {
            Ok(true) => {
                let mut state = self.shared.state.lock().await;
                self.shared.release(&mut state, score);
                return Ok(score);
            }
            Ok(false) => {}
            Err(err) => {
                let mut state = self.shared.state.lock().await;
                self.shared.release(&mut state, score);
                return Err(err);
            }
        }

        let inner = Arc::clone(&self.inner);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let result = inner.store(blob).await;
            let mut state = shared.state.lock().await;
            match result {
                Ok(returned) if returned != score => {
                    let err = anyhow!(
                        "score mismatch: expected {score}, inner store returned {returned}"
                    );
                    state.first_error.get_or_insert(SharedError(Arc::new(err)));
                }
                Err(err) => {
                    state.first_error.get_or_insert(SharedError(Arc::new(err)));
                }
                Ok(_) => {}
            }
            shared.release(&mut state, score);
        });

        Ok(score)
    }

    async fn load(&self, score: Score) -> Result<Bytes> {
        self.inner.load(score).await
    }

    async fn contains(&self, score: Score) -> Result<bool> {
        if self.shared.state.lock().await.in_flight.contains_key(&score) {
            return Ok(true);
        }
        self.inner.contains(score).await
    }

    async fn flush(&self) -> Result<()> {
        let state = self.wait_for(|state| state.in_flight.is_empty()).await?;
        match &state.first_error {
            Some(err) => Err(err.clone().into()),
            None => Ok(()),
        }
    }
}
