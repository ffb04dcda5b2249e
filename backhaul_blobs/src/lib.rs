//! The layered blob-store stack.
//!
//! Each layer implements [`backhaul_core::BlobStore`] over an inner store
//! and owns exactly one concern. Composed by [`stack::build`], outermost
//! first:
//!
//! 1. [`EncryptingStore`]: deterministic AEAD; everything beneath it sees
//!    only ciphertext, so scores computed below are ciphertext scores.
//! 2. [`BufferingStore`]: bounds buffered bytes and in-flight requests,
//!    runs inner writes in background tasks, absorbs `flush`.
//! 3. [`ExistingScoresStore`]: skips writes for scores already known to
//!    be durable.
//! 4. [`CheckingStore`]: recomputes scores on both paths and fails on
//!    any mismatch.
//! 5. [`ObjectBlobStore`]: names blobs `"<prefix><40-hex-score>"` in the
//!    object store and retries transient failures with backoff.

mod buffering;
mod checking;
mod encrypting;
mod existing;
mod object;
pub mod stack;

pub use buffering::BufferingStore;
pub use checking::CheckingStore;
pub use encrypting::EncryptingStore;
pub use existing::ExistingScoresStore;
pub use object::ObjectBlobStore;
pub use stack::{StackConfig, build};
