//! Error kinds callers must be able to branch on.
//!
//! Fallible operations across the workspace return `anyhow::Error` so that
//! context chains stay cheap to build. The handful of outcomes that change
//! caller behavior are typed here and found by [`is_kind`] anywhere in the
//! chain:
//!
//! - [`NotFound`]: an object, record, user, or group is absent.
//! - [`Transient`]: a retryable object-store failure (HTTP 5xx).
//! - [`Cancelled`]: cooperative cancellation, propagated unchanged.
//! - [`PreconditionFailed`]: a conditional record write lost its race.
//! - [`NotAuthentic`]: an AEAD open failed; the registry maps this to the
//!   incompatible-credential message.
//!
//! Everything else is treated as fatal and bubbles to the top.

use thiserror::Error;

/// The named object or record does not exist.
#[derive(Debug, Clone, Error)]
#[error("not found")]
pub struct NotFound;

/// A retryable backend failure. The object-store adapter retries these with
/// truncated exponential backoff; nothing else does.
#[derive(Debug, Clone, Error)]
#[error("transient: {0}")]
pub struct Transient(pub String);

/// The operation observed a cancelled cancellation token.
#[derive(Debug, Clone, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// A conditional write found the record in a different state than required.
#[derive(Debug, Clone, Error)]
#[error("precondition failed: {0}")]
pub struct PreconditionFailed(pub String);

/// Authenticated decryption rejected the ciphertext.
#[derive(Debug, Clone, Error)]
#[error("ciphertext is not authentic")]
pub struct NotAuthentic;

/// The marker record exists but was written under a different password.
#[derive(Debug, Clone, Error)]
#[error("The supplied password is incorrect")]
pub struct IncompatibleCredential;

/// True if `err` or any of its causes is the kind `E`.
pub fn is_kind<E>(err: &anyhow::Error) -> bool
where
    E: std::error::Error + Send + Sync + 'static,
{
    err.chain().any(|cause| cause.downcast_ref::<E>().is_some())
}
