//! The authenticated-encryption seam.

use std::fmt::Debug;

use crate::store::Result;

/// Authenticated encryption used for every blob and for the registry
/// marker.
///
/// Implementations must be deterministic: encrypting the same plaintext
/// twice yields identical ciphertext. Scores are computed over ciphertext,
/// so determinism is what makes deduplication and the existing-scores
/// short-circuit work at all.
///
/// A failed `decrypt` whose cause is a rejected authentication tag must
/// carry [`NotAuthentic`](crate::error::NotAuthentic) in its chain; the
/// registry distinguishes a wrong password from a corrupt marker that way.
pub trait Crypter: Debug + Send + Sync + 'static {
    /// Encrypt and authenticate `plaintext`.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Verify and decrypt `ciphertext`.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}
