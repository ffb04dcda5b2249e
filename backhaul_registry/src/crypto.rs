//! Password-derived, deduplication-stable authenticated encryption.

use aes_gcm::{Aes256Gcm, KeyInit, Nonce, aead::Aead};
use anyhow::anyhow;
use sha2::{Digest, Sha256};

use backhaul_core::error::NotAuthentic;
use backhaul_core::{Crypter, Result};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

// N = 2^14, r = 8, p = 1.
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// AES-256-GCM with a nonce derived as SHA-256(key ‖ plaintext)[..12].
///
/// The derived nonce makes encryption a pure function of key and
/// plaintext: equal chunks produce equal ciphertexts, which is what lets
/// ciphertext scores deduplicate. The trade-off is that equal plaintexts
/// are visible as equal objects in the remote store. Ciphertext layout is
/// nonce ‖ body ‖ tag.
#[derive(Clone)]
pub struct GcmCrypter {
    cipher: Aes256Gcm,
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for GcmCrypter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcmCrypter").finish_non_exhaustive()
    }
}

impl GcmCrypter {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new((&key).into()),
            key,
        }
    }

    fn nonce_for(&self, plaintext: &[u8]) -> [u8; NONCE_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(self.key);
        hasher.update(plaintext);
        let digest = hasher.finalize();
        digest[..NONCE_LEN].try_into().expect("digest is long enough")
    }
}

impl Crypter for GcmCrypter {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce_for(plaintext);
        let body = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| anyhow!("encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + body.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(NotAuthentic.into());
        }
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| NotAuthentic.into())
    }
}

/// Derive the crypter for `password` under `salt` with scrypt.
pub fn derive_crypter(password: &str, salt: &[u8]) -> Result<GcmCrypter> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
        .map_err(|e| anyhow!("scrypt parameters: {e}"))?;
    let mut key = [0u8; KEY_LEN];
    scrypt::scrypt(password.as_bytes(), salt, &params, &mut key)
        .map_err(|e| anyhow!("deriving key: {e}"))?;
    Ok(GcmCrypter::new(key))
}
