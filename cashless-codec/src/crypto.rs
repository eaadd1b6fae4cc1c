//! Symmetric key material and the primitives built on it.
//!
//! Bodies are sealed with AES-256-GCM under a synthetic nonce derived from the
//! plaintext, which keeps encoding deterministic for identical input and key.
//! Integrity tags are HMAC-SHA256, compared in constant time.

use std::fmt;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CodecError, DecodeError, EncodeError};

type HmacSha256 = Hmac<Sha256>;

/// AES-256 key length in bytes.
pub const ENCRYPTION_KEY_LEN: usize = 32;
/// Minimum accepted HMAC key length in bytes.
pub const MIN_SIGNING_KEY_LEN: usize = 16;

const NONCE_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;
const NONCE_DOMAIN: &[u8] = b"cashless-tag-nonce-v1";

// ═══════════════════════════════════════════════════════════════════════════════
// KEY MATERIAL
// ═══════════════════════════════════════════════════════════════════════════════

/// Pre-shared keys used by every terminal of a festival.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TagKeys {
    encryption_key: [u8; ENCRYPTION_KEY_LEN],
    signing_key: Vec<u8>,
}

impl TagKeys {
    pub fn new(
        encryption_key: [u8; ENCRYPTION_KEY_LEN],
        signing_key: impl Into<Vec<u8>>,
    ) -> Result<Self, CodecError> {
        let signing_key = signing_key.into();
        if signing_key.len() < MIN_SIGNING_KEY_LEN {
            return Err(CodecError::InvalidKey(format!(
                "signing key must be at least {} bytes, got {}",
                MIN_SIGNING_KEY_LEN,
                signing_key.len()
            )));
        }
        Ok(Self {
            encryption_key,
            signing_key,
        })
    }

    /// Parse both keys from hex strings (as carried in configuration).
    pub fn from_hex(encryption_key_hex: &str, signing_key_hex: &str) -> Result<Self, CodecError> {
        let mut raw = hex::decode(encryption_key_hex.trim())
            .map_err(|e| CodecError::InvalidKey(format!("encryption key: {e}")))?;
        if raw.len() != ENCRYPTION_KEY_LEN {
            let len = raw.len();
            raw.zeroize();
            return Err(CodecError::InvalidKey(format!(
                "encryption key must be {} bytes, got {}",
                ENCRYPTION_KEY_LEN, len
            )));
        }
        let mut encryption_key = [0u8; ENCRYPTION_KEY_LEN];
        encryption_key.copy_from_slice(&raw);
        raw.zeroize();

        let signing_key = hex::decode(signing_key_hex.trim())
            .map_err(|e| CodecError::InvalidKey(format!("signing key: {e}")))?;
        Self::new(encryption_key, signing_key)
    }

    /// HMAC-SHA256 of `message` under the signing key, lowercase hex.
    pub fn sign_hex(&self, message: &[u8]) -> Result<String, CodecError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.signing_key)
            .map_err(|e| CodecError::InvalidKey(e.to_string()))?;
        mac.update(message);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time check of a hex signature. Never errors: anything
    /// malformed is simply a mismatch.
    pub fn verify_hex(&self, message: &[u8], signature_hex: &str) -> bool {
        if signature_hex.is_empty() {
            return false;
        }
        let Ok(expected) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(&self.signing_key) else {
            return false;
        };
        mac.update(message);
        let actual = mac.finalize().into_bytes();
        if expected.len() != actual.len() {
            return false;
        }
        expected.ct_eq(actual.as_slice()).into()
    }

    /// Seal `plaintext` as `nonce || ciphertext || gcm_tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncodeError> {
        let nonce = self.synthetic_nonce(plaintext)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.encryption_key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| EncodeError::Encryption)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a buffer produced by [`TagKeys::encrypt`].
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, DecodeError> {
        if sealed.len() < NONCE_LEN + GCM_TAG_LEN {
            return Err(DecodeError::TruncatedCiphertext);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.encryption_key));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| DecodeError::DecryptionFailed)
    }

    fn synthetic_nonce(&self, plaintext: &[u8]) -> Result<[u8; NONCE_LEN], EncodeError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.encryption_key)
            .map_err(|_| EncodeError::Encryption)?;
        mac.update(NONCE_DOMAIN);
        mac.update(plaintext);
        let digest = mac.finalize().into_bytes();
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest[..NONCE_LEN]);
        Ok(nonce)
    }
}

impl fmt::Debug for TagKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagKeys")
            .field("encryption_key", &"<redacted>")
            .field("signing_key", &"<redacted>")
            .finish()
    }
}
