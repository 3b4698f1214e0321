//! Symmetric encryption binding ciphertexts to their timestamps.
//!
//! Change records are encrypted end to end; relays only ever see
//! ciphertext. Encryption prepends the canonical 16 timestamp bytes to the
//! plaintext before sealing, so the record's causal identity is covered by
//! the authentication tag. Decryption compares the embedded copy against the
//! timestamp the caller presents and rejects any disagreement -- replaying a
//! valid ciphertext under a swapped timestamp fails even though the
//! ciphertext itself verifies under the key.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};

use crate::hlc::{Timestamp, TIMESTAMP_LEN};

/// Width of a symmetric key in bytes.
pub const SYMMETRIC_KEY_LEN: usize = 32;

/// Width of the XChaCha20 nonce prepended to every ciphertext.
pub const NONCE_LEN: usize = 24;

/// Errors from [`SymmetricCrypto`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// The ciphertext was produced under a different timestamp than the one
    /// presented for decryption.
    #[error("ciphertext timestamp mismatch: expected {expected}, embedded {embedded}")]
    TimestampMismatch {
        /// Timestamp the caller presented.
        expected: Timestamp,
        /// Timestamp embedded in the ciphertext when it was produced.
        embedded: Timestamp,
    },
    /// The ciphertext failed authentication or is structurally broken.
    #[error("ciphertext failed authentication")]
    Aead,
}

/// Source of nonces, injected for deterministic tests.
pub trait NonceSource: Send + Sync {
    /// Produces 24 fresh random bytes.
    fn next_nonce(&self) -> [u8; NONCE_LEN];
}

/// Symmetric encryption of change payloads with timestamp binding.
///
/// A trait seam so embedders can substitute their own suite;
/// [`TimestampBoundCipher`] is the default implementation.
pub trait SymmetricCrypto: Send + Sync {
    /// Encrypts `plaintext` for `timestamp` under `key`.
    fn encrypt(
        &self,
        key: &[u8; SYMMETRIC_KEY_LEN],
        timestamp: &Timestamp,
        plaintext: &[u8],
    ) -> Vec<u8>;

    /// Decrypts `ciphertext`, verifying it was produced for `timestamp`.
    ///
    /// # Errors
    ///
    /// [`CryptoError::TimestampMismatch`] when the ciphertext is bound to a
    /// different timestamp; [`CryptoError::Aead`] when it is corrupt or was
    /// produced under a different key.
    fn decrypt(
        &self,
        key: &[u8; SYMMETRIC_KEY_LEN],
        timestamp: &Timestamp,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

/// XChaCha20-Poly1305 over `timestamp_bytes ‖ plaintext`.
///
/// Ciphertext layout: 24-byte nonce, then the AEAD output.
pub struct TimestampBoundCipher {
    nonces: Box<dyn NonceSource>,
}

impl TimestampBoundCipher {
    /// Creates a cipher drawing nonces from `nonces`.
    #[must_use]
    pub fn new(nonces: Box<dyn NonceSource>) -> Self {
        Self { nonces }
    }
}

impl SymmetricCrypto for TimestampBoundCipher {
    fn encrypt(
        &self,
        key: &[u8; SYMMETRIC_KEY_LEN],
        timestamp: &Timestamp,
        plaintext: &[u8],
    ) -> Vec<u8> {
        let cipher = XChaCha20Poly1305::new(key.into());
        let nonce_bytes = self.nonces.next_nonce();
        let nonce = XNonce::from_slice(&nonce_bytes);

        let mut msg = Vec::with_capacity(TIMESTAMP_LEN + plaintext.len());
        msg.extend_from_slice(&timestamp.to_bytes());
        msg.extend_from_slice(plaintext);

        let sealed = cipher
            .encrypt(nonce, msg.as_slice())
            .expect("XChaCha20-Poly1305 encryption is infallible for in-memory buffers");

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        out
    }

    fn decrypt(
        &self,
        key: &[u8; SYMMETRIC_KEY_LEN],
        timestamp: &Timestamp,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CryptoError::Aead);
        }
        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new(key.into());
        let nonce = XNonce::from_slice(nonce_bytes);

        let opened = cipher.decrypt(nonce, sealed).map_err(|_| CryptoError::Aead)?;
        if opened.len() < TIMESTAMP_LEN {
            return Err(CryptoError::Aead);
        }
        let (embedded_bytes, plaintext) = opened.split_at(TIMESTAMP_LEN);
        let mut arr = [0u8; TIMESTAMP_LEN];
        arr.copy_from_slice(embedded_bytes);
        let embedded = Timestamp::from_bytes(arr);
        if embedded != *timestamp {
            return Err(CryptoError::TimestampMismatch {
                expected: *timestamp,
                embedded,
            });
        }
        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::{NonceSource, NONCE_LEN};

    /// Deterministic nonce source: a counter spread over the nonce bytes.
    #[derive(Default)]
    pub struct CountingNonces {
        next: AtomicU64,
    }

    impl NonceSource for CountingNonces {
        fn next_nonce(&self) -> [u8; NONCE_LEN] {
            let n = self.next.fetch_add(1, Ordering::Relaxed);
            let mut out = [0u8; NONCE_LEN];
            out[..8].copy_from_slice(&n.to_be_bytes());
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::CountingNonces;
    use super::*;
    use crate::hlc::NodeId;

    fn cipher() -> TimestampBoundCipher {
        TimestampBoundCipher::new(Box::<CountingNonces>::default())
    }

    fn ts(millis: u64, counter: u16, node: u64) -> Timestamp {
        Timestamp { millis, counter, node: NodeId(node) }
    }

    const KEY: [u8; SYMMETRIC_KEY_LEN] = [0x42; SYMMETRIC_KEY_LEN];

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let c = cipher();
        let t = ts(1_700_000_000_000, 7, 0xAA);
        let sealed = c.encrypt(&KEY, &t, b"column update");
        assert_ne!(&sealed[NONCE_LEN..], b"column update");
        assert_eq!(c.decrypt(&KEY, &t, &sealed).unwrap(), b"column update");
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let c = cipher();
        let t = ts(1, 0, 1);
        let sealed = c.encrypt(&KEY, &t, b"");
        assert_eq!(c.decrypt(&KEY, &t, &sealed).unwrap(), b"");
    }

    #[test]
    fn swapped_timestamp_reports_both_timestamps() {
        let c = cipher();
        let original = ts(1_000, 0, 1);
        let forged = ts(2_000, 0, 1);
        let sealed = c.encrypt(&KEY, &original, b"secret");
        let err = c.decrypt(&KEY, &forged, &sealed).unwrap_err();
        assert_eq!(
            err,
            CryptoError::TimestampMismatch { expected: forged, embedded: original }
        );
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let c = cipher();
        let t = ts(1_000, 0, 1);
        let sealed = c.encrypt(&KEY, &t, b"secret");
        let other_key = [0x43; SYMMETRIC_KEY_LEN];
        assert_eq!(c.decrypt(&other_key, &t, &sealed).unwrap_err(), CryptoError::Aead);
    }

    #[test]
    fn corrupt_ciphertext_fails() {
        let c = cipher();
        let t = ts(1_000, 0, 1);
        let mut sealed = c.encrypt(&KEY, &t, b"secret");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(c.decrypt(&KEY, &t, &sealed).unwrap_err(), CryptoError::Aead);
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let c = cipher();
        assert_eq!(
            c.decrypt(&KEY, &ts(1, 0, 1), &[0x00; 5]).unwrap_err(),
            CryptoError::Aead
        );
    }

    #[test]
    fn distinct_nonces_give_distinct_ciphertexts() {
        let c = cipher();
        let t = ts(1_000, 0, 1);
        let a = c.encrypt(&KEY, &t, b"same");
        let b = c.encrypt(&KEY, &t, b"same");
        assert_ne!(a, b);
    }
}
