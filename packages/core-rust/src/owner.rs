//! Owner identity and write authorization types.
//!
//! An [`OwnerId`] is the unit of partitioning, admission, and encryption:
//! every timestamp, message, and quota record is keyed by it, and it is the
//! routing key of every protocol frame. A [`WriteKey`] is the 16-byte shared
//! secret a peer must present to mutate an owner's data on a relay.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// Width of an [`OwnerId`] in bytes.
pub const OWNER_ID_LEN: usize = 16;

/// Width of a [`WriteKey`] in bytes.
pub const WRITE_KEY_LEN: usize = 16;

/// Length of the textual owner id form in characters.
pub const OWNER_ID_TEXT_LEN: usize = 21;

/// 16-byte opaque owner identifier.
///
/// The textual form is 21 url-safe base64 characters carrying 126 bits; ids
/// minted from text therefore always have the two lowest bits of the last
/// byte clear. The wire always carries the raw 16 bytes, whatever their bit
/// pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId([u8; OWNER_ID_LEN]);

impl OwnerId {
    /// Wraps 16 raw bytes as received on the wire.
    #[must_use]
    pub fn from_bytes(bytes: [u8; OWNER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// The raw 16 bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; OWNER_ID_LEN] {
        &self.0
    }

    /// Parses the 21-character url-safe base64 textual form.
    ///
    /// # Errors
    ///
    /// Returns [`OwnerIdParseError`] if the input is not exactly 21
    /// characters of the url-safe alphabet.
    pub fn parse(s: &str) -> Result<Self, OwnerIdParseError> {
        if s.len() != OWNER_ID_TEXT_LEN {
            return Err(OwnerIdParseError(s.to_string()));
        }
        // 21 chars carry 126 bits; a zero pad char supplies the final two
        // bits so the decoder sees a well-formed 16-byte group.
        let mut padded = String::with_capacity(OWNER_ID_TEXT_LEN + 1);
        padded.push_str(s);
        padded.push('A');
        let decoded = URL_SAFE_NO_PAD
            .decode(padded)
            .map_err(|_| OwnerIdParseError(s.to_string()))?;
        let bytes: [u8; OWNER_ID_LEN] = decoded
            .try_into()
            .map_err(|_| OwnerIdParseError(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for OwnerId {
    /// Renders the 21-character textual form.
    ///
    /// The encoding covers the leading 126 bits; for ids that honor the
    /// text-form invariant (two trailing zero bits) this is lossless.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full = URL_SAFE_NO_PAD.encode(self.0);
        f.write_str(&full[..OWNER_ID_TEXT_LEN])
    }
}

/// Error parsing the textual owner id form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid owner id: {0:?}")]
pub struct OwnerIdParseError(pub String);

/// 16-byte shared secret authorizing writes for one owner on a relay.
///
/// Equality is constant-time; the relay compares a presented key against the
/// stored one on every message-bearing request.
#[derive(Clone, Copy, Eq, Serialize, Deserialize)]
pub struct WriteKey([u8; WRITE_KEY_LEN]);

impl WriteKey {
    /// Wraps 16 raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; WRITE_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// The raw 16 bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; WRITE_KEY_LEN] {
        &self.0
    }
}

impl PartialEq for WriteKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

/// Debug never prints key material.
impl fmt::Debug for WriteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WriteKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_roundtrip() {
        let text = "A0b1C2d3E4f5G6h7I8j9K";
        let id = OwnerId::parse(text).unwrap();
        assert_eq!(id.to_string(), text);
    }

    #[test]
    fn bytes_roundtrip_under_invariant() {
        // Trailing two bits clear: text form is lossless.
        let mut bytes = [0xA7; OWNER_ID_LEN];
        bytes[OWNER_ID_LEN - 1] = 0xA4;
        let id = OwnerId::from_bytes(bytes);
        assert_eq!(OwnerId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!(OwnerId::parse("").is_err());
        assert!(OwnerId::parse("tooshort").is_err());
        assert!(OwnerId::parse("0123456789012345678901").is_err()); // 22 chars
    }

    #[test]
    fn parse_rejects_non_alphabet() {
        assert!(OwnerId::parse("!!!!!!!!!!!!!!!!!!!!!").is_err());
        assert!(OwnerId::parse("A0b1C2d3E4f5G6h7I8j9+").is_err()); // std alphabet
    }

    #[test]
    fn display_is_21_chars() {
        let id = OwnerId::from_bytes([0xFF; OWNER_ID_LEN]);
        assert_eq!(id.to_string().len(), OWNER_ID_TEXT_LEN);
    }

    #[test]
    fn write_key_equality() {
        let a = WriteKey::from_bytes([7; WRITE_KEY_LEN]);
        let b = WriteKey::from_bytes([7; WRITE_KEY_LEN]);
        let c = WriteKey::from_bytes([8; WRITE_KEY_LEN]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn write_key_debug_redacts() {
        let key = WriteKey::from_bytes([0x41; WRITE_KEY_LEN]);
        assert_eq!(format!("{key:?}"), "WriteKey(..)");
    }
}
