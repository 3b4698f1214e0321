//! Bit-exact binary wire codec for the synchronization protocol.
//!
//! Everything a peer puts on the wire goes through this module:
//!
//! - **varints** ([`varint`]): little-endian base-128 integers up to 2^53−1
//! - **values** ([`value`]): the tagged encoding of payload plaintext
//! - **timestamp blocks** ([`timestamps`]): delta + run-length encoded
//!   timestamp sequences shared by message lists and range bounds
//! - **frames** ([`frame`]): the protocol message itself -- header, encrypted
//!   messages, write key, reconciliation ranges -- plus the size-budgeted
//!   [`RangesBuilder`](frame::RangesBuilder)
//!
//! Decoding is strict: unknown tags, non-canonical varints, truncated input,
//! and trailing bytes all fail with [`WireError::InvalidData`].

pub mod frame;
pub mod timestamps;
pub mod value;
pub mod varint;

pub use frame::{
    peek_owner, EncryptedMessage, ErrorCode, MessageType, ProtocolMessage, Range, RangePayload,
    RangeUpper, RangesBuilder, SubscriptionFlag, DEFAULT_RANGES_MAX_SIZE, PROTOCOL_VERSION,
};
pub use value::Value;

/// Errors surfaced while encoding or decoding wire bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The bytes violate the wire format. The context string names the field
    /// that failed; it never reaches the wire.
    #[error("invalid data: {0}")]
    InvalidData(&'static str),
    /// The peer speaks a protocol version this build does not.
    #[error("unsupported protocol version {version}")]
    UnsupportedVersion {
        /// Version the peer announced.
        version: u64,
    },
}

/// Cursor over a received byte buffer.
///
/// Every read checks bounds and fails with [`WireError::InvalidData`] rather
/// than panicking: the buffer is attacker-controlled.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, WireError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or(WireError::InvalidData("unexpected end of input"))?;
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn read_slice(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(WireError::InvalidData("unexpected end of input"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn read_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let slice = self.read_slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    /// Remaining unread byte count.
    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Fails unless the whole buffer was consumed.
    pub(crate) fn expect_end(&self) -> Result<(), WireError> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(WireError::InvalidData("trailing bytes"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_bounds_checked() {
        let mut r = Reader::new(&[1, 2]);
        assert_eq!(r.read_u8().unwrap(), 1);
        assert_eq!(r.read_slice(1).unwrap(), &[2]);
        assert!(r.read_u8().is_err());
        r.expect_end().unwrap();
    }

    #[test]
    fn reader_rejects_trailing() {
        let r = Reader::new(&[0]);
        assert_eq!(
            r.expect_end().unwrap_err(),
            WireError::InvalidData("trailing bytes")
        );
    }
}
