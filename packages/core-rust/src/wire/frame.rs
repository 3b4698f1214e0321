//! Protocol frames: header, encrypted messages, write key, ranges.
//!
//! One frame is one protocol message on the transport. The layout is
//! bit-exact and versioned; see the module docs of [`super`] for the field
//! order. Reconciliation ranges always cover `[0, ∞)`: the last range's
//! upper bound is the infinite sentinel and is implicit on the wire, so a
//! sequence of `n` ranges carries only `n − 1` finite bounds, packed into a
//! single delta + RLE timestamp block.

use crate::fingerprint::{Fingerprint, FINGERPRINT_LEN};
use crate::hlc::Timestamp;
use crate::owner::{OwnerId, WriteKey, OWNER_ID_LEN, WRITE_KEY_LEN};

use super::{timestamps, varint, Reader, WireError};

/// The protocol version this build speaks.
pub const PROTOCOL_VERSION: u64 = 0;

/// Default byte budget for the ranges section of one frame.
pub const DEFAULT_RANGES_MAX_SIZE: usize = 1024 * 1024;

/// Kind of a protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Initiator to relay.
    Request = 0,
    /// Relay to initiator, answering a request.
    Response = 1,
    /// Relay to the owner's other subscribers.
    Broadcast = 2,
}

impl MessageType {
    fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            2 => Ok(Self::Broadcast),
            _ => Err(WireError::InvalidData("unknown message type")),
        }
    }
}

/// Subscription intent carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionFlag {
    /// Leave the subscription state unchanged.
    #[default]
    None = 0,
    /// Add this connection to the owner's subscriber set.
    Subscribe = 1,
    /// Remove this connection from the owner's subscriber set.
    Unsubscribe = 2,
}

impl SubscriptionFlag {
    fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::Subscribe),
            2 => Ok(Self::Unsubscribe),
            _ => Err(WireError::InvalidData("unknown subscription flag")),
        }
    }
}

/// Protocol-level error code carried by responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorCode {
    /// Success.
    #[default]
    NoError = 0,
    /// The presented write key does not match the stored one.
    WriteKey = 1,
    /// The peer's protocol version is not supported.
    UnsupportedVersion = 2,
    /// The frame bytes violate the wire format.
    InvalidData = 3,
    /// The owner's storage quota would be exceeded.
    StorageQuota = 4,
}

impl ErrorCode {
    fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(Self::NoError),
            1 => Ok(Self::WriteKey),
            2 => Ok(Self::UnsupportedVersion),
            3 => Ok(Self::InvalidData),
            4 => Ok(Self::StorageQuota),
            _ => Err(WireError::InvalidData("unknown error code")),
        }
    }
}

/// An encrypted change record travelling in a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedMessage {
    /// Causal identity of the change. Bound into the ciphertext by the
    /// encryption layer.
    pub timestamp: Timestamp,
    /// Opaque ciphertext.
    pub change: Vec<u8>,
}

/// Upper bound of a reconciliation range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeUpper {
    /// Exclusive finite bound.
    Finite(Timestamp),
    /// Covers everything to the end of the keyspace.
    Infinite,
}

/// Payload of a reconciliation range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangePayload {
    /// The peer already agrees on this segment; advance without comparing.
    Skip,
    /// Compare the 12-byte fingerprint of the segment.
    Fingerprint(Fingerprint),
    /// The full timestamp list of the segment.
    Timestamps(Vec<Timestamp>),
}

const RANGE_TAG_SKIP: u8 = 0;
const RANGE_TAG_FINGERPRINT: u8 = 1;
const RANGE_TAG_TIMESTAMPS: u8 = 2;

/// One reconciliation range: a segment of the keyspace plus what the sender
/// asserts about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    /// Exclusive upper bound of the segment; the lower bound is the previous
    /// range's upper bound (or the start of the keyspace).
    pub upper: RangeUpper,
    /// What the sender asserts about the segment.
    pub payload: RangePayload,
}

/// A protocol message.
///
/// `write_key` must be present exactly when this is a [`MessageType::Request`]
/// carrying messages; [`ProtocolMessage::encode`] enforces that, as well as
/// the range coverage invariant (every non-empty range sequence ends with one
/// infinite-bounded range and none precedes it).
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolMessage {
    /// The owner this frame belongs to; the routing key.
    pub owner: OwnerId,
    /// Request, response, or broadcast.
    pub kind: MessageType,
    /// Error code; meaningful on responses, [`ErrorCode::NoError`] otherwise.
    pub error: ErrorCode,
    /// Subscription intent; meaningful on requests.
    pub subscription: SubscriptionFlag,
    /// Encrypted change records.
    pub messages: Vec<EncryptedMessage>,
    /// Write authorization, on message-bearing requests only.
    pub write_key: Option<WriteKey>,
    /// Reconciliation ranges. Either empty or covering `[0, ∞)`.
    pub ranges: Vec<Range>,
}

impl ProtocolMessage {
    /// Serializes the frame.
    ///
    /// # Panics
    ///
    /// Panics when structural invariants are violated: a non-final infinite
    /// range, a finite final range, a missing write key on a message-bearing
    /// request, or a write key anywhere else. These are programmer errors,
    /// not wire conditions.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let needs_key = self.kind == MessageType::Request && !self.messages.is_empty();
        assert_eq!(
            needs_key,
            self.write_key.is_some(),
            "write key must accompany message-bearing requests only"
        );
        if let Some((last, init)) = self.ranges.split_last() {
            assert!(
                last.upper == RangeUpper::Infinite
                    && init.iter().all(|r| matches!(r.upper, RangeUpper::Finite(_))),
                "ranges must cover the keyspace with one final infinite bound"
            );
        }

        let mut out = Vec::new();
        varint::encode(PROTOCOL_VERSION, &mut out);
        out.extend_from_slice(self.owner.as_bytes());
        out.push(self.kind as u8);
        if self.kind == MessageType::Request {
            out.push(self.subscription as u8);
        } else {
            out.push(self.error as u8);
        }

        varint::encode(self.messages.len() as u64, &mut out);
        if !self.messages.is_empty() {
            let stamps: Vec<Timestamp> = self.messages.iter().map(|m| m.timestamp).collect();
            timestamps::encode(&stamps, &mut out);
            for msg in &self.messages {
                varint::encode(msg.change.len() as u64, &mut out);
                out.extend_from_slice(&msg.change);
            }
        }

        if let Some(key) = &self.write_key {
            out.extend_from_slice(key.as_bytes());
        }

        varint::encode(self.ranges.len() as u64, &mut out);
        if !self.ranges.is_empty() {
            let bounds: Vec<Timestamp> = self
                .ranges
                .iter()
                .filter_map(|r| match r.upper {
                    RangeUpper::Finite(ts) => Some(ts),
                    RangeUpper::Infinite => None,
                })
                .collect();
            timestamps::encode(&bounds, &mut out);
            for range in &self.ranges {
                match &range.payload {
                    RangePayload::Skip => out.push(RANGE_TAG_SKIP),
                    RangePayload::Fingerprint(fp) => {
                        out.push(RANGE_TAG_FINGERPRINT);
                        out.extend_from_slice(fp.as_bytes());
                    }
                    RangePayload::Timestamps(ts) => {
                        out.push(RANGE_TAG_TIMESTAMPS);
                        varint::encode(ts.len() as u64, &mut out);
                        timestamps::encode(ts, &mut out);
                    }
                }
            }
        }
        out
    }

    /// Parses a frame.
    ///
    /// # Errors
    ///
    /// [`WireError::UnsupportedVersion`] when the version varint differs from
    /// [`PROTOCOL_VERSION`]; [`WireError::InvalidData`] for everything else
    /// the format forbids, including trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(bytes);

        let version = varint::decode(&mut r)?;
        if version != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion { version });
        }
        let owner = OwnerId::from_bytes(r.read_array::<OWNER_ID_LEN>()?);
        let kind = MessageType::from_u8(r.read_u8()?)?;
        let (error, subscription) = if kind == MessageType::Request {
            (ErrorCode::NoError, SubscriptionFlag::from_u8(r.read_u8()?)?)
        } else {
            (ErrorCode::from_u8(r.read_u8()?)?, SubscriptionFlag::None)
        };

        let count = checked_count(varint::decode(&mut r)?, &r)?;
        let messages = if count == 0 {
            Vec::new()
        } else {
            let stamps = timestamps::decode(&mut r, count)?;
            let mut messages = Vec::with_capacity(count);
            for timestamp in stamps {
                let len = usize::try_from(varint::decode(&mut r)?)
                    .map_err(|_| WireError::InvalidData("change length"))?;
                let change = r.read_slice(len)?.to_vec();
                messages.push(EncryptedMessage { timestamp, change });
            }
            messages
        };

        let write_key = if kind == MessageType::Request && !messages.is_empty() {
            Some(WriteKey::from_bytes(r.read_array::<WRITE_KEY_LEN>()?))
        } else {
            None
        };

        let range_count = checked_count(varint::decode(&mut r)?, &r)?;
        let ranges = if range_count == 0 {
            Vec::new()
        } else {
            let bounds = timestamps::decode(&mut r, range_count - 1)?;
            if bounds.windows(2).any(|w| w[0] >= w[1]) {
                return Err(WireError::InvalidData("range bounds must increase"));
            }
            let mut ranges = Vec::with_capacity(range_count);
            for i in 0..range_count {
                let payload = match r.read_u8()? {
                    RANGE_TAG_SKIP => RangePayload::Skip,
                    RANGE_TAG_FINGERPRINT => RangePayload::Fingerprint(Fingerprint(
                        r.read_array::<FINGERPRINT_LEN>()?,
                    )),
                    RANGE_TAG_TIMESTAMPS => {
                        let n = checked_count(varint::decode(&mut r)?, &r)?;
                        RangePayload::Timestamps(timestamps::decode(&mut r, n)?)
                    }
                    _ => return Err(WireError::InvalidData("unknown range tag")),
                };
                let upper = if i + 1 == range_count {
                    RangeUpper::Infinite
                } else {
                    RangeUpper::Finite(bounds[i])
                };
                ranges.push(Range { upper, payload });
            }
            ranges
        };

        r.expect_end()?;
        Ok(Self {
            owner,
            kind,
            error,
            subscription,
            messages,
            write_key,
            ranges,
        })
    }
}

/// Reads just the owner id out of a frame, tolerating everything after it.
///
/// Lets a relay address an error response (for example unsupported version)
/// without being able to fully decode the frame.
#[must_use]
pub fn peek_owner(bytes: &[u8]) -> Option<OwnerId> {
    let mut r = Reader::new(bytes);
    varint::decode(&mut r).ok()?;
    let owner = r.read_array::<OWNER_ID_LEN>().ok()?;
    Some(OwnerId::from_bytes(owner))
}

/// Bounds a decoded element count by the bytes actually present, so a
/// malicious count cannot trigger a huge allocation.
fn checked_count(count: u64, r: &Reader<'_>) -> Result<usize, WireError> {
    let count = usize::try_from(count).map_err(|_| WireError::InvalidData("count"))?;
    if count > r.remaining().saturating_add(1) {
        return Err(WireError::InvalidData("count exceeds input"));
    }
    Ok(count)
}

/// Accumulates ranges for one frame under a byte budget.
///
/// [`RangesBuilder::push`] returns `false` once a fingerprint or timestamps
/// range would push the serialized section past the budget; the caller then
/// stops subdividing and terminates with an infinite `Skip`, which is always
/// accepted. Pushing anything after an infinite-bounded range, or a second
/// infinite range, is a programmer error.
#[derive(Debug)]
pub struct RangesBuilder {
    ranges: Vec<Range>,
    max_size: usize,
    used: usize,
    prev_bound: Option<Timestamp>,
    sealed: bool,
}

impl RangesBuilder {
    /// Creates a builder with an explicit byte budget.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            ranges: Vec::new(),
            max_size,
            used: 0,
            prev_bound: None,
            sealed: false,
        }
    }

    /// Number of ranges accumulated so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether no range has been accumulated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Whether an infinite-bounded range has been pushed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Tries to add a range. Returns `false` (leaving the builder unchanged)
    /// when the budget would be exceeded; `Skip` ranges always succeed.
    ///
    /// # Panics
    ///
    /// Panics when called after an infinite-bounded range was pushed.
    pub fn push(&mut self, range: Range) -> bool {
        assert!(!self.sealed, "no range may follow an infinite upper bound");

        let cost = self.cost_of(&range);
        if !matches!(range.payload, RangePayload::Skip) && self.used + cost > self.max_size {
            return false;
        }

        self.used += cost;
        if let RangeUpper::Finite(ts) = range.upper {
            self.prev_bound = Some(ts);
        } else {
            self.sealed = true;
        }
        self.ranges.push(range);
        true
    }

    /// Consumes the builder.
    ///
    /// # Panics
    ///
    /// Panics unless the accumulated ranges cover the keyspace (the last
    /// pushed range had an infinite bound), or no range was pushed at all.
    #[must_use]
    pub fn into_ranges(self) -> Vec<Range> {
        assert!(
            self.ranges.is_empty() || self.sealed,
            "ranges must be terminated with an infinite upper bound"
        );
        self.ranges
    }

    /// Serialized cost of `range` in the ranges section, given the bounds
    /// already accumulated.
    fn cost_of(&self, range: &Range) -> usize {
        let mut scratch = Vec::new();
        if let RangeUpper::Finite(ts) = range.upper {
            match self.prev_bound {
                // Later bounds ride the delta encoding; a fresh counter run
                // and node run are assumed (an overestimate when runs merge).
                Some(prev) => {
                    varint::encode_signed(
                        ts.millis as i64 - prev.millis as i64,
                        &mut scratch,
                    );
                    varint::encode(1, &mut scratch);
                    varint::encode(u64::from(ts.counter), &mut scratch);
                    varint::encode(1, &mut scratch);
                    scratch.extend_from_slice(&ts.node.to_bytes());
                }
                None => scratch.extend_from_slice(&ts.to_bytes()),
            }
        }
        scratch.push(0); // tag
        match &range.payload {
            RangePayload::Skip => {}
            RangePayload::Fingerprint(_) => scratch.extend_from_slice(&[0; FINGERPRINT_LEN]),
            RangePayload::Timestamps(ts) => {
                varint::encode(ts.len() as u64, &mut scratch);
                timestamps::encode(ts, &mut scratch);
            }
        }
        scratch.len()
    }
}

impl Default for RangesBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_RANGES_MAX_SIZE)
    }
}
