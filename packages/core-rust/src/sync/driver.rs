//! The two-role reconciliation driver (range-based set reconciliation).
//!
//! Both peers hold an ordered timestamp set; each round compares
//! fingerprints of nested ranges and narrows down to the symmetric
//! difference in `O(log n)` rounds. The [`Initiator`] opens a session and
//! consumes responses; [`apply_as_responder`] answers one request at a time
//! and is fully stateless, which is what lets a relay serve any number of
//! peers without per-session memory.
//!
//! Per round, each incoming range is handled as:
//!
//! 1. **Skip** -- the peer agrees on the segment; advance the cursor.
//! 2. **Fingerprint** -- compare against the local fingerprint. Equal: skip.
//!    Small segment: answer with the full timestamp list. Otherwise:
//!    subdivide into up to 16 near-equal buckets and answer a fingerprint
//!    per bucket. The ranges byte budget bounds how deep one round digs;
//!    when it runs out, the rest of the keyspace is deferred with an
//!    infinite skip.
//! 3. **Timestamps** -- diff against the local segment. Local extras are
//!    attached as encrypted messages; if the peer has extras we answer with
//!    our own list so the peer can send theirs.

use std::collections::BTreeSet;

use crate::hlc::Timestamp;
use crate::owner::{OwnerId, WriteKey};
use crate::wire::{
    peek_owner, ErrorCode, MessageType, ProtocolMessage, Range, RangePayload, RangeUpper,
    RangesBuilder, SubscriptionFlag, WireError, DEFAULT_RANGES_MAX_SIZE,
};

use super::store::{collect_range, StoreError, TimestampStore, WriteOutcome};

/// Tuning knobs of the reconciliation driver.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Byte budget for the ranges section of one frame.
    pub ranges_max_size: usize,
    /// Hard bound on rounds per session; crossing it is a protocol error.
    pub max_rounds: u32,
    /// Largest segment answered as a plain timestamp list. Above it, the
    /// fingerprint representation is smaller.
    pub timestamps_threshold: u64,
    /// Fan-out of one subdivision step.
    pub max_buckets: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ranges_max_size: DEFAULT_RANGES_MAX_SIZE,
            max_rounds: 64,
            timestamps_threshold: 31,
            max_buckets: 16,
        }
    }
}

/// Failures of a reconciliation session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    /// Bytes on the wire violate the format.
    #[error(transparent)]
    Wire(WireError),
    /// The peer runs an incompatible protocol version.
    #[error("unsupported protocol version {version} (initiator: {is_initiator})")]
    UnsupportedVersion {
        /// The offending version.
        version: u64,
        /// Whether this side initiated the session.
        is_initiator: bool,
    },
    /// The relay rejected the presented write key.
    #[error("write key rejected for owner {owner}")]
    WriteKey {
        /// The owner the write was addressed to.
        owner: OwnerId,
    },
    /// The relay rejected the write because of the owner's quota.
    #[error("storage quota exceeded for owner {owner}")]
    Quota {
        /// The owner over quota.
        owner: OwnerId,
    },
    /// The local write of received changes failed.
    #[error("storage write failed for owner {owner}")]
    StorageWrite {
        /// The affected owner.
        owner: OwnerId,
    },
    /// The session exceeded its round bound without converging.
    #[error("reconciliation exceeded the round limit")]
    RoundLimit,
    /// Opaque storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<WireError> for SyncError {
    fn from(error: WireError) -> Self {
        match error {
            WireError::UnsupportedVersion { version } => Self::UnsupportedVersion {
                version,
                is_initiator: false,
            },
            other => Self::Wire(other),
        }
    }
}

/// Initiator-side session state: the owner, the credentials, and the round
/// counter. Everything else lives in storage.
pub struct Initiator {
    owner: OwnerId,
    write_key: Option<WriteKey>,
    subscription: SubscriptionFlag,
    config: SyncConfig,
    rounds: u32,
}

impl Initiator {
    /// Creates a session for `owner`. Without a write key the session is
    /// read-only: local extras are withheld rather than pushed.
    #[must_use]
    pub fn new(owner: OwnerId, write_key: Option<WriteKey>, config: SyncConfig) -> Self {
        Self {
            owner,
            write_key,
            subscription: SubscriptionFlag::None,
            config,
            rounds: 0,
        }
    }

    /// Sets the subscription flag carried by every request of this session.
    pub fn set_subscription(&mut self, subscription: SubscriptionFlag) {
        self.subscription = subscription;
    }

    /// Builds the opening request.
    ///
    /// With at most [`SyncConfig::timestamps_threshold`] stored timestamps
    /// the whole set travels as a single `Timestamps` range; above that, the
    /// set is split into [`SyncConfig::max_buckets`] fingerprint ranges via
    /// cumulative bucket counts.
    ///
    /// # Errors
    ///
    /// Opaque storage failure.
    pub fn initiate(&mut self, store: &dyn TimestampStore) -> Result<ProtocolMessage, SyncError> {
        self.rounds = 0;
        let size = store.get_size(&self.owner)?;
        let mut builder = RangesBuilder::new(self.config.ranges_max_size);

        if size <= self.config.timestamps_threshold {
            let all = collect_range(store, &self.owner, 0, size)?;
            let pushed = builder.push(Range {
                upper: RangeUpper::Infinite,
                payload: RangePayload::Timestamps(all),
            });
            debug_assert!(pushed, "threshold-sized list fits any sane budget");
        } else {
            let buckets = self.config.max_buckets.min(size);
            let cumulative: Vec<u64> = (1..=buckets).map(|i| size * i / buckets).collect();
            let bucket_fps =
                store.fingerprint_ranges(&self.owner, 0, &cumulative, RangeUpper::Infinite)?;
            for rf in bucket_fps {
                if !builder.push(Range {
                    upper: rf.upper,
                    payload: RangePayload::Fingerprint(rf.fingerprint),
                }) {
                    break;
                }
            }
            if !builder.is_sealed() {
                let pushed = builder.push(Range {
                    upper: RangeUpper::Infinite,
                    payload: RangePayload::Skip,
                });
                debug_assert!(pushed);
            }
        }

        Ok(self.request(Vec::new(), builder.into_ranges()))
    }

    /// Applies one relay frame (response or broadcast): surfaces protocol
    /// errors, writes received changes to local storage, reconciles the
    /// ranges, and produces the next request -- or `None` when the session
    /// has converged.
    ///
    /// # Errors
    ///
    /// Protocol errors reported by the relay, wire violations, the round
    /// bound, or storage failures.
    pub async fn apply(
        &mut self,
        store: &dyn TimestampStore,
        frame: &[u8],
    ) -> Result<Option<ProtocolMessage>, SyncError> {
        self.rounds += 1;
        if self.rounds > self.config.max_rounds {
            return Err(SyncError::RoundLimit);
        }

        let msg = ProtocolMessage::decode(frame).map_err(|error| match error {
            WireError::UnsupportedVersion { version } => SyncError::UnsupportedVersion {
                version,
                is_initiator: true,
            },
            other => SyncError::Wire(other),
        })?;
        if msg.owner != self.owner || msg.kind == MessageType::Request {
            return Err(SyncError::Wire(WireError::InvalidData(
                "frame does not belong to this session",
            )));
        }
        match msg.error {
            ErrorCode::NoError => {}
            ErrorCode::WriteKey => return Err(SyncError::WriteKey { owner: self.owner }),
            ErrorCode::StorageQuota => return Err(SyncError::Quota { owner: self.owner }),
            ErrorCode::UnsupportedVersion => {
                return Err(SyncError::UnsupportedVersion {
                    version: crate::wire::PROTOCOL_VERSION,
                    is_initiator: true,
                })
            }
            ErrorCode::InvalidData => {
                return Err(SyncError::Wire(WireError::InvalidData(
                    "peer rejected the previous frame",
                )))
            }
        }

        if !msg.messages.is_empty() {
            match store.write_messages(&self.owner, None, &msg.messages).await? {
                WriteOutcome::Written { .. } => {}
                WriteOutcome::WriteKeyMismatch | WriteOutcome::QuotaExceeded => {
                    return Err(SyncError::StorageWrite { owner: self.owner })
                }
            }
        }
        if msg.kind == MessageType::Broadcast {
            return Ok(None);
        }

        let (ranges, give) = process_ranges(store, &self.owner, &msg.ranges, &self.config)?;
        let messages = if give.is_empty() {
            Vec::new()
        } else if self.write_key.is_some() {
            store.read_messages(&self.owner, &give)?
        } else {
            tracing::debug!(
                owner = %self.owner,
                withheld = give.len(),
                "read-only session: not pushing local changes"
            );
            Vec::new()
        };

        if ranges.is_empty() && messages.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.request(messages, ranges)))
    }

    fn request(&self, messages: Vec<crate::wire::EncryptedMessage>, ranges: Vec<Range>) -> ProtocolMessage {
        let write_key = (!messages.is_empty())
            .then_some(self.write_key)
            .flatten();
        ProtocolMessage {
            owner: self.owner,
            kind: MessageType::Request,
            error: ErrorCode::NoError,
            subscription: self.subscription,
            messages,
            write_key,
            ranges,
        }
    }
}

/// What the responder produced for one request.
#[derive(Debug)]
pub struct ResponderOutput {
    /// The owner the request addressed.
    pub owner: OwnerId,
    /// The requester's subscription intent, for the relay to act on.
    pub subscription: SubscriptionFlag,
    /// Frame to send back to the requester, if any.
    pub response: Option<ProtocolMessage>,
    /// Frame to fan out to the owner's other subscribers: the newly
    /// ingested changes, with the write key stripped.
    pub broadcast: Option<ProtocolMessage>,
}

fn error_response(owner: OwnerId, error: ErrorCode) -> ProtocolMessage {
    ProtocolMessage {
        owner,
        kind: MessageType::Response,
        error,
        subscription: SubscriptionFlag::None,
        messages: Vec::new(),
        write_key: None,
        ranges: Vec::new(),
    }
}

/// Answers one request frame against local storage.
///
/// Ingests carried messages first (write key, quota, and duplication are the
/// store's concern), then reconciles the ranges. Malformed or
/// wrong-versioned frames are answered with the matching error response
/// when the owner id is readable.
///
/// # Errors
///
/// [`SyncError::Wire`] when the frame is too broken to address a response,
/// [`SyncError::Store`] when storage fails (the caller logs it and drops the
/// session; internals never reach the wire).
pub async fn apply_as_responder(
    store: &dyn TimestampStore,
    frame: &[u8],
    config: &SyncConfig,
) -> Result<ResponderOutput, SyncError> {
    let msg = match ProtocolMessage::decode(frame) {
        Ok(msg) => msg,
        Err(error) => {
            let Some(owner) = peek_owner(frame) else {
                return Err(error.into());
            };
            let code = match error {
                WireError::UnsupportedVersion { version } => {
                    tracing::debug!(%owner, version, "rejecting frame: unsupported version");
                    ErrorCode::UnsupportedVersion
                }
                WireError::InvalidData(context) => {
                    tracing::debug!(%owner, context, "rejecting frame: invalid data");
                    ErrorCode::InvalidData
                }
            };
            return Ok(ResponderOutput {
                owner,
                subscription: SubscriptionFlag::None,
                response: Some(error_response(owner, code)),
                broadcast: None,
            });
        }
    };

    let owner = msg.owner;
    if msg.kind != MessageType::Request {
        return Ok(ResponderOutput {
            owner,
            subscription: SubscriptionFlag::None,
            response: Some(error_response(owner, ErrorCode::InvalidData)),
            broadcast: None,
        });
    }

    let mut broadcast = None;
    if !msg.messages.is_empty() {
        match store
            .write_messages(&owner, msg.write_key.as_ref(), &msg.messages)
            .await?
        {
            WriteOutcome::WriteKeyMismatch => {
                tracing::warn!(%owner, "write key mismatch");
                return Ok(ResponderOutput {
                    owner,
                    subscription: msg.subscription,
                    response: Some(error_response(owner, ErrorCode::WriteKey)),
                    broadcast: None,
                });
            }
            WriteOutcome::QuotaExceeded => {
                tracing::warn!(%owner, "storage quota exceeded");
                return Ok(ResponderOutput {
                    owner,
                    subscription: msg.subscription,
                    response: Some(error_response(owner, ErrorCode::StorageQuota)),
                    broadcast: None,
                });
            }
            WriteOutcome::Written { new_messages } => {
                if !new_messages.is_empty() {
                    broadcast = Some(ProtocolMessage {
                        owner,
                        kind: MessageType::Broadcast,
                        error: ErrorCode::NoError,
                        subscription: SubscriptionFlag::None,
                        messages: new_messages,
                        write_key: None,
                        ranges: Vec::new(),
                    });
                }
            }
        }
    }

    let (ranges, give) = process_ranges(store, &owner, &msg.ranges, config)?;
    let messages = if give.is_empty() {
        Vec::new()
    } else {
        store.read_messages(&owner, &give)?
    };

    let response = ProtocolMessage {
        owner,
        kind: MessageType::Response,
        error: ErrorCode::NoError,
        subscription: SubscriptionFlag::None,
        messages,
        write_key: None,
        ranges,
    };
    Ok(ResponderOutput {
        owner,
        subscription: msg.subscription,
        response: Some(response),
        broadcast,
    })
}

fn flush_pending_skip(builder: &mut RangesBuilder, pending: &mut Option<RangeUpper>) {
    if let Some(upper) = pending.take() {
        let pushed = builder.push(Range {
            upper,
            payload: RangePayload::Skip,
        });
        debug_assert!(pushed, "skip ranges always fit");
    }
}

/// Reconciles the peer's ranges against local storage.
///
/// Returns the ranges to answer with (empty when the whole keyspace agreed)
/// and the local timestamps the peer turned out to be missing.
fn process_ranges(
    store: &dyn TimestampStore,
    owner: &OwnerId,
    peer_ranges: &[Range],
    config: &SyncConfig,
) -> Result<(Vec<Range>, Vec<Timestamp>), SyncError> {
    let size = store.get_size(owner)?;
    let mut builder = RangesBuilder::new(config.ranges_max_size);
    let mut give: Vec<Timestamp> = Vec::new();
    let mut cursor: u64 = 0;
    let mut pending_skip: Option<RangeUpper> = None;
    let mut exhausted = false;

    for range in peer_ranges {
        let upper_idx = match &range.upper {
            RangeUpper::Finite(upper) => store.find_lower_bound(owner, cursor, size, upper)?,
            RangeUpper::Infinite => size,
        };
        if exhausted {
            cursor = upper_idx;
            continue;
        }

        match &range.payload {
            RangePayload::Skip => {
                pending_skip = Some(range.upper);
            }
            RangePayload::Fingerprint(peer_fp) => {
                let local_fp = store.fingerprint(owner, cursor, upper_idx)?;
                if local_fp == *peer_fp {
                    pending_skip = Some(range.upper);
                } else if upper_idx - cursor <= config.timestamps_threshold {
                    let local = collect_range(store, owner, cursor, upper_idx)?;
                    flush_pending_skip(&mut builder, &mut pending_skip);
                    if !builder.push(Range {
                        upper: range.upper,
                        payload: RangePayload::Timestamps(local),
                    }) {
                        exhausted = true;
                    }
                } else {
                    let count = upper_idx - cursor;
                    let buckets = config.max_buckets.min(count);
                    let cumulative: Vec<u64> =
                        (1..=buckets).map(|i| cursor + count * i / buckets).collect();
                    let bucket_fps =
                        store.fingerprint_ranges(owner, cursor, &cumulative, range.upper)?;
                    flush_pending_skip(&mut builder, &mut pending_skip);
                    for rf in bucket_fps {
                        if !builder.push(Range {
                            upper: rf.upper,
                            payload: RangePayload::Fingerprint(rf.fingerprint),
                        }) {
                            exhausted = true;
                            break;
                        }
                    }
                }
            }
            RangePayload::Timestamps(peer_list) => {
                let local = collect_range(store, owner, cursor, upper_idx)?;
                let peer_set: BTreeSet<Timestamp> = peer_list.iter().copied().collect();
                let local_set: BTreeSet<Timestamp> = local.iter().copied().collect();
                give.extend(local.iter().copied().filter(|ts| !peer_set.contains(ts)));
                let peer_has_extras = peer_list.iter().any(|ts| !local_set.contains(ts));
                if peer_has_extras {
                    // Announce our list so the peer can send what we lack.
                    flush_pending_skip(&mut builder, &mut pending_skip);
                    if !builder.push(Range {
                        upper: range.upper,
                        payload: RangePayload::Timestamps(local),
                    }) {
                        exhausted = true;
                    }
                } else {
                    pending_skip = Some(range.upper);
                }
            }
        }
        cursor = upper_idx;
    }

    if builder.is_empty() {
        // Nothing contentful: the keyspace agreed (up to messages we may
        // still attach for the peer's benefit).
        return Ok((Vec::new(), give));
    }
    if !builder.is_sealed() {
        let pushed = builder.push(Range {
            upper: RangeUpper::Infinite,
            payload: RangePayload::Skip,
        });
        debug_assert!(pushed);
    }
    Ok((builder.into_ranges(), give))
}
