//! The storage surface the reconciliation driver works against.
//!
//! A [`TimestampStore`] holds, per owner, an ordered set of timestamps with
//! logarithmic-cost range fingerprints plus the encrypted change blobs keyed
//! by timestamp. Positions are zero-based indices into the ordered set; all
//! ranges are half-open `[begin, end)`.
//!
//! Reads and skiplist maintenance are synchronous (the backing SQL binding
//! is synchronous and a context switch per query would dominate);
//! [`TimestampStore::write_messages`] alone is async so relay
//! implementations can consult an async quota policy inside the per-owner
//! critical section.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::fingerprint::Fingerprint;
use crate::hlc::Timestamp;
use crate::owner::{OwnerId, WriteKey};
use crate::wire::{EncryptedMessage, RangeUpper};

/// How a timestamp relates to the owner's stored set, picked by comparing it
/// against the usage record's first and last timestamps.
///
/// `Append` touches only forward parents and is roughly twice as fast as the
/// general `Insert`; writes from a live peer are almost always appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStrategy {
    /// Strictly greater than the stored last timestamp.
    Append,
    /// Strictly less than the stored first timestamp.
    Prepend,
    /// Anywhere in between.
    Insert,
}

impl InsertStrategy {
    /// Picks the strategy for `ts` given the stored bounds, if any.
    #[must_use]
    pub fn pick(ts: &Timestamp, bounds: Option<&(Timestamp, Timestamp)>) -> Self {
        match bounds {
            None => Self::Append,
            Some((first, last)) => {
                if ts > last {
                    Self::Append
                } else if ts < first {
                    Self::Prepend
                } else {
                    Self::Insert
                }
            }
        }
    }
}

/// One bucket produced by [`TimestampStore::fingerprint_ranges`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeFingerprint {
    /// Fingerprint of the bucket's timestamps.
    pub fingerprint: Fingerprint,
    /// Exclusive upper bound: the timestamp at the bucket's end index, or
    /// the caller-provided bound for the final bucket.
    pub upper: RangeUpper,
}

/// Result of a batched message write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The batch was committed; carries only the messages that were actually
    /// new (already-present timestamps are ignored).
    Written {
        /// Newly stored messages, in timestamp order.
        new_messages: Vec<EncryptedMessage>,
    },
    /// The presented write key does not match the stored one.
    WriteKeyMismatch,
    /// The owner's quota would be exceeded.
    QuotaExceeded,
}

/// Opaque storage failure.
///
/// The backend's detail is surfaced to the embedder's error sink; peers only
/// ever learn that a write failed, never why.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("storage failure: {0}")]
pub struct StoreError(pub Arc<str>);

impl StoreError {
    /// Wraps any displayable failure.
    pub fn new(error: impl fmt::Display) -> Self {
        Self(error.to_string().into())
    }
}

/// Per-owner ordered timestamp set with range fingerprints and message
/// blobs.
#[async_trait]
pub trait TimestampStore: Send + Sync {
    /// Inserts one timestamp using the given strategy. Idempotent on
    /// duplicates.
    ///
    /// # Errors
    ///
    /// Opaque backend failure.
    fn insert_timestamp(
        &self,
        owner: &OwnerId,
        ts: &Timestamp,
        strategy: InsertStrategy,
    ) -> Result<(), StoreError>;

    /// Returns the subset of `timestamps` already present, in one batched
    /// query.
    ///
    /// # Errors
    ///
    /// Opaque backend failure.
    fn get_existing_timestamps(
        &self,
        owner: &OwnerId,
        timestamps: &[Timestamp],
    ) -> Result<Vec<Timestamp>, StoreError>;

    /// Number of stored timestamps.
    ///
    /// # Errors
    ///
    /// Opaque backend failure.
    fn get_size(&self, owner: &OwnerId) -> Result<u64, StoreError>;

    /// Fingerprint of the index range `[begin, end)`.
    ///
    /// # Errors
    ///
    /// Opaque backend failure.
    fn fingerprint(&self, owner: &OwnerId, begin: u64, end: u64)
        -> Result<Fingerprint, StoreError>;

    /// Fingerprints a partition of `[0 or previous, …)` described by
    /// cumulative end indices, in one query. The final bucket's bound is
    /// `upper`.
    ///
    /// # Errors
    ///
    /// Opaque backend failure.
    fn fingerprint_ranges(
        &self,
        owner: &OwnerId,
        begin: u64,
        cumulative_ends: &[u64],
        upper: RangeUpper,
    ) -> Result<Vec<RangeFingerprint>, StoreError>;

    /// Index of the first timestamp `>= upper` within `[begin, end)`, or
    /// `end` when none is.
    ///
    /// # Errors
    ///
    /// Opaque backend failure.
    fn find_lower_bound(
        &self,
        owner: &OwnerId,
        begin: u64,
        end: u64,
        upper: &Timestamp,
    ) -> Result<u64, StoreError>;

    /// Calls `visit(ts, index)` for `[begin, end)` in timestamp order until
    /// it returns `false`.
    ///
    /// # Errors
    ///
    /// Opaque backend failure.
    fn iterate(
        &self,
        owner: &OwnerId,
        begin: u64,
        end: u64,
        visit: &mut dyn FnMut(Timestamp, u64) -> bool,
    ) -> Result<(), StoreError>;

    /// Reads the encrypted blobs for `timestamps` (absent ones are skipped).
    ///
    /// # Errors
    ///
    /// Opaque backend failure.
    fn read_messages(
        &self,
        owner: &OwnerId,
        timestamps: &[Timestamp],
    ) -> Result<Vec<EncryptedMessage>, StoreError>;

    /// Ingests a batch of encrypted messages atomically: filters existing
    /// timestamps, verifies the write key, checks quota, then commits the
    /// skiplist rows, the blobs, and the usage record in one transaction.
    ///
    /// # Errors
    ///
    /// Opaque backend failure (the transaction rolled back).
    async fn write_messages(
        &self,
        owner: &OwnerId,
        write_key: Option<&WriteKey>,
        messages: &[EncryptedMessage],
    ) -> Result<WriteOutcome, StoreError>;

    /// Drops the owner's timestamps, messages, usage, and write key.
    ///
    /// # Errors
    ///
    /// Opaque backend failure.
    fn delete_owner(&self, owner: &OwnerId) -> Result<(), StoreError>;
}

/// Collects the timestamps of `[begin, end)` into a vector.
///
/// # Errors
///
/// Opaque backend failure.
pub fn collect_range(
    store: &dyn TimestampStore,
    owner: &OwnerId,
    begin: u64,
    end: u64,
) -> Result<Vec<Timestamp>, StoreError> {
    let mut out = Vec::with_capacity(usize::try_from(end.saturating_sub(begin)).unwrap_or(0));
    store.iterate(owner, begin, end, &mut |ts, _idx| {
        out.push(ts);
        true
    })?;
    Ok(out)
}
