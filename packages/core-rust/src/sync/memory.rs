//! In-memory reference implementation of [`TimestampStore`].
//!
//! Used by client-side code that does not need durability and by the driver
//! test-suite. Fingerprints are computed by direct iteration; the
//! logarithmic-cost skiplist lives in the relay's SQLite store, which must
//! agree with this implementation bit for bit.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::fingerprint::Fingerprint;
use crate::hlc::Timestamp;
use crate::owner::{OwnerId, WriteKey};
use crate::wire::{EncryptedMessage, RangeUpper};

use super::store::{
    InsertStrategy, RangeFingerprint, StoreError, TimestampStore, WriteOutcome,
};

#[derive(Default)]
struct OwnerSet {
    /// Sorted, deduplicated.
    stamps: Vec<Timestamp>,
    blobs: HashMap<Timestamp, Vec<u8>>,
    stored_bytes: u64,
}

impl OwnerSet {
    fn insert(&mut self, ts: Timestamp) -> bool {
        match self.stamps.binary_search(&ts) {
            Ok(_) => false,
            Err(pos) => {
                self.stamps.insert(pos, ts);
                true
            }
        }
    }

    fn bounds(&self) -> Option<(Timestamp, Timestamp)> {
        Some((*self.stamps.first()?, *self.stamps.last()?))
    }
}

/// Heap-backed [`TimestampStore`].
#[derive(Default)]
pub struct MemoryStore {
    owners: RwLock<HashMap<OwnerId, OwnerSet>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes of stored ciphertext for `owner`.
    #[must_use]
    pub fn stored_bytes(&self, owner: &OwnerId) -> u64 {
        self.owners
            .read()
            .get(owner)
            .map_or(0, |set| set.stored_bytes)
    }

    fn clamp(range: (u64, u64), len: usize) -> (usize, usize) {
        let begin = usize::try_from(range.0).unwrap_or(usize::MAX).min(len);
        let end = usize::try_from(range.1).unwrap_or(usize::MAX).min(len);
        (begin, end.max(begin))
    }
}

#[async_trait]
impl TimestampStore for MemoryStore {
    fn insert_timestamp(
        &self,
        owner: &OwnerId,
        ts: &Timestamp,
        _strategy: InsertStrategy,
    ) -> Result<(), StoreError> {
        self.owners.write().entry(*owner).or_default().insert(*ts);
        Ok(())
    }

    fn get_existing_timestamps(
        &self,
        owner: &OwnerId,
        timestamps: &[Timestamp],
    ) -> Result<Vec<Timestamp>, StoreError> {
        let owners = self.owners.read();
        let Some(set) = owners.get(owner) else {
            return Ok(Vec::new());
        };
        Ok(timestamps
            .iter()
            .filter(|ts| set.stamps.binary_search(ts).is_ok())
            .copied()
            .collect())
    }

    fn get_size(&self, owner: &OwnerId) -> Result<u64, StoreError> {
        Ok(self
            .owners
            .read()
            .get(owner)
            .map_or(0, |set| set.stamps.len() as u64))
    }

    fn fingerprint(
        &self,
        owner: &OwnerId,
        begin: u64,
        end: u64,
    ) -> Result<Fingerprint, StoreError> {
        let owners = self.owners.read();
        let Some(set) = owners.get(owner) else {
            return Ok(Fingerprint::ZERO);
        };
        let (begin, end) = Self::clamp((begin, end), set.stamps.len());
        Ok(Fingerprint::of(&set.stamps[begin..end]))
    }

    fn fingerprint_ranges(
        &self,
        owner: &OwnerId,
        begin: u64,
        cumulative_ends: &[u64],
        upper: RangeUpper,
    ) -> Result<Vec<RangeFingerprint>, StoreError> {
        let owners = self.owners.read();
        let empty = OwnerSet::default();
        let set = owners.get(owner).unwrap_or(&empty);
        let len = set.stamps.len();

        let mut out = Vec::with_capacity(cumulative_ends.len());
        let mut cursor = usize::try_from(begin).unwrap_or(usize::MAX).min(len);
        for (i, &cumulative) in cumulative_ends.iter().enumerate() {
            let end = usize::try_from(cumulative).unwrap_or(usize::MAX).min(len);
            let end = end.max(cursor);
            let bucket_upper = if i + 1 == cumulative_ends.len() {
                upper
            } else if end < len {
                RangeUpper::Finite(set.stamps[end])
            } else {
                RangeUpper::Infinite
            };
            out.push(RangeFingerprint {
                fingerprint: Fingerprint::of(&set.stamps[cursor..end]),
                upper: bucket_upper,
            });
            cursor = end;
        }
        Ok(out)
    }

    fn find_lower_bound(
        &self,
        owner: &OwnerId,
        begin: u64,
        end: u64,
        upper: &Timestamp,
    ) -> Result<u64, StoreError> {
        let owners = self.owners.read();
        let Some(set) = owners.get(owner) else {
            return Ok(begin);
        };
        let (begin, end) = Self::clamp((begin, end), set.stamps.len());
        let offset = set.stamps[begin..end].partition_point(|ts| ts < upper);
        Ok((begin + offset) as u64)
    }

    fn iterate(
        &self,
        owner: &OwnerId,
        begin: u64,
        end: u64,
        visit: &mut dyn FnMut(Timestamp, u64) -> bool,
    ) -> Result<(), StoreError> {
        let owners = self.owners.read();
        let Some(set) = owners.get(owner) else {
            return Ok(());
        };
        let (begin, end) = Self::clamp((begin, end), set.stamps.len());
        for (offset, ts) in set.stamps[begin..end].iter().enumerate() {
            if !visit(*ts, (begin + offset) as u64) {
                break;
            }
        }
        Ok(())
    }

    fn read_messages(
        &self,
        owner: &OwnerId,
        timestamps: &[Timestamp],
    ) -> Result<Vec<EncryptedMessage>, StoreError> {
        let owners = self.owners.read();
        let Some(set) = owners.get(owner) else {
            return Ok(Vec::new());
        };
        Ok(timestamps
            .iter()
            .filter_map(|ts| {
                set.blobs.get(ts).map(|change| EncryptedMessage {
                    timestamp: *ts,
                    change: change.clone(),
                })
            })
            .collect())
    }

    async fn write_messages(
        &self,
        owner: &OwnerId,
        _write_key: Option<&WriteKey>,
        messages: &[EncryptedMessage],
    ) -> Result<WriteOutcome, StoreError> {
        let mut owners = self.owners.write();
        let set = owners.entry(*owner).or_default();
        let mut new_messages = Vec::new();
        for message in messages {
            if set.insert(message.timestamp) {
                set.blobs.insert(message.timestamp, message.change.clone());
                set.stored_bytes += message.change.len() as u64;
                new_messages.push(message.clone());
            }
        }
        new_messages.sort_by_key(|m| m.timestamp);
        Ok(WriteOutcome::Written { new_messages })
    }

    fn delete_owner(&self, owner: &OwnerId) -> Result<(), StoreError> {
        self.owners.write().remove(owner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::hlc::NodeId;

    use super::*;

    fn ts(millis: u64) -> Timestamp {
        Timestamp { millis, counter: 0, node: NodeId(1) }
    }

    fn owner() -> OwnerId {
        OwnerId::from_bytes([9; 16])
    }

    #[tokio::test]
    async fn write_filters_duplicates() {
        let store = MemoryStore::new();
        let msg = EncryptedMessage { timestamp: ts(5), change: vec![1, 2] };
        let WriteOutcome::Written { new_messages } = store
            .write_messages(&owner(), None, &[msg.clone(), msg.clone()])
            .await
            .unwrap()
        else {
            panic!("expected write");
        };
        assert_eq!(new_messages.len(), 1);

        let WriteOutcome::Written { new_messages } =
            store.write_messages(&owner(), None, &[msg]).await.unwrap()
        else {
            panic!("expected write");
        };
        assert!(new_messages.is_empty());
        assert_eq!(store.get_size(&owner()).unwrap(), 1);
    }

    #[test]
    fn lower_bound_and_iterate() {
        let store = MemoryStore::new();
        for millis in [10, 20, 30, 40] {
            store
                .insert_timestamp(&owner(), &ts(millis), InsertStrategy::Append)
                .unwrap();
        }
        assert_eq!(store.find_lower_bound(&owner(), 0, 4, &ts(25)).unwrap(), 2);
        assert_eq!(store.find_lower_bound(&owner(), 0, 4, &ts(30)).unwrap(), 2);
        assert_eq!(store.find_lower_bound(&owner(), 0, 4, &ts(99)).unwrap(), 4);

        let mut seen = Vec::new();
        store
            .iterate(&owner(), 1, 3, &mut |ts, idx| {
                seen.push((ts.millis, idx));
                true
            })
            .unwrap();
        assert_eq!(seen, [(20, 1), (30, 2)]);
    }

    #[test]
    fn fingerprint_matches_direct_xor() {
        let store = MemoryStore::new();
        let stamps: Vec<Timestamp> = (0..10).map(|i| ts(i * 7)).collect();
        for t in &stamps {
            store.insert_timestamp(&owner(), t, InsertStrategy::Append).unwrap();
        }
        assert_eq!(
            store.fingerprint(&owner(), 2, 7).unwrap(),
            Fingerprint::of(&stamps[2..7])
        );
    }

    #[test]
    fn fingerprint_ranges_partitions() {
        let store = MemoryStore::new();
        let stamps: Vec<Timestamp> = (0..8).map(|i| ts(i + 1)).collect();
        for t in &stamps {
            store.insert_timestamp(&owner(), t, InsertStrategy::Append).unwrap();
        }
        let ranges = store
            .fingerprint_ranges(&owner(), 0, &[3, 6, 8], RangeUpper::Infinite)
            .unwrap();
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].fingerprint, Fingerprint::of(&stamps[0..3]));
        assert_eq!(ranges[0].upper, RangeUpper::Finite(stamps[3]));
        assert_eq!(ranges[1].fingerprint, Fingerprint::of(&stamps[3..6]));
        assert_eq!(ranges[1].upper, RangeUpper::Finite(stamps[6]));
        assert_eq!(ranges[2].fingerprint, Fingerprint::of(&stamps[6..8]));
        assert_eq!(ranges[2].upper, RangeUpper::Infinite);
    }

    #[test]
    fn delete_owner_drops_everything() {
        let store = MemoryStore::new();
        store.insert_timestamp(&owner(), &ts(1), InsertStrategy::Append).unwrap();
        store.delete_owner(&owner()).unwrap();
        assert_eq!(store.get_size(&owner()).unwrap(), 0);
    }
}
