//! Range-based set reconciliation over a pluggable timestamp store.
//!
//! - **Store contract** ([`store`]): the per-owner ordered timestamp set
//!   with range fingerprints the driver runs against
//! - **Reference store** ([`memory`]): heap-backed implementation for
//!   clients and tests; the relay ships the SQLite skiplist implementation
//! - **Driver** ([`driver`]): the [`Initiator`] session and the stateless
//!   [`apply_as_responder`] entry point

pub mod driver;
pub mod memory;
pub mod store;

pub use driver::{apply_as_responder, Initiator, ResponderOutput, SyncConfig, SyncError};
pub use memory::MemoryStore;
pub use store::{
    collect_range, InsertStrategy, RangeFingerprint, StoreError, TimestampStore, WriteOutcome,
};

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::hlc::{NodeId, Timestamp};
    use crate::owner::{OwnerId, WriteKey};
    use crate::wire::{EncryptedMessage, ErrorCode, MessageType, RangePayload};

    use super::*;

    fn ts(millis: u64, node: u64) -> Timestamp {
        Timestamp { millis, counter: 0, node: NodeId(node) }
    }

    fn owner() -> OwnerId {
        OwnerId::from_bytes([
            0x1A, 0x6D, 0xAB, 0xC4, 0x36, 0x22, 0x6E, 0x98, 0, 0, 0, 0, 0, 0, 0, 0,
        ])
    }

    fn write_key() -> WriteKey {
        WriteKey::from_bytes([0x11; 16])
    }

    fn message(millis: u64, node: u64) -> EncryptedMessage {
        EncryptedMessage {
            timestamp: ts(millis, node),
            change: millis.to_be_bytes().to_vec(),
        }
    }

    async fn seed(store: &MemoryStore, messages: &[EncryptedMessage]) {
        let WriteOutcome::Written { .. } =
            store.write_messages(&owner(), None, messages).await.unwrap()
        else {
            panic!("seed write refused");
        };
    }

    /// Drives a full session between two stores; returns the frame count.
    async fn sync_to_convergence(local: &MemoryStore, remote: &MemoryStore) -> u32 {
        let mut initiator = Initiator::new(owner(), Some(write_key()), SyncConfig::default());
        let config = SyncConfig::default();
        let mut frame = initiator.initiate(local).unwrap().encode();
        let mut frames = 1;

        loop {
            frames += 1;
            assert!(frames < 100, "sync does not converge");
            let output = apply_as_responder(remote, &frame, &config).await.unwrap();
            let response = output.response.expect("responder answers requests");
            assert_eq!(response.error, ErrorCode::NoError);
            match initiator.apply(local, &response.encode()).await.unwrap() {
                Some(next) => frame = next.encode(),
                None => break,
            }
        }
        frames
    }

    fn stored(store: &MemoryStore) -> Vec<Timestamp> {
        let size = store.get_size(&owner()).unwrap();
        collect_range(store, &owner(), 0, size).unwrap()
    }

    // ---- initial frame shapes ----

    #[tokio::test]
    async fn empty_initiate_is_single_timestamps_range() {
        let store = MemoryStore::new();
        let mut initiator = Initiator::new(owner(), None, SyncConfig::default());
        let msg = initiator.initiate(&store).unwrap();
        assert_eq!(msg.kind, MessageType::Request);
        assert_eq!(msg.ranges.len(), 1);
        assert!(matches!(&msg.ranges[0].payload, RangePayload::Timestamps(list) if list.is_empty()));
    }

    #[tokio::test]
    async fn initiate_31_sends_one_timestamps_range() {
        let store = MemoryStore::new();
        let msgs: Vec<EncryptedMessage> = (0..31).map(|i| message(1_000 + i * 60_000, 7)).collect();
        seed(&store, &msgs).await;

        let mut initiator = Initiator::new(owner(), None, SyncConfig::default());
        let frame = initiator.initiate(&store).unwrap();
        assert_eq!(frame.ranges.len(), 1);
        assert!(
            matches!(&frame.ranges[0].payload, RangePayload::Timestamps(list) if list.len() == 31)
        );
        assert!(frame.encode().len() <= 240);
    }

    #[tokio::test]
    async fn initiate_32_sends_sixteen_fingerprint_ranges() {
        let store = MemoryStore::new();
        let msgs: Vec<EncryptedMessage> = (0..32).map(|i| message(1_000 + i * 60_000, 7)).collect();
        seed(&store, &msgs).await;

        let mut initiator = Initiator::new(owner(), None, SyncConfig::default());
        let frame = initiator.initiate(&store).unwrap();
        assert_eq!(frame.ranges.len(), 16);
        assert!(frame
            .ranges
            .iter()
            .all(|r| matches!(r.payload, RangePayload::Fingerprint(_))));
        assert!(frame.encode().len() <= 335);
    }

    // ---- full sessions ----

    #[tokio::test]
    async fn empty_stores_converge_in_one_exchange() {
        let a = MemoryStore::new();
        let b = MemoryStore::new();
        let frames = sync_to_convergence(&a, &b).await;
        assert_eq!(frames, 2);
        assert!(stored(&a).is_empty());
        assert!(stored(&b).is_empty());
    }

    #[tokio::test]
    async fn one_sided_push_converges() {
        let a = MemoryStore::new();
        let b = MemoryStore::new();
        let msgs: Vec<EncryptedMessage> = (0..10).map(|i| message(1_000 + i, 1)).collect();
        seed(&a, &msgs).await;

        sync_to_convergence(&a, &b).await;
        assert_eq!(stored(&a), stored(&b));
        assert_eq!(stored(&b).len(), 10);
        // Ciphertexts arrived too.
        let blobs = b.read_messages(&owner(), &stored(&b)).unwrap();
        assert_eq!(blobs.len(), 10);
    }

    #[tokio::test]
    async fn one_sided_pull_converges() {
        let a = MemoryStore::new();
        let b = MemoryStore::new();
        let msgs: Vec<EncryptedMessage> = (0..40).map(|i| message(1_000 + i, 2)).collect();
        seed(&b, &msgs).await;

        sync_to_convergence(&a, &b).await;
        assert_eq!(stored(&a), stored(&b));
        assert_eq!(stored(&a).len(), 40);
    }

    #[tokio::test]
    async fn disjoint_large_sets_converge_within_round_bound() {
        let a = MemoryStore::new();
        let b = MemoryStore::new();
        let msgs_a: Vec<EncryptedMessage> = (0..300).map(|i| message(10_000 + i * 3, 1)).collect();
        let msgs_b: Vec<EncryptedMessage> = (0..300).map(|i| message(11_000 + i * 5, 2)).collect();
        seed(&a, &msgs_a).await;
        seed(&b, &msgs_b).await;

        let frames = sync_to_convergence(&a, &b).await;
        assert_eq!(stored(&a), stored(&b));
        assert_eq!(stored(&a).len(), 600 - overlap(&msgs_a, &msgs_b));
        // 2 * ceil(log16 600) + slack
        assert!(frames <= 16, "took {frames} frames");
    }

    fn overlap(a: &[EncryptedMessage], b: &[EncryptedMessage]) -> usize {
        let set: std::collections::BTreeSet<Timestamp> =
            a.iter().map(|m| m.timestamp).collect();
        b.iter().filter(|m| set.contains(&m.timestamp)).count()
    }

    #[tokio::test]
    async fn responder_broadcasts_newly_ingested_messages() {
        let relay = MemoryStore::new();
        let config = SyncConfig::default();

        let push = crate::wire::ProtocolMessage {
            owner: owner(),
            kind: MessageType::Request,
            error: ErrorCode::NoError,
            subscription: crate::wire::SubscriptionFlag::Subscribe,
            messages: vec![message(5_000, 3), message(6_000, 3)],
            write_key: Some(write_key()),
            ranges: vec![],
        };
        let output = apply_as_responder(&relay, &push.encode(), &config).await.unwrap();

        let broadcast = output.broadcast.expect("new messages fan out");
        assert_eq!(broadcast.kind, MessageType::Broadcast);
        assert_eq!(broadcast.messages.len(), 2);
        assert!(broadcast.write_key.is_none());
        assert_eq!(output.subscription, crate::wire::SubscriptionFlag::Subscribe);

        // Re-pushing the same messages produces no broadcast.
        let output = apply_as_responder(&relay, &push.encode(), &config).await.unwrap();
        assert!(output.broadcast.is_none());
    }

    #[tokio::test]
    async fn responder_answers_garbage_with_invalid_data() {
        let relay = MemoryStore::new();
        let config = SyncConfig::default();
        // A valid prefix (version + owner) followed by junk.
        let mut frame = vec![0x00];
        frame.extend_from_slice(owner().as_bytes());
        frame.extend_from_slice(&[0xEE, 0xEE]);
        let output = apply_as_responder(&relay, &frame, &config).await.unwrap();
        let response = output.response.unwrap();
        assert_eq!(response.error, ErrorCode::InvalidData);
        assert!(response.messages.is_empty() && response.ranges.is_empty());
    }

    #[tokio::test]
    async fn responder_answers_future_version_with_error() {
        let relay = MemoryStore::new();
        let config = SyncConfig::default();
        let mut frame = vec![0x05];
        frame.extend_from_slice(owner().as_bytes());
        let output = apply_as_responder(&relay, &frame, &config).await.unwrap();
        assert_eq!(output.response.unwrap().error, ErrorCode::UnsupportedVersion);
    }

    #[tokio::test]
    async fn initiator_surfaces_relay_errors() {
        let store = MemoryStore::new();
        let mut initiator = Initiator::new(owner(), Some(write_key()), SyncConfig::default());
        initiator.initiate(&store).unwrap();

        let reject = crate::wire::ProtocolMessage {
            owner: owner(),
            kind: MessageType::Response,
            error: ErrorCode::WriteKey,
            subscription: crate::wire::SubscriptionFlag::None,
            messages: vec![],
            write_key: None,
            ranges: vec![],
        };
        let err = initiator.apply(&store, &reject.encode()).await.unwrap_err();
        assert_eq!(err, SyncError::WriteKey { owner: owner() });

        let quota = crate::wire::ProtocolMessage { error: ErrorCode::StorageQuota, ..reject };
        let err = initiator.apply(&store, &quota.encode()).await.unwrap_err();
        assert_eq!(err, SyncError::Quota { owner: owner() });
    }

    #[tokio::test]
    async fn initiator_enforces_round_limit() {
        let store = MemoryStore::new();
        let config = SyncConfig { max_rounds: 2, ..SyncConfig::default() };
        let mut initiator = Initiator::new(owner(), None, config);
        initiator.initiate(&store).unwrap();

        let empty_response = crate::wire::ProtocolMessage {
            owner: owner(),
            kind: MessageType::Response,
            error: ErrorCode::NoError,
            subscription: crate::wire::SubscriptionFlag::None,
            messages: vec![],
            write_key: None,
            ranges: vec![],
        };
        let bytes = empty_response.encode();
        assert!(initiator.apply(&store, &bytes).await.unwrap().is_none());
        assert!(initiator.apply(&store, &bytes).await.unwrap().is_none());
        assert_eq!(
            initiator.apply(&store, &bytes).await.unwrap_err(),
            SyncError::RoundLimit
        );
    }

    #[tokio::test]
    async fn broadcast_frames_are_written_and_terminal() {
        let store = MemoryStore::new();
        let mut initiator = Initiator::new(owner(), Some(write_key()), SyncConfig::default());
        initiator.initiate(&store).unwrap();

        let broadcast = crate::wire::ProtocolMessage {
            owner: owner(),
            kind: MessageType::Broadcast,
            error: ErrorCode::NoError,
            subscription: crate::wire::SubscriptionFlag::None,
            messages: vec![message(7_000, 9)],
            write_key: None,
            ranges: vec![],
        };
        let next = initiator.apply(&store, &broadcast.encode()).await.unwrap();
        assert!(next.is_none());
        assert_eq!(store.get_size(&owner()).unwrap(), 1);
    }

    // ---- property: convergence over random sets ----

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]
        #[test]
        fn random_sets_converge(
            millis_a in prop::collection::btree_set(1_000_u64..200_000, 0..80),
            millis_b in prop::collection::btree_set(1_000_u64..200_000, 0..80),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(async {
                let a = MemoryStore::new();
                let b = MemoryStore::new();
                let msgs_a: Vec<EncryptedMessage> =
                    millis_a.iter().map(|&m| message(m, 1)).collect();
                let msgs_b: Vec<EncryptedMessage> =
                    millis_b.iter().map(|&m| message(m, 2)).collect();
                seed(&a, &msgs_a).await;
                seed(&b, &msgs_b).await;

                sync_to_convergence(&a, &b).await;
                assert_eq!(stored(&a), stored(&b));
            });
        }
    }
}
