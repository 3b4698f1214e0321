//! Relay engine: frame ingestion, subscriptions, and broadcast fan-out.
//!
//! The relay is blind: it stores ciphertext and reconciles timestamp sets
//! without ever decrypting. Transport is somebody else's problem -- the
//! embedder owns the framed byte channel (WebSocket, TCP, a test harness)
//! and wires it to [`Relay::apply_as_relay`], one call per incoming frame.
//!
//! Connections get per-connection bounded outbound channels; broadcasts use
//! non-blocking sends so one slow subscriber cannot stall ingestion -- a
//! full channel is skipped and the subscriber catches up through its next
//! reconciliation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use rangesync_core::owner::OwnerId;
use rangesync_core::sync::{apply_as_responder, SyncError, TimestampStore};
use rangesync_core::wire::{ErrorCode, SubscriptionFlag};

use crate::config::RelayConfig;

/// Unique identifier for a relay connection, assigned at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

struct ConnectionHandle {
    tx: mpsc::Sender<Vec<u8>>,
    /// Owners this connection subscribed to, for cleanup on disconnect.
    owners: Mutex<HashSet<OwnerId>>,
}

/// The relay: storage plus the per-owner subscriber sets.
pub struct Relay {
    store: Arc<dyn TimestampStore>,
    config: RelayConfig,
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    subscribers: DashMap<OwnerId, HashSet<ConnectionId>>,
    next_id: AtomicU64,
}

impl Relay {
    /// Creates a relay over `store`.
    pub fn new(store: Arc<dyn TimestampStore>, config: RelayConfig) -> Self {
        Self {
            store,
            config,
            connections: DashMap::new(),
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a connection. The receiver is the connection's outbound
    /// frame stream; the transport drains it onto the wire.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<Vec<u8>>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.config.outbound_channel_capacity);
        self.connections.insert(
            id,
            Arc::new(ConnectionHandle {
                tx,
                owners: Mutex::new(HashSet::new()),
            }),
        );
        (id, rx)
    }

    /// Removes a connection and its subscriptions.
    pub fn disconnect(&self, id: ConnectionId) {
        if let Some((_, handle)) = self.connections.remove(&id) {
            let owners = std::mem::take(&mut *handle.owners.lock());
            for owner in owners {
                if let Some(mut set) = self.subscribers.get_mut(&owner) {
                    set.remove(&id);
                }
            }
        }
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of connections subscribed to `owner`.
    #[must_use]
    pub fn subscriber_count(&self, owner: &OwnerId) -> usize {
        self.subscribers.get(owner).map_or(0, |set| set.len())
    }

    /// Processes one frame from `connection`, returning the response frame
    /// to send back on the same connection, if any. Newly ingested changes
    /// are fanned out to the owner's other subscribers as broadcast frames,
    /// write key stripped.
    ///
    /// # Errors
    ///
    /// [`SyncError::Store`] on backend failure (log and drop the
    /// connection; internals never reach the wire) and [`SyncError::Wire`]
    /// when the frame is too broken to even address an error response.
    pub async fn apply_as_relay(
        &self,
        connection: ConnectionId,
        frame: &[u8],
    ) -> Result<Option<Vec<u8>>, SyncError> {
        let output = apply_as_responder(self.store.as_ref(), frame, &self.config.sync()).await?;
        let owner = output.owner;

        match output.subscription {
            SubscriptionFlag::None => {}
            SubscriptionFlag::Subscribe => self.subscribe(owner, connection),
            SubscriptionFlag::Unsubscribe => self.unsubscribe(owner, connection),
        }

        // A rejected write key ends the owner's session on this connection.
        if output
            .response
            .as_ref()
            .is_some_and(|r| r.error == ErrorCode::WriteKey)
        {
            self.unsubscribe(owner, connection);
        }

        if let Some(broadcast) = output.broadcast {
            self.broadcast(owner, connection, &broadcast.encode());
        }

        Ok(output.response.map(|r| r.encode()))
    }

    fn subscribe(&self, owner: OwnerId, connection: ConnectionId) {
        let Some(handle) = self.connections.get(&connection) else {
            return;
        };
        handle.owners.lock().insert(owner);
        self.subscribers.entry(owner).or_default().insert(connection);
        tracing::debug!(%owner, connection = connection.0, "subscribed");
    }

    fn unsubscribe(&self, owner: OwnerId, connection: ConnectionId) {
        if let Some(handle) = self.connections.get(&connection) {
            handle.owners.lock().remove(&owner);
        }
        if let Some(mut set) = self.subscribers.get_mut(&owner) {
            set.remove(&connection);
        }
    }

    /// Fans a frame out to every subscriber of `owner` except `sender`.
    ///
    /// Non-blocking: a subscriber with a full outbound channel is skipped.
    fn broadcast(&self, owner: OwnerId, sender: ConnectionId, frame: &[u8]) {
        let Some(set) = self.subscribers.get(&owner) else {
            return;
        };
        for id in set.iter() {
            if *id == sender {
                continue;
            }
            let Some(handle) = self.connections.get(id) else {
                continue;
            };
            if handle.tx.try_send(frame.to_vec()).is_err() {
                tracing::debug!(
                    %owner,
                    connection = id.0,
                    "broadcast skipped: outbound channel full or closed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rangesync_core::hlc::{NodeId, Timestamp};
    use rangesync_core::owner::WriteKey;
    use rangesync_core::runtime::Runner;
    use rangesync_core::sync::{Initiator, MemoryStore, SyncConfig};
    use rangesync_core::wire::{
        EncryptedMessage, MessageType, ProtocolMessage, SubscriptionFlag,
    };

    use crate::store::{RandomLevels, SqliteStore, UnlimitedQuota};

    use super::*;

    fn owner() -> OwnerId {
        OwnerId::from_bytes([0x42; 16])
    }

    fn key() -> WriteKey {
        WriteKey::from_bytes([0x77; 16])
    }

    fn ts(millis: u64) -> Timestamp {
        Timestamp { millis, counter: 0, node: NodeId(5) }
    }

    fn relay() -> Relay {
        let store = SqliteStore::in_memory(
            Box::new(RandomLevels),
            Arc::new(UnlimitedQuota),
            Runner::new(),
        )
        .unwrap();
        Relay::new(Arc::new(store), RelayConfig::default())
    }

    fn push_frame(messages: Vec<EncryptedMessage>, subscription: SubscriptionFlag) -> Vec<u8> {
        let write_key = (!messages.is_empty()).then(key);
        ProtocolMessage {
            owner: owner(),
            kind: MessageType::Request,
            error: rangesync_core::wire::ErrorCode::NoError,
            subscription,
            messages,
            write_key,
            ranges: vec![],
        }
        .encode()
    }

    fn msg(millis: u64) -> EncryptedMessage {
        EncryptedMessage { timestamp: ts(millis), change: vec![1, 2, 3] }
    }

    #[tokio::test]
    async fn subscribe_and_broadcast_to_other_subscribers() {
        let relay = relay();
        let (writer, mut writer_rx) = relay.register();
        let (watcher, mut watcher_rx) = relay.register();

        // Both subscribe.
        for id in [writer, watcher] {
            let response = relay
                .apply_as_relay(id, &push_frame(vec![], SubscriptionFlag::Subscribe))
                .await
                .unwrap();
            assert!(response.is_some());
        }
        assert_eq!(relay.subscriber_count(&owner()), 2);

        // The writer pushes a change; only the watcher gets the broadcast.
        let response = relay
            .apply_as_relay(writer, &push_frame(vec![msg(100)], SubscriptionFlag::None))
            .await
            .unwrap()
            .unwrap();
        let response = ProtocolMessage::decode(&response).unwrap();
        assert_eq!(response.error, rangesync_core::wire::ErrorCode::NoError);

        let broadcast = watcher_rx.try_recv().expect("watcher receives broadcast");
        let broadcast = ProtocolMessage::decode(&broadcast).unwrap();
        assert_eq!(broadcast.kind, MessageType::Broadcast);
        assert_eq!(broadcast.messages.len(), 1);
        assert!(broadcast.write_key.is_none());

        assert!(writer_rx.try_recv().is_err(), "sender gets no echo");
    }

    #[tokio::test]
    async fn unsubscribe_stops_broadcasts() {
        let relay = relay();
        let (writer, _writer_rx) = relay.register();
        let (watcher, mut watcher_rx) = relay.register();

        relay
            .apply_as_relay(watcher, &push_frame(vec![], SubscriptionFlag::Subscribe))
            .await
            .unwrap();
        relay
            .apply_as_relay(watcher, &push_frame(vec![], SubscriptionFlag::Unsubscribe))
            .await
            .unwrap();
        assert_eq!(relay.subscriber_count(&owner()), 0);

        relay
            .apply_as_relay(writer, &push_frame(vec![msg(5)], SubscriptionFlag::None))
            .await
            .unwrap();
        assert!(watcher_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn write_key_mismatch_errors_and_ends_owner_session() {
        let relay = relay();
        let (client, _rx) = relay.register();

        // First write establishes the key and subscribes.
        relay
            .apply_as_relay(client, &push_frame(vec![msg(1)], SubscriptionFlag::Subscribe))
            .await
            .unwrap();
        assert_eq!(relay.subscriber_count(&owner()), 1);

        // A forged key gets the error response and the subscription is cut.
        let forged = ProtocolMessage {
            owner: owner(),
            kind: MessageType::Request,
            error: rangesync_core::wire::ErrorCode::NoError,
            subscription: SubscriptionFlag::None,
            messages: vec![msg(2)],
            write_key: Some(WriteKey::from_bytes([0xEE; 16])),
            ranges: vec![],
        };
        let response = relay
            .apply_as_relay(client, &forged.encode())
            .await
            .unwrap()
            .unwrap();
        let response = ProtocolMessage::decode(&response).unwrap();
        assert_eq!(response.error, rangesync_core::wire::ErrorCode::WriteKey);
        assert!(response.messages.is_empty() && response.ranges.is_empty());
        assert_eq!(relay.subscriber_count(&owner()), 0);
    }

    #[tokio::test]
    async fn disconnect_cleans_up_subscriptions() {
        let relay = relay();
        let (client, _rx) = relay.register();
        relay
            .apply_as_relay(client, &push_frame(vec![], SubscriptionFlag::Subscribe))
            .await
            .unwrap();
        assert_eq!(relay.connection_count(), 1);

        relay.disconnect(client);
        assert_eq!(relay.connection_count(), 0);
        assert_eq!(relay.subscriber_count(&owner()), 0);
    }

    /// A client with a local in-memory store converges against the relay's
    /// SQLite store through the full frame loop.
    #[tokio::test]
    async fn client_converges_against_relay() {
        let relay = relay();
        let (conn, _rx) = relay.register();

        // Seed the relay with some history.
        let history: Vec<EncryptedMessage> = (0..40).map(|i| msg(10_000 + i * 7)).collect();
        relay
            .apply_as_relay(conn, &push_frame(history, SubscriptionFlag::None))
            .await
            .unwrap();

        // Fresh client with a few local changes of its own.
        let local = MemoryStore::new();
        let local_changes: Vec<EncryptedMessage> = (0..5).map(|i| msg(99_000 + i)).collect();
        local
            .write_messages(&owner(), None, &local_changes)
            .await
            .unwrap();

        let mut initiator = Initiator::new(owner(), Some(key()), SyncConfig::default());
        let mut frame = initiator.initiate(&local).unwrap().encode();
        let mut hops = 0;
        loop {
            hops += 1;
            assert!(hops < 50, "no convergence");
            let Some(response) = relay.apply_as_relay(conn, &frame).await.unwrap() else {
                break;
            };
            match initiator.apply(&local, &response).await.unwrap() {
                Some(next) => frame = next.encode(),
                None => break,
            }
        }

        assert_eq!(local.get_size(&owner()).unwrap(), 45);
        assert_eq!(relay.store.get_size(&owner()).unwrap(), 45);
    }
}
