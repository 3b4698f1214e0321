//! rangesync relay -- the storage and ingestion side of the protocol.
//!
//! A relay is a blind forwarding server: it stores encrypted change records
//! indexed by owner and timestamp, reconciles timestamp sets with clients
//! via range-based set reconciliation, and fans ingested changes out to the
//! owner's subscribers -- all without ever seeing plaintext.
//!
//! - **Store** ([`store`]): the SQLite skiplist implementation of the core
//!   [`TimestampStore`](rangesync_core::sync::TimestampStore) contract,
//!   with write keys, quota, and per-owner write serialization
//! - **Relay** ([`relay`]): per-connection frame ingestion, subscriber
//!   sets, and broadcast
//! - **Config** ([`config`]): tuning knobs with serde support
//!
//! The transport is abstracted: the embedder owns a framed full-duplex byte
//! channel per connection and wires it to [`Relay::apply_as_relay`] and the
//! outbound receiver returned by [`Relay::register`].

pub mod config;
pub mod relay;
pub mod store;

pub use config::RelayConfig;
pub use relay::{ConnectionId, Relay};
pub use store::{
    sample_level, LevelSource, OwnerUsage, QuotaPolicy, RandomLevels, SqliteStore, StoreErrorSink,
    UnlimitedQuota,
};

/// Installs the process-wide tracing subscriber, honoring `RUST_LOG`.
///
/// Call once from the embedder's composition root; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rangesync_core::hlc::{NodeId, Timestamp};
    use rangesync_core::runtime::Runner;
    use rangesync_core::sync::TimestampStore;
    use rangesync_core::wire::EncryptedMessage;
    use rangesync_core::OwnerId;

    use super::*;

    #[tokio::test]
    async fn store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        let owner = OwnerId::from_bytes([8; 16]);
        let message = EncryptedMessage {
            timestamp: Timestamp { millis: 123, counter: 0, node: NodeId(1) },
            change: vec![9, 9, 9],
        };

        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            let store = SqliteStore::new(
                conn,
                Box::new(RandomLevels),
                Arc::new(UnlimitedQuota),
                Runner::new(),
            )
            .unwrap();
            store.write_messages(&owner, None, &[message.clone()]).await.unwrap();
        }

        let conn = rusqlite::Connection::open(&path).unwrap();
        let store = SqliteStore::new(
            conn,
            Box::new(RandomLevels),
            Arc::new(UnlimitedQuota),
            Runner::new(),
        )
        .unwrap();
        assert_eq!(store.get_size(&owner).unwrap(), 1);
        assert_eq!(store.read_messages(&owner, &[message.timestamp]).unwrap(), [message]);
    }
}
