//! rangesync core -- the synchronization engine for end-to-end encrypted,
//! causally ordered change records.
//!
//! This crate is the protocol and algorithm layer shared by clients and
//! relays:
//!
//! - **HLC** ([`hlc`]): hybrid logical clock producing globally unique,
//!   causally ordered 16-byte timestamps
//! - **Owner** ([`owner`]): owner identity and write-authorization secrets
//! - **Fingerprint** ([`fingerprint`]): 12-byte commutative set hashes
//!   (truncated SHA-256, XOR-combined)
//! - **Wire** ([`wire`]): the bit-exact binary protocol framing
//! - **Crypto** ([`crypto`]): symmetric encryption binding ciphertexts to
//!   their timestamps
//! - **Sync** ([`sync`]): range-based set reconciliation over a pluggable
//!   timestamp store
//! - **Runtime** ([`runtime`]): structured concurrency -- runner trees with
//!   ownership-bound cancellation, combinators, and disposal stacks
//!
//! Time, randomness, and nonces are injected through the [`hlc::ClockSource`]
//! and [`crypto::NonceSource`] seams; nothing reads ambient state, so every
//! layer tests deterministically.

pub mod crypto;
pub mod fingerprint;
pub mod hlc;
pub mod owner;
pub mod runtime;
pub mod sync;
pub mod wire;

// HLC
pub use hlc::{ClockSource, Hlc, HlcConfig, HlcError, NodeId, SystemClock, Timestamp};

// Owner
pub use owner::{OwnerId, WriteKey};

// Fingerprint
pub use fingerprint::Fingerprint;

// Wire
pub use wire::{
    EncryptedMessage, ErrorCode, MessageType, ProtocolMessage, Range, RangePayload, RangeUpper,
    RangesBuilder, SubscriptionFlag, Value, WireError,
};

// Crypto
pub use crypto::{CryptoError, NonceSource, SymmetricCrypto, TimestampBoundCipher};

// Sync
pub use sync::{
    apply_as_responder, Initiator, InsertStrategy, MemoryStore, RangeFingerprint, StoreError,
    SyncConfig, SyncError, TimestampStore, WriteOutcome,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reexports_accessible() {
        let _ = Timestamp::MIN;
        let _ = NodeId(7);
        let _ = Fingerprint::ZERO;
        let _ = OwnerId::from_bytes([0; 16]);
        let _ = WriteKey::from_bytes([0; 16]);
        let _ = SubscriptionFlag::Subscribe;
        let _ = SyncConfig::default();
        let _ = MemoryStore::new();
        let _ = runtime::Runner::new();
    }

    #[test]
    fn timestamp_min_sorts_first() {
        let later = Timestamp { millis: 1, counter: 0, node: NodeId(0) };
        assert!(Timestamp::MIN < later);
    }
}
