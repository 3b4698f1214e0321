//! Hybrid Logical Clock (HLC) for causally ordered change identifiers.
//!
//! Produces globally unique timestamps combining physical wall-clock millis,
//! a 16-bit logical counter, and a stable node identifier. Timestamps are the
//! primary key of every synchronized change record, so their ordering must be
//! total and identical on every peer.
//!
//! # Wire format
//!
//! A timestamp serializes canonically into 16 big-endian bytes:
//! 6 bytes millis, 2 bytes counter, 8 bytes node id. Lexicographic order on
//! this byte form equals `(millis, counter, node)` tuple order, which is what
//! the skiplist store and the range fingerprints rely on.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Largest representable physical time: 48 bits of milliseconds.
pub const MAX_MILLIS: u64 = (1 << 48) - 1;

/// Canonical serialized width of a [`Timestamp`].
pub const TIMESTAMP_LEN: usize = 16;

/// Stable identifier of the node that generated a timestamp.
///
/// 8 bytes; the textual form is 16 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Reconstructs a node id from its 8 big-endian bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    /// Returns the 8 big-endian bytes of this node id.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Parses the 16-hex-character textual form.
    ///
    /// # Errors
    ///
    /// Returns [`HlcError::InvalidNodeId`] if the input is not exactly
    /// 16 lowercase hex characters.
    pub fn parse(s: &str) -> Result<Self, HlcError> {
        if s.len() != 16 || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(HlcError::InvalidNodeId(s.to_string()));
        }
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| HlcError::InvalidNodeId(s.to_string()))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A hybrid logical timestamp: physical millis, logical counter, node identity.
///
/// Ordering is `millis` first, then `counter`, then `node` -- the derived
/// field order below is load-bearing and must match the canonical byte form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Physical wall-clock milliseconds since Unix epoch. At most 48 bits.
    pub millis: u64,
    /// Logical counter disambiguating events within the same millisecond.
    pub counter: u16,
    /// Identifier of the generating node.
    pub node: NodeId,
}

impl Timestamp {
    /// The smallest timestamp; used as the inclusive lower bound of the
    /// whole keyspace.
    pub const MIN: Self = Self {
        millis: 0,
        counter: 0,
        node: NodeId(0),
    };

    /// Serializes into the canonical 16-byte big-endian form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; TIMESTAMP_LEN] {
        debug_assert!(self.millis <= MAX_MILLIS);
        let mut out = [0u8; TIMESTAMP_LEN];
        out[..6].copy_from_slice(&self.millis.to_be_bytes()[2..]);
        out[6..8].copy_from_slice(&self.counter.to_be_bytes());
        out[8..].copy_from_slice(&self.node.to_bytes());
        out
    }

    /// Reconstructs a timestamp from its canonical 16-byte form.
    #[must_use]
    pub fn from_bytes(bytes: [u8; TIMESTAMP_LEN]) -> Self {
        let mut millis = [0u8; 8];
        millis[2..].copy_from_slice(&bytes[..6]);
        let mut counter = [0u8; 2];
        counter.copy_from_slice(&bytes[6..8]);
        let mut node = [0u8; 8];
        node.copy_from_slice(&bytes[8..]);
        Self {
            millis: u64::from_be_bytes(millis),
            counter: u16::from_be_bytes(counter),
            node: NodeId::from_bytes(node),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.millis, self.counter, self.node)
    }
}

/// Errors from [`Hlc::send`] and [`Hlc::receive`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HlcError {
    /// The gap between the wall clock and the observed physical time exceeds
    /// the configured threshold.
    #[error("clock drift of {drift_millis}ms exceeds the {max_drift_millis}ms threshold")]
    ClockDrift {
        /// Absolute difference between wall clock and observed millis.
        drift_millis: u64,
        /// Configured threshold.
        max_drift_millis: u64,
    },
    /// More than 2^16 events were generated within a single millisecond.
    #[error("timestamp counter overflowed")]
    CounterOverflow,
    /// A timestamp claiming to come from this node arrived from a peer.
    #[error("received a timestamp carrying the local node id {0}")]
    DuplicateNode(NodeId),
    /// A node id literal failed to parse.
    #[error("invalid node id: {0:?}")]
    InvalidNodeId(String),
}

/// Abstraction over the system clock for dependency injection.
///
/// Allows deterministic testing by replacing the real clock with a scripted
/// one. The default implementation ([`SystemClock`]) reads `SystemTime`.
pub trait ClockSource: Send + Sync {
    /// Current time as milliseconds since Unix epoch.
    fn now(&self) -> u64;
}

/// Default clock source reading the real system time.
#[derive(Debug, Clone)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before Unix epoch")
            .as_millis() as u64
    }
}

/// Configuration for an [`Hlc`].
#[derive(Debug, Clone)]
pub struct HlcConfig {
    /// Largest tolerated gap between wall clock and observed physical time.
    pub max_drift_millis: u64,
}

impl Default for HlcConfig {
    fn default() -> Self {
        Self {
            max_drift_millis: 5 * 60 * 1000,
        }
    }
}

/// Hybrid Logical Clock.
///
/// [`Hlc::send`] stamps locally created changes; [`Hlc::receive`] advances the
/// local clock past a timestamp received from a peer. Both keep the invariant
/// that every produced timestamp is strictly greater than every timestamp
/// this clock has produced or observed before.
pub struct Hlc {
    last: Timestamp,
    config: HlcConfig,
    clock: Box<dyn ClockSource>,
}

impl Hlc {
    /// Creates a clock for `node` with the default configuration.
    pub fn new(node: NodeId, clock: Box<dyn ClockSource>) -> Self {
        Self::with_config(node, clock, HlcConfig::default())
    }

    /// Creates a clock for `node` with an explicit configuration.
    pub fn with_config(node: NodeId, clock: Box<dyn ClockSource>, config: HlcConfig) -> Self {
        Self {
            last: Timestamp {
                millis: 0,
                counter: 0,
                node,
            },
            config,
            clock,
        }
    }

    /// The node id this clock stamps timestamps with.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.last.node
    }

    /// The most recent timestamp produced or merged by this clock.
    #[must_use]
    pub fn last(&self) -> Timestamp {
        self.last
    }

    /// Produces a timestamp for a locally created change.
    ///
    /// Advances millis to `max(wall_now, last.millis)`; within an unchanged
    /// millisecond the counter increments, otherwise it resets to zero.
    ///
    /// # Errors
    ///
    /// [`HlcError::ClockDrift`] if the logical clock has run ahead of the
    /// wall clock beyond the configured threshold (typically after merging a
    /// timestamp from a peer with a badly skewed clock).
    /// [`HlcError::CounterOverflow`] after 2^16 sends in one millisecond.
    pub fn send(&mut self) -> Result<Timestamp, HlcError> {
        let wall = self.clock.now();
        let millis = wall.max(self.last.millis);

        if millis - wall > self.config.max_drift_millis {
            return Err(HlcError::ClockDrift {
                drift_millis: millis - wall,
                max_drift_millis: self.config.max_drift_millis,
            });
        }

        let counter = if millis == self.last.millis {
            u32::from(self.last.counter) + 1
        } else {
            0
        };
        let counter = u16::try_from(counter).map_err(|_| HlcError::CounterOverflow)?;

        self.last = Timestamp {
            millis,
            counter,
            node: self.last.node,
        };
        Ok(self.last)
    }

    /// Merges a timestamp received from a peer, advancing the local clock
    /// strictly beyond it.
    ///
    /// # Errors
    ///
    /// [`HlcError::DuplicateNode`] if `remote` carries the local node id: a
    /// timestamp can never arrive from self.
    /// [`HlcError::ClockDrift`] if `|remote.millis - wall_now|` exceeds the
    /// configured threshold.
    /// [`HlcError::CounterOverflow`] if advancing the counter leaves u16.
    pub fn receive(&mut self, remote: Timestamp) -> Result<Timestamp, HlcError> {
        if remote.node == self.last.node {
            return Err(HlcError::DuplicateNode(remote.node));
        }

        let wall = self.clock.now();
        let drift = wall.abs_diff(remote.millis);
        if drift > self.config.max_drift_millis {
            tracing::warn!(
                drift_millis = drift,
                remote_millis = remote.millis,
                wall_millis = wall,
                "rejecting remote timestamp: clock drift"
            );
            return Err(HlcError::ClockDrift {
                drift_millis: drift,
                max_drift_millis: self.config.max_drift_millis,
            });
        }

        let millis = wall.max(self.last.millis).max(remote.millis);
        let counter = if millis == self.last.millis && millis == remote.millis {
            u32::from(self.last.counter.max(remote.counter)) + 1
        } else if millis == self.last.millis {
            u32::from(self.last.counter) + 1
        } else if millis == remote.millis {
            u32::from(remote.counter) + 1
        } else {
            0
        };
        let counter = u16::try_from(counter).map_err(|_| HlcError::CounterOverflow)?;

        self.last = Timestamp {
            millis,
            counter,
            node: self.last.node,
        };
        Ok(self.last)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
    use std::sync::Arc;

    use super::*;

    /// A deterministic clock source for testing. Time is controlled explicitly.
    struct FixedClock {
        time: Arc<AtomicU64>,
    }

    impl FixedClock {
        fn new(initial: u64) -> (Self, Arc<AtomicU64>) {
            let time = Arc::new(AtomicU64::new(initial));
            (Self { time: time.clone() }, time)
        }
    }

    impl ClockSource for FixedClock {
        fn now(&self) -> u64 {
            self.time.load(AtomicOrdering::Relaxed)
        }
    }

    fn node(n: u64) -> NodeId {
        NodeId(n)
    }

    fn hlc_at(millis: u64, n: u64) -> Hlc {
        let (clock, _) = FixedClock::new(millis);
        Hlc::new(node(n), Box::new(clock))
    }

    // ---- Canonical byte form ----

    #[test]
    fn to_bytes_layout() {
        let ts = Timestamp {
            millis: 0x0102_0304_0506,
            counter: 0x0708,
            node: NodeId(0x090A_0B0C_0D0E_0F10),
        };
        assert_eq!(
            ts.to_bytes(),
            [1, 2, 3, 4, 5, 6, 7, 8, 9, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10]
        );
    }

    #[test]
    fn bytes_roundtrip() {
        let ts = Timestamp {
            millis: MAX_MILLIS,
            counter: u16::MAX,
            node: NodeId(u64::MAX),
        };
        assert_eq!(Timestamp::from_bytes(ts.to_bytes()), ts);
    }

    #[test]
    fn byte_order_equals_tuple_order() {
        let samples = [
            Timestamp { millis: 1, counter: 0, node: NodeId(9) },
            Timestamp { millis: 1, counter: 1, node: NodeId(0) },
            Timestamp { millis: 2, counter: 0, node: NodeId(0) },
            Timestamp { millis: 2, counter: 0, node: NodeId(1) },
        ];
        for a in &samples {
            for b in &samples {
                assert_eq!(a.cmp(b), a.to_bytes().cmp(&b.to_bytes()), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn min_is_all_zero_bytes() {
        assert_eq!(Timestamp::MIN.to_bytes(), [0u8; TIMESTAMP_LEN]);
    }

    // ---- NodeId text form ----

    #[test]
    fn node_id_display_parse_roundtrip() {
        let id = NodeId(0xDEAD_BEEF_0000_0001);
        let text = id.to_string();
        assert_eq!(text.len(), 16);
        assert_eq!(NodeId::parse(&text).unwrap(), id);
    }

    #[test]
    fn node_id_parse_rejects_bad_input() {
        assert!(NodeId::parse("").is_err());
        assert!(NodeId::parse("xyz").is_err());
        assert!(NodeId::parse("DEADBEEF00000001").is_err()); // uppercase
        assert!(NodeId::parse("0123456789abcde").is_err()); // 15 chars
    }

    // ---- send ----

    #[test]
    fn send_monotonic_within_one_millisecond() {
        let mut hlc = hlc_at(1_000_000, 1);
        let a = hlc.send().unwrap();
        let b = hlc.send().unwrap();
        let c = hlc.send().unwrap();
        assert!(a < b && b < c);
        assert_eq!((a.counter, b.counter, c.counter), (0, 1, 2));
        assert_eq!(a.millis, 1_000_000);
    }

    #[test]
    fn send_resets_counter_when_clock_advances() {
        let (clock, time) = FixedClock::new(1_000_000);
        let mut hlc = Hlc::new(node(1), Box::new(clock));
        let a = hlc.send().unwrap();
        time.store(1_000_001, AtomicOrdering::Relaxed);
        let b = hlc.send().unwrap();
        assert_eq!(a.counter, 0);
        assert_eq!(b.millis, 1_000_001);
        assert_eq!(b.counter, 0);
    }

    #[test]
    fn send_counter_overflow() {
        let mut hlc = hlc_at(1_000_000, 1);
        for _ in 0..u32::from(u16::MAX) + 1 {
            hlc.send().unwrap();
        }
        assert_eq!(hlc.send().unwrap_err(), HlcError::CounterOverflow);
    }

    #[test]
    fn send_drift_when_logical_clock_ran_ahead() {
        let (clock, time) = FixedClock::new(1_000_000);
        let mut hlc = Hlc::with_config(
            node(1),
            Box::new(clock),
            HlcConfig { max_drift_millis: 1_000 },
        );
        // Merge a remote timestamp within threshold, then pull the wall clock
        // back so the logical clock sits too far in the future.
        hlc.receive(Timestamp { millis: 1_001_000, counter: 0, node: node(2) })
            .unwrap();
        time.store(999_000, AtomicOrdering::Relaxed);
        let err = hlc.send().unwrap_err();
        assert!(matches!(err, HlcError::ClockDrift { drift_millis: 2_000, .. }));
    }

    // ---- receive ----

    #[test]
    fn receive_same_millis_takes_max_counter_plus_one() {
        let mut hlc = hlc_at(1_000_000, 1);
        hlc.send().unwrap(); // counter 0
        let merged = hlc
            .receive(Timestamp { millis: 1_000_000, counter: 5, node: node(2) })
            .unwrap();
        assert_eq!(merged.millis, 1_000_000);
        assert_eq!(merged.counter, 6);
    }

    #[test]
    fn receive_remote_ahead_fast_forwards() {
        let mut hlc = hlc_at(1_000_000, 1);
        let merged = hlc
            .receive(Timestamp { millis: 1_000_050, counter: 7, node: node(2) })
            .unwrap();
        assert_eq!(merged.millis, 1_000_050);
        assert_eq!(merged.counter, 8);
    }

    #[test]
    fn receive_local_ahead_increments_local_counter() {
        let (clock, time) = FixedClock::new(1_000_100);
        let mut hlc = Hlc::new(node(1), Box::new(clock));
        hlc.send().unwrap();
        time.store(1_000_000, AtomicOrdering::Relaxed);
        let merged = hlc
            .receive(Timestamp { millis: 1_000_000, counter: 9, node: node(2) })
            .unwrap();
        assert_eq!(merged.millis, 1_000_100);
        assert_eq!(merged.counter, 1);
    }

    #[test]
    fn receive_wall_ahead_resets_counter() {
        let mut hlc = hlc_at(1_000_200, 1);
        let merged = hlc
            .receive(Timestamp { millis: 1_000_100, counter: 5, node: node(2) })
            .unwrap();
        assert_eq!(merged.millis, 1_000_200);
        assert_eq!(merged.counter, 0);
    }

    #[test]
    fn receive_rejects_own_node() {
        let mut hlc = hlc_at(1_000_000, 1);
        let err = hlc
            .receive(Timestamp { millis: 1_000_000, counter: 0, node: node(1) })
            .unwrap_err();
        assert_eq!(err, HlcError::DuplicateNode(node(1)));
    }

    #[test]
    fn receive_rejects_drift_ahead() {
        let (clock, _) = FixedClock::new(1_000_000);
        let mut hlc = Hlc::with_config(
            node(1),
            Box::new(clock),
            HlcConfig { max_drift_millis: 5_000 },
        );
        let err = hlc
            .receive(Timestamp { millis: 1_010_000, counter: 0, node: node(2) })
            .unwrap_err();
        assert!(matches!(err, HlcError::ClockDrift { drift_millis: 10_000, .. }));
    }

    #[test]
    fn receive_rejects_drift_behind() {
        let (clock, _) = FixedClock::new(1_000_000);
        let mut hlc = Hlc::with_config(
            node(1),
            Box::new(clock),
            HlcConfig { max_drift_millis: 5_000 },
        );
        let err = hlc
            .receive(Timestamp { millis: 990_000, counter: 0, node: node(2) })
            .unwrap_err();
        assert!(matches!(err, HlcError::ClockDrift { drift_millis: 10_000, .. }));
    }

    #[test]
    fn receive_counter_overflow() {
        let mut hlc = hlc_at(1_000_000, 1);
        let err = hlc
            .receive(Timestamp { millis: 1_000_000, counter: u16::MAX, node: node(2) })
            .unwrap_err();
        assert_eq!(err, HlcError::CounterOverflow);
    }

    // ---- cross-node causality ----

    #[test]
    fn causality_across_two_nodes() {
        let mut a = hlc_at(1_000_000, 1);
        let mut b = hlc_at(1_000_000, 2);

        let sent = a.send().unwrap();
        let merged = b.receive(sent).unwrap();
        let reply = b.send().unwrap();

        assert!(sent < merged);
        assert!(merged < reply);
        assert_eq!(reply.node, node(2));
    }

    #[test]
    fn total_order_with_equal_clocks_breaks_ties_on_node() {
        let mut a = hlc_at(1_000_000, 1);
        let mut b = hlc_at(1_000_000, 2);
        let ta = a.send().unwrap();
        let tb = b.send().unwrap();
        assert_eq!((ta.millis, ta.counter), (tb.millis, tb.counter));
        assert!(ta < tb);
    }
}
