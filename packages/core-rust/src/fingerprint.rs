//! Commutative set fingerprints over timestamps.
//!
//! A fingerprint reduces a set of timestamps to 12 bytes: each element hashes
//! to the first 12 bytes of SHA-256 over its canonical form, and elements
//! combine with XOR. The combination is associative, commutative, and
//! cancellative (`x ^ x = 0`), so fingerprints can be maintained
//! incrementally and compared across peers regardless of insertion order.

use std::fmt;
use std::ops::{BitXor, BitXorAssign};

use sha2::{Digest, Sha256};

use crate::hlc::Timestamp;

/// Width of a [`Fingerprint`] in bytes.
pub const FINGERPRINT_LEN: usize = 12;

/// 12-byte commutative hash of a set of timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// The fingerprint of the empty set.
    pub const ZERO: Self = Self([0; FINGERPRINT_LEN]);

    /// Hashes a single timestamp into its fingerprint leaf.
    #[must_use]
    pub fn from_timestamp(ts: &Timestamp) -> Self {
        let digest = Sha256::digest(ts.to_bytes());
        let mut out = [0u8; FINGERPRINT_LEN];
        out.copy_from_slice(&digest[..FINGERPRINT_LEN]);
        Self(out)
    }

    /// Combines the fingerprints of all timestamps in `iter`.
    #[must_use]
    pub fn of<'a>(iter: impl IntoIterator<Item = &'a Timestamp>) -> Self {
        let mut acc = Self::ZERO;
        for ts in iter {
            acc ^= Self::from_timestamp(ts);
        }
        acc
    }

    /// The raw 12 bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Splits into two big-endian 48-bit halves.
    ///
    /// The skiplist store persists fingerprints as two integers because its
    /// query language has no 12-byte integer type.
    #[must_use]
    pub fn to_halves(&self) -> (u64, u64) {
        let mut h1 = [0u8; 8];
        h1[2..].copy_from_slice(&self.0[..6]);
        let mut h2 = [0u8; 8];
        h2[2..].copy_from_slice(&self.0[6..]);
        (u64::from_be_bytes(h1), u64::from_be_bytes(h2))
    }

    /// Reassembles a fingerprint from its two big-endian 48-bit halves.
    #[must_use]
    pub fn from_halves(h1: u64, h2: u64) -> Self {
        debug_assert!(h1 < (1 << 48) && h2 < (1 << 48));
        let mut out = [0u8; FINGERPRINT_LEN];
        out[..6].copy_from_slice(&h1.to_be_bytes()[2..]);
        out[6..].copy_from_slice(&h2.to_be_bytes()[2..]);
        Self(out)
    }
}

impl BitXorAssign for Fingerprint {
    fn bitxor_assign(&mut self, rhs: Self) {
        for (a, b) in self.0.iter_mut().zip(rhs.0) {
            *a ^= b;
        }
    }
}

impl BitXor for Fingerprint {
    type Output = Self;

    fn bitxor(mut self, rhs: Self) -> Self {
        self ^= rhs;
        self
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::hlc::NodeId;

    fn ts(millis: u64, counter: u16, node: u64) -> Timestamp {
        Timestamp { millis, counter, node: NodeId(node) }
    }

    #[test]
    fn leaf_matches_truncated_sha256() {
        let t = ts(1_700_000_000_000, 3, 42);
        let digest = Sha256::digest(t.to_bytes());
        assert_eq!(Fingerprint::from_timestamp(&t).as_bytes(), &digest[..12]);
    }

    #[test]
    fn xor_is_cancellative() {
        let t = ts(5, 0, 1);
        let fp = Fingerprint::from_timestamp(&t);
        assert_eq!(fp ^ fp, Fingerprint::ZERO);
    }

    #[test]
    fn zero_is_identity() {
        let fp = Fingerprint::from_timestamp(&ts(9, 1, 2));
        assert_eq!(fp ^ Fingerprint::ZERO, fp);
    }

    #[test]
    fn halves_roundtrip() {
        let fp = Fingerprint::from_timestamp(&ts(123_456_789, 77, 0xABCD));
        let (h1, h2) = fp.to_halves();
        assert!(h1 < (1 << 48) && h2 < (1 << 48));
        assert_eq!(Fingerprint::from_halves(h1, h2), fp);
    }

    #[test]
    fn of_empty_set_is_zero() {
        let empty: Vec<Timestamp> = Vec::new();
        assert_eq!(Fingerprint::of(&empty), Fingerprint::ZERO);
    }

    proptest! {
        #[test]
        fn order_independent(
            mut entries in prop::collection::vec((0_u64..u64::from(u32::MAX), any::<u16>(), any::<u64>()), 0..64),
        ) {
            let set: Vec<Timestamp> =
                entries.iter().map(|&(m, c, n)| ts(m, c, n)).collect();
            let forward = Fingerprint::of(&set);
            entries.reverse();
            let reversed: Vec<Timestamp> =
                entries.iter().map(|&(m, c, n)| ts(m, c, n)).collect();
            prop_assert_eq!(forward, Fingerprint::of(&reversed));
        }

        #[test]
        fn associativity(
            a in (0_u64..1 << 40, any::<u16>(), any::<u64>()),
            b in (0_u64..1 << 40, any::<u16>(), any::<u64>()),
            c in (0_u64..1 << 40, any::<u16>(), any::<u64>()),
        ) {
            let fa = Fingerprint::from_timestamp(&ts(a.0, a.1, a.2));
            let fb = Fingerprint::from_timestamp(&ts(b.0, b.1, b.2));
            let fc = Fingerprint::from_timestamp(&ts(c.0, c.1, c.2));
            prop_assert_eq!((fa ^ fb) ^ fc, fa ^ (fb ^ fc));
        }
    }
}
