//! Delta + run-length encoded timestamp blocks.
//!
//! One block encodes an ordered sequence of timestamps: the first in full
//! 16-byte form, every later `millis` as a zigzag varint delta from its
//! predecessor, and the remaining counters and node ids as run-length
//! encoded columns. Change records from one writer share a node id and
//! usually a counter of zero, so both columns collapse to a single run.
//!
//! The same block format carries message timestamp lists, `Timestamps`
//! range payloads, and the finite upper bounds of a range sequence; the
//! entry count always comes from surrounding context.

use crate::hlc::Timestamp;

use super::{varint, Reader, WireError};

/// Appends a block of `timestamps` to `out`. The count is not written.
pub fn encode(timestamps: &[Timestamp], out: &mut Vec<u8>) {
    let Some((first, rest)) = timestamps.split_first() else {
        return;
    };
    out.extend_from_slice(&first.to_bytes());

    // millis deltas
    let mut prev = first.millis;
    for ts in rest {
        let delta = i64::try_from(ts.millis).expect("millis fits i64")
            - i64::try_from(prev).expect("millis fits i64");
        varint::encode_signed(delta, out);
        prev = ts.millis;
    }

    // counter runs
    let mut i = 0;
    while i < rest.len() {
        let counter = rest[i].counter;
        let mut run = 1;
        while i + run < rest.len() && rest[i + run].counter == counter {
            run += 1;
        }
        varint::encode(run as u64, out);
        varint::encode(u64::from(counter), out);
        i += run;
    }

    // node runs
    let mut i = 0;
    while i < rest.len() {
        let node = rest[i].node;
        let mut run = 1;
        while i + run < rest.len() && rest[i + run].node == node {
            run += 1;
        }
        varint::encode(run as u64, out);
        out.extend_from_slice(&node.to_bytes());
        i += run;
    }
}

/// Reads a block of exactly `count` timestamps from `r`.
///
/// # Errors
///
/// `InvalidData` on truncation, on millis deltas leaving the 48-bit range,
/// and on run lengths that do not sum to `count − 1` exactly.
pub fn decode(r: &mut Reader<'_>, count: usize) -> Result<Vec<Timestamp>, WireError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let first = Timestamp::from_bytes(r.read_array()?);
    let mut out = Vec::with_capacity(count);
    out.push(first);

    let rest = count - 1;
    let mut millis = Vec::with_capacity(rest);
    let mut prev = i64::try_from(first.millis).expect("millis fits i64");
    for _ in 0..rest {
        let delta = varint::decode_signed(r)?;
        let next = prev
            .checked_add(delta)
            .ok_or(WireError::InvalidData("timestamp millis out of range"))?;
        let next_u = u64::try_from(next)
            .ok()
            .filter(|&m| m <= crate::hlc::MAX_MILLIS)
            .ok_or(WireError::InvalidData("timestamp millis out of range"))?;
        millis.push(next_u);
        prev = next;
    }

    let mut counters = Vec::with_capacity(rest);
    while counters.len() < rest {
        let run = usize::try_from(varint::decode(r)?)
            .map_err(|_| WireError::InvalidData("run length"))?;
        let counter = u16::try_from(varint::decode(r)?)
            .map_err(|_| WireError::InvalidData("counter out of range"))?;
        if run == 0 || counters.len() + run > rest {
            return Err(WireError::InvalidData("counter runs do not sum to count"));
        }
        counters.extend(std::iter::repeat(counter).take(run));
    }

    let mut nodes = Vec::with_capacity(rest);
    while nodes.len() < rest {
        let run = usize::try_from(varint::decode(r)?)
            .map_err(|_| WireError::InvalidData("run length"))?;
        let node = crate::hlc::NodeId::from_bytes(r.read_array()?);
        if run == 0 || nodes.len() + run > rest {
            return Err(WireError::InvalidData("node runs do not sum to count"));
        }
        nodes.extend(std::iter::repeat(node).take(run));
    }

    for ((millis, counter), node) in millis.into_iter().zip(counters).zip(nodes) {
        out.push(Timestamp { millis, counter, node });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::hlc::NodeId;

    use super::*;

    fn ts(millis: u64, counter: u16, node: u64) -> Timestamp {
        Timestamp { millis, counter, node: NodeId(node) }
    }

    fn roundtrip(input: &[Timestamp]) -> Vec<Timestamp> {
        let mut buf = Vec::new();
        encode(input, &mut buf);
        let mut r = Reader::new(&buf);
        let decoded = decode(&mut r, input.len()).unwrap();
        r.expect_end().unwrap();
        decoded
    }

    #[test]
    fn empty_block_is_empty() {
        let mut buf = Vec::new();
        encode(&[], &mut buf);
        assert!(buf.is_empty());
        assert!(roundtrip(&[]).is_empty());
    }

    #[test]
    fn single_timestamp_is_16_bytes() {
        let input = [ts(1_700_000_000_000, 3, 99)];
        let mut buf = Vec::new();
        encode(&input, &mut buf);
        assert_eq!(buf.len(), 16);
        assert_eq!(roundtrip(&input), input);
    }

    #[test]
    fn one_writer_collapses_to_single_runs() {
        // 31 timestamps from one node, counters all zero: the layout the
        // initial-sync size budget depends on.
        let input: Vec<Timestamp> =
            (0..31).map(|i| ts(1_000_000 + i * 1000, 0, 7)).collect();
        let mut buf = Vec::new();
        encode(&input, &mut buf);
        // 16 (first) + 30 deltas (2 bytes each: zigzag 2000) + one counter
        // run (2) + one node run (9)
        assert_eq!(buf.len(), 16 + 30 * 2 + 2 + 9);
        assert_eq!(roundtrip(&input), input);
    }

    #[test]
    fn unsorted_input_still_roundtrips() {
        let input = [ts(5_000, 0, 1), ts(1_000, 9, 2), ts(3_000, 9, 2)];
        assert_eq!(roundtrip(&input), input);
    }

    #[test]
    fn rejects_truncated_block() {
        let input = [ts(1, 0, 1), ts(2, 0, 1)];
        let mut buf = Vec::new();
        encode(&input, &mut buf);
        buf.pop();
        let mut r = Reader::new(&buf);
        assert!(decode(&mut r, 2).is_err());
    }

    #[test]
    fn rejects_run_overflow() {
        let input = [ts(1, 0, 1), ts(2, 0, 1)];
        let mut buf = Vec::new();
        encode(&input, &mut buf);
        // Claim three entries while the columns only carry runs for one.
        let mut r = Reader::new(&buf);
        assert!(decode(&mut r, 3).is_err());
    }

    #[test]
    fn rejects_millis_delta_underflow() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&ts(5, 0, 1).to_bytes());
        varint::encode_signed(-6, &mut buf); // millis would be -1
        varint::encode(1, &mut buf);
        varint::encode(0, &mut buf);
        varint::encode(1, &mut buf);
        buf.extend_from_slice(&NodeId(1).to_bytes());
        let mut r = Reader::new(&buf);
        assert_eq!(
            decode(&mut r, 2).unwrap_err(),
            WireError::InvalidData("timestamp millis out of range")
        );
    }

    proptest! {
        #[test]
        fn roundtrip_arbitrary(
            entries in prop::collection::vec(
                (0_u64..1 << 48, any::<u16>(), 0_u64..8),
                0..48,
            ),
        ) {
            let mut input: Vec<Timestamp> =
                entries.iter().map(|&(m, c, n)| ts(m, c, n)).collect();
            input.sort();
            prop_assert_eq!(roundtrip(&input), input);
        }
    }
}
