//! Native skiplist traversal over the `evolu_timestamp` table.
//!
//! Every stored timestamp is a node with a sampled level `l ∈ [1, 10]`. A
//! node's row aggregates its *block*: the elements strictly after its
//! predecessor at level `>= l`, up to and including itself (`c` elements,
//! fingerprint split into `h1`/`h2`). For any level, the blocks of the
//! nodes at that level tile the keyspace between the higher-level nodes, so
//! a prefix aggregate is assembled top-down with one covering-index query
//! per level: consume whole blocks while they fit, descend when they do
//! not. Expected cost is O(log n) block reads for any prefix, which makes
//! range fingerprints (prefix XOR differences, fingerprints cancel) and
//! order statistics logarithmic.
//!
//! Updates never rewrite more than the forward parents of the touched
//! position. In-SQL fingerprint updates use `(a|b) - (a&b)` for XOR; the
//! query language has no XOR operator and this identity must be shared by
//! every implementation so the stored halves stay reproducible.

use rusqlite::{Connection, OptionalExtension};

use rangesync_core::fingerprint::Fingerprint;
use rangesync_core::hlc::Timestamp;
use rangesync_core::sync::InsertStrategy;

/// Levels are sampled in `[1, MAX_LEVEL]`.
pub const MAX_LEVEL: u8 = 10;

/// Aggregate of a keyspace prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct PrefixAgg {
    pub fingerprint: Fingerprint,
    pub count: u64,
}

impl PrefixAgg {
    fn consume(&mut self, h1: i64, h2: i64, c: i64) {
        self.fingerprint ^= Fingerprint::from_halves(h1 as u64, h2 as u64);
        self.count += c as u64;
    }

    /// Difference of two prefixes: XOR cancels the shared part.
    pub(crate) fn minus(&self, earlier: &PrefixAgg) -> PrefixAgg {
        PrefixAgg {
            fingerprint: self.fingerprint ^ earlier.fingerprint,
            count: self.count - earlier.count,
        }
    }
}

fn halves(fp: &Fingerprint) -> (i64, i64) {
    let (h1, h2) = fp.to_halves();
    (h1 as i64, h2 as i64)
}

/// Aggregates all elements with `t < bound` (or `t <= bound` when
/// `inclusive`).
pub(crate) fn prefix_to_bound(
    conn: &Connection,
    owner: &[u8],
    bound: &Timestamp,
    inclusive: bool,
) -> rusqlite::Result<PrefixAgg> {
    let bound_bytes = bound.to_bytes();
    let mut agg = PrefixAgg::default();
    let mut cursor: Option<[u8; 16]> = None;

    for level in (1..=MAX_LEVEL).rev() {
        let sql = if inclusive {
            "SELECT t, h1, h2, c FROM evolu_timestamp
             WHERE ownerId = ?1 AND l = ?2 AND t > ?3 AND t <= ?4 ORDER BY t"
        } else {
            "SELECT t, h1, h2, c FROM evolu_timestamp
             WHERE ownerId = ?1 AND l = ?2 AND t > ?3 AND t < ?4 ORDER BY t"
        };
        let mut stmt = conn.prepare_cached(sql)?;
        let after: &[u8] = cursor.as_ref().map_or(&[][..], |c| &c[..]);
        let mut rows = stmt.query(rusqlite::params![owner, level, after, &bound_bytes[..]])?;
        let mut last: Option<[u8; 16]> = None;
        while let Some(row) = rows.next()? {
            let t: Vec<u8> = row.get(0)?;
            agg.consume(row.get(1)?, row.get(2)?, row.get(3)?);
            last = Some(t.try_into().expect("timestamps are 16 bytes"));
        }
        if last.is_some() {
            cursor = last;
        }
    }
    Ok(agg)
}

/// Aggregates the first `target` elements; also returns the timestamp of
/// the last consumed element. When fewer than `target` elements exist, the
/// whole set is aggregated.
pub(crate) fn prefix_to_index(
    conn: &Connection,
    owner: &[u8],
    target: u64,
) -> rusqlite::Result<(PrefixAgg, Option<Timestamp>)> {
    let mut agg = PrefixAgg::default();
    let mut cursor: Option<[u8; 16]> = None;
    // First block that overshot the target; lower levels must not read
    // past it, their blocks would not start at the cursor.
    let mut barrier: Option<[u8; 16]> = None;

    'levels: for level in (1..=MAX_LEVEL).rev() {
        loop {
            if agg.count == target {
                break 'levels;
            }
            let mut stmt = conn.prepare_cached(
                "SELECT t, h1, h2, c FROM evolu_timestamp
                 WHERE ownerId = ?1 AND l = ?2 AND t > ?3 AND (?4 IS NULL OR t < ?4)
                 ORDER BY t LIMIT 1",
            )?;
            let after: &[u8] = cursor.as_ref().map_or(&[][..], |c| &c[..]);
            let limit = barrier.as_ref().map(|b| b.to_vec());
            let row = stmt
                .query_row(rusqlite::params![owner, level, after, limit], |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .optional()?;
            let Some((t, h1, h2, c)) = row else {
                break;
            };
            let t: [u8; 16] = t.try_into().expect("timestamps are 16 bytes");
            if agg.count + c as u64 <= target {
                agg.consume(h1, h2, c);
                cursor = Some(t);
            } else {
                barrier = Some(t);
                break;
            }
        }
    }
    Ok((agg, cursor.map(Timestamp::from_bytes)))
}

/// Total element count via the same top-down walk, one aggregate query per
/// level.
pub(crate) fn size(conn: &Connection, owner: &[u8]) -> rusqlite::Result<u64> {
    let mut total: i64 = 0;
    let mut cursor: Option<Vec<u8>> = None;
    for level in (1..=MAX_LEVEL).rev() {
        let mut stmt = conn.prepare_cached(
            "SELECT COALESCE(SUM(c), 0), MAX(t) FROM evolu_timestamp
             WHERE ownerId = ?1 AND l = ?2 AND t > ?3",
        )?;
        let after: &[u8] = cursor.as_ref().map_or(&[][..], |c| &c[..]);
        let (sum, max): (i64, Option<Vec<u8>>) =
            stmt.query_row(rusqlite::params![owner, level, after], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
        total += sum;
        if let Some(max) = max {
            cursor = Some(max);
        }
    }
    Ok(total as u64)
}

/// The element at `index`, if it exists.
pub(crate) fn timestamp_at(
    conn: &Connection,
    owner: &[u8],
    index: u64,
) -> rusqlite::Result<Option<Timestamp>> {
    let (agg, last) = prefix_to_index(conn, owner, index + 1)?;
    Ok((agg.count == index + 1).then_some(last).flatten())
}

fn first_successor_at_or_above(
    conn: &Connection,
    owner: &[u8],
    t: &[u8; 16],
    min_level: u8,
) -> rusqlite::Result<Option<([u8; 16], u8)>> {
    let mut best: Option<([u8; 16], u8)> = None;
    for level in min_level..=MAX_LEVEL {
        let mut stmt = conn.prepare_cached(
            "SELECT MIN(t) FROM evolu_timestamp WHERE ownerId = ?1 AND l = ?2 AND t > ?3",
        )?;
        let min: Option<Vec<u8>> =
            stmt.query_row(rusqlite::params![owner, level, &t[..]], |row| row.get(0))?;
        if let Some(min) = min {
            let min: [u8; 16] = min.try_into().expect("timestamps are 16 bytes");
            if best.as_ref().map_or(true, |(b, _)| min < *b) {
                best = Some((min, level));
            }
        }
    }
    Ok(best)
}

fn last_predecessor_at_or_above(
    conn: &Connection,
    owner: &[u8],
    t: &[u8; 16],
    min_level: u8,
) -> rusqlite::Result<Option<[u8; 16]>> {
    let mut best: Option<[u8; 16]> = None;
    for level in min_level..=MAX_LEVEL {
        let mut stmt = conn.prepare_cached(
            "SELECT MAX(t) FROM evolu_timestamp WHERE ownerId = ?1 AND l = ?2 AND t < ?3",
        )?;
        let max: Option<Vec<u8>> =
            stmt.query_row(rusqlite::params![owner, level, &t[..]], |row| row.get(0))?;
        if let Some(max) = max {
            let max: [u8; 16] = max.try_into().expect("timestamps are 16 bytes");
            if best.as_ref().map_or(true, |b| max > *b) {
                best = Some(max);
            }
        }
    }
    Ok(best)
}

/// XOR-merges a delta into a node's stored halves and adjusts its count.
fn update_node(
    conn: &Connection,
    owner: &[u8],
    t: &[u8; 16],
    d1: i64,
    d2: i64,
    c_delta: i64,
) -> rusqlite::Result<()> {
    // XOR via (a|b) - (a&b); the dialect has no ^ operator.
    conn.prepare_cached(
        "UPDATE evolu_timestamp SET
             h1 = (h1 | ?3) - (h1 & ?3),
             h2 = (h2 | ?4) - (h2 & ?4),
             c  = c + ?5
         WHERE ownerId = ?1 AND t = ?2",
    )?
    .execute(rusqlite::params![owner, &t[..], d1, d2, c_delta])
    .map(|_| ())
}

/// Inserts one timestamp at the given sampled level, restoring the block
/// aggregates of every affected node. Returns `false` (and writes nothing)
/// when the timestamp is already present.
///
/// An [`InsertStrategy::Append`] (new maximum) has no successors, so the
/// forward-parent chain is skipped entirely; that is what makes appends
/// roughly twice as cheap as general inserts and why the write path
/// classifies every timestamp against the usage bounds first.
pub(crate) fn insert(
    conn: &Connection,
    owner: &[u8],
    ts: &Timestamp,
    level: u8,
    strategy: InsertStrategy,
) -> rusqlite::Result<bool> {
    debug_assert!((1..=MAX_LEVEL).contains(&level));
    let t = ts.to_bytes();

    let exists: Option<i64> = conn
        .prepare_cached("SELECT 1 FROM evolu_timestamp WHERE ownerId = ?1 AND t = ?2")?
        .query_row(rusqlite::params![owner, &t[..]], |row| row.get(0))
        .optional()?;
    if exists.is_some() {
        return Ok(false);
    }

    let leaf = Fingerprint::from_timestamp(ts);
    let before = match strategy {
        // Nothing precedes a prepend.
        InsertStrategy::Prepend => PrefixAgg::default(),
        InsertStrategy::Append | InsertStrategy::Insert => {
            prefix_to_bound(conn, owner, ts, false)?
        }
    };

    // The new node's own block: everything since its predecessor at a level
    // at least its own, plus itself.
    let own_prev = last_predecessor_at_or_above(conn, owner, &t, level)?;
    let prev_agg = match &own_prev {
        Some(prev) => prefix_to_bound(conn, owner, &Timestamp::from_bytes(*prev), true)?,
        None => PrefixAgg::default(),
    };
    let own = before.minus(&prev_agg);
    let own_fp = own.fingerprint ^ leaf;
    let (h1, h2) = halves(&own_fp);
    conn.prepare_cached(
        "INSERT INTO evolu_timestamp (ownerId, t, h1, h2, c, l)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?
    .execute(rusqlite::params![owner, &t[..], h1, h2, own.count as i64 + 1, level])?;

    if strategy == InsertStrategy::Append {
        return Ok(true);
    }

    // Forward-parent chain: for each successor band, either the new node
    // split the successor's block (successor level <= ours: shed the part
    // now covered by the new node) or the block spans the new element
    // (successor level above ours: gain one leaf).
    let (leaf1, leaf2) = halves(&leaf);
    let mut min_level = 1;
    while let Some((succ_t, succ_l)) = first_successor_at_or_above(conn, owner, &t, min_level)? {
        if succ_l <= level {
            let pred = last_predecessor_at_or_above(conn, owner, &t, succ_l)?;
            let pred_agg = match &pred {
                Some(p) => prefix_to_bound(conn, owner, &Timestamp::from_bytes(*p), true)?,
                None => PrefixAgg::default(),
            };
            let shed = before.minus(&pred_agg);
            let (d1, d2) = halves(&shed.fingerprint);
            update_node(conn, owner, &succ_t, d1, d2, -(shed.count as i64))?;
        } else {
            update_node(conn, owner, &succ_t, leaf1, leaf2, 1)?;
        }
        if succ_l >= MAX_LEVEL {
            break;
        }
        min_level = succ_l + 1;
    }
    Ok(true)
}
