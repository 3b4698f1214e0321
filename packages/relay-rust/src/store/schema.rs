//! Persisted schema of the relay store.
//!
//! Four tables per database, shared with every other implementation of this
//! protocol, so names and shapes are fixed:
//!
//! - `evolu_timestamp` -- one row per (owner, timestamp) with the skiplist
//!   level `l`, the block element count `c`, and the block fingerprint split
//!   into two 48-bit halves `h1`/`h2` (the query language has no 12-byte
//!   integer type)
//! - `evolu_message` -- the encrypted change blob per (owner, timestamp)
//! - `evolu_usage` -- per-owner stored byte count and timestamp bounds,
//!   updated atomically with each write batch
//! - `evolu_writeKey` -- the per-owner write-authorization secret
//!
//! The composite index over `(ownerId, l, t, h1, h2, c)` is covering for the
//! per-level traversal queries; every walk step is one indexed lookup.

use rusqlite::Connection;

/// Creates the tables and indexes when absent.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS evolu_timestamp (
            ownerId BLOB NOT NULL,
            t       BLOB NOT NULL,
            h1      INTEGER NOT NULL,
            h2      INTEGER NOT NULL,
            c       INTEGER NOT NULL,
            l       INTEGER NOT NULL,
            PRIMARY KEY (ownerId, t)
        ) WITHOUT ROWID;

        CREATE INDEX IF NOT EXISTS evolu_timestamp_level
            ON evolu_timestamp (ownerId, l, t, h1, h2, c);

        CREATE TABLE IF NOT EXISTS evolu_message (
            ownerId   BLOB NOT NULL,
            timestamp BLOB NOT NULL,
            change    BLOB NOT NULL,
            PRIMARY KEY (ownerId, timestamp)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS evolu_usage (
            ownerId        BLOB PRIMARY KEY,
            storedBytes    INTEGER NOT NULL,
            firstTimestamp BLOB NOT NULL,
            lastTimestamp  BLOB NOT NULL
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS evolu_writeKey (
            ownerId  BLOB PRIMARY KEY,
            writeKey BLOB NOT NULL
        ) WITHOUT ROWID;
        ",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();

        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        let names: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            names,
            ["evolu_message", "evolu_timestamp", "evolu_usage", "evolu_writeKey"]
        );
    }
}
