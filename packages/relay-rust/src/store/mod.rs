//! SQLite-backed timestamp store.
//!
//! Implements the core [`TimestampStore`] contract on top of the skiplist
//! schema ([`schema`]) and traversal ([`skiplist`]). Reads and skiplist
//! maintenance are synchronous against the embedded database; the batched
//! [`write_messages`](TimestampStore::write_messages) path is async so the
//! quota policy can be consulted without blocking a worker, and is
//! serialized per owner through a mutex from the runtime -- one writer per
//! owner, any number of owners in flight.

pub mod schema;
pub mod skiplist;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as ConnMutex;
use rusqlite::{Connection, OptionalExtension};

use rangesync_core::fingerprint::Fingerprint;
use rangesync_core::hlc::Timestamp;
use rangesync_core::owner::{OwnerId, WriteKey, WRITE_KEY_LEN};
use rangesync_core::runtime::{Mutex as OwnerMutex, Runner, Scope};
use rangesync_core::sync::{
    InsertStrategy, RangeFingerprint, StoreError, TimestampStore, WriteOutcome,
};
use rangesync_core::wire::{EncryptedMessage, RangeUpper};

/// Samples skiplist levels; injected so tests are deterministic.
pub trait LevelSource: Send + Sync {
    /// A level in `[1, 10]`: geometric with p = 0.25 per promotion.
    fn next_level(&self) -> u8;
}

/// Default level source over the process RNG.
pub struct RandomLevels;

impl LevelSource for RandomLevels {
    fn next_level(&self) -> u8 {
        sample_level(|| rand::random::<f64>())
    }
}

/// `1 + geometric(0.25)`, capped at [`skiplist::MAX_LEVEL`].
pub fn sample_level(mut random: impl FnMut() -> f64) -> u8 {
    let mut level = 1;
    while level < skiplist::MAX_LEVEL && random() <= 0.25 {
        level += 1;
    }
    level
}

/// Decides whether an owner may grow to `new_total_bytes`.
#[async_trait]
pub trait QuotaPolicy: Send + Sync {
    /// `true` to admit the write.
    async fn is_within_quota(&self, owner: &OwnerId, new_total_bytes: u64) -> bool;
}

/// Admits everything.
pub struct UnlimitedQuota;

#[async_trait]
impl QuotaPolicy for UnlimitedQuota {
    async fn is_within_quota(&self, _owner: &OwnerId, _new_total_bytes: u64) -> bool {
        true
    }
}

/// Sink for opaque backend failures; the detail never reaches the wire.
pub type StoreErrorSink = Arc<dyn Fn(&OwnerId, &rusqlite::Error) + Send + Sync>;

fn log_sink() -> StoreErrorSink {
    Arc::new(|owner, error| {
        tracing::error!(%owner, %error, "store backend failure");
    })
}

/// Durable [`TimestampStore`] over a single SQLite database.
pub struct SqliteStore {
    conn: ConnMutex<Connection>,
    levels: Box<dyn LevelSource>,
    quota: Arc<dyn QuotaPolicy>,
    on_error: StoreErrorSink,
    runner: Runner,
    /// Per-owner write serialization. Entries are never evicted; memory
    /// grows with the number of owners ever written.
    write_locks: DashMap<OwnerId, OwnerMutex>,
}

impl SqliteStore {
    /// Opens the store over `conn`, creating the schema when absent.
    ///
    /// # Errors
    ///
    /// Opaque backend failure while migrating.
    pub fn new(
        conn: Connection,
        levels: Box<dyn LevelSource>,
        quota: Arc<dyn QuotaPolicy>,
        runner: Runner,
    ) -> Result<Self, StoreError> {
        schema::migrate(&conn).map_err(StoreError::new)?;
        Ok(Self {
            conn: ConnMutex::new(conn),
            levels,
            quota,
            on_error: log_sink(),
            runner,
            write_locks: DashMap::new(),
        })
    }

    /// Opens an in-memory store, for tests and ephemeral relays.
    ///
    /// # Errors
    ///
    /// Opaque backend failure.
    pub fn in_memory(
        levels: Box<dyn LevelSource>,
        quota: Arc<dyn QuotaPolicy>,
        runner: Runner,
    ) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(StoreError::new)?;
        Self::new(conn, levels, quota, runner)
    }

    /// Replaces the backend-failure sink.
    pub fn set_error_sink(&mut self, sink: StoreErrorSink) {
        self.on_error = sink;
    }

    fn fail(&self, owner: &OwnerId, error: rusqlite::Error) -> StoreError {
        (self.on_error)(owner, &error);
        StoreError::new(error)
    }

    /// The usage record for `owner`, if any writes happened.
    ///
    /// # Errors
    ///
    /// Opaque backend failure.
    pub fn usage(&self, owner: &OwnerId) -> Result<Option<OwnerUsage>, StoreError> {
        let conn = self.conn.lock();
        read_usage(&conn, owner).map_err(|e| self.fail(owner, e))
    }

    /// The stored write key for `owner`, if one was created.
    ///
    /// # Errors
    ///
    /// Opaque backend failure.
    pub fn write_key(&self, owner: &OwnerId) -> Result<Option<WriteKey>, StoreError> {
        let conn = self.conn.lock();
        read_write_key(&conn, owner).map_err(|e| self.fail(owner, e))
    }

    /// Replaces the stored write key; subsequent writes must present the new
    /// value.
    ///
    /// # Errors
    ///
    /// Opaque backend failure.
    pub fn rotate_write_key(&self, owner: &OwnerId, key: &WriteKey) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO evolu_writeKey (ownerId, writeKey) VALUES (?1, ?2)
             ON CONFLICT (ownerId) DO UPDATE SET writeKey = excluded.writeKey",
        )
        .and_then(|mut stmt| {
            stmt.execute(rusqlite::params![
                &owner.as_bytes()[..],
                &key.as_bytes()[..]
            ])
        })
        .map(|_| ())
        .map_err(|e| self.fail(owner, e))
    }
}

/// Per-owner accounting row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerUsage {
    /// Total ciphertext bytes stored.
    pub stored_bytes: u64,
    /// Smallest stored timestamp.
    pub first_timestamp: Timestamp,
    /// Largest stored timestamp.
    pub last_timestamp: Timestamp,
}

fn read_usage(conn: &Connection, owner: &OwnerId) -> rusqlite::Result<Option<OwnerUsage>> {
    conn.prepare_cached(
        "SELECT storedBytes, firstTimestamp, lastTimestamp FROM evolu_usage WHERE ownerId = ?1",
    )?
    .query_row([&owner.as_bytes()[..]], |row| {
        let bytes: i64 = row.get(0)?;
        let first: Vec<u8> = row.get(1)?;
        let last: Vec<u8> = row.get(2)?;
        Ok(OwnerUsage {
            stored_bytes: bytes as u64,
            first_timestamp: Timestamp::from_bytes(
                first.try_into().expect("timestamps are 16 bytes"),
            ),
            last_timestamp: Timestamp::from_bytes(
                last.try_into().expect("timestamps are 16 bytes"),
            ),
        })
    })
    .optional()
}

fn read_write_key(conn: &Connection, owner: &OwnerId) -> rusqlite::Result<Option<WriteKey>> {
    let key: Option<Vec<u8>> = conn
        .prepare_cached("SELECT writeKey FROM evolu_writeKey WHERE ownerId = ?1")?
        .query_row([&owner.as_bytes()[..]], |row| row.get(0))
        .optional()?;
    Ok(key.and_then(|k| {
        let bytes: [u8; WRITE_KEY_LEN] = k.try_into().ok()?;
        Some(WriteKey::from_bytes(bytes))
    }))
}

#[async_trait]
impl TimestampStore for SqliteStore {
    fn insert_timestamp(
        &self,
        owner: &OwnerId,
        ts: &Timestamp,
        strategy: InsertStrategy,
    ) -> Result<(), StoreError> {
        let level = self.levels.next_level();
        let conn = self.conn.lock();
        skiplist::insert(&conn, owner.as_bytes(), ts, level, strategy)
            .map(|_| ())
            .map_err(|e| self.fail(owner, e))
    }

    fn get_existing_timestamps(
        &self,
        owner: &OwnerId,
        timestamps: &[Timestamp],
    ) -> Result<Vec<Timestamp>, StoreError> {
        if timestamps.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        existing_timestamps(&conn, owner, timestamps).map_err(|e| self.fail(owner, e))
    }

    fn get_size(&self, owner: &OwnerId) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        skiplist::size(&conn, owner.as_bytes()).map_err(|e| self.fail(owner, e))
    }

    fn fingerprint(
        &self,
        owner: &OwnerId,
        begin: u64,
        end: u64,
    ) -> Result<Fingerprint, StoreError> {
        if end <= begin {
            return Ok(Fingerprint::ZERO);
        }
        let conn = self.conn.lock();
        let run = || -> rusqlite::Result<Fingerprint> {
            let (to_end, _) = skiplist::prefix_to_index(&conn, owner.as_bytes(), end)?;
            let (to_begin, _) = skiplist::prefix_to_index(&conn, owner.as_bytes(), begin)?;
            Ok(to_end.minus(&to_begin).fingerprint)
        };
        run().map_err(|e| self.fail(owner, e))
    }

    fn fingerprint_ranges(
        &self,
        owner: &OwnerId,
        begin: u64,
        cumulative_ends: &[u64],
        upper: RangeUpper,
    ) -> Result<Vec<RangeFingerprint>, StoreError> {
        let conn = self.conn.lock();
        let run = || -> rusqlite::Result<Vec<RangeFingerprint>> {
            let mut out = Vec::with_capacity(cumulative_ends.len());
            let (mut prev, _) = skiplist::prefix_to_index(&conn, owner.as_bytes(), begin)?;
            for (i, &end) in cumulative_ends.iter().enumerate() {
                let (cur, last) = skiplist::prefix_to_index(&conn, owner.as_bytes(), end)?;
                let bucket_upper = if i + 1 == cumulative_ends.len() {
                    upper
                } else {
                    next_after(&conn, owner, last.as_ref())?
                        .map_or(RangeUpper::Infinite, RangeUpper::Finite)
                };
                out.push(RangeFingerprint {
                    fingerprint: cur.minus(&prev).fingerprint,
                    upper: bucket_upper,
                });
                prev = cur;
            }
            Ok(out)
        };
        run().map_err(|e| self.fail(owner, e))
    }

    fn find_lower_bound(
        &self,
        owner: &OwnerId,
        begin: u64,
        end: u64,
        upper: &Timestamp,
    ) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        skiplist::prefix_to_bound(&conn, owner.as_bytes(), upper, false)
            .map(|agg| agg.count.clamp(begin, end))
            .map_err(|e| self.fail(owner, e))
    }

    fn iterate(
        &self,
        owner: &OwnerId,
        begin: u64,
        end: u64,
        visit: &mut dyn FnMut(Timestamp, u64) -> bool,
    ) -> Result<(), StoreError> {
        if end <= begin {
            return Ok(());
        }
        let conn = self.conn.lock();
        let mut run = || -> rusqlite::Result<()> {
            let Some(start) = skiplist::timestamp_at(&conn, owner.as_bytes(), begin)? else {
                return Ok(());
            };
            let start_bytes = start.to_bytes();
            let mut stmt = conn.prepare_cached(
                "SELECT t FROM evolu_timestamp WHERE ownerId = ?1 AND t >= ?2
                 ORDER BY t LIMIT ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![
                &owner.as_bytes()[..],
                &start_bytes[..],
                (end - begin) as i64
            ])?;
            let mut index = begin;
            while let Some(row) = rows.next()? {
                let t: Vec<u8> = row.get(0)?;
                let ts = Timestamp::from_bytes(t.try_into().expect("timestamps are 16 bytes"));
                if !visit(ts, index) {
                    break;
                }
                index += 1;
            }
            Ok(())
        };
        run().map_err(|e| self.fail(owner, e))
    }

    fn read_messages(
        &self,
        owner: &OwnerId,
        timestamps: &[Timestamp],
    ) -> Result<Vec<EncryptedMessage>, StoreError> {
        if timestamps.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let run = || -> rusqlite::Result<Vec<EncryptedMessage>> {
            let placeholders = vec!["?"; timestamps.len()].join(", ");
            let sql = format!(
                "SELECT timestamp, change FROM evolu_message
                 WHERE ownerId = ? AND timestamp IN ({placeholders})
                 ORDER BY timestamp"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut params: Vec<Vec<u8>> = Vec::with_capacity(timestamps.len() + 1);
            params.push(owner.as_bytes().to_vec());
            params.extend(timestamps.iter().map(|ts| ts.to_bytes().to_vec()));
            let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let t: Vec<u8> = row.get(0)?;
                out.push(EncryptedMessage {
                    timestamp: Timestamp::from_bytes(
                        t.try_into().expect("timestamps are 16 bytes"),
                    ),
                    change: row.get(1)?,
                });
            }
            Ok(out)
        };
        run().map_err(|e| self.fail(owner, e))
    }

    async fn write_messages(
        &self,
        owner: &OwnerId,
        write_key: Option<&WriteKey>,
        messages: &[EncryptedMessage],
    ) -> Result<WriteOutcome, StoreError> {
        let lock = self
            .write_locks
            .entry(*owner)
            .or_insert_with(OwnerMutex::new)
            .clone();
        let scope = Scope::detached(&self.runner);

        let result = lock
            .with_lock::<WriteOutcome, StoreError, _, _>(&scope, |_inner| async move {
                self.write_messages_locked(owner, write_key, messages).await
            })
            .await;
        match result {
            Ok(outcome) => Ok(outcome),
            Err(rangesync_core::runtime::TaskError::Failed(e)) => Err(e),
            Err(rangesync_core::runtime::TaskError::Aborted(_)) => {
                Err(StoreError::new("store is shutting down"))
            }
        }
    }

    fn delete_owner(&self, owner: &OwnerId) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let run = || -> rusqlite::Result<()> {
            for table in ["evolu_timestamp", "evolu_message", "evolu_usage", "evolu_writeKey"] {
                conn.execute(
                    &format!("DELETE FROM {table} WHERE ownerId = ?1"),
                    [&owner.as_bytes()[..]],
                )?;
            }
            Ok(())
        };
        run().map_err(|e| self.fail(owner, e))
    }
}

impl SqliteStore {
    /// The write critical section; the per-owner mutex is already held.
    async fn write_messages_locked(
        &self,
        owner: &OwnerId,
        write_key: Option<&WriteKey>,
        messages: &[EncryptedMessage],
    ) -> Result<WriteOutcome, StoreError> {
        // Phase 1 (sync): admission and filtering.
        let (new_messages, new_total) = {
            let conn = self.conn.lock();
            let run = || -> rusqlite::Result<Result<(Vec<EncryptedMessage>, u64), WriteOutcome>> {
                // A remote write presents a key; it must match the stored
                // one, created lazily on first write. A local write (None)
                // is trusted.
                if let Some(presented) = write_key {
                    match read_write_key(&conn, owner)? {
                        None => {
                            conn.prepare_cached(
                                "INSERT INTO evolu_writeKey (ownerId, writeKey) VALUES (?1, ?2)",
                            )?
                            .execute(rusqlite::params![
                                &owner.as_bytes()[..],
                                &presented.as_bytes()[..]
                            ])?;
                        }
                        // Constant-time comparison via WriteKey's PartialEq.
                        Some(stored) if stored == *presented => {}
                        Some(_) => return Ok(Err(WriteOutcome::WriteKeyMismatch)),
                    }
                }

                let stamps: Vec<Timestamp> = messages.iter().map(|m| m.timestamp).collect();
                let existing = existing_timestamps(&conn, owner, &stamps)?;
                let mut new_messages: Vec<EncryptedMessage> = messages
                    .iter()
                    .filter(|m| !existing.contains(&m.timestamp))
                    .cloned()
                    .collect();
                new_messages.sort_by_key(|m| m.timestamp);
                new_messages.dedup_by_key(|m| m.timestamp);

                let incoming: u64 = new_messages.iter().map(|m| m.change.len() as u64).sum();
                let stored = read_usage(&conn, owner)?.map_or(0, |u| u.stored_bytes);
                Ok(Ok((new_messages, stored + incoming)))
            };
            match run().map_err(|e| self.fail(owner, e))? {
                Ok(filtered) => filtered,
                Err(outcome) => return Ok(outcome),
            }
        };

        if new_messages.is_empty() {
            return Ok(WriteOutcome::Written { new_messages });
        }

        // Phase 2 (async, connection released): quota.
        if !self.quota.is_within_quota(owner, new_total).await {
            return Ok(WriteOutcome::QuotaExceeded);
        }

        // Phase 3 (sync): one all-or-nothing transaction.
        let mut conn = self.conn.lock();
        let levels: Vec<u8> = new_messages.iter().map(|_| self.levels.next_level()).collect();
        let run = |conn: &mut Connection| -> rusqlite::Result<()> {
            let tx = conn.transaction()?;
            let mut bounds = read_usage(&tx, owner)?
                .map(|u| (u.first_timestamp, u.last_timestamp));
            for (message, level) in new_messages.iter().zip(&levels) {
                let strategy = InsertStrategy::pick(&message.timestamp, bounds.as_ref());
                skiplist::insert(&tx, owner.as_bytes(), &message.timestamp, *level, strategy)?;
                tx.prepare_cached(
                    "INSERT INTO evolu_message (ownerId, timestamp, change)
                     VALUES (?1, ?2, ?3) ON CONFLICT (ownerId, timestamp) DO NOTHING",
                )?
                .execute(rusqlite::params![
                    &owner.as_bytes()[..],
                    &message.timestamp.to_bytes()[..],
                    &message.change[..]
                ])?;
                bounds = Some(match bounds {
                    None => (message.timestamp, message.timestamp),
                    Some((first, last)) => {
                        (first.min(message.timestamp), last.max(message.timestamp))
                    }
                });
            }
            let (first, last) = bounds.expect("at least one message written");
            tx.prepare_cached(
                "INSERT INTO evolu_usage (ownerId, storedBytes, firstTimestamp, lastTimestamp)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (ownerId) DO UPDATE SET
                     storedBytes = excluded.storedBytes,
                     firstTimestamp = excluded.firstTimestamp,
                     lastTimestamp = excluded.lastTimestamp",
            )?
            .execute(rusqlite::params![
                &owner.as_bytes()[..],
                new_total as i64,
                &first.to_bytes()[..],
                &last.to_bytes()[..]
            ])?;
            tx.commit()
        };
        run(&mut conn).map_err(|e| self.fail(owner, e))?;
        Ok(WriteOutcome::Written { new_messages })
    }
}

fn existing_timestamps(
    conn: &Connection,
    owner: &OwnerId,
    timestamps: &[Timestamp],
) -> rusqlite::Result<Vec<Timestamp>> {
    if timestamps.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; timestamps.len()].join(", ");
    let sql = format!(
        "SELECT t FROM evolu_timestamp WHERE ownerId = ? AND t IN ({placeholders}) ORDER BY t"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut params: Vec<Vec<u8>> = Vec::with_capacity(timestamps.len() + 1);
    params.push(owner.as_bytes().to_vec());
    params.extend(timestamps.iter().map(|ts| ts.to_bytes().to_vec()));
    let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let t: Vec<u8> = row.get(0)?;
        out.push(Timestamp::from_bytes(
            t.try_into().expect("timestamps are 16 bytes"),
        ));
    }
    Ok(out)
}

fn next_after(
    conn: &Connection,
    owner: &OwnerId,
    after: Option<&Timestamp>,
) -> rusqlite::Result<Option<Timestamp>> {
    let after_bytes = after.map(|ts| ts.to_bytes().to_vec()).unwrap_or_default();
    let min: Option<Vec<u8>> = conn
        .prepare_cached("SELECT MIN(t) FROM evolu_timestamp WHERE ownerId = ?1 AND t > ?2")?
        .query_row(rusqlite::params![&owner.as_bytes()[..], after_bytes], |row| row.get(0))?;
    Ok(min.map(|t| Timestamp::from_bytes(t.try_into().expect("timestamps are 16 bytes"))))
}
