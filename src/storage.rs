use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use sha2::{Digest, Sha256};

use crate::codec;
use crate::error::{TlError, TlResult};
use crate::model::{
    AccountKey, AwardTally, Partition, Profile, RaceRecord, RemoteRace, TextEntry, Tombstone,
};

const PERSIST_BUSY_RETRY_ATTEMPTS: usize = 8;
const PERSIST_BUSY_BASE_BACKOFF_MS: u64 = 5;

/// Local store of races, tombstones, texts, staged historical buckets and
/// per-account profiles.
pub struct RaceStore {
    connection: Mutex<Connection>,
}

impl std::fmt::Debug for RaceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaceStore").finish_non_exhaustive()
    }
}

/// Result of committing one batch of processed races.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitSummary {
    pub inserted: usize,
    /// Races that were already present (or tombstoned) when the batch landed.
    pub ignored: usize,
    pub profile: Profile,
}

impl RaceStore {
    pub fn open(db_path: &Path) -> TlResult<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let connection = Connection::open(db_path)?;
        Self::from_connection(connection)
    }

    pub fn open_in_memory() -> TlResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(connection: Connection) -> TlResult<Self> {
        initialize_schema(&connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn conn(&self) -> TlResult<MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|_| TlError::Storage("store connection mutex poisoned".to_owned()))
    }

    // -----------------------------------------------------------------------
    // Profiles
    // -----------------------------------------------------------------------

    pub fn profile(&self, key: &AccountKey) -> TlResult<Option<Profile>> {
        let conn = self.conn()?;
        load_profile(&conn, key)
    }

    /// The stored profile, or a fresh one for an account never synced.
    pub fn profile_or_default(&self, key: &AccountKey) -> TlResult<Profile> {
        Ok(self.profile(key)?.unwrap_or_else(|| Profile::new(key)))
    }

    // -----------------------------------------------------------------------
    // Races
    // -----------------------------------------------------------------------

    pub fn contains_race(&self, key: &AccountKey, sequence: u64) -> TlResult<bool> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM races WHERE partition = ?1 AND account = ?2 AND sequence = ?3",
                params![key.partition, key.account, sequence as i64],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn race(&self, key: &AccountKey, sequence: u64) -> TlResult<Option<RaceRecord>> {
        let conn = self.conn()?;
        let race = conn
            .query_row(
                &format!(
                    "SELECT {RACE_COLUMNS} FROM races \
                     WHERE partition = ?1 AND account = ?2 AND sequence = ?3"
                ),
                params![key.partition, key.account, sequence as i64],
                race_from_row,
            )
            .optional()?;
        Ok(race)
    }

    /// Every stored race of the account in timestamp order.
    pub fn races(&self, key: &AccountKey) -> TlResult<Vec<RaceRecord>> {
        let conn = self.conn()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {RACE_COLUMNS} FROM races WHERE partition = ?1 AND account = ?2 \
             ORDER BY timestamp_ms ASC, sequence ASC"
        ))?;
        let rows = statement.query_map(params![key.partition, key.account], race_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn race_count(&self, key: &AccountKey) -> TlResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM races WHERE partition = ?1 AND account = ?2",
            params![key.partition, key.account],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Highest stored race sequence, 0 when none.
    pub fn max_race_sequence(&self, key: &AccountKey) -> TlResult<u64> {
        let conn = self.conn()?;
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(sequence) FROM races WHERE partition = ?1 AND account = ?2",
            params![key.partition, key.account],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) as u64)
    }

    /// The stored raw log of a race, decompressed.
    pub fn typing_log(&self, key: &AccountKey, sequence: u64) -> TlResult<Option<String>> {
        let conn = self.conn()?;
        let stored: Option<(Option<Vec<u8>>, bool)> = conn
            .query_row(
                "SELECT raw_log, log_compressed FROM races \
                 WHERE partition = ?1 AND account = ?2 AND sequence = ?3",
                params![key.partition, key.account, sequence as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match stored {
            Some((Some(bytes), compressed)) => Ok(Some(stored_log_text(&bytes, compressed)?)),
            _ => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Tombstones
    // -----------------------------------------------------------------------

    pub fn tombstone(&self, key: &AccountKey, sequence: u64) -> TlResult<Option<Tombstone>> {
        let conn = self.conn()?;
        let raw_log: Option<Option<String>> = conn
            .query_row(
                "SELECT raw_log FROM tombstones \
                 WHERE partition = ?1 AND account = ?2 AND sequence = ?3",
                params![key.partition, key.account, sequence as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw_log.map(|raw_log| Tombstone {
            partition: key.partition.clone(),
            account: key.account.clone(),
            sequence,
            raw_log,
        }))
    }

    /// Sequence numbers of every tombstone of the account with their logs.
    pub fn tombstones(&self, key: &AccountKey) -> TlResult<HashMap<u64, Option<String>>> {
        let conn = self.conn()?;
        let mut statement = conn.prepare(
            "SELECT sequence, raw_log FROM tombstones WHERE partition = ?1 AND account = ?2",
        )?;
        let rows = statement.query_map(params![key.partition, key.account], |row| {
            Ok((row.get::<_, i64>(0)? as u64, row.get::<_, Option<String>>(1)?))
        })?;
        Ok(rows.collect::<Result<HashMap<_, _>, _>>()?)
    }

    pub fn tombstone_count(&self, key: &AccountKey) -> TlResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tombstones WHERE partition = ?1 AND account = ?2",
            params![key.partition, key.account],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Record a void sequence number. Returns `false` when it was already
    /// tombstoned or is held by a stored race.
    pub fn insert_tombstone(&self, tombstone: &Tombstone) -> TlResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO tombstones (partition, account, sequence, raw_log, created_at_ms) \
             SELECT ?1, ?2, ?3, ?4, ?5 WHERE NOT EXISTS ( \
                 SELECT 1 FROM races WHERE partition = ?1 AND account = ?2 AND sequence = ?3)",
            params![
                tombstone.partition,
                tombstone.account,
                tombstone.sequence as i64,
                tombstone.raw_log,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(changed == 1)
    }

    /// Move a stored race into the tombstone ledger and take its
    /// contribution back out of the profile.
    pub fn tombstone_race(
        &self,
        partition: &Partition,
        account: &str,
        sequence: u64,
    ) -> TlResult<bool> {
        let key = AccountKey::new(&partition.name, account);
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let Some(record) = tx
            .query_row(
                &format!(
                    "SELECT {RACE_COLUMNS} FROM races \
                     WHERE partition = ?1 AND account = ?2 AND sequence = ?3"
                ),
                params![key.partition, key.account, sequence as i64],
                race_from_row,
            )
            .optional()?
        else {
            return Ok(false);
        };

        let raw_log = match &record.raw_log {
            Some(bytes) => stored_log_text(bytes, record.log_compressed).ok(),
            None => None,
        };
        tx.execute(
            "DELETE FROM races WHERE partition = ?1 AND account = ?2 AND sequence = ?3",
            params![key.partition, key.account, sequence as i64],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO tombstones (partition, account, sequence, raw_log, created_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key.partition,
                key.account,
                sequence as i64,
                raw_log,
                Utc::now().timestamp_millis()
            ],
        )?;

        let mut profile = load_profile(&tx, &key)?.unwrap_or_else(|| Profile::new(&key));
        unfold_record(&tx, &mut profile, partition, &record)?;
        save_profile(&tx, &profile)?;
        tx.commit()?;

        tracing::info!(
            partition = %key.partition,
            account = %key.account,
            sequence,
            "race moved to tombstones"
        );
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Texts
    // -----------------------------------------------------------------------

    pub fn text(&self, partition: &str, text_id: u32) -> TlResult<Option<TextEntry>> {
        let conn = self.conn()?;
        let text = conn
            .query_row(
                "SELECT quote, disabled FROM texts WHERE partition = ?1 AND text_id = ?2",
                params![partition, text_id],
                |row| {
                    Ok(TextEntry {
                        text_id,
                        quote: row.get(0)?,
                        disabled: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(text)
    }

    /// Returns `true` when the text was not known before.
    pub fn insert_text(&self, partition: &str, text: &TextEntry) -> TlResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO texts (partition, text_id, quote, disabled) VALUES (?1, ?2, ?3, ?4)",
            params![partition, text.text_id, text.quote, text.disabled],
        )?;
        Ok(changed == 1)
    }

    pub fn text_best(&self, key: &AccountKey, text_id: u32) -> TlResult<Option<f64>> {
        let conn = self.conn()?;
        let best = conn
            .query_row(
                "SELECT best_speed FROM text_bests \
                 WHERE partition = ?1 AND account = ?2 AND text_id = ?3",
                params![key.partition, key.account, text_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(best)
    }

    // -----------------------------------------------------------------------
    // Resume cache
    // -----------------------------------------------------------------------

    /// Stage a fetched historical bucket until the batch it feeds commits.
    pub fn stage_bucket(&self, key: &AccountKey, bucket: u64, races: &[RemoteRace]) -> TlResult<()> {
        let payload = serde_json::to_string(races)?;
        let checksum = sha256_hex(payload.as_bytes());
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO resume_buckets \
             (partition, account, bucket, payload, checksum, staged_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                key.partition,
                key.account,
                bucket as i64,
                payload,
                checksum,
                Utc::now().timestamp_millis()
            ],
        )?;
        tracing::debug!(
            partition = %key.partition,
            account = %key.account,
            bucket,
            races = races.len(),
            "bucket staged"
        );
        Ok(())
    }

    /// A staged bucket, or `None` when absent. An entry that fails its
    /// checksum or no longer parses is dropped so the caller refetches it.
    pub fn staged_bucket(&self, key: &AccountKey, bucket: u64) -> TlResult<Option<Vec<RemoteRace>>> {
        let conn = self.conn()?;
        let staged: Option<(String, String)> = conn
            .query_row(
                "SELECT payload, checksum FROM resume_buckets \
                 WHERE partition = ?1 AND account = ?2 AND bucket = ?3",
                params![key.partition, key.account, bucket as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((payload, checksum)) = staged else {
            return Ok(None);
        };

        let parsed = (sha256_hex(payload.as_bytes()) == checksum)
            .then(|| serde_json::from_str::<Vec<RemoteRace>>(&payload).ok())
            .flatten();
        if parsed.is_none() {
            tracing::warn!(
                partition = %key.partition,
                account = %key.account,
                bucket,
                "discarding corrupt staged bucket"
            );
            conn.execute(
                "DELETE FROM resume_buckets WHERE partition = ?1 AND account = ?2 AND bucket = ?3",
                params![key.partition, key.account, bucket as i64],
            )?;
        }
        Ok(parsed)
    }

    pub fn staged_buckets(&self, key: &AccountKey) -> TlResult<Vec<u64>> {
        let conn = self.conn()?;
        let mut statement = conn.prepare(
            "SELECT bucket FROM resume_buckets WHERE partition = ?1 AND account = ?2 ORDER BY bucket",
        )?;
        let rows = statement.query_map(params![key.partition, key.account], |row| {
            row.get::<_, i64>(0).map(|bucket| bucket as u64)
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    /// Insert `records` in one transaction, fold each newly inserted record
    /// into the profile and clear the account's staged buckets.
    ///
    /// `last_synced_at_ms` and `reconciled_sequence` advance to `synced_at_ms`
    /// and `reconciled_through` and never move back.
    pub fn commit_batch(
        &self,
        partition: &Partition,
        account: &str,
        records: &[RaceRecord],
        synced_at_ms: i64,
        reconciled_through: u64,
    ) -> TlResult<CommitSummary> {
        for attempt in 0..=PERSIST_BUSY_RETRY_ATTEMPTS {
            match self.commit_batch_once(
                partition,
                account,
                records,
                synced_at_ms,
                reconciled_through,
            ) {
                Ok(summary) => return Ok(summary),
                Err(error)
                    if is_busy_storage_error(&error) && attempt < PERSIST_BUSY_RETRY_ATTEMPTS =>
                {
                    let delay_ms = PERSIST_BUSY_BASE_BACKOFF_MS * (attempt as u64 + 1);
                    std::thread::sleep(Duration::from_millis(delay_ms));
                }
                Err(error) => return Err(error),
            }
        }

        Err(TlError::Storage(
            "commit retry loop exhausted unexpectedly".to_owned(),
        ))
    }

    fn commit_batch_once(
        &self,
        partition: &Partition,
        account: &str,
        records: &[RaceRecord],
        synced_at_ms: i64,
        reconciled_through: u64,
    ) -> TlResult<CommitSummary> {
        let key = AccountKey::new(&partition.name, account);
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut profile = load_profile(&tx, &key)?.unwrap_or_else(|| Profile::new(&key));
        let mut inserted = 0usize;
        for record in records {
            if insert_race(&tx, record)? {
                fold_record(&tx, &mut profile, partition, record)?;
                inserted += 1;
            }
        }

        profile.last_synced_at_ms = profile.last_synced_at_ms.max(synced_at_ms);
        profile.reconciled_sequence = profile.reconciled_sequence.max(reconciled_through);
        save_profile(&tx, &profile)?;
        tx.execute(
            "DELETE FROM resume_buckets WHERE partition = ?1 AND account = ?2",
            params![key.partition, key.account],
        )?;
        tx.commit()?;

        Ok(CommitSummary {
            inserted,
            ignored: records.len() - inserted,
            profile,
        })
    }
}

fn initialize_schema(connection: &Connection) -> TlResult<()> {
    let _ = connection.pragma_update(None, "journal_mode", "WAL");
    connection.busy_timeout(Duration::from_millis(5_000))?;

    connection.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS profiles (
    partition TEXT NOT NULL,
    account TEXT NOT NULL,
    last_synced_at_ms INTEGER NOT NULL DEFAULT 0,
    reconciled_sequence INTEGER NOT NULL DEFAULT 0,
    imported_count INTEGER NOT NULL DEFAULT 0,
    best_speed REAL NOT NULL DEFAULT 0,
    speed_total REAL NOT NULL DEFAULT 0,
    points_total REAL NOT NULL DEFAULT 0,
    points_retroactive REAL NOT NULL DEFAULT 0,
    characters_total INTEGER NOT NULL DEFAULT 0,
    seconds_total REAL NOT NULL DEFAULT 0,
    texts_typed INTEGER NOT NULL DEFAULT 0,
    text_best_total REAL NOT NULL DEFAULT 0,
    awards_first INTEGER NOT NULL DEFAULT 0,
    awards_second INTEGER NOT NULL DEFAULT 0,
    awards_third INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (partition, account)
);

CREATE TABLE IF NOT EXISTS races (
    partition TEXT NOT NULL,
    account TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    text_id INTEGER NOT NULL,
    speed REAL NOT NULL,
    accuracy REAL NOT NULL,
    points REAL NOT NULL,
    characters INTEGER NOT NULL,
    rank INTEGER NOT NULL,
    peer_count INTEGER NOT NULL,
    correlation_id TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    unlagged REAL,
    adjusted REAL,
    raw_adjusted REAL,
    pauseless_adjusted REAL,
    start_delay_ms REAL,
    duration_ms REAL,
    correction_time_ms REAL,
    pause_time_ms REAL,
    raw_log BLOB,
    log_compressed INTEGER NOT NULL DEFAULT 0,
    retroactive INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (partition, account, sequence)
);

CREATE INDEX IF NOT EXISTS idx_races_timestamp ON races (partition, account, timestamp_ms);
CREATE INDEX IF NOT EXISTS idx_races_text ON races (partition, account, text_id);

CREATE TABLE IF NOT EXISTS tombstones (
    partition TEXT NOT NULL,
    account TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    raw_log TEXT,
    created_at_ms INTEGER NOT NULL,
    PRIMARY KEY (partition, account, sequence)
);

CREATE TABLE IF NOT EXISTS texts (
    partition TEXT NOT NULL,
    text_id INTEGER NOT NULL,
    quote TEXT NOT NULL,
    disabled INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (partition, text_id)
);

CREATE TABLE IF NOT EXISTS text_bests (
    partition TEXT NOT NULL,
    account TEXT NOT NULL,
    text_id INTEGER NOT NULL,
    best_speed REAL NOT NULL,
    sequence INTEGER NOT NULL,
    PRIMARY KEY (partition, account, text_id)
);

CREATE TABLE IF NOT EXISTS resume_buckets (
    partition TEXT NOT NULL,
    account TEXT NOT NULL,
    bucket INTEGER NOT NULL,
    payload TEXT NOT NULL,
    checksum TEXT NOT NULL,
    staged_at_ms INTEGER NOT NULL,
    PRIMARY KEY (partition, account, bucket)
);
"#,
    )?;
    ensure_column_exists(
        connection,
        "profiles",
        "reconciled_sequence",
        "INTEGER NOT NULL DEFAULT 0",
    )?;
    Ok(())
}

/// Stores created before a column existed get it added in place.
fn ensure_column_exists(
    connection: &Connection,
    table: &str,
    column: &str,
    column_def: &str,
) -> TlResult<()> {
    let mut statement = connection.prepare(&format!("PRAGMA table_info({table})"))?;
    let exists = statement
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?
        .iter()
        .any(|name| name == column);
    if !exists {
        connection.execute_batch(&format!(
            "ALTER TABLE {table} ADD COLUMN {column} {column_def};"
        ))?;
    }
    Ok(())
}

const RACE_COLUMNS: &str = "partition, account, sequence, text_id, speed, accuracy, points, \
     characters, rank, peer_count, correlation_id, timestamp_ms, unlagged, adjusted, \
     raw_adjusted, pauseless_adjusted, start_delay_ms, duration_ms, correction_time_ms, \
     pause_time_ms, raw_log, log_compressed, retroactive";

fn race_from_row(row: &Row<'_>) -> rusqlite::Result<RaceRecord> {
    Ok(RaceRecord {
        partition: row.get(0)?,
        account: row.get(1)?,
        sequence: row.get::<_, i64>(2)? as u64,
        text_id: row.get(3)?,
        speed: row.get(4)?,
        accuracy: row.get(5)?,
        points: row.get(6)?,
        characters: row.get(7)?,
        rank: row.get(8)?,
        peer_count: row.get(9)?,
        correlation_id: row.get(10)?,
        timestamp_ms: row.get(11)?,
        unlagged: row.get(12)?,
        adjusted: row.get(13)?,
        raw_adjusted: row.get(14)?,
        pauseless_adjusted: row.get(15)?,
        start_delay_ms: row.get(16)?,
        duration_ms: row.get(17)?,
        correction_time_ms: row.get(18)?,
        pause_time_ms: row.get(19)?,
        raw_log: row.get(20)?,
        log_compressed: row.get(21)?,
        retroactive: row.get(22)?,
    })
}

/// `false` when the sequence number is already stored or tombstoned.
fn insert_race(tx: &Transaction<'_>, record: &RaceRecord) -> TlResult<bool> {
    let changed = tx.execute(
        &format!(
            "INSERT OR IGNORE INTO races ({RACE_COLUMNS}) \
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                    ?17, ?18, ?19, ?20, ?21, ?22, ?23 \
             WHERE NOT EXISTS (SELECT 1 FROM tombstones \
                 WHERE partition = ?1 AND account = ?2 AND sequence = ?3)"
        ),
        params![
            record.partition,
            record.account,
            record.sequence as i64,
            record.text_id,
            record.speed,
            record.accuracy,
            record.points,
            record.characters,
            record.rank,
            record.peer_count,
            record.correlation_id,
            record.timestamp_ms,
            record.unlagged,
            record.adjusted,
            record.raw_adjusted,
            record.pauseless_adjusted,
            record.start_delay_ms,
            record.duration_ms,
            record.correction_time_ms,
            record.pause_time_ms,
            record.raw_log,
            record.log_compressed,
            record.retroactive,
        ],
    )?;
    Ok(changed == 1)
}

fn load_profile(conn: &Connection, key: &AccountKey) -> TlResult<Option<Profile>> {
    let profile = conn
        .query_row(
            "SELECT last_synced_at_ms, imported_count, best_speed, speed_total, points_total, \
                    points_retroactive, characters_total, seconds_total, texts_typed, \
                    text_best_total, awards_first, awards_second, awards_third, \
                    reconciled_sequence \
             FROM profiles WHERE partition = ?1 AND account = ?2",
            params![key.partition, key.account],
            |row| {
                Ok(Profile {
                    partition: key.partition.clone(),
                    account: key.account.clone(),
                    last_synced_at_ms: row.get(0)?,
                    imported_count: row.get::<_, i64>(1)? as u64,
                    best_speed: row.get(2)?,
                    speed_total: row.get(3)?,
                    points_total: row.get(4)?,
                    points_retroactive: row.get(5)?,
                    characters_total: row.get::<_, i64>(6)? as u64,
                    seconds_total: row.get(7)?,
                    texts_typed: row.get::<_, i64>(8)? as u64,
                    text_best_total: row.get(9)?,
                    awards: AwardTally {
                        first: row.get::<_, i64>(10)? as u64,
                        second: row.get::<_, i64>(11)? as u64,
                        third: row.get::<_, i64>(12)? as u64,
                    },
                    reconciled_sequence: row.get::<_, i64>(13)? as u64,
                })
            },
        )
        .optional()?;
    Ok(profile)
}

fn save_profile(conn: &Connection, profile: &Profile) -> TlResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO profiles (partition, account, last_synced_at_ms, imported_count, \
             best_speed, speed_total, points_total, points_retroactive, characters_total, \
             seconds_total, texts_typed, text_best_total, awards_first, awards_second, awards_third, \
             reconciled_sequence) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            profile.partition,
            profile.account,
            profile.last_synced_at_ms,
            profile.imported_count as i64,
            profile.best_speed,
            profile.speed_total,
            profile.points_total,
            profile.points_retroactive,
            profile.characters_total as i64,
            profile.seconds_total,
            profile.texts_typed as i64,
            profile.text_best_total,
            profile.awards.first as i64,
            profile.awards.second as i64,
            profile.awards.third as i64,
            profile.reconciled_sequence as i64,
        ],
    )?;
    Ok(())
}

/// Seconds spent typing, from the reported speed.
fn active_seconds(partition: &Partition, record: &RaceRecord) -> f64 {
    if record.speed <= 0.0 {
        return 0.0;
    }
    f64::from(record.characters) * f64::from(partition.multiplier) / 1_000.0 / record.speed
}

fn fold_record(
    tx: &Transaction<'_>,
    profile: &mut Profile,
    partition: &Partition,
    record: &RaceRecord,
) -> TlResult<()> {
    profile.imported_count += 1;
    profile.best_speed = profile.best_speed.max(record.speed);
    profile.speed_total += record.speed;
    profile.points_total += record.points;
    if record.retroactive {
        profile.points_retroactive += record.points;
    }
    profile.characters_total += u64::from(record.characters);
    profile.seconds_total += active_seconds(partition, record);
    profile.awards.record(record.rank, record.peer_count);

    let previous: Option<f64> = tx
        .query_row(
            "SELECT best_speed FROM text_bests WHERE partition = ?1 AND account = ?2 AND text_id = ?3",
            params![record.partition, record.account, record.text_id],
            |row| row.get(0),
        )
        .optional()?;
    match previous {
        None => {
            profile.texts_typed += 1;
            profile.text_best_total += record.speed;
        }
        Some(best) if record.speed > best => {
            profile.text_best_total += record.speed - best;
        }
        Some(_) => return Ok(()),
    }
    tx.execute(
        "INSERT OR REPLACE INTO text_bests (partition, account, text_id, best_speed, sequence) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.partition,
            record.account,
            record.text_id,
            record.speed,
            record.sequence as i64
        ],
    )?;
    Ok(())
}

/// Inverse of [`fold_record`] for a race that has already been deleted.
/// Maxima are recomputed from what remains.
fn unfold_record(
    tx: &Transaction<'_>,
    profile: &mut Profile,
    partition: &Partition,
    record: &RaceRecord,
) -> TlResult<()> {
    profile.imported_count = profile.imported_count.saturating_sub(1);
    profile.speed_total -= record.speed;
    profile.points_total -= record.points;
    if record.retroactive {
        profile.points_retroactive -= record.points;
    }
    profile.characters_total = profile
        .characters_total
        .saturating_sub(u64::from(record.characters));
    profile.seconds_total -= active_seconds(partition, record);
    if record.peer_count >= 2 {
        match record.rank {
            1 => profile.awards.first = profile.awards.first.saturating_sub(1),
            2 => profile.awards.second = profile.awards.second.saturating_sub(1),
            3 => profile.awards.third = profile.awards.third.saturating_sub(1),
            _ => {}
        }
    }

    let best: Option<f64> = tx.query_row(
        "SELECT MAX(speed) FROM races WHERE partition = ?1 AND account = ?2",
        params![record.partition, record.account],
        |row| row.get(0),
    )?;
    profile.best_speed = best.unwrap_or(0.0);

    let previous: Option<f64> = tx
        .query_row(
            "SELECT best_speed FROM text_bests WHERE partition = ?1 AND account = ?2 AND text_id = ?3",
            params![record.partition, record.account, record.text_id],
            |row| row.get(0),
        )
        .optional()?;
    let remaining: Option<(f64, i64)> = tx
        .query_row(
            "SELECT speed, sequence FROM races WHERE partition = ?1 AND account = ?2 AND text_id = ?3 \
             ORDER BY speed DESC LIMIT 1",
            params![record.partition, record.account, record.text_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let previous = previous.unwrap_or(0.0);
    match remaining {
        Some((speed, sequence)) => {
            profile.text_best_total += speed - previous;
            tx.execute(
                "UPDATE text_bests SET best_speed = ?4, sequence = ?5 \
                 WHERE partition = ?1 AND account = ?2 AND text_id = ?3",
                params![record.partition, record.account, record.text_id, speed, sequence],
            )?;
        }
        None => {
            profile.texts_typed = profile.texts_typed.saturating_sub(1);
            profile.text_best_total -= previous;
            tx.execute(
                "DELETE FROM text_bests WHERE partition = ?1 AND account = ?2 AND text_id = ?3",
                params![record.partition, record.account, record.text_id],
            )?;
        }
    }
    Ok(())
}

fn stored_log_text(bytes: &[u8], compressed: bool) -> TlResult<String> {
    if compressed {
        codec::decompress_log(bytes)
    } else {
        String::from_utf8(bytes.to_vec())
            .map_err(|error| TlError::Storage(format!("stored log is not utf-8: {error}")))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn is_busy_storage_error(error: &TlError) -> bool {
    let TlError::Storage(message) = error else {
        return false;
    };
    let lowered = message.to_ascii_lowercase();
    lowered.contains("database is busy") || lowered.contains("database is locked")
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn play() -> Partition {
        Partition::new("play", 12_000)
    }

    fn key() -> AccountKey {
        AccountKey::new("play", "keegant")
    }

    fn record(sequence: u64, text_id: u32, speed: f64) -> RaceRecord {
        RaceRecord {
            partition: "play".to_owned(),
            account: "keegant".to_owned(),
            sequence,
            text_id,
            speed,
            accuracy: 0.98,
            points: 40.0,
            characters: 100,
            rank: 1,
            peer_count: 3,
            correlation_id: format!("heat-{sequence}"),
            timestamp_ms: 1_700_000_000_000 + sequence as i64,
            unlagged: Some(speed + 2.0),
            adjusted: Some(speed + 4.0),
            raw_adjusted: None,
            pauseless_adjusted: None,
            start_delay_ms: Some(400.0),
            duration_ms: Some(12_000.0),
            correction_time_ms: None,
            pause_time_ms: None,
            raw_log: Some(codec::compress_log("0,0,0,100a|1,1,100,0+a,").expect("compress")),
            log_compressed: true,
            retroactive: false,
        }
    }

    fn remote(sequence: u64) -> RemoteRace {
        RemoteRace {
            sequence,
            text_id: 7,
            speed: 90.0,
            accuracy: 1.0,
            points: None,
            rank: 1,
            peer_count: 1,
            correlation_id: String::new(),
            timestamp_ms: sequence as i64,
            log: None,
        }
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested/store.sqlite3");
        let store = RaceStore::open(&path).expect("open");
        assert!(path.exists());
        assert_eq!(store.race_count(&key()).expect("count"), 0);
    }

    #[test]
    fn older_profiles_table_gains_reconciled_column() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("old.sqlite3");
        {
            let conn = Connection::open(&path).expect("open");
            conn.execute_batch(
                "CREATE TABLE profiles (
                    partition TEXT NOT NULL,
                    account TEXT NOT NULL,
                    last_synced_at_ms INTEGER NOT NULL DEFAULT 0,
                    imported_count INTEGER NOT NULL DEFAULT 0,
                    best_speed REAL NOT NULL DEFAULT 0,
                    speed_total REAL NOT NULL DEFAULT 0,
                    points_total REAL NOT NULL DEFAULT 0,
                    points_retroactive REAL NOT NULL DEFAULT 0,
                    characters_total INTEGER NOT NULL DEFAULT 0,
                    seconds_total REAL NOT NULL DEFAULT 0,
                    texts_typed INTEGER NOT NULL DEFAULT 0,
                    text_best_total REAL NOT NULL DEFAULT 0,
                    awards_first INTEGER NOT NULL DEFAULT 0,
                    awards_second INTEGER NOT NULL DEFAULT 0,
                    awards_third INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (partition, account)
                );
                INSERT INTO profiles (partition, account, last_synced_at_ms, imported_count)
                VALUES ('play', 'keegant', 7, 2);",
            )
            .expect("old schema");
        }

        let store = RaceStore::open(&path).expect("reopen");
        let profile = store.profile(&key()).expect("profile").expect("present");
        assert_eq!(profile.last_synced_at_ms, 7);
        assert_eq!(profile.imported_count, 2);
        assert_eq!(profile.reconciled_sequence, 0);

        let summary = store
            .commit_batch(&play(), "keegant", &[], 8, 40)
            .expect("commit");
        assert_eq!(summary.profile.reconciled_sequence, 40);
    }

    #[test]
    fn commit_folds_aggregates_once() {
        let store = RaceStore::open_in_memory().expect("store");
        let mut retro = record(2, 5, 120.0);
        retro.retroactive = true;
        retro.points = 10.0;
        let batch = vec![record(1, 5, 100.0), retro, record(3, 6, 80.0)];

        let summary = store.commit_batch(&play(), "keegant", &batch, 5_000, 3).expect("commit");
        assert_eq!(summary.inserted, 3);
        let profile = summary.profile;
        assert_eq!(profile.imported_count, 3);
        assert_eq!(profile.best_speed, 120.0);
        assert_eq!(profile.speed_total, 300.0);
        assert_eq!(profile.points_total, 90.0);
        assert_eq!(profile.points_retroactive, 10.0);
        assert_eq!(profile.characters_total, 300);
        assert_eq!(profile.texts_typed, 2);
        assert_eq!(profile.text_best_total, 200.0);
        assert_eq!(profile.awards.first, 3);
        assert!((profile.seconds_total - (12.0 + 10.0 + 15.0)).abs() < 1e-9);
        assert_eq!(store.text_best(&key(), 5).expect("best"), Some(120.0));

        let again = store.commit_batch(&play(), "keegant", &batch, 4_000, 1).expect("recommit");
        assert_eq!(again.inserted, 0);
        assert_eq!(again.ignored, 3);
        assert_eq!(again.profile.imported_count, 3);
        assert_eq!(again.profile.speed_total, 300.0);
        assert_eq!(again.profile.last_synced_at_ms, 5_000);
        assert_eq!(again.profile.reconciled_sequence, 3);
        assert_eq!(store.max_race_sequence(&key()).expect("max"), 3);
    }

    #[test]
    fn tombstones_and_races_are_exclusive() {
        let store = RaceStore::open_in_memory().expect("store");
        let tombstone = Tombstone {
            partition: "play".to_owned(),
            account: "keegant".to_owned(),
            sequence: 4,
            raw_log: None,
        };
        assert!(store.insert_tombstone(&tombstone).expect("insert"));
        assert!(!store.insert_tombstone(&tombstone).expect("duplicate"));

        let summary = store
            .commit_batch(&play(), "keegant", &[record(4, 1, 100.0)], 1, 4)
            .expect("commit");
        assert_eq!(summary.inserted, 0);
        assert!(!store.contains_race(&key(), 4).expect("contains"));

        store
            .commit_batch(&play(), "keegant", &[record(5, 1, 100.0)], 1, 5)
            .expect("commit");
        let blocked = Tombstone {
            sequence: 5,
            ..tombstone
        };
        assert!(!store.insert_tombstone(&blocked).expect("blocked"));
        assert_eq!(store.tombstone_count(&key()).expect("count"), 1);
    }

    #[test]
    fn tombstone_race_moves_record_and_unfolds_profile() {
        let store = RaceStore::open_in_memory().expect("store");
        let batch = vec![record(1, 5, 100.0), record(2, 5, 120.0), record(3, 6, 80.0)];
        store.commit_batch(&play(), "keegant", &batch, 10, 3).expect("commit");

        assert!(store.tombstone_race(&play(), "keegant", 2).expect("tombstone"));
        assert!(!store.tombstone_race(&play(), "keegant", 2).expect("second"));

        let profile = store.profile(&key()).expect("load").expect("profile");
        assert_eq!(profile.imported_count, 2);
        assert_eq!(profile.best_speed, 100.0);
        assert_eq!(profile.speed_total, 180.0);
        assert_eq!(profile.text_best_total, 180.0);
        assert_eq!(profile.awards.first, 2);

        let tombstone = store.tombstone(&key(), 2).expect("load").expect("tombstone");
        assert_eq!(tombstone.raw_log.as_deref(), Some("0,0,0,100a|1,1,100,0+a,"));
        assert!(store.race(&key(), 2).expect("race").is_none());

        assert!(store.tombstone_race(&play(), "keegant", 3).expect("tombstone"));
        let profile = store.profile(&key()).expect("load").expect("profile");
        assert_eq!(profile.texts_typed, 1);
        assert_eq!(profile.text_best_total, 100.0);
    }

    #[test]
    fn staged_buckets_survive_until_commit() {
        let store = RaceStore::open_in_memory().expect("store");
        store.stage_bucket(&key(), 3, &[remote(3001), remote(3002)]).expect("stage");
        store.stage_bucket(&key(), 1, &[]).expect("stage empty");

        let staged = store.staged_bucket(&key(), 3).expect("load").expect("staged");
        assert_eq!(staged.len(), 2);
        assert_eq!(staged[1].sequence, 3002);
        assert_eq!(store.staged_buckets(&key()).expect("list"), vec![1, 3]);

        store.commit_batch(&play(), "keegant", &[], 1, 0).expect("commit");
        assert!(store.staged_buckets(&key()).expect("list").is_empty());
    }

    #[test]
    fn corrupt_staged_bucket_is_discarded() {
        let store = RaceStore::open_in_memory().expect("store");
        store.stage_bucket(&key(), 2, &[remote(2001)]).expect("stage");
        store
            .conn()
            .expect("conn")
            .execute("UPDATE resume_buckets SET payload = '[]'", [])
            .expect("tamper");

        assert!(store.staged_bucket(&key(), 2).expect("load").is_none());
        assert!(store.staged_buckets(&key()).expect("list").is_empty());
    }

    #[test]
    fn texts_register_once() {
        let store = RaceStore::open_in_memory().expect("store");
        let text = TextEntry {
            text_id: 9,
            quote: "hello world".to_owned(),
            disabled: false,
        };
        assert!(store.insert_text("play", &text).expect("insert"));
        assert!(!store.insert_text("play", &text).expect("again"));
        assert_eq!(store.text("play", 9).expect("load"), Some(text));
        assert!(store.text("lang_ko", 9).expect("load").is_none());
    }

    #[test]
    fn stored_logs_load_decompressed() {
        let store = RaceStore::open_in_memory().expect("store");
        store
            .commit_batch(&play(), "keegant", &[record(1, 1, 90.0)], 1, 1)
            .expect("commit");
        let log = store.typing_log(&key(), 1).expect("load").expect("log");
        assert_eq!(log, "0,0,0,100a|1,1,100,0+a,");
        let race = store.race(&key(), 1).expect("load").expect("race");
        assert!(race.log_compressed);
        assert_eq!(race.unlagged, Some(92.0));
    }

    #[test]
    fn busy_messages_are_recognized() {
        assert!(is_busy_storage_error(&TlError::Storage(
            "database is locked".to_owned()
        )));
        assert!(!is_busy_storage_error(&TlError::Storage(
            "no such table".to_owned()
        )));
        assert!(!is_busy_storage_error(&TlError::Config(
            "database is locked".to_owned()
        )));
    }
}
