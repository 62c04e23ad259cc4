use std::fmt;

use serde::{Deserialize, Serialize};

/// A logical namespace of races with its own sequence space and speed
/// normalization constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    /// Converts a character count over elapsed milliseconds into words per
    /// minute: `wpm = multiplier * chars / ms`.
    pub multiplier: u32,
}

impl Partition {
    #[must_use]
    pub fn new(name: impl Into<String>, multiplier: u32) -> Self {
        Self {
            name: name.into(),
            multiplier,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountKey {
    pub partition: String,
    pub account: String,
}

impl AccountKey {
    #[must_use]
    pub fn new(partition: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            account: account.into(),
        }
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account, self.partition)
    }
}

/// What the source reports about an account as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAccount {
    /// Highest sequence number the source has assigned so far.
    pub sequence_high_water: u64,
}

/// A race summary as returned by the listing and historical endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRace {
    pub sequence: u64,
    pub text_id: u32,
    /// Speed as measured by the source, including network lag.
    pub speed: f64,
    pub accuracy: f64,
    /// Absent (or zero) for races the source never scored.
    pub points: Option<f64>,
    pub rank: u32,
    pub peer_count: u32,
    /// Groups races that ran in the same heat.
    pub correlation_id: String,
    pub timestamp_ms: i64,
    /// Raw typing log; `None` when the listing omitted it and the detail
    /// endpoint must be consulted.
    pub log: Option<String>,
}

impl RemoteRace {
    /// The source marks void races with a zero speed.
    #[must_use]
    pub fn is_void(&self) -> bool {
        self.speed == 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEntry {
    pub text_id: u32,
    pub quote: String,
    pub disabled: bool,
}

impl TextEntry {
    #[must_use]
    pub fn word_count(&self) -> usize {
        word_count(&self.quote)
    }
}

/// Words are space separated; consecutive spaces delimit empty words, which
/// matches how the source scores races.
#[must_use]
pub fn word_count(quote: &str) -> usize {
    quote.split(' ').count()
}

/// One persisted race. Unique by `(partition, account, sequence)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceRecord {
    pub partition: String,
    pub account: String,
    pub sequence: u64,
    pub text_id: u32,
    pub speed: f64,
    pub accuracy: f64,
    pub points: f64,
    pub characters: u32,
    pub rank: u32,
    pub peer_count: u32,
    pub correlation_id: String,
    pub timestamp_ms: i64,
    pub unlagged: Option<f64>,
    pub adjusted: Option<f64>,
    pub raw_adjusted: Option<f64>,
    pub pauseless_adjusted: Option<f64>,
    pub start_delay_ms: Option<f64>,
    pub duration_ms: Option<f64>,
    pub correction_time_ms: Option<f64>,
    pub pause_time_ms: Option<f64>,
    #[serde(skip)]
    pub raw_log: Option<Vec<u8>>,
    pub log_compressed: bool,
    /// Points were computed locally because the source supplied none.
    pub retroactive: bool,
}

impl RaceRecord {
    #[must_use]
    pub fn key(&self) -> AccountKey {
        AccountKey::new(&self.partition, &self.account)
    }
}

/// Permanent marker for a sequence number the source reported as void.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub partition: String,
    pub account: String,
    pub sequence: u64,
    pub raw_log: Option<String>,
}

/// Podium finishes across the account's own races, folded per race at
/// commit. Awards from organized competitions are not counted here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwardTally {
    pub first: u64,
    pub second: u64,
    pub third: u64,
}

impl AwardTally {
    /// Count podium finishes in heats that had someone to beat.
    pub fn record(&mut self, rank: u32, peer_count: u32) {
        if peer_count < 2 {
            return;
        }
        match rank {
            1 => self.first += 1,
            2 => self.second += 1,
            3 => self.third += 1,
            _ => {}
        }
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.first + self.second + self.third
    }
}

/// Per account-partition sync state and aggregate statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub partition: String,
    pub account: String,
    /// Only ever moves forward.
    pub last_synced_at_ms: i64,
    /// Every sequence at or below this has been fetched and settled as a
    /// stored race, a tombstone or a gap at the source. Only moves forward.
    #[serde(default)]
    pub reconciled_sequence: u64,
    pub imported_count: u64,
    pub best_speed: f64,
    pub speed_total: f64,
    pub points_total: f64,
    /// Share of `points_total` computed locally.
    pub points_retroactive: f64,
    pub characters_total: u64,
    pub seconds_total: f64,
    pub texts_typed: u64,
    pub text_best_total: f64,
    pub awards: AwardTally,
}

impl Profile {
    #[must_use]
    pub fn new(key: &AccountKey) -> Self {
        Self {
            partition: key.partition.clone(),
            account: key.account.clone(),
            last_synced_at_ms: 0,
            reconciled_sequence: 0,
            imported_count: 0,
            best_speed: 0.0,
            speed_total: 0.0,
            points_total: 0.0,
            points_retroactive: 0.0,
            characters_total: 0,
            seconds_total: 0.0,
            texts_typed: 0,
            text_best_total: 0.0,
            awards: AwardTally::default(),
        }
    }

    #[must_use]
    pub fn key(&self) -> AccountKey {
        AccountKey::new(&self.partition, &self.account)
    }

    #[must_use]
    pub fn average_speed(&self) -> f64 {
        if self.imported_count == 0 {
            0.0
        } else {
            self.speed_total / self.imported_count as f64
        }
    }

    #[must_use]
    pub fn text_best_average(&self) -> f64 {
        if self.texts_typed == 0 {
            0.0
        } else {
            self.text_best_total / self.texts_typed as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    FetchingRecent,
    FetchingHistorical,
    Processing,
    Committing,
}

impl SyncPhase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::FetchingRecent => "fetching_recent",
            Self::FetchingHistorical => "fetching_historical",
            Self::Processing => "processing",
            Self::Committing => "committing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub partition: String,
    pub account: String,
    pub recent_fetched: usize,
    pub historical_fetched: usize,
    pub buckets_fetched: usize,
    pub buckets_from_cache: usize,
    pub inserted: usize,
    pub skipped_existing: usize,
    pub skipped_tombstoned: usize,
    pub tombstoned: usize,
    pub conflicts: usize,
    pub malformed_logs: usize,
    pub retroactive: usize,
    pub new_texts: usize,
    pub profile: Profile,
}

impl SyncReport {
    #[must_use]
    pub fn new(profile: Profile) -> Self {
        Self {
            partition: profile.partition.clone(),
            account: profile.account.clone(),
            recent_fetched: 0,
            historical_fetched: 0,
            buckets_fetched: 0,
            buckets_from_cache: 0,
            inserted: 0,
            skipped_existing: 0,
            skipped_tombstoned: 0,
            tombstoned: 0,
            conflicts: 0,
            malformed_logs: 0,
            retroactive: 0,
            new_texts: 0,
            profile,
        }
    }
}
