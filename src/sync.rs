//! Race synchronization.
//!
//! One sync of an account walks `Idle -> FetchingRecent -> FetchingHistorical
//! -> Processing -> Committing -> Idle`:
//!
//! 1. Page the listing endpoint backwards from now until a page reaches the
//!    locally covered sequence range. The smallest sequence seen marks the
//!    cutoff; anything older comes from historical buckets.
//! 2. Walk historical buckets from the cutoff down to the first uncovered
//!    sequence. Each fetched bucket is staged in the store before the next
//!    request, so a rate limit or crash loses no completed fetch.
//! 3. Process candidates in timestamp order: skip tombstoned and stored
//!    sequences, tombstone void races, resolve texts, decode logs and compute
//!    metrics.
//! 4. Commit every new race in one transaction and fold it into the profile.
//!
//! Tombstones and staged buckets written along the way are never rolled
//! back; a later sync resumes from them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::config::Config;
use crate::error::{TlError, TlResult};
use crate::locks::{Acquisition, LockHolder, LockName, LockRegistry};
use crate::metrics::{self, Metrics};
use crate::model::{
    AccountKey, Partition, RaceRecord, RemoteRace, SyncPhase, SyncReport, TextEntry, Tombstone,
    word_count,
};
use crate::remote::{ListQuery, NoopTextObserver, RaceSource, TextObserver};
use crate::storage::RaceStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced(SyncReport),
    /// Another sync is running; nothing was touched.
    Busy(LockHolder),
    /// The source throttled us. Staged buckets are kept and the next sync
    /// resumes from them.
    RateLimited {
        partition: String,
        account: String,
        message: String,
        buckets_staged: usize,
    },
}

pub struct SyncPipeline {
    store: Arc<RaceStore>,
    source: Arc<dyn RaceSource>,
    observer: Arc<dyn TextObserver>,
    locks: LockRegistry,
    config: Config,
    phase: Mutex<SyncPhase>,
}

impl std::fmt::Debug for SyncPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPipeline")
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// Candidates gathered by the two fetch phases.
struct Fetched {
    recent: Vec<RemoteRace>,
    historical: Vec<RemoteRace>,
    /// Highest sequence these candidates settle once committed.
    reconciled_through: u64,
}

impl SyncPipeline {
    #[must_use]
    pub fn new(
        store: Arc<RaceStore>,
        source: Arc<dyn RaceSource>,
        locks: LockRegistry,
        config: Config,
    ) -> Self {
        Self {
            store,
            source,
            observer: Arc::new(NoopTextObserver),
            locks,
            config,
            phase: Mutex::new(SyncPhase::Idle),
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn TextObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, key: &AccountKey, phase: SyncPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
        tracing::debug!(
            partition = %key.partition,
            account = %key.account,
            phase = phase.as_str(),
            "sync phase"
        );
    }

    /// Synchronize one account of one partition.
    ///
    /// `Busy` and `RateLimited` come back as outcomes; other failures are
    /// errors and leave every previously flushed side effect in place.
    pub async fn sync(&self, partition: &str, account: &str) -> TlResult<SyncOutcome> {
        if account.trim().is_empty() {
            return Err(TlError::InvalidRequest("account must not be empty".to_owned()));
        }
        let key = AccountKey::new(partition, account);

        let guard = match self.locks.try_acquire(LockName::Sync, &key.to_string())? {
            Acquisition::Held(guard) => guard,
            Acquisition::Busy(holder) => {
                tracing::info!(
                    partition,
                    account,
                    holder = %holder.holder,
                    "sync already in progress"
                );
                return Ok(SyncOutcome::Busy(holder));
            }
        };

        let partition = self.config.partition(partition);
        tracing::info!(partition = %partition, account, "sync started");
        let result = self.run(&partition, &key).await;
        self.enter(&key, SyncPhase::Idle);
        drop(guard);

        match result {
            Ok(report) => {
                tracing::info!(
                    partition = %partition,
                    account,
                    inserted = report.inserted,
                    tombstoned = report.tombstoned,
                    imported = report.profile.imported_count,
                    "sync finished"
                );
                Ok(SyncOutcome::Synced(report))
            }
            Err(error @ TlError::RateLimited { .. }) => {
                let buckets_staged = self.store.staged_buckets(&key)?.len();
                tracing::warn!(
                    partition = %partition,
                    account,
                    buckets_staged,
                    error = %error,
                    "sync paused by rate limit"
                );
                Ok(SyncOutcome::RateLimited {
                    partition: key.partition,
                    account: key.account,
                    message: error.to_string(),
                    buckets_staged,
                })
            }
            Err(error) => {
                tracing::warn!(partition = %partition, account, error = %error, "sync failed");
                Err(error)
            }
        }
    }

    async fn run(&self, partition: &Partition, key: &AccountKey) -> TlResult<SyncReport> {
        let started_at_ms = Utc::now().timestamp_millis();
        let profile = self.store.profile_or_default(key)?;
        // Stores written before `reconciled_sequence` existed fall back to
        // their highest race.
        let covered = profile
            .reconciled_sequence
            .max(self.store.max_race_sequence(key)?);
        let mut report = SyncReport::new(profile.clone());

        let fetched = self
            .fetch(key, profile.last_synced_at_ms, covered, started_at_ms, &mut report)
            .await?;
        let reconciled_through = fetched.reconciled_through;

        self.enter(key, SyncPhase::Processing);
        let records = self
            .process(partition, key, fetched, &mut report)
            .await?;

        self.enter(key, SyncPhase::Committing);
        let store = Arc::clone(&self.store);
        let commit_partition = partition.clone();
        let account = key.account.clone();
        let summary = tokio::task::spawn_blocking(move || {
            store.commit_batch(
                &commit_partition,
                &account,
                &records,
                started_at_ms,
                reconciled_through,
            )
        })
        .await
        .map_err(|error| TlError::Storage(format!("commit task failed: {error}")))??;
        report.inserted = summary.inserted;
        report.skipped_existing += summary.ignored;
        report.profile = summary.profile;
        Ok(report)
    }

    async fn fetch(
        &self,
        key: &AccountKey,
        last_synced_at_ms: i64,
        covered: u64,
        now_ms: i64,
        report: &mut SyncReport,
    ) -> TlResult<Fetched> {
        self.enter(key, SyncPhase::FetchingRecent);
        let recent = self.fetch_recent(key, last_synced_at_ms, covered, now_ms).await?;
        report.recent_fetched = recent.len();

        let cutoff = match recent.iter().map(|race| race.sequence).min() {
            Some(min_sequence) => min_sequence.saturating_sub(1),
            None => match self
                .source
                .account_summary(&key.partition, &key.account)
                .await
                .map_err(without_resume)?
            {
                Some(summary) => summary.sequence_high_water,
                None => {
                    return Err(TlError::InvalidRequest(format!("unknown account {key}")));
                }
            },
        };

        let mut historical = Vec::new();
        if cutoff > covered {
            self.enter(key, SyncPhase::FetchingHistorical);
            historical = self.fetch_historical(key, covered, cutoff, report).await?;
        }
        report.historical_fetched = historical.len();

        let recent_high = recent.iter().map(|race| race.sequence).max().unwrap_or(0);
        Ok(Fetched {
            recent,
            historical,
            reconciled_through: cutoff.max(recent_high),
        })
    }

    async fn fetch_recent(
        &self,
        key: &AccountKey,
        last_synced_at_ms: i64,
        covered: u64,
        now_ms: i64,
    ) -> TlResult<Vec<RemoteRace>> {
        let sync = &self.config.sync;
        let start_ms = if last_synced_at_ms > 0 {
            (last_synced_at_ms - sync.recent_overlap_ms).max(0)
        } else {
            0
        };

        let mut races = Vec::new();
        let mut end_ms = now_ms;
        for page_index in 0..sync.max_recent_pages {
            if end_ms < start_ms {
                break;
            }
            let query = ListQuery {
                partition: key.partition.clone(),
                account: key.account.clone(),
                start_ms,
                end_ms,
                page_size: sync.page_size,
            };
            let page = self.source.list_races(&query).await.map_err(without_resume)?;
            let (Some(min_sequence), Some(min_timestamp)) = (
                page.iter().map(|race| race.sequence).min(),
                page.iter().map(|race| race.timestamp_ms).min(),
            ) else {
                break;
            };
            tracing::debug!(
                partition = %key.partition,
                account = %key.account,
                page = page_index,
                races = page.len(),
                min_sequence,
                "recent page"
            );
            races.extend(page);
            if min_sequence <= covered {
                break;
            }
            end_ms = min_timestamp - 1;
        }
        Ok(races)
    }

    async fn fetch_historical(
        &self,
        key: &AccountKey,
        covered: u64,
        cutoff: u64,
        report: &mut SyncReport,
    ) -> TlResult<Vec<RemoteRace>> {
        let width = self.config.sync.bucket_width;
        let first = bucket_of(covered + 1, width);
        let last = bucket_of(cutoff, width);

        let mut races = Vec::new();
        for bucket in (first..=last).rev() {
            let bucket_races = match self.store.staged_bucket(key, bucket)? {
                Some(staged) => {
                    report.buckets_from_cache += 1;
                    tracing::debug!(
                        partition = %key.partition,
                        account = %key.account,
                        bucket,
                        "bucket from resume cache"
                    );
                    staged
                }
                None => {
                    let fetched = self
                        .source
                        .historical_bucket(&key.partition, &key.account, bucket)
                        .await?;
                    self.store.stage_bucket(key, bucket, &fetched)?;
                    report.buckets_fetched += 1;
                    fetched
                }
            };
            races.extend(
                bucket_races
                    .into_iter()
                    .filter(|race| race.sequence > covered && race.sequence <= cutoff),
            );
        }
        Ok(races)
    }

    async fn process(
        &self,
        partition: &Partition,
        key: &AccountKey,
        fetched: Fetched,
        report: &mut SyncReport,
    ) -> TlResult<Vec<RaceRecord>> {
        let mut by_sequence: BTreeMap<u64, RemoteRace> = BTreeMap::new();
        for race in fetched.recent.into_iter().chain(fetched.historical) {
            by_sequence.entry(race.sequence).or_insert(race);
        }
        let mut candidates: Vec<RemoteRace> = by_sequence.into_values().collect();
        candidates.sort_by_key(|race| (race.timestamp_ms, race.sequence));

        let mut tombstones = self.store.tombstones(key)?;
        let mut records = Vec::new();
        for race in candidates {
            if let Some(stored_log) = tombstones.get(&race.sequence) {
                report.skipped_tombstoned += 1;
                if let (Some(stored), Some(fetched)) = (stored_log, &race.log)
                    && stored != fetched
                {
                    let violation = TlError::ConsistencyViolation {
                        partition: key.partition.clone(),
                        account: key.account.clone(),
                        sequence: race.sequence,
                        details: "fetched log differs from tombstoned log".to_owned(),
                    };
                    tracing::warn!(error = %violation, "dropping conflicting race");
                    report.conflicts += 1;
                }
                continue;
            }
            if self.store.contains_race(key, race.sequence)? {
                report.skipped_existing += 1;
                continue;
            }
            if race.is_void() {
                let tombstone = Tombstone {
                    partition: key.partition.clone(),
                    account: key.account.clone(),
                    sequence: race.sequence,
                    raw_log: race.log.clone(),
                };
                if self.store.insert_tombstone(&tombstone)? {
                    report.tombstoned += 1;
                }
                tombstones.insert(race.sequence, race.log);
                continue;
            }

            records.push(self.build_record(partition, key, race, report).await?);
        }
        Ok(records)
    }

    async fn build_record(
        &self,
        partition: &Partition,
        key: &AccountKey,
        mut race: RemoteRace,
        report: &mut SyncReport,
    ) -> TlResult<RaceRecord> {
        let mut text = self.resolve_text(&key.partition, race.text_id, report).await?;

        if race.log.is_none() {
            if let Some(detail) = self
                .source
                .race_detail(&key.partition, &key.account, race.sequence)
                .await
                .map_err(without_resume)?
            {
                race.log = detail.race.log;
                if text.is_none()
                    && let Some(quote) = detail.quote
                {
                    let entry = TextEntry {
                        text_id: race.text_id,
                        quote,
                        disabled: false,
                    };
                    self.register_text(&key.partition, &entry, report).await?;
                    text = Some(entry);
                }
            }
        }

        let metrics = match race.log.as_deref() {
            Some(log) => self.analyze_log(key, race.sequence, log, partition.multiplier, report)?,
            None => None,
        };

        let characters = metrics
            .as_ref()
            .map(|metrics| metrics.characters)
            .or_else(|| text.as_ref().map(|text| text.quote.chars().count()))
            .unwrap_or(0);

        let (points, retroactive) = match (race.points, &text) {
            (Some(points), _) if points > 0.0 => (points, false),
            (_, Some(text)) => (calculate_points(race.speed, &text.quote), true),
            (points, None) => (points.unwrap_or(0.0), false),
        };
        if retroactive {
            report.retroactive += 1;
        }

        let (raw_log, log_compressed) = match race.log.as_deref() {
            Some(log) if self.config.sync.compress_logs => (Some(codec::compress_log(log)?), true),
            Some(log) => (Some(log.as_bytes().to_vec()), false),
            None => (None, false),
        };

        let mut record = RaceRecord {
            partition: key.partition.clone(),
            account: key.account.clone(),
            sequence: race.sequence,
            text_id: race.text_id,
            speed: race.speed,
            accuracy: race.accuracy,
            points,
            characters: u32::try_from(characters).unwrap_or(u32::MAX),
            rank: race.rank,
            peer_count: race.peer_count,
            correlation_id: race.correlation_id,
            timestamp_ms: race.timestamp_ms,
            unlagged: None,
            adjusted: None,
            raw_adjusted: None,
            pauseless_adjusted: None,
            start_delay_ms: None,
            duration_ms: None,
            correction_time_ms: None,
            pause_time_ms: None,
            raw_log,
            log_compressed,
            retroactive,
        };
        if let Some(metrics) = &metrics {
            apply_metrics(&mut record, metrics);
        }
        Ok(record)
    }

    /// Decode and measure a log. A malformed log is not fatal: the race is
    /// kept with its summary fields and no metrics.
    fn analyze_log(
        &self,
        key: &AccountKey,
        sequence: u64,
        log: &str,
        multiplier: u32,
        report: &mut SyncReport,
    ) -> TlResult<Option<Metrics>> {
        let measured = codec::decode_auto(log)
            .and_then(|decoded| metrics::compute_metrics(&decoded, multiplier, &self.config.metrics));
        match measured {
            Ok(metrics) => Ok(Some(metrics)),
            Err(error @ TlError::MalformedLog { .. }) => {
                tracing::warn!(
                    partition = %key.partition,
                    account = %key.account,
                    sequence,
                    error = %error,
                    "keeping race without metrics"
                );
                report.malformed_logs += 1;
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    async fn resolve_text(
        &self,
        partition: &str,
        text_id: u32,
        report: &mut SyncReport,
    ) -> TlResult<Option<TextEntry>> {
        if let Some(text) = self.store.text(partition, text_id)? {
            return Ok(Some(text));
        }
        let Some(text) = self.source.text(partition, text_id).await.map_err(without_resume)? else {
            return Ok(None);
        };
        self.register_text(partition, &text, report).await?;
        Ok(Some(text))
    }

    async fn register_text(
        &self,
        partition: &str,
        text: &TextEntry,
        report: &mut SyncReport,
    ) -> TlResult<()> {
        if self.store.insert_text(partition, text)? {
            report.new_texts += 1;
            tracing::debug!(partition, text_id = text.text_id, "new text registered");
            self.observer.text_registered(partition, text).await;
        }
        Ok(())
    }
}

/// Only historical buckets have a resume cache behind them. A throttled call
/// anywhere else fails the sync as a transport error.
fn without_resume(error: TlError) -> TlError {
    match error {
        TlError::RateLimited {
            endpoint,
            retry_suffix,
        } => TlError::Transport(format!("`{endpoint}` returned HTTP 429{retry_suffix}")),
        other => other,
    }
}

/// Points for a race the source never scored: words typed per second of
/// racing, scaled by the text's word count.
#[must_use]
pub fn calculate_points(speed: f64, quote: &str) -> f64 {
    (speed / 60.0) * word_count(quote) as f64
}

pub fn apply_metrics(record: &mut RaceRecord, metrics: &Metrics) {
    record.unlagged = Some(metrics.unlagged);
    record.adjusted = Some(metrics.adjusted);
    record.raw_adjusted = metrics.raw_adjusted();
    record.pauseless_adjusted = metrics.pauseless_adjusted();
    record.start_delay_ms = Some(metrics.start_ms);
    record.duration_ms = Some(metrics.duration_ms);
    record.correction_time_ms = metrics.correction_time_ms();
    record.pause_time_ms = metrics.pause_time_ms();
}

/// Re-run the metrics engine over a race already in the store.
pub fn analyze_stored_race(
    store: &RaceStore,
    config: &Config,
    key: &AccountKey,
    sequence: u64,
) -> TlResult<Option<Metrics>> {
    let Some(log) = store.typing_log(key, sequence)? else {
        return Ok(None);
    };
    let decoded = codec::decode_auto(&log)?;
    let multiplier = config.partition(&key.partition).multiplier;
    metrics::compute_metrics(&decoded, multiplier, &config.metrics).map(Some)
}

/// Group races into sequence buckets of `width`, as the historical endpoint
/// serves them.
#[must_use]
pub fn bucket_of(sequence: u64, width: u64) -> u64 {
    sequence.saturating_sub(1) / width
}
