#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;
use typeledger::config::Config;
use typeledger::locks::LockRegistry;
use typeledger::model::{RaceRecord, RemoteAccount, RemoteRace, TextEntry};
use typeledger::remote::{ListQuery, RaceDetail, RaceSource, TextObserver};
use typeledger::storage::RaceStore;
use typeledger::sync::{SyncOutcome, SyncPipeline, bucket_of};
use typeledger::{SyncReport, TlError, TlResult};

pub const PARTITION: &str = "play";
pub const ACCOUNT: &str = "keegant";
pub const QUOTE: &str = "the quick brown fox";

/// Base timestamp of race #1; each later race is a minute apart.
pub const EPOCH_MS: i64 = 1_700_000_000_000;

/// Clean action log typing `quote` with a constant per-character delay.
pub fn clean_log(quote: &str, delay_ms: u32) -> String {
    let delays = vec![delay_ms; quote.chars().count()];
    action_log(quote, &delays)
}

/// Clean action log with one delay per character. Edit indices are relative
/// to the text box, which clears after every completed word.
pub fn action_log(quote: &str, delays: &[u32]) -> String {
    let mut log = delay_stream(quote, delays);
    log.push_str("|1,1,");
    for ((ch, position), delay) in quote.chars().zip(box_positions(quote)).zip(delays) {
        log.push_str(&format!("{delay},{position}+{ch},"));
    }
    log
}

/// Action log of `quote` where the first character is mistyped as `x`,
/// deleted and retyped. The delay stream charges all three keystrokes to the
/// first character.
pub fn corrected_log(quote: &str, delay_ms: u32) -> String {
    let mut delays = vec![delay_ms; quote.chars().count()];
    delays[0] = delay_ms * 3;
    let mut log = delay_stream(quote, &delays);
    log.push_str("|1,1,");
    log.push_str(&format!("{delay_ms},0+x,{delay_ms},0-x,"));
    for (ch, position) in quote.chars().zip(box_positions(quote)) {
        log.push_str(&format!("{delay_ms},{position}+{ch},"));
    }
    log
}

fn delay_stream(quote: &str, delays: &[u32]) -> String {
    let mut log = String::from("1,1,1,");
    for (ch, delay) in quote.chars().zip(delays) {
        log.push_str(&delay.to_string());
        push_escaped(&mut log, ch);
    }
    log
}

fn box_positions(quote: &str) -> Vec<usize> {
    let mut position = 0;
    quote
        .chars()
        .map(|ch| {
            let current = position;
            position = if ch == ' ' { 0 } else { position + 1 };
            current
        })
        .collect()
}

fn push_escaped(log: &mut String, ch: char) {
    if ch.is_ascii_digit() || ch == '\u{8}' {
        log.push('\u{8}');
    }
    log.push(ch);
}

pub fn race(sequence: u64, speed: f64) -> RemoteRace {
    RemoteRace {
        sequence,
        text_id: 1,
        speed,
        accuracy: 0.98,
        points: Some(30.0),
        rank: 1,
        peer_count: 3,
        correlation_id: format!("heat-{sequence}"),
        timestamp_ms: EPOCH_MS + sequence as i64 * 60_000,
        log: Some(clean_log(QUOTE, 100)),
    }
}

pub fn races(sequences: impl IntoIterator<Item = u64>) -> Vec<RemoteRace> {
    sequences.into_iter().map(|sequence| race(sequence, 100.0)).collect()
}

/// A stored race as the pipeline would build it from [`race`], metrics
/// included.
pub fn record(sequence: u64, speed: f64) -> RaceRecord {
    RaceRecord {
        partition: PARTITION.to_owned(),
        account: ACCOUNT.to_owned(),
        sequence,
        text_id: 1,
        speed,
        accuracy: 0.98,
        points: 30.0,
        characters: QUOTE.len() as u32,
        rank: 2,
        peer_count: 3,
        correlation_id: format!("heat-{sequence}"),
        timestamp_ms: EPOCH_MS + sequence as i64 * 60_000,
        unlagged: Some(120.0),
        adjusted: Some(120.0),
        raw_adjusted: Some(120.0),
        pauseless_adjusted: Some(120.0),
        start_delay_ms: Some(100.0),
        duration_ms: Some(1_900.0),
        correction_time_ms: Some(0.0),
        pause_time_ms: Some(0.0),
        raw_log: Some(clean_log(QUOTE, 100).into_bytes()),
        log_compressed: false,
        retroactive: false,
    }
}

pub fn text(text_id: u32, quote: &str) -> TextEntry {
    TextEntry {
        text_id,
        quote: quote.to_owned(),
        disabled: false,
    }
}

/// Holds the next `list_races` call inside the source until released.
#[derive(Default)]
pub struct ListingGate {
    /// Signalled once the call is parked.
    pub entered: Notify,
    pub release: Notify,
}

/// In-memory stand-in for the remote data API. Every call is recorded.
#[derive(Default)]
pub struct ScriptedSource {
    pub bucket_width: u64,
    pub history: Mutex<Vec<RemoteRace>>,
    /// Races at or below this sequence are only reachable through buckets.
    pub listing_floor: Mutex<u64>,
    pub unknown_account: Mutex<bool>,
    pub rate_limited_buckets: Mutex<HashSet<u64>>,
    pub rate_limited_listing: Mutex<bool>,
    pub listing_gate: Mutex<Option<Arc<ListingGate>>>,
    pub texts: Mutex<HashMap<u32, TextEntry>>,
    pub details: Mutex<HashMap<u64, RaceDetail>>,
    pub list_calls: Mutex<Vec<ListQuery>>,
    pub bucket_calls: Mutex<Vec<u64>>,
    pub detail_calls: Mutex<Vec<u64>>,
    pub text_calls: Mutex<Vec<u32>>,
}

impl ScriptedSource {
    pub fn new(bucket_width: u64) -> Self {
        let source = Self {
            bucket_width,
            ..Self::default()
        };
        source.add_text(text(1, QUOTE));
        source
    }

    pub fn with_history(bucket_width: u64, history: Vec<RemoteRace>) -> Self {
        let source = Self::new(bucket_width);
        source.set_history(history);
        source
    }

    pub fn set_history(&self, history: Vec<RemoteRace>) {
        *self.history.lock().expect("history lock") = history;
    }

    pub fn push_races(&self, more: Vec<RemoteRace>) {
        self.history.lock().expect("history lock").extend(more);
    }

    pub fn set_listing_floor(&self, floor: u64) {
        *self.listing_floor.lock().expect("floor lock") = floor;
    }

    pub fn rate_limit_bucket(&self, bucket: u64) {
        self.rate_limited_buckets
            .lock()
            .expect("rate limit lock")
            .insert(bucket);
    }

    pub fn lift_rate_limits(&self) {
        self.rate_limited_buckets.lock().expect("rate limit lock").clear();
        *self.rate_limited_listing.lock().expect("rate limit lock") = false;
    }

    pub fn rate_limit_listing(&self) {
        *self.rate_limited_listing.lock().expect("rate limit lock") = true;
    }

    /// Park the next listing call until the returned gate is released.
    pub fn gate_listing(&self) -> Arc<ListingGate> {
        let gate = Arc::new(ListingGate::default());
        *self.listing_gate.lock().expect("gate lock") = Some(Arc::clone(&gate));
        gate
    }

    pub fn add_text(&self, entry: TextEntry) {
        self.texts
            .lock()
            .expect("texts lock")
            .insert(entry.text_id, entry);
    }

    pub fn add_detail(&self, detail: RaceDetail) {
        self.details
            .lock()
            .expect("details lock")
            .insert(detail.race.sequence, detail);
    }

    pub fn bucket_calls(&self) -> Vec<u64> {
        self.bucket_calls.lock().expect("bucket calls lock").clone()
    }

    pub fn list_call_count(&self) -> usize {
        self.list_calls.lock().expect("list calls lock").len()
    }

    pub fn detail_calls(&self) -> Vec<u64> {
        self.detail_calls.lock().expect("detail calls lock").clone()
    }

    pub fn reset_calls(&self) {
        self.list_calls.lock().expect("list calls lock").clear();
        self.bucket_calls.lock().expect("bucket calls lock").clear();
        self.detail_calls.lock().expect("detail calls lock").clear();
        self.text_calls.lock().expect("text calls lock").clear();
    }
}

#[async_trait]
impl RaceSource for ScriptedSource {
    async fn account_summary(
        &self,
        _partition: &str,
        _account: &str,
    ) -> TlResult<Option<RemoteAccount>> {
        if *self.unknown_account.lock().expect("unknown lock") {
            return Ok(None);
        }
        let history = self.history.lock().expect("history lock");
        Ok(Some(RemoteAccount {
            sequence_high_water: history.iter().map(|race| race.sequence).max().unwrap_or(0),
        }))
    }

    async fn list_races(&self, query: &ListQuery) -> TlResult<Vec<RemoteRace>> {
        self.list_calls
            .lock()
            .expect("list calls lock")
            .push(query.clone());
        let gate = self.listing_gate.lock().expect("gate lock").take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if *self.rate_limited_listing.lock().expect("rate limit lock") {
            return Err(TlError::rate_limited("races", Some(30)));
        }
        let floor = *self.listing_floor.lock().expect("floor lock");
        let mut page: Vec<RemoteRace> = self
            .history
            .lock()
            .expect("history lock")
            .iter()
            .filter(|race| race.sequence > floor)
            .filter(|race| race.timestamp_ms >= query.start_ms && race.timestamp_ms <= query.end_ms)
            .cloned()
            .collect();
        page.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        page.truncate(query.page_size as usize);
        Ok(page)
    }

    async fn historical_bucket(
        &self,
        _partition: &str,
        _account: &str,
        bucket: u64,
    ) -> TlResult<Vec<RemoteRace>> {
        self.bucket_calls
            .lock()
            .expect("bucket calls lock")
            .push(bucket);
        if self
            .rate_limited_buckets
            .lock()
            .expect("rate limit lock")
            .contains(&bucket)
        {
            return Err(TlError::rate_limited("historical", Some(60)));
        }
        Ok(self
            .history
            .lock()
            .expect("history lock")
            .iter()
            .filter(|race| bucket_of(race.sequence, self.bucket_width) == bucket)
            .cloned()
            .collect())
    }

    async fn race_detail(
        &self,
        _partition: &str,
        _account: &str,
        sequence: u64,
    ) -> TlResult<Option<RaceDetail>> {
        self.detail_calls
            .lock()
            .expect("detail calls lock")
            .push(sequence);
        Ok(self
            .details
            .lock()
            .expect("details lock")
            .get(&sequence)
            .cloned())
    }

    async fn text(&self, _partition: &str, text_id: u32) -> TlResult<Option<TextEntry>> {
        self.text_calls
            .lock()
            .expect("text calls lock")
            .push(text_id);
        Ok(self.texts.lock().expect("texts lock").get(&text_id).cloned())
    }
}

/// Records every text registration it is told about.
#[derive(Default)]
pub struct RecordingObserver {
    pub registered: Mutex<Vec<(String, u32)>>,
}

#[async_trait]
impl TextObserver for RecordingObserver {
    async fn text_registered(&self, partition: &str, text: &TextEntry) {
        self.registered
            .lock()
            .expect("observer lock")
            .push((partition.to_owned(), text.text_id));
    }
}

pub fn test_config(bucket_width: u64) -> Config {
    let mut config = Config::default();
    config.sync.bucket_width = bucket_width;
    config.sync.page_size = 50;
    config
}

/// A pipeline over a store in a fresh temporary directory.
pub struct Harness {
    pub dir: TempDir,
    pub db_path: PathBuf,
    pub store: Arc<RaceStore>,
    pub source: Arc<ScriptedSource>,
    pub locks: LockRegistry,
    pub pipeline: SyncPipeline,
}

impl Harness {
    pub fn new(source: ScriptedSource) -> Self {
        Self::with_config(source, test_config(10))
    }

    pub fn with_config(source: ScriptedSource, config: Config) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("ledger.sqlite3");
        let store = Arc::new(RaceStore::open(&db_path).expect("open store"));
        let source = Arc::new(source);
        let locks = LockRegistry::with_lock_dir(dir.path().join("locks"));
        let pipeline = SyncPipeline::new(
            Arc::clone(&store),
            Arc::clone(&source) as Arc<dyn RaceSource>,
            locks.clone(),
            config,
        );
        Self {
            dir,
            db_path,
            store,
            source,
            locks,
            pipeline,
        }
    }

    pub async fn sync(&self) -> SyncOutcome {
        self.pipeline
            .sync(PARTITION, ACCOUNT)
            .await
            .expect("sync should not fail")
    }

    pub async fn synced(&self) -> SyncReport {
        match self.sync().await {
            SyncOutcome::Synced(report) => report,
            other => panic!("expected a completed sync, got {other:?}"),
        }
    }
}
