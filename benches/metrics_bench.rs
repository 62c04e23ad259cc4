//! Benchmarks for the typing-log hot paths: decoding, metric computation and
//! batch commits into the race store.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use tempfile::tempdir;

use typeledger::codec;
use typeledger::config::{Config, MetricsConfig};
use typeledger::metrics::compute_metrics;
use typeledger::model::RaceRecord;
use typeledger::storage::RaceStore;

const QUOTE_WORDS: &[&str] = &[
    "the", "quick", "brown", "fox", "jumps", "over", "lazy", "dog", "while", "typing",
];

fn make_quote(words: usize) -> String {
    (0..words)
        .map(|index| QUOTE_WORDS[index % QUOTE_WORDS.len()])
        .collect::<Vec<_>>()
        .join(" ")
}

/// Action log with a typo and correction at the start of every word.
fn make_log(quote: &str) -> String {
    let mut delays = String::from("1,1,1,");
    let mut actions = String::from("|1,1,");
    let mut position = 0usize;
    for (index, ch) in quote.chars().enumerate() {
        let delay = 80 + (index % 7) * 15;
        delays.push_str(&format!("{delay}{ch}"));
        if position == 0 && ch != ' ' {
            actions.push_str(&format!("{delay},0+q,40,0-q,"));
        }
        actions.push_str(&format!("{delay},{position}+{ch},"));
        position = if ch == ' ' { 0 } else { position + 1 };
    }
    delays.push_str(&actions);
    delays
}

fn make_record(sequence: u64, log: &str) -> RaceRecord {
    RaceRecord {
        partition: "play".to_owned(),
        account: "bench".to_owned(),
        sequence,
        text_id: (sequence % 50) as u32,
        speed: 90.0 + (sequence % 40) as f64,
        accuracy: 0.97,
        points: 40.0,
        characters: 200,
        rank: (sequence % 4) as u32 + 1,
        peer_count: 4,
        correlation_id: format!("heat-{sequence}"),
        timestamp_ms: 1_700_000_000_000 + sequence as i64 * 60_000,
        unlagged: Some(100.0),
        adjusted: Some(104.0),
        raw_adjusted: Some(110.0),
        pauseless_adjusted: Some(112.0),
        start_delay_ms: Some(300.0),
        duration_ms: Some(24_000.0),
        correction_time_ms: Some(900.0),
        pause_time_ms: Some(0.0),
        raw_log: Some(codec::compress_log(log).expect("compress")),
        log_compressed: true,
        retroactive: false,
    }
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for words in [10, 60, 300] {
        let log = make_log(&make_quote(words));
        group.bench_with_input(BenchmarkId::from_parameter(words), &log, |b, log| {
            b.iter(|| codec::decode_auto(black_box(log)).expect("decode"));
        });
    }
    group.finish();
}

fn bench_compute_metrics(c: &mut Criterion) {
    let config = MetricsConfig::default();
    let mut group = c.benchmark_group("compute_metrics");
    for words in [10, 60, 300] {
        let decoded = codec::decode_auto(&make_log(&make_quote(words))).expect("decode");
        group.bench_with_input(BenchmarkId::from_parameter(words), &decoded, |b, log| {
            b.iter(|| compute_metrics(black_box(log), 12_000, &config).expect("metrics"));
        });
    }
    group.finish();
}

fn bench_curves(c: &mut Criterion) {
    let decoded = codec::decode_auto(&make_log(&make_quote(300))).expect("decode");
    let metrics = compute_metrics(&decoded, 12_000, &MetricsConfig::default()).expect("metrics");
    c.bench_function("curves_300_words", |b| b.iter(|| black_box(&metrics).curves()));
}

fn bench_commit_batch(c: &mut Criterion) {
    let log = make_log(&make_quote(40));
    let partition = Config::default().partition("play");
    let mut group = c.benchmark_group("commit_batch");
    group.sample_size(10);
    for batch in [100u64, 1_000] {
        let records: Vec<RaceRecord> = (1..=batch).map(|seq| make_record(seq, &log)).collect();
        group.bench_with_input(BenchmarkId::from_parameter(batch), &records, |b, records| {
            b.iter_with_setup(
                || {
                    let dir = tempdir().expect("tempdir");
                    let store =
                        RaceStore::open(&dir.path().join("bench.sqlite3")).expect("open store");
                    (dir, store)
                },
                |(_dir, store)| {
                    store
                        .commit_batch(&partition, "bench", records, 1_700_000_000_000, batch)
                        .expect("commit")
                },
            );
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_decode,
    bench_compute_metrics,
    bench_curves,
    bench_commit_batch
);
criterion_main!(benches);
