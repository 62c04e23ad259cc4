use std::fmt::Write as _;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

use crate::codec::TypingLog;
use crate::metrics::Metrics;
use crate::model::{Profile, RaceRecord, SyncReport};
use crate::sync::SyncOutcome;

/// Histories longer than this contend for the large-query lock.
pub const LARGE_HISTORY_THRESHOLD: u64 = 10_000;

/// Exit code used when interrupted: 128 + SIGINT.
pub const SIGNAL_EXIT_CODE: i32 = 130;

#[derive(Debug, Parser)]
#[command(name = "typeledger")]
#[command(about = "Import and analyze typing-race histories")]
pub struct Cli {
    /// JSON configuration file. Environment variables override it.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite store path; overrides configuration and environment.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Import new races of an account from the remote source.
    Sync(SyncArgs),
    /// Recompute metrics of a stored race.
    Analyze(AnalyzeArgs),
    /// Decode a raw typing log from a file and print its metrics.
    Decode(DecodeArgs),
    /// Show the aggregate profile of an account.
    Profile(AccountArgs),
    /// Scan the full stored history of an account.
    History(HistoryArgs),
    /// Move a stored race into the tombstone ledger.
    Delete(DeleteArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum OutputFormat {
    Plain,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum LogFormat {
    /// Legacy when the log has no action section.
    Auto,
    Action,
    Legacy,
}

#[derive(Debug, Args)]
pub struct AccountArgs {
    pub account: String,

    #[arg(long, default_value = "play")]
    pub partition: String,

    #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
    pub format: OutputFormat,
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    #[command(flatten)]
    pub target: AccountArgs,
}

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    #[command(flatten)]
    pub target: AccountArgs,

    pub sequence: u64,

    /// Include cumulative keystroke speed curves.
    #[arg(long)]
    pub curves: bool,
}

#[derive(Debug, Args)]
pub struct DecodeArgs {
    pub path: PathBuf,

    #[arg(long, value_enum, default_value_t = LogFormat::Auto)]
    pub log_format: LogFormat,

    /// Partition whose universe multiplier applies.
    #[arg(long, default_value = "play")]
    pub partition: String,

    #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
    pub format: OutputFormat,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[command(flatten)]
    pub target: AccountArgs,

    /// Number of most recent races to list.
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Debug, Args)]
pub struct DeleteArgs {
    pub account: String,

    pub sequence: u64,

    #[arg(long, default_value = "play")]
    pub partition: String,
}

/// What `history` prints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistorySummary {
    pub races: usize,
    pub with_metrics: usize,
    pub best_speed: f64,
    pub average_speed: f64,
    pub average_adjusted: Option<f64>,
    pub first_timestamp_ms: Option<i64>,
    pub last_timestamp_ms: Option<i64>,
    pub recent: Vec<HistoryRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRow {
    pub sequence: u64,
    pub timestamp_ms: i64,
    pub speed: f64,
    pub adjusted: Option<f64>,
    pub accuracy: f64,
    pub points: f64,
}

/// `races` must be in timestamp order, as the store returns them.
#[must_use]
pub fn summarize_history(races: &[RaceRecord], limit: usize) -> HistorySummary {
    let speed_total: f64 = races.iter().map(|race| race.speed).sum();
    let adjusted: Vec<f64> = races.iter().filter_map(|race| race.adjusted).collect();
    let recent = races
        .iter()
        .rev()
        .take(limit)
        .map(|race| HistoryRow {
            sequence: race.sequence,
            timestamp_ms: race.timestamp_ms,
            speed: race.speed,
            adjusted: race.adjusted,
            accuracy: race.accuracy,
            points: race.points,
        })
        .collect();

    HistorySummary {
        races: races.len(),
        with_metrics: adjusted.len(),
        best_speed: races.iter().map(|race| race.speed).fold(0.0, f64::max),
        average_speed: if races.is_empty() {
            0.0
        } else {
            speed_total / races.len() as f64
        },
        average_adjusted: (!adjusted.is_empty())
            .then(|| adjusted.iter().sum::<f64>() / adjusted.len() as f64),
        first_timestamp_ms: races.first().map(|race| race.timestamp_ms),
        last_timestamp_ms: races.last().map(|race| race.timestamp_ms),
        recent,
    }
}

#[must_use]
pub fn render_outcome(outcome: &SyncOutcome) -> String {
    match outcome {
        SyncOutcome::Synced(report) => render_report(report),
        SyncOutcome::Busy(holder) => format!(
            "busy: {} has been held by {} since {}",
            holder.lock, holder.holder, holder.acquired_at_rfc3339
        ),
        SyncOutcome::RateLimited {
            partition,
            account,
            message,
            buckets_staged,
        } => format!(
            "rate limited while importing {account}/{partition}: {message}\n\
             {buckets_staged} bucket(s) staged; run sync again to resume"
        ),
    }
}

#[must_use]
pub fn render_report(report: &SyncReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "synced {}/{}", report.account, report.partition);
    let _ = writeln!(
        out,
        "  fetched    recent={} historical={} (buckets fetched={} cached={})",
        report.recent_fetched,
        report.historical_fetched,
        report.buckets_fetched,
        report.buckets_from_cache
    );
    let _ = writeln!(
        out,
        "  inserted   {} (retroactive points {})",
        report.inserted, report.retroactive
    );
    let _ = writeln!(
        out,
        "  skipped    existing={} tombstoned={} conflicts={}",
        report.skipped_existing, report.skipped_tombstoned, report.conflicts
    );
    let _ = writeln!(
        out,
        "  tombstoned {}  malformed logs {}  new texts {}",
        report.tombstoned, report.malformed_logs, report.new_texts
    );
    out.push_str(&render_profile(&report.profile));
    out
}

#[must_use]
pub fn render_profile(profile: &Profile) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "profile {}/{}", profile.account, profile.partition);
    let _ = writeln!(out, "  races           {}", profile.imported_count);
    let _ = writeln!(out, "  best speed      {:.2}", profile.best_speed);
    let _ = writeln!(out, "  average speed   {:.2}", profile.average_speed());
    let _ = writeln!(
        out,
        "  points          {:.0} ({:.0} retroactive)",
        profile.points_total, profile.points_retroactive
    );
    let _ = writeln!(out, "  characters      {}", profile.characters_total);
    let _ = writeln!(out, "  seconds typing  {:.0}", profile.seconds_total);
    let _ = writeln!(
        out,
        "  texts typed     {} (best average {:.2})",
        profile.texts_typed,
        profile.text_best_average()
    );
    let _ = writeln!(
        out,
        "  awards          {} / {} / {}",
        profile.awards.first, profile.awards.second, profile.awards.third
    );
    out
}

#[must_use]
pub fn render_metrics(log: Option<&TypingLog>, metrics: &Metrics) -> String {
    let mut out = String::new();
    if let Some(log) = log {
        let kind = if log.is_legacy() { "legacy" } else { "action" };
        let _ = writeln!(out, "log        {kind}, {} characters", log.char_count());
    }
    let _ = writeln!(out, "duration   {:.0} ms (start {:.0} ms)", metrics.duration_ms, metrics.start_ms);
    let _ = writeln!(out, "unlagged   {:.2}", metrics.unlagged);
    let _ = writeln!(out, "adjusted   {:.2}", metrics.adjusted);
    match &metrics.raw {
        Some(raw) => {
            let _ = writeln!(out, "raw        {:.2} / {:.2} adjusted", raw.unlagged, raw.adjusted);
            let _ = writeln!(
                out,
                "correction {:.0} ms ({:.1}%)",
                raw.correction_time_ms,
                raw.correction_ratio * 100.0
            );
            let _ = writeln!(
                out,
                "pauseless  {:.2} / {:.2} adjusted, {} pause(s), {:.0} ms",
                raw.pauseless.unlagged,
                raw.pauseless.adjusted,
                raw.pauseless.pauses.len(),
                raw.pauseless.pause_time_ms
            );
        }
        None => {
            let _ = writeln!(out, "raw        n/a");
        }
    }
    if !metrics.typos.is_empty() {
        let words: Vec<&str> = metrics.typos.iter().map(|typo| typo.word.as_str()).collect();
        let _ = writeln!(out, "typos      {} ({})", metrics.typos.len(), words.join(", "));
    }
    out
}

#[must_use]
pub fn render_history(summary: &HistorySummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} races ({} with metrics), best {:.2}, average {:.2}",
        summary.races, summary.with_metrics, summary.best_speed, summary.average_speed
    );
    if let Some(adjusted) = summary.average_adjusted {
        let _ = writeln!(out, "average adjusted {adjusted:.2}");
    }
    for row in &summary.recent {
        let adjusted = row
            .adjusted
            .map_or_else(|| "-".to_owned(), |value| format!("{value:.2}"));
        let _ = writeln!(
            out,
            "#{:<8} {:>8.2} wpm  adj {:>8}  acc {:>5.1}%  pts {:.0}",
            row.sequence,
            row.speed,
            adjusted,
            row.accuracy * 100.0,
            row.points
        );
    }
    out
}
