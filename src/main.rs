use std::sync::Arc;

use clap::Parser;
use typeledger::cli::{
    AccountArgs, AnalyzeArgs, Cli, Command, DecodeArgs, DeleteArgs, HistoryArgs,
    LARGE_HISTORY_THRESHOLD, LogFormat, OutputFormat, SIGNAL_EXIT_CODE, render_history,
    render_metrics, render_outcome, render_profile, summarize_history,
};
use typeledger::codec;
use typeledger::config::Config;
use typeledger::locks::{LockName, LockRegistry};
use typeledger::metrics;
use typeledger::model::AccountKey;
use typeledger::remote::HttpSource;
use typeledger::storage::RaceStore;
use typeledger::sync::{self, SyncOutcome, SyncPipeline};
use typeledger::{TlError, TlResult};

#[tokio::main]
async fn main() {
    typeledger::logging::init();

    // Abandoning the future leaves every flushed side effect in place; the
    // next sync resumes from staged buckets.
    let outcome = tokio::select! {
        outcome = run() => outcome,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            std::process::exit(SIGNAL_EXIT_CODE);
        }
    };

    if let Err(error) = outcome {
        tracing::debug!(code = error.error_code(), error = %error, "command failed");
        eprintln!("error: {}", error.user_message());
        eprintln!("       {error}");
        std::process::exit(1);
    }
}

async fn run() -> TlResult<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.db_path = Some(db);
    }

    match cli.command {
        Command::Sync(args) => sync_account(config, &args.target).await,
        Command::Analyze(args) => analyze(&config, &args),
        Command::Decode(args) => decode(&config, &args),
        Command::Profile(args) => profile(&config, &args),
        Command::History(args) => history(&config, &args),
        Command::Delete(args) => delete(&config, &args),
    }
}

fn open_store(config: &Config) -> TlResult<RaceStore> {
    RaceStore::open(&config.db_path_or_default())
}

async fn sync_account(config: Config, args: &AccountArgs) -> TlResult<()> {
    let store = Arc::new(open_store(&config)?);
    let source = Arc::new(HttpSource::new(&config.api)?);
    let locks = LockRegistry::with_lock_dir(config.lock_dir());
    let pipeline = SyncPipeline::new(store, source, locks, config);
    let outcome = pipeline.sync(&args.partition, &args.account).await?;

    match args.format {
        OutputFormat::Plain => print!("{}", render_outcome(&outcome)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
    }
    if let SyncOutcome::Busy(holder) = &outcome {
        tracing::info!(lock = %holder.lock, holder = %holder.holder, "sync skipped");
    }
    Ok(())
}

fn analyze(config: &Config, args: &AnalyzeArgs) -> TlResult<()> {
    let store = open_store(config)?;
    let key = AccountKey::new(&args.target.partition, &args.target.account);
    let Some(record) = store.race(&key, args.sequence)? else {
        return Err(TlError::InvalidRequest(format!(
            "race {} of {key} is not stored",
            args.sequence
        )));
    };
    let Some(metrics) = sync::analyze_stored_race(&store, config, &key, args.sequence)? else {
        return Err(TlError::InvalidRequest(format!(
            "race {} of {key} has no typing log",
            args.sequence
        )));
    };
    let lag = metrics.lag(record.speed);

    match args.target.format {
        OutputFormat::Plain => {
            print!("{}", render_metrics(None, &metrics));
            if let Some(lag) = lag {
                println!("lag        {:.2} wpm, ping {:.0} ms", lag.lag, lag.ping_ms);
            }
        }
        OutputFormat::Json => {
            let payload = serde_json::json!({
                "race": record,
                "metrics": metrics,
                "lag": lag,
                "curves": args.curves.then(|| metrics.curves()),
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
    }
    Ok(())
}

fn decode(config: &Config, args: &DecodeArgs) -> TlResult<()> {
    let raw = std::fs::read_to_string(&args.path)?;
    let raw = raw.trim_end_matches(['\r', '\n']);
    let log = match args.log_format {
        LogFormat::Auto => codec::decode_auto(raw)?,
        LogFormat::Action => codec::decode(raw, false)?,
        LogFormat::Legacy => codec::decode(raw, true)?,
    };
    let multiplier = config.partition(&args.partition).multiplier;
    let metrics = metrics::compute_metrics(&log, multiplier, &config.metrics)?;

    match args.format {
        OutputFormat::Plain => print!("{}", render_metrics(Some(&log), &metrics)),
        OutputFormat::Json => {
            let payload = serde_json::json!({ "log": log, "metrics": metrics });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
    }
    Ok(())
}

fn profile(config: &Config, args: &AccountArgs) -> TlResult<()> {
    let store = open_store(config)?;
    let key = AccountKey::new(&args.partition, &args.account);
    let Some(profile) = store.profile(&key)? else {
        return Err(TlError::InvalidRequest(format!("{key} has never been synced")));
    };
    match args.format {
        OutputFormat::Plain => print!("{}", render_profile(&profile)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&profile)?),
    }
    Ok(())
}

fn history(config: &Config, args: &HistoryArgs) -> TlResult<()> {
    let store = open_store(config)?;
    let key = AccountKey::new(&args.target.partition, &args.target.account);
    let locks = LockRegistry::with_lock_dir(config.lock_dir());
    let count = store.race_count(&key)?;
    let _guard = locks
        .try_acquire_if(
            LockName::LargeQuery,
            count > LARGE_HISTORY_THRESHOLD,
            &format!("history {key}"),
        )?
        .map(|acquisition| acquisition.into_result())
        .transpose()?;

    let summary = summarize_history(&store.races(&key)?, args.limit);
    match args.target.format {
        OutputFormat::Plain => print!("{}", render_history(&summary)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
    }
    Ok(())
}

fn delete(config: &Config, args: &DeleteArgs) -> TlResult<()> {
    let store = open_store(config)?;
    let partition = config.partition(&args.partition);
    if store.tombstone_race(&partition, &args.account, args.sequence)? {
        println!("race {} of {}/{} tombstoned", args.sequence, args.account, partition);
        Ok(())
    } else {
        Err(TlError::InvalidRequest(format!(
            "race {} of {}/{} is not stored",
            args.sequence, args.account, partition
        )))
    }
}
