use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use kv_realtime::{
    Cache, InMemoryMetricsRecorder, KeyValueCache, LocalTopic, MutationCodec, MutationKind,
    MutationRecord, NotifierMetadata, RealtimeConfig, RealtimeNotifierOptions,
    cache_apply_callback, create_realtime_notifier,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "kv-realtime")]
#[command(about = "Tooling for realtime key-value mutation streams")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the base64 message body for one mutation
    Encode {
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: Option<String>,
        #[arg(long, value_enum, default_value_t = Kind::Update)]
        kind: Kind,
        #[arg(long)]
        time: i64,
    },
    /// Verify a message body and print it as JSON
    Decode { payload: String },
    /// Feed a file of message bodies (one per line) through an ingestion worker
    Replay {
        file: PathBuf,
        #[arg(long, default_value_t = 1)]
        threads: usize,
        /// Drop tombstones at or below this logical time afterwards
        #[arg(long)]
        compact: Option<i64>,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Update,
    Delete,
}

#[derive(Serialize)]
struct DecodedRecord {
    key: String,
    value: Option<String>,
    mutation_type: String,
    logical_commit_time: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,kv_realtime=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Encode {
            key,
            value,
            kind,
            time,
        } => encode(key, value, kind, time),
        Command::Decode { payload } => decode(&payload),
        Command::Replay {
            file,
            threads,
            compact,
            timeout_secs,
        } => replay(&file, threads, compact, Duration::from_secs(timeout_secs)).await,
    }
}

fn encode(key: String, value: Option<String>, kind: Kind, time: i64) -> Result<()> {
    let record = match kind {
        Kind::Update => {
            let value = value.ok_or_else(|| anyhow!("--value is required for updates"))?;
            MutationRecord::update(key, value, time)
        }
        Kind::Delete => MutationRecord::delete(key, time),
    };
    let payload = MutationCodec::encode(&record).context("Failed to encode mutation")?;
    println!("{}", payload);
    Ok(())
}

fn decode(payload: &str) -> Result<()> {
    let record = MutationCodec::decode(payload.as_bytes()).context("Invalid message body")?;
    let decoded = DecodedRecord {
        key: String::from_utf8_lossy(&record.key).into_owned(),
        value: record
            .value
            .as_deref()
            .map(|value| String::from_utf8_lossy(value).into_owned()),
        mutation_type: match record.kind {
            MutationKind::Update => "UPDATE".to_string(),
            MutationKind::Delete => "DELETE".to_string(),
        },
        logical_commit_time: record.logical_commit_time,
    };
    println!("{}", serde_json::to_string_pretty(&decoded)?);
    Ok(())
}

async fn replay(
    file: &Path,
    threads: usize,
    compact: Option<i64>,
    timeout: Duration,
) -> Result<()> {
    let content = fs::read_to_string(file)
        .with_context(|| format!("Failed to read payload file '{}'", file.display()))?;

    let topic = LocalTopic::new(&format!("replay-{}", uuid::Uuid::new_v4()));
    let published = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| topic.publish(line, HashMap::new()))
        .count();

    let metrics = Arc::new(InMemoryMetricsRecorder::new()?);
    let cache = Arc::new(KeyValueCache::new());
    let metadata = NotifierMetadata::local(topic.name()).with_num_threads(threads);
    let notifier = create_realtime_notifier(
        metrics.clone(),
        &metadata,
        RealtimeConfig::default(),
        RealtimeNotifierOptions::new().subscriber(Arc::new(topic.clone())),
    )?;

    let started = Instant::now();
    notifier.start(cache_apply_callback(cache.clone()))?;
    while !topic.is_idle() {
        if started.elapsed() > timeout {
            notifier.stop().await?;
            bail!(
                "Replay did not finish within {:?} ({} of {} messages acked)",
                timeout,
                topic.acked(),
                published
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    notifier.stop().await?;

    let removed = compact.map(|cutoff| cache.remove_deleted_keys(cutoff));
    let stats = cache.stats();

    println!("Replayed {} messages in {:?}", published, started.elapsed());
    println!(
        "Cache: {} live entries, {} tombstones",
        stats.live_entries, stats.tombstones
    );
    if let Some(removed) = removed {
        println!("Compaction removed {} tombstones", removed);
    }
    print!("{}", metrics.render()?);
    Ok(())
}
