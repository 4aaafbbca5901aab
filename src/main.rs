//! Transit vehicle position ingester CLI
//!
//! Polls a GTFS-realtime vehicle positions feed and indexes every changed
//! vehicle observation into Elasticsearch.

use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use transitgaze::{
    client::{FeedClient, FeedSource},
    config::{
        Config, DEFAULT_SECRETS_FILE, DEFAULT_SETTINGS_FILE, SECRETS_FILE_ENV, SETTINGS_FILE_ENV,
    },
    hasher,
    indexer::ElasticsearchIndexer,
    protocol::{self, DecodedFeed},
    scheduler::Scheduler,
    transform,
};

#[derive(Parser)]
#[command(name = "transitgaze")]
#[command(about = "GTFS-realtime vehicle position ingester", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Args)]
struct ConfigPaths {
    /// Settings file
    #[arg(long, env = SETTINGS_FILE_ENV, default_value = DEFAULT_SETTINGS_FILE)]
    settings: PathBuf,

    /// Secrets file, merged over the settings
    #[arg(long, env = SECRETS_FILE_ENV, default_value = DEFAULT_SECRETS_FILE)]
    secrets: PathBuf,
}

impl ConfigPaths {
    fn load(&self) -> Result<Config, Box<dyn std::error::Error>> {
        match Config::from_files(&self.settings, &self.secrets) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::error!("Invalid configuration: {}", e);
                Err(e.into())
            }
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the feed and index vehicle positions until interrupted
    Run {
        #[command(flatten)]
        config: ConfigPaths,

        /// Seconds between statistics log lines
        #[arg(long, default_value = "60")]
        stats_interval: u64,
    },

    /// Validate configuration and contact the feed and the cluster once
    Check {
        #[command(flatten)]
        config: ConfigPaths,
    },

    /// Decode a saved feed snapshot
    Decode {
        /// Path to a binary GTFS-realtime file
        file: PathBuf,

        /// Show only the first N entities
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Print the indexed documents as JSON lines instead
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .init(),
    }

    match cli.command {
        Commands::Run {
            config,
            stats_interval,
        } => {
            let config = config.load()?;
            run(config, Duration::from_secs(stats_interval.max(1))).await?;
        }

        Commands::Check { config } => {
            let config = config.load()?;
            check(config).await?;
        }

        Commands::Decode { file, limit, json } => {
            decode_file(&file, limit, json)?;
        }
    }

    Ok(())
}

async fn run(config: Config, stats_interval: Duration) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Starting transitgaze");
    tracing::info!("Feed: {}", config.feed.url);
    tracing::info!(
        "Elasticsearch: {} (index {})",
        config.elasticsearch.url,
        config.elasticsearch.index
    );
    tracing::info!("Poll interval: {:?}", config.scheduler.interval);
    if let Some(path) = &config.dedup.journal_path {
        tracing::info!("Seen journal: {}", path.display());
    }

    let client = FeedClient::new(config.feed.clone())?;
    let indexer = ElasticsearchIndexer::new(config.elasticsearch.clone())?;

    if let Err(e) = indexer.ping().await {
        tracing::warn!("Elasticsearch is not reachable yet: {}", e);
    }

    let dedup = config.dedup.open()?;
    let mut scheduler = Scheduler::new(client, indexer, dedup, config.scheduler.clone());
    let stats = scheduler.stats();
    let state = scheduler.state_handle();

    // Spawn stats reporting task
    let stats_handle = {
        let stats = stats.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(stats_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let s = stats.snapshot();
                tracing::info!(
                    "Stats: state={}, cycles={}, entities={}, duplicates={}, emitted={}, \
                     indexed={}, rejected={}, failed={}, fetch_errors={}, net={}KB",
                    *state.read(),
                    s.cycles,
                    s.entities_received,
                    s.duplicates,
                    s.documents_emitted,
                    s.documents_indexed,
                    s.documents_rejected,
                    s.documents_failed,
                    s.fetch_errors,
                    s.bytes_received / 1024
                );
            }
        })
    };

    let cancel = CancellationToken::new();
    let shutdown_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            wait_for_shutdown().await;
            tracing::info!("Shutdown requested, finishing current cycle...");
            cancel.cancel();
        })
    };

    scheduler.run(cancel).await;

    stats_handle.abort();
    shutdown_handle.abort();
    drop(scheduler);

    let final_stats = stats.snapshot();
    tracing::info!("Final statistics:");
    tracing::info!("  Cycles: {}", final_stats.cycles);
    tracing::info!("  Fetch errors: {}", final_stats.fetch_errors);
    tracing::info!("  Decode errors: {}", final_stats.decode_errors);
    tracing::info!("  Entities received: {}", final_stats.entities_received);
    tracing::info!("  Entities skipped: {}", final_stats.entities_skipped);
    tracing::info!("  Duplicates: {}", final_stats.duplicates);
    tracing::info!("  Documents emitted: {}", final_stats.documents_emitted);
    tracing::info!("  Documents indexed: {}", final_stats.documents_indexed);
    tracing::info!("  Documents rejected: {}", final_stats.documents_rejected);
    tracing::info!("  Documents failed: {}", final_stats.documents_failed);
    tracing::info!(
        "  Network received: {:.2} MB",
        final_stats.bytes_received as f64 / (1024.0 * 1024.0)
    );

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn check(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("Configuration OK");
    println!("  Feed: {}", config.feed.url);
    println!(
        "  Elasticsearch: {} (index {})",
        config.elasticsearch.url, config.elasticsearch.index
    );
    println!("  Interval: {:?}", config.scheduler.interval);
    println!("  Delivery: {:?}", config.scheduler.delivery_mode);
    println!();

    let indexer = ElasticsearchIndexer::new(config.elasticsearch.clone())?;
    match indexer.ping().await {
        Ok(()) => println!("Elasticsearch: reachable"),
        Err(e) => println!("Elasticsearch: {}", e),
    }

    let client = FeedClient::new(config.feed.clone())?;
    let data = client.fetch().await?;
    let feed = protocol::decode(&data)?;
    println!(
        "Feed: {} bytes, {} vehicles, {} skipped",
        data.len(),
        feed.entities.len(),
        feed.skipped.len()
    );

    Ok(())
}

fn decode_file(path: &Path, limit: usize, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read(path)?;

    tracing::info!("Decoding file: {} ({} bytes)", path.display(), data.len());

    let feed = protocol::decode(&data)?;

    if json {
        let now = Utc::now();
        for entity in feed.entities.into_iter().take(limit) {
            let fingerprinted = hasher::fingerprint(&entity)?;
            let document = transform::transform(entity, fingerprinted, now);
            println!("{}", serde_json::to_string(&document)?);
        }
        return Ok(());
    }

    print_feed(&feed, limit);
    Ok(())
}

fn print_feed(feed: &DecodedFeed, limit: usize) {
    println!("Header:");
    println!("  GTFS-realtime version: {}", feed.header.gtfs_realtime_version);
    if let Some(incrementality) = feed.header.incrementality {
        println!("  Incrementality: {}", incrementality);
    }
    if let Some(ts) = feed.header.timestamp {
        let formatted = transform::format_unix_timestamp(ts).unwrap_or_else(|| ts.to_string());
        println!("  Timestamp: {}", formatted);
    }
    println!();
    println!(
        "Decoded {} vehicles ({} skipped)",
        feed.entities.len(),
        feed.skipped.len()
    );
    println!();

    for entity in feed.entities.iter().take(limit) {
        let v = &entity.vehicle;
        println!("Entity {}:", entity.id);
        println!("  Vehicle: {}", entity.vehicle_id());
        if let Some(label) = &v.vehicle.label {
            println!("  Label: {}", label);
        }
        println!(
            "  Position: {:.6}, {:.6}",
            v.position.latitude, v.position.longitude
        );
        if let Some(bearing) = v.position.bearing {
            println!("  Bearing: {:.0}°", bearing);
        }
        if let Some(trip) = &v.trip {
            if let Some(route) = &trip.route_id {
                println!("  Route: {}", route);
            }
            if let Some(trip_id) = &trip.trip_id {
                println!("  Trip: {}", trip_id);
            }
        }
        if let Some(status) = v.current_status {
            match &v.stop_id {
                Some(stop) => println!("  Status: {} {}", status, stop),
                None => println!("  Status: {}", status),
            }
        }
        if let Some(ts) = v.timestamp.and_then(transform::format_unix_timestamp) {
            println!("  Reported: {}", ts);
        }
        if entity.is_deleted {
            println!("  Deleted");
        }
        println!();
    }

    if feed.entities.len() > limit {
        println!("... and {} more vehicles", feed.entities.len() - limit);
    }

    for skipped in &feed.skipped {
        println!("Skipped {}: {}", skipped.entity_id, skipped.reason);
    }
}
