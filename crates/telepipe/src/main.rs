//! `telepipe` - CLI for the telemetry pipeline
//!
//! Runs the ingestion server, pushes event files through the client
//! pipeline, and inspects configuration and dead letters.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};

use telepipe::cli::input::parse_send_lines;
use telepipe::cli::{
    Cli, Command, ConfigCommand, DeadLetterCommand, KeygenCommand, OutputFormat, SendCommand,
    ServeCommand,
};
use telepipe::crypto::{Decryptor, KeyMaterial, KeySession};
use telepipe::pipeline::{Pipeline, PipelineConfig, PipelineStats};
use telepipe::record::Priority;
use telepipe::server::{self, AppState};
use telepipe::storage::DeadLetterStore;
use telepipe::transport::{DiscardSink, HttpTransport, Transport};
use telepipe::{init_logging, Config, MetricCache};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbosity());

    let config = Config::load_from(cli.config.clone()).context("loading configuration")?;

    match cli.command {
        Command::Serve(cmd) => handle_serve(&config, cmd).await,
        Command::Send(cmd) => handle_send(&config, cmd).await,
        Command::Keygen(cmd) => handle_keygen(&cmd),
        Command::DeadLetters(cmd) => handle_dead_letters(&config, cmd),
        Command::Config(cmd) => handle_config(&config, cmd),
    }
}

fn session_from(config: &Config) -> anyhow::Result<KeySession> {
    Ok(match config.key_material()? {
        Some(material) => KeySession::with_material(material),
        None => KeySession::new(),
    })
}

async fn handle_serve(config: &Config, cmd: ServeCommand) -> anyhow::Result<()> {
    let session = session_from(config)?;
    if !session.is_provisioned() {
        warn!("No key material configured; ingest requests will be refused");
    }

    let addr = match cmd.bind {
        Some(bind) => bind
            .parse()
            .with_context(|| format!("invalid bind address {bind}"))?,
        None => config.bind_addr()?,
    };

    let cache = Arc::new(MetricCache::new(config.cache_config()));
    let sweeper = Arc::clone(&cache).spawn_sweeper(config.sweep_interval());
    let state = AppState::new(Decryptor::new(session), cache);

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
    };
    let result = server::serve(addr, state, shutdown).await;
    sweeper.abort();
    result.context("running server")
}

async fn handle_send(config: &Config, cmd: SendCommand) -> anyhow::Result<()> {
    let Some(material) = config.key_material()? else {
        bail!("no key material configured; run `telepipe keygen` and add it under [keys]");
    };

    let text = std::fs::read_to_string(&cmd.file)
        .with_context(|| format!("reading {}", cmd.file.display()))?;
    let batch = parse_send_lines(&text);
    for skipped in &batch.skipped {
        warn!(line = skipped.line, reason = %skipped.reason, "Skipping input line");
    }

    let endpoint = cmd
        .endpoint
        .unwrap_or_else(|| config.transport.endpoint.clone());
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
        endpoint,
        config.dispatcher_config().send_timeout,
    )?);
    let sink: Arc<dyn DiscardSink> = Arc::new(
        DeadLetterStore::open(config.dead_letter_path()).context("opening dead-letter store")?,
    );

    let pipeline = Pipeline::start(
        PipelineConfig::from(config),
        KeySession::with_material(material),
        transport,
        sink,
    );
    let handle = pipeline.handle();
    for line in &batch.lines {
        if !handle.submit_event(&line.payload, line.priority) {
            warn!(line = line.line, "Event rejected");
        }
    }
    let stats = pipeline.shutdown().await;
    print_send_stats(&stats, batch.skipped.len(), cmd.format)?;
    Ok(())
}

fn print_send_stats(
    stats: &PipelineStats,
    skipped: usize,
    format: OutputFormat,
) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        let mut value = serde_json::to_value(stats)?;
        value["skippedLines"] = serde_json::json!(skipped);
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Send summary");
    println!("------------");
    println!("Skipped lines:   {skipped}");
    println!("Accepted:        {}", stats.accepted);
    println!("Rejected:        {}", stats.rejected);
    println!("Records built:   {}", stats.records_flushed);
    println!("Delivered:       {}", stats.dispatcher.delivered);
    println!("Failed attempts: {}", stats.dispatcher.failed_attempts);
    println!("Discarded:       {}", stats.discarded());
    Ok(())
}

fn handle_keygen(cmd: &KeygenCommand) -> anyhow::Result<()> {
    let material = KeyMaterial::generate(cmd.aes256)?;
    println!("# AES-{}-CBC session key", material.key_bits());
    println!("[keys]");
    println!("key = \"{}\"", material.key_base64());
    println!("iv = \"{}\"", material.iv_base64());
    Ok(())
}

fn handle_dead_letters(config: &Config, cmd: DeadLetterCommand) -> anyhow::Result<()> {
    let path = config.dead_letter_path();
    let store = DeadLetterStore::open(&path)
        .with_context(|| format!("opening dead-letter store at {}", path.display()))?;

    match cmd {
        DeadLetterCommand::List {
            limit,
            priority,
            format,
        } => {
            let letters = match priority {
                Some(p) => store.by_priority(Priority::from(p), limit)?,
                None => store.recent(limit)?,
            };
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&letters)?),
                OutputFormat::Table => {
                    println!(
                        "{:>6}  {:<13}  {:>7}  {:>6}  {:<27}  REASON",
                        "ID", "PRIORITY", "RETRIES", "EVENTS", "DISCARDED AT"
                    );
                    for letter in &letters {
                        println!(
                            "{:>6}  {:<13}  {:>7}  {:>6}  {:<27}  {}",
                            letter.id,
                            letter.priority.to_string(),
                            letter.retries,
                            letter.event_count,
                            letter.discarded_at.to_rfc3339(),
                            letter.reason
                        );
                    }
                }
                OutputFormat::Plain => {
                    for letter in &letters {
                        println!(
                            "#{} {} record={} retries={} events={} at {}: {}",
                            letter.id,
                            letter.priority,
                            letter.record_id,
                            letter.retries,
                            letter.event_count,
                            letter.discarded_at.to_rfc3339(),
                            letter.reason
                        );
                    }
                }
            }
        }
        DeadLetterCommand::Stats { json } => {
            let stats = store.stats()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Dead letters");
                println!("------------");
                println!("Database:      {}", store.path().display());
                println!("Total:         {}", stats.total);
                for priority in Priority::ALL {
                    println!(
                        "  {:<12} {}",
                        priority.to_string(),
                        stats.by_priority[priority.index()]
                    );
                }
                if let Some(oldest) = stats.oldest {
                    println!("Oldest:        {}", oldest.to_rfc3339());
                }
                if let Some(newest) = stats.newest {
                    println!("Newest:        {}", newest.to_rfc3339());
                }
                println!("Size:          {} bytes", stats.db_size_bytes);
            }
        }
        DeadLetterCommand::Prune { older_than_days } => {
            let max_age = match older_than_days {
                Some(days) => Some(chrono::Duration::days(i64::from(days))),
                None => config.max_age(),
            };
            let Some(max_age) = max_age else {
                println!("Retention is unlimited (storage.max_age_days = 0); nothing pruned.");
                return Ok(());
            };
            let removed = store.prune_older_than(max_age)?;
            println!("Pruned {removed} dead letters.");
        }
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                print!("{}", config.to_toml()?);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => bail!("configuration error: {e}"),
            }
        }
    }
    Ok(())
}
