use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use pingpost::auction::{AuctionEngine, Disposition};
use pingpost::breaker::BreakerRegistry;
use pingpost::caps::DailyCapTracker;
use pingpost::config::{load_buyer_directory, EngineSettings, LoggingConfig};
use pingpost::domain::{Lead, LeadStatus};
use pingpost::ledger::{AuctionStore, MemoryStore, PostgresStore};
use pingpost::registry::BuyerRegistry;
use pingpost::services::{EngineMetrics, HealthServer, HealthState};
use pingpost::transport::{BuyerTransport, DryRunTransport, HttpTransport};
use pingpost::{EngineError, Result};

#[derive(Parser)]
#[command(name = "pingpost", about = "Real-time lead auction engine", version)]
struct Cli {
    /// Directory holding default.toml and environment overlays
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Auction a batch of leads from a JSON Lines file
    Run {
        /// One lead submission per line
        #[arg(long)]
        leads: PathBuf,
        /// Use the simulated transport; no buyer is contacted
        #[arg(long)]
        dry_run: bool,
    },
    /// Run one synthetic lead through a dry-run auction
    Simulate {
        #[arg(long)]
        service: String,
        #[arg(long)]
        zip: String,
    },
    /// Validate settings and the buyer directory, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = EngineSettings::load_from(&cli.config_dir)?;
    let _log_guard = init_logging(&settings.logging);

    match cli.command {
        Commands::Run { leads, dry_run } => run_batch(&settings, &leads, dry_run).await,
        Commands::Simulate { service, zip } => simulate(&settings, &service, &zip).await,
        Commands::CheckConfig => check_config(&settings),
    }
}

/// What a lead submitter sends. Intake assigns identity and timestamps;
/// submitters never pick their own lead id.
#[derive(Debug, Deserialize)]
struct LeadSubmission {
    service_type_id: String,
    zip: String,
    #[serde(default)]
    answers: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    attestations: BTreeMap<String, String>,
    #[serde(default)]
    quality_score: u8,
}

impl LeadSubmission {
    fn materialize(self) -> Lead {
        let mut lead = Lead::new(&self.service_type_id, &self.zip);
        lead.answers = self.answers;
        lead.attestations = self.attestations;
        lead.quality_score = self.quality_score;
        lead.status = LeadStatus::Pending;
        lead
    }
}

async fn run_batch(settings: &EngineSettings, leads_path: &Path, dry_run: bool) -> Result<()> {
    validate_settings(settings)?;

    let registry = Arc::new(BuyerRegistry::new());
    hydrate_registry(settings, &registry)?;

    let breakers = Arc::new(BreakerRegistry::new(settings.breaker.clone()));
    let caps = Arc::new(DailyCapTracker::new());
    let metrics = Arc::new(EngineMetrics::new());

    let health_state = Arc::new(
        HealthState::new()
            .with_registry(Arc::clone(&registry))
            .with_breakers(Arc::clone(&breakers))
            .with_metrics(Arc::clone(&metrics)),
    );

    let store: Arc<dyn AuctionStore> = match (&settings.database.url, dry_run) {
        (Some(url), false) => {
            let pg = PostgresStore::new(url, settings.database.max_connections).await?;
            pg.migrate().await?;
            health_state.record_db_check(true).await;
            Arc::new(pg)
        }
        (Some(_), true) => {
            info!("dry run: ledger kept in memory");
            Arc::new(MemoryStore::new())
        }
        (None, _) => {
            warn!("no database.url configured; ledger rows will not survive this process");
            Arc::new(MemoryStore::new())
        }
    };

    // Restarts keep misbehaving buyers gated.
    let saved = store.load_breaker_snapshots().await?;
    if !saved.is_empty() {
        breakers.restore_all(&saved).await;
        info!(count = saved.len(), "breaker states restored");
    }

    let transport: Arc<dyn BuyerTransport> = if dry_run {
        info!("dry run: no buyer will be contacted");
        Arc::new(DryRunTransport::new(dec!(40)))
    } else {
        Arc::new(HttpTransport::new()?)
    };

    if let Some(port) = settings.health_port {
        let server = HealthServer::new(Arc::clone(&health_state), port);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Health server exited: {}", e);
            }
        });
    }

    let leads = read_leads(leads_path)?;
    info!(count = leads.len(), file = %leads_path.display(), "leads loaded");

    let engine = Arc::new(AuctionEngine::new(
        Arc::clone(&registry),
        Arc::clone(&breakers),
        caps,
        transport,
        Arc::clone(&store),
        Arc::clone(&metrics),
        settings.auction.tuning(),
    ));

    let health = Arc::clone(&health_state);
    let process = stream::iter(leads)
        .map(|lead| {
            let engine = Arc::clone(&engine);
            let health = Arc::clone(&health);
            async move {
                let outcome = engine.run(&lead).await;
                health.record_auction().await;
                outcome
            }
        })
        .buffer_unordered(settings.auction.max_concurrent_auctions)
        .collect::<Vec<_>>();

    tokio::select! {
        outcomes = process => {
            let sold = outcomes.iter().filter(|o| o.disposition.is_sold()).count();
            info!(total = outcomes.len(), sold, "batch complete");
        }
        _ = shutdown_signal() => {
            warn!("Shutdown signal received; abandoning in-flight auctions");
        }
    }

    let snapshots = breakers.snapshot_all().await;
    if let Err(e) = store.save_breaker_snapshots(&snapshots).await {
        error!("Failed to persist breaker snapshots: {}", e);
    }
    metrics.log_status().await;

    Ok(())
}

async fn simulate(settings: &EngineSettings, service: &str, zip: &str) -> Result<()> {
    validate_settings(settings)?;

    let registry = Arc::new(BuyerRegistry::new());
    hydrate_registry(settings, &registry)?;

    let store = Arc::new(MemoryStore::new());
    let store_dyn: Arc<dyn AuctionStore> = Arc::clone(&store) as Arc<dyn AuctionStore>;
    let engine = AuctionEngine::new(
        registry,
        Arc::new(BreakerRegistry::new(settings.breaker.clone())),
        Arc::new(DailyCapTracker::new()),
        Arc::new(DryRunTransport::new(dec!(40))),
        store_dyn,
        Arc::new(EngineMetrics::new()),
        settings.auction.tuning(),
    );

    let lead = Lead::new(service, zip)
        .with_answer("phone", serde_json::json!("555-0100"))
        .with_answer("own_home", serde_json::json!(true))
        .with_attestation("tcpa_consent_text", "simulated consent text")
        .with_attestation("trusted_form_cert", "sim-cert-0001")
        .with_quality_score(80);

    let outcome = engine.run(&lead).await;

    println!("\nLead {} ({service} / {zip})", lead.id);
    match &outcome.disposition {
        Disposition::Sold { buyer_id, amount } => {
            println!("  SOLD to {buyer_id} for ${amount}");
        }
        Disposition::Rejected { cause } => {
            println!("  REJECTED ({cause})");
        }
    }
    println!(
        "  prospects={} exclusions={} bids={} failovers={} elapsed={}ms",
        outcome.prospects, outcome.exclusions, outcome.bids, outcome.failovers, outcome.elapsed_ms
    );

    println!("\nLedger rows:");
    for tx in store.transactions() {
        let amount = tx.amount.map(|a| format!(" ${a}")).unwrap_or_default();
        let detail = tx
            .detail
            .as_deref()
            .map(|d| format!(" ({d})"))
            .unwrap_or_default();
        println!(
            "  {} {} {} attempt={}{}{}",
            tx.kind, tx.buyer_id, tx.outcome, tx.attempt, amount, detail
        );
    }

    Ok(())
}

fn check_config(settings: &EngineSettings) -> Result<()> {
    println!("\n  Validating configuration...\n");
    println!(
        "  auction: ping {}ms / post {}ms, ping deadline {}ms, auction deadline {}ms",
        settings.auction.ping_timeout_ms,
        settings.auction.post_timeout_ms,
        settings.auction.ping_deadline_ms,
        settings.auction.auction_deadline_ms,
    );
    println!(
        "  breaker: trips after {} failures, {}s cooldown",
        settings.breaker.failure_threshold, settings.breaker.cooldown_secs,
    );
    println!(
        "  ledger:  {}",
        settings
            .database
            .url
            .as_deref()
            .map(|_| "postgres")
            .unwrap_or("in-memory (no database.url)"),
    );

    if let Err(errors) = settings.validate() {
        for e in &errors {
            println!("  ✗ {e}");
        }
        return Err(EngineError::Validation(format!(
            "{} configuration problem(s)",
            errors.len()
        )));
    }
    println!("  ✓ settings valid");

    match &settings.buyer_directory {
        Some(path) => {
            let directory = load_buyer_directory(path)?;
            let mut bad = 0usize;
            for buyer in &directory.buyers {
                if let Err(errors) = buyer.validate() {
                    bad += 1;
                    for e in &errors {
                        println!("  ✗ buyer {}: {e}", buyer.buyer_id);
                    }
                }
            }
            println!(
                "  ✓ buyer directory: {} buyers ({} invalid), {} eligibility rows",
                directory.buyers.len(),
                bad,
                directory.eligibility.len(),
            );
        }
        None => println!("  ! no buyer_directory configured"),
    }

    Ok(())
}

fn validate_settings(settings: &EngineSettings) -> Result<()> {
    if let Err(errors) = settings.validate() {
        for e in &errors {
            error!("Configuration: {}", e);
        }
        return Err(EngineError::Validation(format!(
            "{} configuration problem(s)",
            errors.len()
        )));
    }
    Ok(())
}

fn hydrate_registry(settings: &EngineSettings, registry: &BuyerRegistry) -> Result<()> {
    let Some(path) = &settings.buyer_directory else {
        warn!("no buyer_directory configured; every auction will reject with no eligible buyers");
        return Ok(());
    };
    let directory = load_buyer_directory(path)?;
    let buyers = directory.buyers.len();
    let rows = directory.eligibility.len();
    registry.register_all(directory.buyers, directory.eligibility)?;
    info!(buyers, eligibility_rows = rows, "buyer directory loaded");
    Ok(())
}

fn read_leads(path: &Path) -> Result<Vec<Lead>> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);

    let mut leads = Vec::new();
    for (num, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let submission: LeadSubmission = serde_json::from_str(&line)
            .map_err(|e| EngineError::Validation(format!("leads file line {}: {e}", num + 1)))?;
        leads.push(submission.materialize());
    }
    Ok(leads)
}

fn init_logging(cfg: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},pingpost=debug,sqlx=warn", cfg.level)));

    if let Some(dir) = &cfg.file_dir {
        let appender = tracing_appender::rolling::daily(dir, "pingpost.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        if cfg.json {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .json()
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
        }
        return Some(guard);
    }

    if cfg.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
    None
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
