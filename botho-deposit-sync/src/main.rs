//! Botho Deposit Sync CLI
//!
//! Follows a Botho node and keeps an external balance ledger in step with
//! deposits to custodial addresses, across chain reorganizations.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use botho_deposit_sync::{
    address_index::FileAddressStore,
    chain::RpcChainIndex,
    charge_ledger::ChargeLedger,
    config::SyncConfig,
    cursor::FollowerCursor,
    follower::ChainFollower,
    ledger_client::JsonRpcLedgerService,
    metrics::{serve_metrics, SyncMetrics},
    reconciler::Reconciler,
    store::{ChargeStore, LmdbChargeStore},
    sweeper::spawn_sweeper,
    sync_client::SyncClient,
    DepositSync,
};

#[derive(Parser)]
#[command(name = "botho-deposit-sync")]
#[command(about = "Reorg-aware deposit crediting for Botho custodial addresses")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "deposit-sync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the chain and sync deposits until interrupted
    Run {
        /// Start from a specific block height if no cursor exists
        #[arg(long)]
        from_height: Option<u64>,
    },

    /// Run a single reconciliation sweep and exit
    SweepOnce,

    /// Show pending charge records and follower progress
    Status,

    /// Validate configuration file
    ValidateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let config = match SyncConfig::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            if matches!(cli.command, Commands::ValidateConfig) {
                eprintln!("Configuration validation failed: {}", e);
                std::process::exit(1);
            }
            anyhow::bail!("Failed to load config from {:?}: {}", cli.config, e);
        }
    };

    match cli.command {
        Commands::Run { from_height } => run(config, from_height).await,
        Commands::SweepOnce => sweep_once(&config).await,
        Commands::Status => show_status(&config),
        Commands::ValidateConfig => {
            println!("Configuration is valid.");
            println!("  Node RPC: {}", config.node_rpc_url);
            println!("  Ledger RPC: {}", config.ledger_rpc_url);
            println!("  Asset: {}", config.asset);
            println!(
                "  Maturity depth: {} (sweeper re-drives at {})",
                config.maturity_depth,
                config.sweep_depth()
            );
            println!("  Include coinbase: {}", config.include_coinbase);
            println!("  Charge ledger: {:?}", config.ledger_db_path);
            Ok(())
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

struct Service {
    chain: Arc<RpcChainIndex>,
    sync: Arc<DepositSync>,
    metrics: Arc<SyncMetrics>,
}

fn build_service(config: &SyncConfig) -> Result<Service> {
    let timeout = config.request_timeout();
    let metrics = Arc::new(SyncMetrics::new());

    let chain = Arc::new(RpcChainIndex::new(&config.node_rpc_url, timeout)?);
    let ledger_service = Arc::new(JsonRpcLedgerService::new(
        &config.ledger_rpc_url,
        config.ledger_auth_token.clone(),
        timeout,
    )?);

    let store = Arc::new(LmdbChargeStore::open(&config.ledger_db_path)?);
    let charges = ChargeLedger::open(store)?;

    let client = SyncClient::new(ledger_service, config.asset.clone(), timeout);
    let reconciler = Reconciler::new(client).with_metrics(metrics.clone());

    let sync = DepositSync::new(
        chain.clone(),
        charges,
        Arc::new(FileAddressStore::new(config.address_file.clone())),
        reconciler,
        config.policy(),
    )
    .with_metrics(metrics.clone());

    Ok(Service {
        chain,
        sync: Arc::new(sync),
        metrics,
    })
}

async fn run(config: SyncConfig, from_height: Option<u64>) -> Result<()> {
    tracing::info!("Starting deposit sync");

    let service = build_service(&config)?;
    tracing::info!(
        "Charge ledger opened with {} pending blocks",
        service.sync.pending_blocks().await
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics_task = config.metrics_addr.map(|addr| {
        let metrics = service.metrics.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(addr, metrics, shutdown).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        })
    });

    let sweeper = spawn_sweeper(service.sync.clone(), config.sweeper(), shutdown_rx.clone());

    let mut follower_config = config.follower();
    if let Some(height) = from_height {
        tracing::info!("Starting from specified height: {}", height);
        follower_config.start_height = Some(height);
    }
    let follower = ChainFollower::new(
        service.chain.clone(),
        service.chain.clone(),
        service.sync.clone(),
        follower_config,
    )
    .with_cursor_file(config.cursor_file.clone())?;
    let follower = tokio::spawn(follower.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, waiting for in-flight work");
    let _ = shutdown_tx.send(true);

    follower.await?;
    sweeper.await?;
    if let Some(task) = metrics_task {
        task.await?;
    }

    tracing::info!("Deposit sync stopped");
    Ok(())
}

async fn sweep_once(config: &SyncConfig) -> Result<()> {
    let service = build_service(config)?;
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let report = service.sync.sweep_once(&shutdown_rx).await;
    println!("Sweep complete:");
    println!("  Visited: {}", report.visited);
    println!("  Connected: {}", report.connected);
    println!("  Disconnected: {}", report.disconnected);
    println!("  Resolved: {}", report.resolved);
    println!("  Failed: {}", report.failed);
    println!("  Below sweep depth: {}", report.skipped_shallow);
    println!("  Still pending: {}", service.sync.pending_blocks().await);
    Ok(())
}

fn show_status(config: &SyncConfig) -> Result<()> {
    let store = LmdbChargeStore::open(&config.ledger_db_path)?;
    let records = store.load_all()?;

    println!("Charge ledger: {} blocks", records.len());
    for (hash, record) in &records {
        let pending = record.pending_entries().len();
        println!(
            "  {} {:<6} entries={} pending={} total={}",
            hash,
            record.orientation(),
            record.len(),
            pending,
            record.total_amount()
        );
    }

    let cursor = FollowerCursor::load(&config.cursor_file)?;
    println!("{}", cursor.summary());
    Ok(())
}
