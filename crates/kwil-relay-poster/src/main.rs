#![deny(unsafe_code)]

use std::path::PathBuf;

use alloy::primitives::{Address, U256};
use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::signal::unix;

use kwil_relay_poster::{Poster, RelayConfig};
use kwil_relay_store::Ledger;
use kwil_relay_sync::KwilClient;
use kwil_relay_tx::{AlloyChain, Broker, BrokerConfig, SafeServiceClient};
use kwil_relay_types::RewardState;

/// Kwil reward poster.
///
/// Start the daemon from a config file:
///
///     $ kwil-relay-poster -vv --config relay.json run
#[derive(Parser)]
#[command(name = "kwil-relay-poster", version)]
struct Opts {
    /// A level of verbosity, and can be used multiple times
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Relay configuration file.
    #[arg(short, long, env = "KWIL_RELAY_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the poster daemon (default).
    Run,
    /// Build the reward tree for a batch read from a JSON file.
    BuildTree {
        /// JSON file with `recipients` and decimal `amounts`.
        input: PathBuf,
        #[arg(long)]
        escrow: Address,
        /// Source-chain height committed in every leaf.
        #[arg(long)]
        height: U256,
    },
    /// Print the ledger.
    Status,
    /// Propose and sign an `updatePosterFee` wallet transaction.
    UpdateFee { fee: U256 },
    /// Submit a reverted record again from scratch. Run with the daemon stopped.
    Retry { height: u64 },
    /// Give up on a pending record. Run with the daemon stopped.
    Skip { height: u64 },
}

#[derive(Deserialize)]
struct TreeInput {
    recipients: Vec<Address>,
    amounts: Vec<String>,
}

type LivePoster = Poster<KwilClient, AlloyChain, SafeServiceClient>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Opts::parse();
    setup_logger(args.verbose)?;

    match args.command.unwrap_or(Command::Run) {
        Command::BuildTree {
            input,
            escrow,
            height,
        } => build_tree(input, escrow, height),
        Command::Status => {
            let config = load_config(args.config)?;
            print_status(&config)
        }
        Command::UpdateFee { fee } => {
            let config = load_config(args.config)?;
            let poster = build_poster(&config).await?;
            let (proposed, confirmed) = poster.propose_fee_update(fee).await?;
            println!("safe_tx_hash: {}", proposed.safe_tx_hash);
            println!("confirmed: {}", confirmed);
            Ok(())
        }
        Command::Retry { height } => {
            let config = load_config(args.config)?;
            retry(&config, height)
        }
        Command::Skip { height } => {
            let config = load_config(args.config)?;
            skip(&config, height)
        }
        Command::Run => {
            let config = load_config(args.config)?;
            run(config).await
        }
    }
}

fn setup_logger(verbosity: u8) -> anyhow::Result<()> {
    use tracing::Level;
    let log_level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let mut env_filter = tracing_subscriber::EnvFilter::from_default_env();
    for target in [
        "kwil_relay_poster",
        "kwil_relay_tx",
        "kwil_relay_sync",
        "kwil_relay_store",
    ] {
        env_filter = env_filter.add_directive(format!("{}={}", target, log_level).parse()?);
    }
    tracing_subscriber::fmt()
        .with_target(true)
        .with_max_level(log_level)
        .with_env_filter(env_filter)
        .pretty()
        .init();
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<RelayConfig> {
    let path = path.context("no config file given (use --config or KWIL_RELAY_CONFIG)")?;
    let config = RelayConfig::load(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    tracing::debug!(?config, "loaded config");
    Ok(config)
}

async fn build_poster(config: &RelayConfig) -> anyhow::Result<LivePoster> {
    let chain = AlloyChain::connect(&config.eth_rpc, config.executor()?)?;
    let chain_id = match config.chain_id {
        Some(id) => id,
        None => chain.chain_id().await.context("reading chain id")?,
    };
    let auth = SafeServiceClient::new(&config.safe_service_url, Some(config.request_timeout_ms));
    let broker = Broker::new(
        chain,
        auth,
        BrokerConfig {
            chain_id,
            safe: config.safe_address,
            escrow: config.escrow_address,
        },
    );
    let source = KwilClient::new(config.source_config(), Some(config.request_timeout_ms));
    let ledger = open_ledger(config)?;
    tracing::info!(
        chain_id,
        safe = %config.safe_address,
        escrow = %config.escrow_address,
        records = ledger.len(),
        last_synced = ledger.last_synced_height(),
        "poster ready"
    );
    Ok(Poster::new(
        source,
        broker,
        ledger,
        config.signers()?,
        config.poster_config(),
    ))
}

async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let mut poster = build_poster(&config).await?;
    poster
        .health_check()
        .await
        .context("source chain health check")?;
    let synced = poster.fast_sync().await.context("fast sync")?;
    tracing::info!(synced, "fast sync done");

    // watch for signals
    let mut ctrlc_signal = unix::signal(unix::SignalKind::interrupt())?;
    let mut termination_signal = unix::signal(unix::SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = ctrlc_signal.recv() => tracing::warn!("Interrupted (Ctrl+C) ..."),
            _ = termination_signal.recv() => tracing::warn!("Got Terminate signal ..."),
        }
    };

    poster.run(shutdown).await?;
    tracing::info!("Clean Exit ..");
    Ok(())
}

fn build_tree(input: PathBuf, escrow: Address, height: U256) -> anyhow::Result<()> {
    let raw = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
    let input: TreeInput = serde_json::from_slice(&raw).context("parsing tree input")?;
    let amounts = input
        .amounts
        .iter()
        .map(|a| a.parse::<U256>().with_context(|| format!("invalid amount {}", a)))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let (tree, total) = kwil_relay_merkle::build_tree(&input.recipients, &amounts, escrow, height)?;
    let out = serde_json::json!({
        "root": tree.root_hex(),
        "total": total.to_string(),
        "tree": tree.dump(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn open_ledger(config: &RelayConfig) -> anyhow::Result<Ledger> {
    Ledger::load(&config.state_file)
        .with_context(|| format!("opening ledger {}", config.state_file.display()))
}

fn retry(config: &RelayConfig, height: u64) -> anyhow::Result<()> {
    let mut ledger = open_ledger(config)?;
    if ledger.state(height) != Some(RewardState::Reverted) {
        anyhow::bail!("record at height {} is not reverted", height);
    }
    ledger.clear_result(height)?;
    tracing::warn!(height, "reverted record reset for resubmission");
    println!("{}: {}", height, RewardState::Fetched);
    Ok(())
}

fn skip(config: &RelayConfig, height: u64) -> anyhow::Result<()> {
    let mut ledger = open_ledger(config)?;
    if !ledger.is_pending(height) {
        anyhow::bail!("record at height {} is not pending", height);
    }
    ledger.mark_skipped(height)?;
    tracing::warn!(height, "record skipped by operator");
    println!("{}: {}", height, RewardState::Skipped);
    Ok(())
}

fn print_status(config: &RelayConfig) -> anyhow::Result<()> {
    let ledger = open_ledger(config)?;
    println!("last synced height: {}", ledger.last_synced_height());
    for record in ledger.records() {
        let height = record.height();
        let state = ledger
            .state(height)
            .map(|s| s.to_string())
            .unwrap_or_default();
        let tx = record
            .result
            .as_ref()
            .map(|r| r.hash.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>10}  {}  {:<9}  {}",
            height, record.request.root, state, tx
        );
    }
    Ok(())
}
