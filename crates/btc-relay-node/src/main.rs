#![doc = include_str!("../README.md")]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bitcoin::Network;
use btc_relay::header::parse_header;
use btc_relay::work::{target_from_bits, work_from_target};
use btc_relay::{Relay, RelayConfig, ReorgPolicy, SharedRelay};
use clap::{command, Parser};
use num_bigint::BigUint;
use tokio::task::JoinHandle;
use tracing::{error, info, subscriber::set_global_default};
use tracing_subscriber::filter::EnvFilter;

use crate::{
    app::{create_app, AppConfig},
    journal::GenesisRecord,
    rpc::{AppState, RpcConfig, RpcServer},
    shutdown::Shutdown,
    store::AppStore,
};

mod app;
mod journal;
mod rpc;
mod shutdown;
mod store;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// RPC server host
    #[arg(long, default_value = "127.0.0.1:5000")]
    rpc_host: String,
    /// Path to the database journaling accepted headers
    #[arg(long, default_value = "./.relay_data/relay.db")]
    db_path: PathBuf,
    /// Bitcoin network (bitcoin, testnet, signet, regtest)
    #[arg(long, env = "BITCOIN_NETWORK", default_value = "bitcoin")]
    network: Network,
    /// Rule for replacing the main chain with a fork (work, length)
    #[arg(long, env = "REORG_POLICY", default_value = "work")]
    reorg_policy: ReorgPolicy,
    /// Hex encoded trusted starting header, required on first start
    #[arg(long, env = "GENESIS_HEADER")]
    genesis_header: Option<String>,
    /// Height of the starting header
    #[arg(long, env = "GENESIS_HEIGHT", default_value = "0")]
    genesis_height: u32,
    /// Cumulative work up to and including the starting header, decimal
    /// (defaults to the work of the starting header alone)
    #[arg(long, env = "GENESIS_CHAIN_WORK")]
    genesis_chain_work: Option<String>,
    /// Timestamp of the first block of the starting header's difficulty period
    /// (defaults to the starting header's timestamp)
    #[arg(long, env = "GENESIS_EPOCH_START")]
    genesis_epoch_start: Option<u32>,
    /// Logging level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber_builder =
        tracing_subscriber::fmt::Subscriber::builder().with_env_filter(env_filter);

    let subscriber = subscriber_builder.with_writer(std::io::stderr).finish();
    set_global_default(subscriber).expect("Failed to set subscriber");
}

/// Genesis from the command line, if one was given
fn genesis_from_cli(cli: &Cli) -> Result<Option<GenesisRecord>, anyhow::Error> {
    let Some(genesis_hex) = &cli.genesis_header else {
        return Ok(None);
    };
    let header_bytes = hex::decode(genesis_hex).context("Invalid genesis header hex")?;
    let header = parse_header(&header_bytes)?;

    let chain_work = match &cli.genesis_chain_work {
        Some(chain_work) => chain_work
            .parse::<BigUint>()
            .context("Invalid genesis chain work")?,
        None => {
            let target = target_from_bits(header.bits.to_consensus())?;
            work_from_target(&target)
        }
    };

    Ok(Some(GenesisRecord {
        header: header_bytes,
        height: cli.genesis_height,
        chain_work,
        epoch_start_time: cli.genesis_epoch_start.unwrap_or(header.time),
    }))
}

#[tokio::main]
async fn main() {
    // Load environment variables from .env file if it exists
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    info!("Bitcoin relay node is launching on {}...", cli.network);

    let genesis = match genesis_from_cli(&cli) {
        Ok(genesis) => genesis,
        Err(err) => {
            error!("Invalid genesis configuration: {:#}", err);
            std::process::exit(1);
        }
    };
    let store = match AppStore::single_atomic_writer(&cli.db_path).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!("Failed to open {}: {}", cli.db_path.display(), err);
            std::process::exit(1);
        }
    };

    // Instantiating components and wiring them together
    let shutdown = Shutdown::default();

    let relay_config = RelayConfig::new(cli.network, cli.reorg_policy);
    let relay = SharedRelay::new(Relay::new(relay_config));

    let app_config = AppConfig {
        api_requests_capacity: 1000,
        relay: relay_config,
        genesis,
    };
    let (mut app_server, app_client) =
        create_app(app_config, relay.clone(), store, shutdown.subscribe());

    let rpc_config = RpcConfig {
        rpc_host: cli.rpc_host,
    };
    let rpc_server = RpcServer::new(
        rpc_config,
        AppState::new(app_client, relay),
        shutdown.subscribe(),
    );

    // Launching threads for each component
    let app_handle = tokio::spawn(async move { app_server.run().await });
    let rpc_handle = tokio::spawn(async move { rpc_server.run().await });
    let shutdown_handle = tokio::spawn(async move { shutdown.run().await });

    // If at least one component exits with an error, the node will exit with an error
    match tokio::try_join!(
        flatten(app_handle),
        flatten(rpc_handle),
        flatten(shutdown_handle)
    ) {
        Ok(_) => {
            info!("Bitcoin relay node has shut down");
            std::process::exit(0);
        }
        Err(_) => {
            error!("Bitcoin relay node has exited with error");
            std::process::exit(1);
        }
    }
}

async fn flatten<T>(handle: JoinHandle<Result<T, ()>>) -> Result<T, ()> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(()),
    }
}
