//! The OP_NET indexer and peer node.

mod args;
mod config;
mod dev_crypto;
mod indexer;
mod rpc;
mod services;
mod transport;

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use opnet_btcio::test_utils::TestL1Client;
use opnet_common::TaskManager;
use opnet_db::MemDb;

use crate::{args::Args, config::ClientConfig, services::start_services};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ClientConfig::load(args.config.as_deref())?;
    config.apply_overrides(&args);

    opnet_common::logging::init("info,opnet=debug");
    info!(version = env!("CARGO_PKG_VERSION"), "starting opnet-client");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let mut task_manager = TaskManager::new();
        let executor = task_manager.executor();

        // The external Bitcoin RPC node and document store attach here;
        // dev runs use the in-process stand-ins.
        // TODO: wire bitcoind-backed L1 client and document-store bindings
        // once their service endpoints are configured.
        let client = Arc::new(TestL1Client::new(1, 200));
        let db = Arc::new(MemDb::new());

        start_services(config, client, db, executor).await?;

        task_manager.monitor().await;
        info!("shutdown complete");
        Ok(())
    })
}
