//! TDX quote server gateway.
//!
//! This binary keeps a registry of candidate upstream TDX quote servers and
//! exposes it over HTTP so an operator can list, test, select and persist the
//! server that data fetches should use. Internally it wires together:
//!
//! - `SnapshotStore`: the JSON snapshot of the registry under the cache
//!   directory, read once at startup and written only on explicit saves.
//! - `SelectionController`: owner of the registry and the health book; runs
//!   probes through a `TcpProber` and applies their results.
//! - `http`: axum routes translating JSON requests into controller calls.
//!
//! Concurrency:
//! - Registry reads share a `RwLock`; every mutation takes it exclusively.
//! - Probes and file I/O run on tokio's blocking pool and never hold the
//!   registry lock, so a slow upstream cannot stall unrelated requests.
//! - There is no background health check; failover is operator triggered.
#![warn(missing_docs)]
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use log::info;
use tdx_common::Result;
use tdx_common::TcpProber;
use tdx_common::server::default_servers;

use crate::args::Args;
use crate::controller::SelectionController;
use crate::persistence::SnapshotStore;

mod args;
mod controller;
mod http;
pub mod model;
mod persistence;

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();
    let args = Args::parse();

    let store = SnapshotStore::open(&args.cache_dir)?;
    info!("Snapshot file: {}", store.path().display());

    let prober = Arc::new(TcpProber::new(args.probe_timeout()));
    let controller = Arc::new(SelectionController::bootstrap(
        store,
        prober,
        default_servers(),
    )?);
    if let Ok(current) = controller.get_current_server() {
        info!("Current server: {}", current);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    http::serve(controller, addr).await
}

fn init_logger() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
}
