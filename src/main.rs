use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use overlay_launcher::{
    AccountGetter, Backend, FakeStore, Keypair, LauncherConfig, LauncherMode, NodeId,
    SimulatedOverlay,
};

/// Comma-separated health scores the simulated overlay reports after join.
#[derive(Clone, Debug)]
struct HealthScript(Vec<i32>);

impl FromStr for HealthScript {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let scores = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<i32>()
                    .with_context(|| format!("invalid health score '{}'", part))
            })
            .collect::<Result<Vec<_>>>()?;
        if scores.is_empty() {
            anyhow::bail!("health script must contain at least one score");
        }
        Ok(HealthScript(scores))
    }
}

#[derive(Parser, Debug)]
#[command(name = "overlay-launcher")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// `live` joins the simulated overlay, `fake` skips it.
    #[arg(short, long, default_value = "live")]
    mode: LauncherMode,

    #[arg(short, long, default_value_t = overlay_launcher::DEFAULT_EXECUTOR_WORKERS)]
    workers: usize,

    #[arg(long, default_value = "10")]
    key_timeout_secs: u64,

    /// Give up joining after this long. Waits indefinitely when omitted.
    #[arg(long)]
    join_timeout_secs: Option<u64>,

    /// Identity of the simulated overlay node (64 hex chars). Random when omitted.
    #[arg(long, value_name = "HEX")]
    node_id: Option<NodeId>,

    #[arg(long, default_value = "0,50,100")]
    health_script: HealthScript,

    /// Delay between scripted health reports.
    #[arg(long, default_value = "200")]
    step_ms: u64,

    /// Public keys to pre-load into the store and resolve once connected.
    #[arg(long, default_value = "3")]
    seed_keys: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = LauncherConfig {
        executor_workers: args.workers,
        key_fetch_timeout: Duration::from_secs(args.key_timeout_secs),
        join_timeout: args.join_timeout_secs.map(Duration::from_secs),
        ..Default::default()
    };

    let store = FakeStore::new();
    let peers: Vec<Keypair> = (0..args.seed_keys).map(|_| Keypair::generate()).collect();
    for peer in &peers {
        store.put_public_key(&peer.public_key())?;
    }

    let overlay = match args.mode {
        LauncherMode::Live => {
            let own_id = args
                .node_id
                .unwrap_or_else(|| Keypair::generate().node_id());
            let step = Duration::from_millis(args.step_ms);
            let overlay = SimulatedOverlay::new(own_id)
                .with_health_script(args.health_script.0.clone(), step);
            Some(Arc::new(overlay))
        }
        LauncherMode::FakeStore => None,
    };
    let backend = match &overlay {
        Some(overlay) => Backend::Live {
            overlay: overlay.clone(),
            engine: Arc::new(store.clone()),
        },
        None => Backend::FakeStore(store.clone()),
    };

    info!(mode = %args.mode, workers = args.workers, "starting account getter");
    let getter = AccountGetter::create(config, backend)
        .await
        .context("account getter construction failed")?;

    match getter.own_identity() {
        Some(id) => info!(node = %id, health = ?getter.health(), "account getter ready"),
        None => info!("account getter ready (no overlay)"),
    }

    // Resolve the seeded keys the way the overlay would ask for them.
    if let Some(overlay) = &overlay {
        for peer in &peers {
            match overlay.request_public_key(peer.node_id()).await {
                Ok(Ok(key)) if key == peer.public_key() => {
                    info!(peer = ?peer.node_id(), "public key resolved");
                }
                Ok(Ok(_)) => warn!(peer = ?peer.node_id(), "resolved key does not match"),
                Ok(Err(e)) => {
                    warn!(peer = ?peer.node_id(), error = %e, "public key request failed")
                }
                Err(_) => warn!(peer = ?peer.node_id(), "public key reply dropped"),
            }
        }
    }

    // Graceful shutdown on Ctrl+C
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, exiting gracefully");
    getter.shutdown().await;

    Ok(())
}
