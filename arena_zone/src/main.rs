//! Standalone zone binary.
//!
//! Usage:
//!   cargo run -p arena_zone -- [--config zone.json] [--listen 127.0.0.1:4001]
//!       [--zone 1] [--target 2] [--boundary 100] [--data-dir data]
//!       [--metrics 127.0.0.1:9101]
//!
//! The zone listens for one gateway link, runs the authoritative tick
//! loop, and persists characters and snapshots under the data directory.
//! SIGINT/SIGTERM triggers a final save pass before exit.

use std::env;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use arena_shared::config::ZoneConfig;
use arena_shared::metrics::Counters;
use arena_zone::persist::{SaveQueue, SnapshotQueue};
use arena_zone::store::JsonStore;
use arena_zone::zone::Zone;

fn parse_args() -> anyhow::Result<ZoneConfig> {
    let args: Vec<String> = env::args().collect();
    let mut cfg: Option<ZoneConfig> = None;

    // --config first, flags override.
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            let text = std::fs::read_to_string(&args[i + 1])
                .with_context(|| format!("read config {}", args[i + 1]))?;
            cfg = Some(ZoneConfig::from_json_str(&text).context("parse config")?);
        }
        i += 1;
    }
    let mut cfg = cfg.unwrap_or_default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--listen" if i + 1 < args.len() => {
                cfg.listen_addr = args[i + 1].clone();
                i += 2;
            }
            "--zone" if i + 1 < args.len() => {
                cfg.zone_id = args[i + 1].parse().context("parse --zone")?;
                i += 2;
            }
            "--target" if i + 1 < args.len() => {
                cfg.transfer_target_zone = args[i + 1].parse().context("parse --target")?;
                i += 2;
            }
            "--boundary" if i + 1 < args.len() => {
                cfg.transfer_boundary_x = args[i + 1].parse().context("parse --boundary")?;
                i += 2;
            }
            "--data-dir" if i + 1 < args.len() => {
                cfg.data_dir = args[i + 1].clone();
                i += 2;
            }
            "--metrics" if i + 1 < args.len() => {
                cfg.metrics_addr = Some(args[i + 1].clone());
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().context("parse --tick-hz")?;
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(
        zone = cfg.zone_id,
        listen = %cfg.listen_addr,
        target = cfg.transfer_target_zone,
        boundary = cfg.transfer_boundary_x,
        "starting zone"
    );

    let store = Arc::new(JsonStore::open(&cfg.data_dir).await.context("open store")?);
    let save_q = Arc::new(SaveQueue::new(store.clone(), 10_000));
    let snap_q = Arc::new(SnapshotQueue::new(store.clone(), 64));
    let counters = Arc::new(Counters::default());

    let zone = Zone::new(
        cfg.clone(),
        store.clone(),
        store,
        save_q.clone(),
        snap_q.clone(),
        counters.clone(),
    )
    .context("zone startup")?;

    let listener = TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("bind {}", cfg.listen_addr))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(addr) = cfg.metrics_addr.clone() {
        let counters = counters.clone();
        tokio::spawn(async move {
            if let Err(e) = arena_shared::metrics::serve(addr, counters).await {
                warn!(error = %e, "metrics endpoint failed");
            }
        });
    }

    // Workers get their own shutdown edge so they still drain when the
    // zone exits on a link error rather than a signal.
    let (worker_tx, worker_rx) = watch::channel(false);
    let save_worker = {
        let q = save_q.clone();
        let rx = worker_rx.clone();
        tokio::spawn(async move { q.run(rx).await })
    };
    let snap_worker = {
        let q = snap_q.clone();
        let rx = worker_rx;
        tokio::spawn(async move { q.run(rx).await })
    };

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let result = zone.run(listener, shutdown_rx).await;

    // Let the queue workers finish their final flush either way.
    let _ = worker_tx.send(true);
    let _ = save_worker.await;
    let _ = snap_worker.await;
    result?;
    info!("zone exited cleanly");
    Ok(())
}
