//! Standalone gateway binary.
//!
//! Usage:
//!   cargo run -p arena_gateway -- [--config gateway.json] [--udp 127.0.0.1:7777]
//!       [--zone 1=127.0.0.1:4001] [--zone 2=127.0.0.1:4002]
//!       [--cookie-secret s] [--token-secret s]
//!
//! `--zone` is repeatable: one framed TCP link is dialed per entry at
//! startup. SIGINT/SIGTERM shuts the gateway down with exit code 0.

use std::env;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::watch;
use tracing::info;

use arena_gateway::gateway::Gateway;
use arena_shared::config::GatewayConfig;
use arena_shared::metrics::Counters;
use arena_shared::token::HsValidator;

fn parse_args() -> anyhow::Result<GatewayConfig> {
    let args: Vec<String> = env::args().collect();
    let mut cfg: Option<GatewayConfig> = None;

    let mut i = 1;
    while i < args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            let text = std::fs::read_to_string(&args[i + 1])
                .with_context(|| format!("read config {}", args[i + 1]))?;
            cfg = Some(GatewayConfig::from_json_str(&text).context("parse config")?);
        }
        i += 1;
    }
    let mut cfg = cfg.unwrap_or_default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--udp" if i + 1 < args.len() => {
                cfg.udp_addr = args[i + 1].clone();
                i += 2;
            }
            "--zone" if i + 1 < args.len() => {
                let (id, addr) = args[i + 1]
                    .split_once('=')
                    .context("zone flag must be <id>=<addr>")?;
                let id: u32 = id.parse().context("bad zone id")?;
                if id == 0 || addr.is_empty() {
                    bail!("zone flag must be <id>=<addr> with a nonzero id");
                }
                cfg.zones.insert(id, addr.to_string());
                i += 2;
            }
            "--cookie-secret" if i + 1 < args.len() => {
                cfg.cookie_secret = args[i + 1].clone();
                i += 2;
            }
            "--token-secret" if i + 1 < args.len() => {
                cfg.token_secret = args[i + 1].clone();
                i += 2;
            }
            "--proto" if i + 1 < args.len() => {
                cfg.proto_version = args[i + 1].parse().context("parse --proto")?;
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
    info!(udp = %cfg.udp_addr, zones = cfg.zones.len(), "starting gateway");

    let validator = Arc::new(HsValidator::new(cfg.token_secret.as_bytes()));
    let counters = Arc::new(Counters::default());
    let (gateway, inbound) = Gateway::bind(cfg, validator, counters)
        .await
        .context("gateway startup")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    gateway.run(inbound, shutdown_rx).await?;
    info!("gateway exited cleanly");
    Ok(())
}
