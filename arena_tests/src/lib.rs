//! In-process cluster harness for the integration tests.
//!
//! Boots real zones and a real gateway on ephemeral ports, shares one
//! memory store across the zones so tests can assert persisted state, and
//! hands out authenticated clients.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;

use arena_client::peer::ClientPeer;
use arena_gateway::gateway::Gateway;
use arena_shared::config::{GatewayConfig, ZoneConfig};
use arena_shared::interest::Interest;
use arena_shared::metrics::Counters;
use arena_shared::token::{mint_hs256, Claims};
use arena_zone::persist::{SaveQueue, SnapshotQueue};
use arena_zone::store::MemStore;
use arena_zone::zone::Zone;

pub const COOKIE_SECRET: &str = "test-cookie-secret";
pub const TOKEN_SECRET: &str = "test-token-secret";

/// One zone to boot into the cluster.
#[derive(Debug, Clone, Copy)]
pub struct ZoneSpec {
    pub zone_id: u32,
    pub target: u32,
    pub boundary: i16,
    pub npc_count: usize,
}

impl ZoneSpec {
    pub fn new(zone_id: u32, target: u32, boundary: i16) -> Self {
        Self {
            zone_id,
            target,
            boundary,
            npc_count: 0,
        }
    }
}

/// A running gateway + zones, all on ephemeral localhost ports.
pub struct Cluster {
    pub gateway_addr: String,
    pub store: Arc<MemStore>,
    shutdown: watch::Sender<bool>,
}

impl Cluster {
    /// Boots the zones (fast 50 Hz ticks), any extra raw zone addresses
    /// (for unresponsive-zone tests), then the gateway.
    pub async fn start(
        zones: &[ZoneSpec],
        extra_zone_addrs: &[(u32, String)],
        transfer_timeout_ms: u64,
    ) -> anyhow::Result<Cluster> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("info")
            .with_test_writer()
            .try_init();

        let store = Arc::new(MemStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut gw_cfg = GatewayConfig {
            udp_addr: "127.0.0.1:0".to_string(),
            proto_version: 1,
            cookie_secret: COOKIE_SECRET.to_string(),
            token_secret: TOKEN_SECRET.to_string(),
            transfer_timeout_ms,
            ..GatewayConfig::default()
        };

        for spec in zones {
            let listener = TcpListener::bind("127.0.0.1:0")
                .await
                .context("zone listener bind")?;
            let addr = listener.local_addr()?;
            gw_cfg.zones.insert(spec.zone_id, addr.to_string());

            let cfg = ZoneConfig {
                listen_addr: addr.to_string(),
                zone_id: spec.zone_id,
                tick_hz: 50,
                state_every_ticks: 2,
                save_every_ticks: 5,
                snapshot_every_ticks: 50,
                npc_count: spec.npc_count,
                transfer_target_zone: spec.target,
                transfer_boundary_x: spec.boundary,
                transfer_timeout_ticks: 500,
                ..ZoneConfig::default()
            };
            let save_q = Arc::new(SaveQueue::new(store.clone(), 10_000));
            let snap_q = Arc::new(SnapshotQueue::new(store.clone(), 64));
            let zone = Zone::new(
                cfg,
                store.clone(),
                store.clone(),
                save_q.clone(),
                snap_q.clone(),
                Arc::new(Counters::default()),
            )
            .context("zone startup")?;

            let rx = shutdown_rx.clone();
            tokio::spawn(async move { save_q.run(rx).await });
            let rx = shutdown_rx.clone();
            tokio::spawn(async move { snap_q.run(rx).await });
            let rx = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = zone.run(listener, rx).await {
                    tracing::warn!(error = %e, "zone exited");
                }
            });
        }

        for (zid, addr) in extra_zone_addrs {
            gw_cfg.zones.insert(*zid, addr.clone());
        }

        let validator = Arc::new(arena_shared::token::HsValidator::new(TOKEN_SECRET.as_bytes()));
        let (gateway, inbound) = Gateway::bind(gw_cfg, validator, Arc::new(Counters::default()))
            .await
            .context("gateway startup")?;
        let gateway_addr = gateway.local_addr()?.to_string();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = gateway.run(inbound, rx).await {
                tracing::warn!(error = %e, "gateway exited");
            }
        });

        Ok(Cluster {
            gateway_addr,
            store,
            shutdown: shutdown_tx,
        })
    }

    /// A valid development token for the given character/account id.
    pub fn mint_token(cid: u64) -> String {
        mint_hs256(
            TOKEN_SECRET.as_bytes(),
            &Claims {
                sub: cid.to_string(),
                exp: i64::MAX,
                ..Claims::default()
            },
        )
    }

    /// Connects, authenticates, and attaches a client playing `cid`.
    pub async fn client(&self, cid: u64) -> anyhow::Result<ClientPeer> {
        let mut peer = ClientPeer::connect(&self.gateway_addr, 1).await?;
        let token = Self::mint_token(cid);
        let nonce: u64 = rand::random();
        peer.handshake(nonce, &token).await?;
        peer.attach(cid, Interest::all_channels().bits())?;
        Ok(peer)
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Spawns a TCP listener that accepts gateway links but never answers;
/// stands in for a wedged zone.
pub async fn silent_zone() -> anyhow::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                // Swallow frames forever, never reply.
                let mut buf = vec![0u8; 4096];
                loop {
                    if stream.readable().await.is_err() {
                        return;
                    }
                    match stream.try_read(&mut buf) {
                        Ok(0) => return,
                        Ok(_) => {}
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                        Err(_) => return,
                    }
                }
            });
        }
    });
    Ok(addr)
}
