//! Configuration types.
//!
//! Loaded from JSON strings/files (file IO left to the binaries) with
//! per-field defaults, then validated strictly: a missing zone map, a zero
//! tick rate, or an empty secret is a startup error, never a late panic.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Gateway process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// UDP listen address, e.g. `127.0.0.1:7777`.
    pub udp_addr: String,
    /// Zone id → TCP address of that zone's gateway link.
    pub zones: HashMap<u32, String>,
    /// Protocol version; packets with any other value are dropped.
    #[serde(default = "default_proto_version")]
    pub proto_version: u16,
    /// Sessions idle past this are detached and removed.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// A transfer with no AttachAck within this window is aborted.
    #[serde(default = "default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
    /// Outbound replication pacing per session, bytes per second.
    #[serde(default = "default_send_rate_bytes")]
    pub send_rate_bytes: u32,
    /// Outbound pacing burst cap in bytes.
    #[serde(default = "default_send_burst_bytes")]
    pub send_burst_bytes: u32,
    /// Cap on in-flight reliable bytes per session.
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,
    /// Secret for the stateless handshake cookie.
    #[serde(default)]
    pub cookie_secret: String,
    /// Shared secret for the HS256 token validator.
    #[serde(default)]
    pub token_secret: String,
    /// Pre-auth limiter: refill per second.
    #[serde(default = "default_preauth_rate")]
    pub preauth_rate: u32,
    /// Pre-auth limiter: burst capacity.
    #[serde(default = "default_preauth_burst")]
    pub preauth_burst: u32,
    /// Pre-auth limiter state is pruned after this idle window.
    #[serde(default = "default_limiter_idle_ms")]
    pub limiter_idle_ms: u64,
}

fn default_proto_version() -> u16 {
    1
}
fn default_idle_timeout_ms() -> u64 {
    30_000
}
fn default_transfer_timeout_ms() -> u64 {
    5_000
}
fn default_send_rate_bytes() -> u32 {
    16 * 1024
}
fn default_send_burst_bytes() -> u32 {
    8 * 1024
}
fn default_max_pending_bytes() -> usize {
    64 * 1024
}
fn default_preauth_rate() -> u32 {
    1
}
fn default_preauth_burst() -> u32 {
    5
}
fn default_limiter_idle_ms() -> u64 {
    60_000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            udp_addr: "127.0.0.1:7777".to_string(),
            zones: HashMap::new(),
            proto_version: default_proto_version(),
            idle_timeout_ms: default_idle_timeout_ms(),
            transfer_timeout_ms: default_transfer_timeout_ms(),
            send_rate_bytes: default_send_rate_bytes(),
            send_burst_bytes: default_send_burst_bytes(),
            max_pending_bytes: default_max_pending_bytes(),
            cookie_secret: String::new(),
            token_secret: String::new(),
            preauth_rate: default_preauth_rate(),
            preauth_burst: default_preauth_burst(),
            limiter_idle_ms: default_limiter_idle_ms(),
        }
    }
}

impl GatewayConfig {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.udp_addr.is_empty() {
            bail!("missing udp address");
        }
        if self.zones.is_empty() {
            bail!("no zones configured");
        }
        if self.zones.keys().any(|&z| z == 0) {
            bail!("zone id 0 is reserved");
        }
        if self.cookie_secret.is_empty() {
            bail!("missing cookie secret");
        }
        if self.token_secret.is_empty() {
            bail!("missing token secret");
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn limiter_idle(&self) -> Duration {
        Duration::from_millis(self.limiter_idle_ms)
    }
}

/// Zone process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// TCP listen address for the gateway link.
    pub listen_addr: String,
    /// Optional plaintext metrics endpoint; disabled when absent.
    #[serde(default)]
    pub metrics_addr: Option<String>,
    pub zone_id: u32,
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    #[serde(default = "default_aoi_radius")]
    pub aoi_radius: i16,
    #[serde(default = "default_cell_size")]
    pub cell_size: i16,
    /// Per-session replication byte budget per tick.
    #[serde(default = "default_budget_bytes")]
    pub budget_bytes: usize,
    #[serde(default = "default_state_every_ticks")]
    pub state_every_ticks: u32,
    #[serde(default = "default_save_every_ticks")]
    pub save_every_ticks: u32,
    #[serde(default = "default_snapshot_every_ticks")]
    pub snapshot_every_ticks: u32,
    /// NPC decisions evaluated per tick.
    #[serde(default = "default_ai_budget")]
    pub ai_budget_per_tick: usize,
    /// NPCs seeded into a fresh world.
    #[serde(default = "default_npc_count")]
    pub npc_count: usize,
    /// Zone characters are handed to when they cross the boundary.
    #[serde(default)]
    pub transfer_target_zone: u32,
    /// Positive boundary triggers on X > b, negative on X < b.
    #[serde(default = "default_transfer_boundary_x")]
    pub transfer_boundary_x: i16,
    #[serde(default = "default_transfer_timeout_ticks")]
    pub transfer_timeout_ticks: u32,
    /// Position-history ring length per entity.
    #[serde(default = "default_history_ticks")]
    pub history_ticks: usize,
    /// Oldest action tick accepted for lag compensation, relative to now.
    #[serde(default = "default_rewind_max_ticks")]
    pub rewind_max_ticks: u32,
    /// Directory for the JSON character and snapshot stores.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_tick_hz() -> u32 {
    20
}
fn default_aoi_radius() -> i16 {
    25
}
fn default_cell_size() -> i16 {
    8
}
fn default_budget_bytes() -> usize {
    900
}
fn default_state_every_ticks() -> u32 {
    5
}
fn default_save_every_ticks() -> u32 {
    100
}
fn default_snapshot_every_ticks() -> u32 {
    200
}
fn default_ai_budget() -> usize {
    64
}
fn default_npc_count() -> usize {
    8
}
fn default_transfer_boundary_x() -> i16 {
    100
}
fn default_transfer_timeout_ticks() -> u32 {
    100
}
fn default_history_ticks() -> usize {
    32
}
fn default_rewind_max_ticks() -> u32 {
    5
}
fn default_data_dir() -> String {
    "data".to_string()
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:4000".to_string(),
            metrics_addr: None,
            zone_id: 1,
            tick_hz: default_tick_hz(),
            aoi_radius: default_aoi_radius(),
            cell_size: default_cell_size(),
            budget_bytes: default_budget_bytes(),
            state_every_ticks: default_state_every_ticks(),
            save_every_ticks: default_save_every_ticks(),
            snapshot_every_ticks: default_snapshot_every_ticks(),
            ai_budget_per_tick: default_ai_budget(),
            npc_count: default_npc_count(),
            transfer_target_zone: 0,
            transfer_boundary_x: default_transfer_boundary_x(),
            transfer_timeout_ticks: default_transfer_timeout_ticks(),
            history_ticks: default_history_ticks(),
            rewind_max_ticks: default_rewind_max_ticks(),
            data_dir: default_data_dir(),
        }
    }
}

impl ZoneConfig {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listen_addr.is_empty() {
            bail!("missing listen address");
        }
        if self.zone_id == 0 {
            bail!("zone id 0 is reserved");
        }
        if self.tick_hz == 0 {
            bail!("tick rate must be nonzero");
        }
        if self.cell_size <= 0 {
            bail!("cell size must be positive");
        }
        if self.history_ticks == 0 {
            bail!("history ring must hold at least one tick");
        }
        if self.state_every_ticks == 0 || self.save_every_ticks == 0 || self.snapshot_every_ticks == 0
        {
            bail!("cadence intervals must be nonzero");
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_hz as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_config_defaults_from_json() {
        let cfg = GatewayConfig::from_json_str(
            r#"{
                "udp_addr": "127.0.0.1:7777",
                "zones": {"1": "127.0.0.1:4001", "2": "127.0.0.1:4002"},
                "cookie_secret": "c",
                "token_secret": "t"
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.proto_version, 1);
        assert_eq!(cfg.idle_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.zones.len(), 2);
        cfg.validate().unwrap();
    }

    #[test]
    fn gateway_config_requires_zones_and_secrets() {
        let mut cfg = GatewayConfig::default();
        assert!(cfg.validate().is_err());
        cfg.zones.insert(1, "127.0.0.1:4001".to_string());
        assert!(cfg.validate().is_err());
        cfg.cookie_secret = "c".to_string();
        cfg.token_secret = "t".to_string();
        cfg.validate().unwrap();
    }

    #[test]
    fn zone_config_defaults_and_validation() {
        let cfg = ZoneConfig::from_json_str(
            r#"{"listen_addr": "127.0.0.1:4001", "zone_id": 1}"#,
        )
        .unwrap();
        assert_eq!(cfg.tick_hz, 20);
        assert_eq!(cfg.budget_bytes, 900);
        assert_eq!(cfg.aoi_radius, 25);
        cfg.validate().unwrap();

        let mut bad = cfg.clone();
        bad.tick_hz = 0;
        assert!(bad.validate().is_err());
        let mut bad = cfg;
        bad.zone_id = 0;
        assert!(bad.validate().is_err());
    }
}
