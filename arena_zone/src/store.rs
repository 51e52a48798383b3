//! Pluggable persistence stores.
//!
//! The store is authoritative across restarts: a zone loads character
//! state on attach and a full snapshot on startup. Backend choice is out
//! of scope beyond these two capabilities; the JSON store writes one file
//! per record with a tmp + rename to stay crash-consistent, and the
//! memory store backs tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use arena_shared::ids::{CharacterId, EntityId, ZoneId};
use arena_shared::replicate::EntityKind;

/// Persisted character record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterState {
    pub cid: CharacterId,
    pub zid: ZoneId,
    pub x: i16,
    pub y: i16,
    pub hp: u16,
    pub server_tick: u32,
}

/// One entity inside a zone snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntity {
    pub eid: EntityId,
    pub kind: u8,
    pub owner: CharacterId,
    pub x: i16,
    pub y: i16,
    pub vx: i16,
    pub vy: i16,
    pub hp: u16,
}

impl SnapshotEntity {
    pub fn entity_kind(&self) -> Option<EntityKind> {
        EntityKind::from_u8(self.kind)
    }
}

/// Full world capture for crash recovery; includes NPCs so a restarted
/// zone respawns deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    pub zid: ZoneId,
    pub server_tick: u32,
    pub entities: Vec<SnapshotEntity>,
}

#[async_trait]
pub trait CharacterStore: Send + Sync {
    async fn load_character(&self, cid: CharacterId) -> anyhow::Result<Option<CharacterState>>;
    async fn save_character(&self, st: &CharacterState) -> anyhow::Result<()>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load_snapshot(&self, zid: ZoneId) -> anyhow::Result<Option<ZoneSnapshot>>;
    async fn save_snapshot(&self, snap: &ZoneSnapshot) -> anyhow::Result<()>;
}

/// In-memory store for tests and ephemeral worlds.
#[derive(Debug, Default)]
pub struct MemStore {
    chars: Mutex<HashMap<CharacterId, CharacterState>>,
    snaps: Mutex<HashMap<ZoneId, ZoneSnapshot>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn character_count(&self) -> usize {
        self.chars.lock().expect("store lock").len()
    }
}

#[async_trait]
impl CharacterStore for MemStore {
    async fn load_character(&self, cid: CharacterId) -> anyhow::Result<Option<CharacterState>> {
        Ok(self.chars.lock().expect("store lock").get(&cid).copied())
    }

    async fn save_character(&self, st: &CharacterState) -> anyhow::Result<()> {
        self.chars.lock().expect("store lock").insert(st.cid, *st);
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for MemStore {
    async fn load_snapshot(&self, zid: ZoneId) -> anyhow::Result<Option<ZoneSnapshot>> {
        Ok(self.snaps.lock().expect("store lock").get(&zid).cloned())
    }

    async fn save_snapshot(&self, snap: &ZoneSnapshot) -> anyhow::Result<()> {
        self.snaps
            .lock()
            .expect("store lock")
            .insert(snap.zid, snap.clone());
        Ok(())
    }
}

/// One JSON file per character / per zone snapshot under a data directory.
#[derive(Debug, Clone)]
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    /// Creates the directory eagerly so startup fails fast on a bad path.
    pub async fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create store dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn char_path(&self, cid: CharacterId) -> PathBuf {
        self.dir.join(format!("char_{}.json", cid.0))
    }

    fn snap_path(&self, zid: ZoneId) -> PathBuf {
        self.dir.join(format!("zone_{}_snapshot.json", zid.0))
    }

    async fn write_atomic(&self, path: PathBuf, bytes: Vec<u8>) -> anyhow::Result<()> {
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("rename into {}", path.display()))?;
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        path: PathBuf,
    ) -> anyhow::Result<Option<T>> {
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let v = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parse {}", path.display()))?;
                Ok(Some(v))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }
}

#[async_trait]
impl CharacterStore for JsonStore {
    async fn load_character(&self, cid: CharacterId) -> anyhow::Result<Option<CharacterState>> {
        self.read_json(self.char_path(cid)).await
    }

    async fn save_character(&self, st: &CharacterState) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(st).context("serialize character")?;
        self.write_atomic(self.char_path(st.cid), bytes).await
    }
}

#[async_trait]
impl SnapshotStore for JsonStore {
    async fn load_snapshot(&self, zid: ZoneId) -> anyhow::Result<Option<ZoneSnapshot>> {
        self.read_json(self.snap_path(zid)).await
    }

    async fn save_snapshot(&self, snap: &ZoneSnapshot) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(snap).context("serialize snapshot")?;
        self.write_atomic(self.snap_path(snap.zid), bytes).await
    }
}
