//! The zone: one shard of the world.
//!
//! All simulation state is owned by a single task. The TCP reader feeds a
//! bounded frame channel; frames are drained at the top of each tick, the
//! tick body is pure in-memory work, and everything the tick produced is
//! written to the gateway link at the end. Persistence happens through the
//! coalescing queues only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use arena_shared::config::ZoneConfig;
use arena_shared::frame::{read_frame, write_frame, Frame};
use arena_shared::ids::{CharacterId, EntityId, SessionId, ZoneId};
use arena_shared::interest::Interest;
use arena_shared::messages::{ErrCode, LinkMsg};
use arena_shared::metrics::Counters;
use arena_shared::replicate::EntityKind;

use crate::aoi::{build_player_frames, AoiParams};
use crate::combat::resolve_skill;
use crate::grid::Grid;
use crate::history::PositionHistory;
use crate::npc::{run_ai, seed_world, NpcRegistry};
use crate::persist::{SaveQueue, SnapshotQueue};
use crate::player::Player;
use crate::store::{CharacterState, CharacterStore, SnapshotEntity, SnapshotStore, ZoneSnapshot};
use crate::world::World;

/// Depth of the inbound frame channel between the TCP reader and the tick.
pub const INBOUND_DEPTH: usize = 512;

/// Inputs more than this many client ticks ahead of expectation are dropped.
pub const MAX_INPUT_LEAD_TICKS: u32 = 64;

/// Origin-side record of a transfer awaiting commit or abort.
#[derive(Debug, Clone, Copy)]
pub struct PendingTransfer {
    pub target: ZoneId,
    pub started_tick: u32,
    pub cid: CharacterId,
    pub eid: EntityId,
    pub x: i16,
    pub y: i16,
    pub hp: u16,
}

pub struct Zone {
    cfg: ZoneConfig,
    world: World,
    grid: Grid,
    history: PositionHistory,
    players: HashMap<SessionId, Player>,
    transfers: HashMap<SessionId, PendingTransfer>,
    registry: NpcRegistry,
    server_tick: u32,
    rng: StdRng,

    char_store: Arc<dyn CharacterStore>,
    snap_store: Arc<dyn SnapshotStore>,
    save_q: Arc<SaveQueue>,
    snap_q: Arc<SnapshotQueue>,
    counters: Arc<Counters>,

    outbox: Vec<LinkMsg>,
}

impl Zone {
    /// Strict construction: configuration and collaborator problems are
    /// startup errors, never a panic after serving traffic.
    pub fn new(
        cfg: ZoneConfig,
        char_store: Arc<dyn CharacterStore>,
        snap_store: Arc<dyn SnapshotStore>,
        save_q: Arc<SaveQueue>,
        snap_q: Arc<SnapshotQueue>,
        counters: Arc<Counters>,
    ) -> anyhow::Result<Self> {
        cfg.validate()?;
        if cfg.transfer_target_zone == 0 {
            bail!("transfer target zone is unset");
        }
        if cfg.transfer_target_zone == cfg.zone_id {
            bail!("zone cannot transfer to itself");
        }
        let grid = Grid::new(cfg.cell_size);
        let history = PositionHistory::new(cfg.history_ticks);
        Ok(Self {
            cfg,
            world: World::new(),
            grid,
            history,
            players: HashMap::new(),
            transfers: HashMap::new(),
            registry: NpcRegistry::builtin(),
            server_tick: 0,
            rng: StdRng::from_entropy(),
            char_store,
            snap_store,
            save_q,
            snap_q,
            counters,
            outbox: Vec::new(),
        })
    }

    pub fn server_tick(&self) -> u32 {
        self.server_tick
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn player(&self, sid: SessionId) -> Option<&Player> {
        self.players.get(&sid)
    }

    pub fn pending_transfer(&self, sid: SessionId) -> Option<&PendingTransfer> {
        self.transfers.get(&sid)
    }

    /// Restores the world from the latest stored snapshot, or seeds a
    /// fresh NPC population. Runs before any gateway frame is accepted.
    /// Player entities are not restored; their sessions rejoin via attach.
    pub async fn rehydrate(&mut self) -> anyhow::Result<()> {
        match self.snap_store.load_snapshot(ZoneId(self.cfg.zone_id)).await? {
            Some(snap) => {
                let mut restored = 0usize;
                for ent in &snap.entities {
                    if ent.entity_kind() != Some(EntityKind::Npc) {
                        continue;
                    }
                    if self.world.spawn_at(
                        ent.eid, EntityKind::Npc, ent.owner, ent.x, ent.y, ent.vx, ent.vy, ent.hp,
                    ) {
                        restored += 1;
                    }
                }
                self.server_tick = snap.server_tick;
                info!(
                    zone = self.cfg.zone_id,
                    tick = snap.server_tick,
                    restored,
                    "world rehydrated from snapshot"
                );
            }
            None => {
                seed_world(
                    &mut self.world,
                    &self.registry,
                    self.cfg.npc_count,
                    &mut self.rng,
                );
                info!(
                    zone = self.cfg.zone_id,
                    npcs = self.cfg.npc_count,
                    "fresh world seeded"
                );
            }
        }
        Ok(())
    }

    /// Applies one decoded frame from the gateway.
    pub async fn handle_frame(&mut self, frame: Frame) {
        match LinkMsg::decode(&frame) {
            Ok(msg) => self.handle_msg(msg).await,
            Err(e) => {
                debug!(msg_type = frame.msg_type, error = %e, "undecodable frame");
                self.outbox.push(LinkMsg::Error {
                    sid: SessionId::default(),
                    code: ErrCode::BadMsg,
                    msg: "bad frame".to_string(),
                });
            }
        }
    }

    pub async fn handle_msg(&mut self, msg: LinkMsg) {
        match msg {
            LinkMsg::AttachPlayer {
                sid,
                cid,
                zid,
                interest,
            } => {
                if zid.0 != self.cfg.zone_id {
                    self.push_error(sid, ErrCode::BadMsg, "wrong zone");
                    return;
                }
                if self.players.contains_key(&sid) {
                    self.outbox.push(LinkMsg::AttachAck { sid });
                    return;
                }
                let stored = match self.char_store.load_character(cid).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(cid = cid.0, error = %e, "character load failed; seeding defaults");
                        None
                    }
                };
                let (x, y, hp) = stored
                    .map(|st| (st.x, st.y, st.hp))
                    .unwrap_or((0, 0, crate::world::default_hp(EntityKind::Player)));
                self.attach(sid, cid, interest, x, y, hp);
            }
            LinkMsg::AttachWithState {
                sid,
                cid,
                zid,
                interest,
                x,
                y,
                hp,
            } => {
                if zid.0 != self.cfg.zone_id {
                    self.push_error(sid, ErrCode::BadMsg, "wrong zone");
                    return;
                }
                if self.players.contains_key(&sid) {
                    self.outbox.push(LinkMsg::AttachAck { sid });
                    return;
                }
                self.attach(sid, cid, interest, x, y, hp);
            }
            LinkMsg::DetachPlayer { sid } => {
                let Some(player) = self.players.remove(&sid) else {
                    return;
                };
                if let Some(row) = self.world.row(player.eid) {
                    self.save_q.enqueue(CharacterState {
                        cid: player.cid,
                        zid: ZoneId(self.cfg.zone_id),
                        x: self.world.x[row],
                        y: self.world.y[row],
                        hp: self.world.hp[row],
                        server_tick: self.server_tick,
                    });
                }
                self.world.despawn(player.eid);
                self.history.remove(player.eid);
                self.transfers.remove(&sid);
                info!(sid = %sid, "player detached");
            }
            LinkMsg::PlayerInput { sid, tick, mx, my } => {
                let Some(player) = self.players.get_mut(&sid) else {
                    self.push_error(sid, ErrCode::NoPlayer, "no player");
                    return;
                };
                if player.transferring {
                    return;
                }
                if tick < player.next_client_tick
                    || tick > player.next_client_tick.saturating_add(MAX_INPUT_LEAD_TICKS)
                {
                    return;
                }
                let Some(row) = self.world.row(player.eid) else {
                    return;
                };
                self.world.vx[row] = mx;
                self.world.vy[row] = my;
                player.next_client_tick = tick + 1;
            }
            LinkMsg::PlayerAction {
                sid,
                tick,
                skill,
                target,
            } => {
                let Some(player) = self.players.get_mut(&sid) else {
                    self.push_error(sid, ErrCode::NoPlayer, "no player");
                    return;
                };
                if player.transferring {
                    return;
                }
                let attacker = player.eid;
                match resolve_skill(
                    &mut self.world,
                    &self.history,
                    attacker,
                    EntityId(target),
                    skill,
                    tick,
                    self.server_tick,
                    self.cfg.rewind_max_ticks,
                ) {
                    Ok(()) => {
                        if let Some(p) = self.players.get_mut(&sid) {
                            p.pending_events.push_back("hit".to_string());
                        }
                    }
                    Err(e) => {
                        self.push_error(sid, e.code(), &format!("{e:?}"));
                    }
                }
            }
            LinkMsg::TransferCommit { sid } => {
                let Some(t) = self.transfers.remove(&sid) else {
                    return;
                };
                self.save_q.enqueue(CharacterState {
                    cid: t.cid,
                    zid: ZoneId(self.cfg.zone_id),
                    x: t.x,
                    y: t.y,
                    hp: t.hp,
                    server_tick: self.server_tick,
                });
                self.world.despawn(t.eid);
                self.history.remove(t.eid);
                self.players.remove(&sid);
                self.counters
                    .transfers_committed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                info!(sid = %sid, target = t.target.0, "transfer committed; player handed off");
            }
            LinkMsg::TransferAbort { sid } => {
                self.transfers.remove(&sid);
                if let Some(player) = self.players.get_mut(&sid) {
                    player.transferring = false;
                }
                self.counters
                    .transfers_aborted
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!(sid = %sid, "transfer aborted; player resumes here");
            }
            // Zone-originated types arriving inbound are a protocol error.
            LinkMsg::AttachAck { sid }
            | LinkMsg::Error { sid, .. }
            | LinkMsg::Replicate { sid, .. }
            | LinkMsg::TransferPrepare { sid, .. } => {
                self.push_error(sid, ErrCode::BadMsg, "unexpected message direction");
            }
        }
    }

    fn attach(&mut self, sid: SessionId, cid: CharacterId, interest: u32, x: i16, y: i16, hp: u16) {
        let eid = self.world.spawn_with_hp(EntityKind::Player, cid, x, y, hp);
        let interest = Interest::from_bits_truncate(interest);
        self.players.insert(sid, Player::new(sid, cid, eid, interest));
        self.outbox.push(LinkMsg::AttachAck { sid });
        info!(sid = %sid, cid = cid.0, eid = eid.0, x, y, hp, "player attached");
    }

    fn push_error(&mut self, sid: SessionId, code: ErrCode, msg: &str) {
        self.outbox.push(LinkMsg::Error {
            sid,
            code,
            msg: msg.to_string(),
        });
    }

    /// One simulation tick. Pure in-memory work; returns the frames to
    /// emit on the gateway link.
    pub fn step(&mut self) -> Vec<LinkMsg> {
        let t0 = Instant::now();
        self.server_tick += 1;

        run_ai(
            &mut self.world,
            &self.registry,
            self.cfg.ai_budget_per_tick,
            &mut self.rng,
        );
        self.world.step_physics();
        self.grid.rebuild(&self.world);
        for r in 0..self.world.ids.len() {
            self.history
                .record(self.world.ids[r], self.server_tick, self.world.x[r], self.world.y[r]);
        }

        self.sweep_transfers();
        self.detect_transfers();
        self.build_replication();

        if self.server_tick % self.cfg.save_every_ticks == 0 {
            self.enqueue_dirty_saves();
        }
        if self.server_tick % self.cfg.snapshot_every_ticks == 0 {
            self.snap_q.enqueue(self.snapshot());
        }

        self.counters
            .entities
            .store(self.world.len() as u64, std::sync::atomic::Ordering::Relaxed);
        self.counters
            .players
            .store(self.players.len() as u64, std::sync::atomic::Ordering::Relaxed);
        self.counters.observe_tick(t0.elapsed());

        std::mem::take(&mut self.outbox)
    }

    /// Aborts transfers that outlived their tick budget; the gateway's own
    /// timeout normally wins, this is the local backstop.
    fn sweep_transfers(&mut self) {
        let timeout = self.cfg.transfer_timeout_ticks;
        let tick = self.server_tick;
        let stale: Vec<SessionId> = self
            .transfers
            .iter()
            .filter(|(_, t)| tick.saturating_sub(t.started_tick) > timeout)
            .map(|(&sid, _)| sid)
            .collect();
        for sid in stale {
            self.transfers.remove(&sid);
            if let Some(player) = self.players.get_mut(&sid) {
                player.transferring = false;
            }
            warn!(sid = %sid, "pending transfer timed out locally");
        }
    }

    /// Starts a transfer for every player that crossed the boundary this
    /// tick: freeze movement, persist, and hand the frozen state to the
    /// gateway for the two-phase commit.
    fn detect_transfers(&mut self) {
        let boundary = self.cfg.transfer_boundary_x;
        let target = ZoneId(self.cfg.transfer_target_zone);
        let zid = ZoneId(self.cfg.zone_id);
        let tick = self.server_tick;

        let mut sids: Vec<SessionId> = self.players.keys().copied().collect();
        sids.sort_unstable_by_key(|s| s.0);
        for sid in sids {
            let player = self.players.get_mut(&sid).expect("sid from keys");
            if player.transferring {
                continue;
            }
            let Some(row) = self.world.row(player.eid) else {
                continue;
            };
            let x = self.world.x[row];
            let crossed = if boundary >= 0 { x > boundary } else { x < boundary };
            if !crossed {
                continue;
            }

            self.world.vx[row] = 0;
            self.world.vy[row] = 0;
            player.transferring = true;
            let (y, hp) = (self.world.y[row], self.world.hp[row]);
            let (cid, eid, interest) = (player.cid, player.eid, player.interest);

            self.save_q.enqueue(CharacterState {
                cid,
                zid,
                x,
                y,
                hp,
                server_tick: tick,
            });
            self.world.dirty[row] = false;
            self.transfers.insert(
                sid,
                PendingTransfer {
                    target,
                    started_tick: tick,
                    cid,
                    eid,
                    x,
                    y,
                    hp,
                },
            );
            self.outbox.push(LinkMsg::TransferPrepare {
                sid,
                cid,
                target,
                interest: interest.bits(),
                x,
                y,
                hp,
            });
            self.counters
                .transfers_started
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            info!(sid = %sid, cid = cid.0, x, target = target.0, "transfer prepared");
        }
    }

    fn build_replication(&mut self) {
        let params = AoiParams {
            aoi_radius: self.cfg.aoi_radius,
            budget_bytes: self.cfg.budget_bytes,
            state_tick: self.server_tick % self.cfg.state_every_ticks == 0,
        };
        let tick = self.server_tick;

        let mut sids: Vec<SessionId> = self.players.keys().copied().collect();
        sids.sort_unstable_by_key(|s| s.0);
        for sid in sids {
            let player = self.players.get_mut(&sid).expect("sid from keys");
            if player.transferring {
                continue;
            }
            for (channel, events) in build_player_frames(&self.world, &self.grid, player, &params)
            {
                self.outbox.push(LinkMsg::Replicate {
                    sid,
                    server_tick: tick,
                    channel,
                    events,
                });
            }
        }
    }

    fn enqueue_dirty_saves(&mut self) {
        let zid = ZoneId(self.cfg.zone_id);
        let tick = self.server_tick;
        for player in self.players.values() {
            let Some(row) = self.world.row(player.eid) else {
                continue;
            };
            if !self.world.dirty[row] {
                continue;
            }
            self.save_q.enqueue(CharacterState {
                cid: player.cid,
                zid,
                x: self.world.x[row],
                y: self.world.y[row],
                hp: self.world.hp[row],
                server_tick: tick,
            });
            self.world.dirty[row] = false;
        }
    }

    fn snapshot(&self) -> ZoneSnapshot {
        let w = &self.world;
        ZoneSnapshot {
            zid: ZoneId(self.cfg.zone_id),
            server_tick: self.server_tick,
            entities: (0..w.ids.len())
                .map(|r| SnapshotEntity {
                    eid: w.ids[r],
                    kind: w.kind[r] as u8,
                    owner: w.owner[r],
                    x: w.x[r],
                    y: w.y[r],
                    vx: w.vx[r],
                    vy: w.vy[r],
                    hp: w.hp[r],
                })
                .collect(),
        }
    }

    /// Final pass on cancellation: flush dirty characters and a closing
    /// snapshot, draining whatever is still in the inbound channel.
    async fn shutdown_pass(&mut self, rx: &mut mpsc::Receiver<Frame>) {
        while let Ok(frame) = rx.try_recv() {
            self.handle_frame(frame).await;
        }
        self.enqueue_dirty_saves();
        self.snap_q.enqueue(self.snapshot());
        self.outbox.clear();
        info!(zone = self.cfg.zone_id, tick = self.server_tick, "zone shut down");
    }

    /// Serves the zone on an already-bound listener until shutdown.
    /// Accepts exactly one gateway connection; losing it is fatal to this
    /// instance.
    pub async fn run(
        mut self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        self.rehydrate().await?;
        info!(
            zone = self.cfg.zone_id,
            listen = %listener.local_addr().context("listener addr")?,
            tick_hz = self.cfg.tick_hz,
            "zone up"
        );

        let (stream, peer) = tokio::select! {
            res = listener.accept() => res.context("gateway link accept")?,
            _ = shutdown.changed() => {
                let (_tx, mut empty) = mpsc::channel::<Frame>(1);
                self.shutdown_pass(&mut empty).await;
                return Ok(());
            }
        };
        stream.set_nodelay(true).ok();
        info!(%peer, "gateway link established");

        let (read_half, write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Frame>(INBOUND_DEPTH);
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                match read_frame(&mut reader).await {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "gateway link reader stopped");
                        return;
                    }
                }
            }
        });

        let mut writer = BufWriter::new(write_half);
        let mut interval = tokio::time::interval(self.cfg.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Drain inbound frames accumulated since the last tick.
                    loop {
                        match rx.try_recv() {
                            Ok(frame) => self.handle_frame(frame).await,
                            Err(mpsc::error::TryRecvError::Empty) => break,
                            Err(mpsc::error::TryRecvError::Disconnected) => {
                                bail!("gateway link closed");
                            }
                        }
                    }
                    let out = self.step();
                    for msg in &out {
                        let (msg_type, payload) = msg.encode();
                        if matches!(msg, LinkMsg::Replicate { .. }) {
                            self.counters.add_rep_bytes(payload.len());
                        }
                        write_frame(&mut writer, msg_type, &payload)
                            .await
                            .context("gateway link write")?;
                    }
                    writer.flush().await.context("gateway link flush")?;
                }
                _ = shutdown.changed() => {
                    self.shutdown_pass(&mut rx).await;
                    return Ok(());
                }
            }
        }
    }
}
