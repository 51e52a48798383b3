//! The gateway process core.
//!
//! One UDP socket faces clients; one framed TCP link per zone faces the
//! world. Pre-auth traffic is stateless (cookie handshake) and rate
//! limited per source address; authenticated traffic rides the reliable /
//! unreliable channels and is routed to the session's current zone. The
//! gateway also drives the transfer two-phase commit and the three
//! sweepers (retransmit, idle cleanup, transfer timeout).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use arena_shared::config::GatewayConfig;
use arena_shared::cookie::CookieMinter;
use arena_shared::ids::{AccountId, SessionId, ZoneId};
use arena_shared::interest::Interest;
use arena_shared::limiter::LimiterTable;
use arena_shared::messages::LinkMsg;
use arena_shared::metrics::Counters;
use arena_shared::packet::{
    decode_action, decode_auth, decode_hello_attach, decode_hello_nonce, decode_input,
    decode_packet, encode_challenge, encode_packet, Challenge, Channel, Packet, PacketType,
};
use arena_shared::replicate::RepEvent;
use arena_shared::token::TokenValidator;

use crate::link::ZoneLink;
use crate::session::{InflightTransfer, Session, SessionTable};

/// Cadence of the reliable retransmission sweep.
const RETRANSMIT_SWEEP: Duration = Duration::from_millis(50);
/// Cadence of the idle-session cleanup sweep.
const CLEANUP_SWEEP: Duration = Duration::from_secs(2);
/// Cadence of the transfer-timeout sweep.
const TRANSFER_SWEEP: Duration = Duration::from_millis(200);
/// UDP read deadline so cancellation is honored promptly.
const UDP_READ_DEADLINE: Duration = Duration::from_millis(500);

pub struct Gateway {
    cfg: GatewayConfig,
    udp: Arc<UdpSocket>,
    minter: CookieMinter,
    validator: Arc<dyn TokenValidator>,
    links: HashMap<ZoneId, ZoneLink>,
    default_zone: ZoneId,
    table: Mutex<SessionTable>,
    limiters: Mutex<LimiterTable<SocketAddr>>,
    counters: Arc<Counters>,
}

impl Gateway {
    /// Binds the UDP socket and dials every configured zone. Any failure
    /// here is a startup error.
    pub async fn bind(
        cfg: GatewayConfig,
        validator: Arc<dyn TokenValidator>,
        counters: Arc<Counters>,
    ) -> anyhow::Result<(Arc<Gateway>, mpsc::Receiver<(ZoneId, LinkMsg)>)> {
        cfg.validate()?;
        let udp = UdpSocket::bind(&cfg.udp_addr)
            .await
            .with_context(|| format!("udp bind {}", cfg.udp_addr))?;

        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let mut links = HashMap::new();
        for (&zid, addr) in &cfg.zones {
            let link = ZoneLink::connect(ZoneId(zid), addr, inbound_tx.clone()).await?;
            links.insert(ZoneId(zid), link);
        }
        let default_zone = ZoneId(
            cfg.zones
                .keys()
                .min()
                .copied()
                .context("no zones configured")?,
        );

        let minter = CookieMinter::new(cfg.cookie_secret.as_bytes());
        let limiters = LimiterTable::new(cfg.preauth_burst, cfg.preauth_rate, cfg.limiter_idle());

        let gw = Arc::new(Gateway {
            cfg,
            udp: Arc::new(udp),
            minter,
            validator,
            links,
            default_zone,
            table: Mutex::new(SessionTable::default()),
            limiters: Mutex::new(limiters),
            counters,
        });
        Ok((gw, inbound_rx))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.udp.local_addr()?)
    }

    /// Runs the gateway until shutdown: spawns the zone-message pump and
    /// the sweepers, then serves the UDP read loop on this task.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<(ZoneId, LinkMsg)>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!(
            udp = %self.local_addr()?,
            zones = self.links.len(),
            proto = self.cfg.proto_version,
            "gateway up"
        );

        {
            let gw = self.clone();
            let mut stop = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        msg = inbound.recv() => match msg {
                            Some((zid, msg)) => gw.handle_zone_msg(zid, msg),
                            None => return,
                        },
                        _ = stop.changed() => return,
                    }
                }
            });
        }
        self.spawn_sweeper(RETRANSMIT_SWEEP, shutdown.clone(), Gateway::retransmit_sweep);
        self.spawn_sweeper(CLEANUP_SWEEP, shutdown.clone(), Gateway::cleanup_sweep);
        self.spawn_sweeper(TRANSFER_SWEEP, shutdown.clone(), Gateway::transfer_sweep);

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("gateway shutting down");
                    return Ok(());
                }
                res = tokio::time::timeout(UDP_READ_DEADLINE, self.udp.recv_from(&mut buf)) => {
                    match res {
                        Ok(Ok((n, remote))) => self.handle_packet(remote, &buf[..n]).await,
                        Ok(Err(e)) => return Err(e).context("udp recv"),
                        Err(_) => {} // deadline; loop to honor shutdown
                    }
                }
            }
        }
    }

    fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
        f: fn(&Gateway),
    ) {
        let gw = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = tick.tick() => f(&gw),
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // ─── Client-facing packet handling ───

    async fn handle_packet(&self, remote: SocketAddr, data: &[u8]) {
        let pkt = match decode_packet(data) {
            Ok(p) => p,
            Err(_) => return, // silent drop on framing errors
        };
        if pkt.proto != self.cfg.proto_version {
            return;
        }
        self.counters
            .packets_in
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let sid = self
            .table
            .lock()
            .expect("session lock")
            .sid_by_remote(&remote);
        match sid {
            Some(sid) => self.handle_session_packet(sid, remote, pkt),
            None => self.handle_preauth(remote, pkt).await,
        }
    }

    /// Stateless pre-session path. Only the plaintext handshake types are
    /// processed; everything else from an unknown address is dropped.
    async fn handle_preauth(&self, remote: SocketAddr, pkt: Packet) {
        let now = Instant::now();
        let allowed = self
            .limiters
            .lock()
            .expect("limiter lock")
            .allow(remote, 1.0, now);

        match pkt.packet_type() {
            Some(PacketType::Hello) => {
                if !allowed {
                    return;
                }
                let Ok(hello) = decode_hello_nonce(&pkt.payload) else {
                    return;
                };
                let bucket = CookieMinter::current_bucket();
                let cookie = self.minter.mint(remote, hello.nonce, bucket);
                self.send_plain(
                    remote,
                    PacketType::Challenge,
                    encode_challenge(Challenge { bucket, cookie }),
                );
            }
            Some(PacketType::Auth) => {
                if !allowed {
                    self.send_plain(
                        remote,
                        PacketType::AuthResp,
                        Bytes::from_static(b"TOO_MANY_ATTEMPTS"),
                    );
                    return;
                }
                let Ok(auth) = decode_auth(&pkt.payload) else {
                    return;
                };
                if !self
                    .minter
                    .verify(remote, auth.nonce, auth.bucket, &auth.cookie)
                {
                    self.send_plain(
                        remote,
                        PacketType::AuthResp,
                        Bytes::from_static(b"BAD_COOKIE"),
                    );
                    return;
                }
                let claims = match self.validator.validate(&auth.token).await {
                    Ok(c) => c,
                    Err(e) => {
                        debug!(%remote, error = %e, "token rejected");
                        self.send_plain(
                            remote,
                            PacketType::AuthResp,
                            Bytes::from_static(b"INVALID_TOKEN"),
                        );
                        return;
                    }
                };

                let sid = SessionId::random();
                let account = AccountId(claims.sub.parse().unwrap_or(0));
                let sess = Session::new(
                    sid,
                    remote,
                    account,
                    self.cfg.max_pending_bytes,
                    self.cfg.send_burst_bytes,
                    self.cfg.send_rate_bytes,
                    now,
                );
                let mut table = self.table.lock().expect("session lock");
                table.insert(sess);
                if let Some(sess) = table.get_mut(sid) {
                    let hello = format!("HELLO_OK sid={sid}");
                    self.push_reliable(sess, PacketType::Text, Bytes::from(hello.into_bytes()));
                }
                drop(table);
                info!(%remote, sid = %sid, account = account.0, "session authenticated");
            }
            _ => {} // authentication gate
        }
    }

    fn handle_session_packet(&self, sid: SessionId, remote: SocketAddr, pkt: Packet) {
        let now = Instant::now();
        let mut table = self.table.lock().expect("session lock");
        let Some(sess) = table.get_mut(sid) else {
            return;
        };
        sess.last_heard = now;
        sess.remote = remote;
        sess.peer.on_acks(pkt.ack, pkt.ack_bits, now);

        let reliable = pkt.channel() == Some(Channel::Reliable);
        if reliable {
            // Duplicates are tolerated; handlers below are idempotent.
            sess.peer.update_recv(pkt.seq);
        }

        match pkt.packet_type() {
            Some(PacketType::Hello) => {
                // Reliable attach hello: character id + interest mask.
                if !reliable {
                    return;
                }
                let Ok(hello) = decode_hello_attach(&pkt.payload) else {
                    return;
                };
                sess.cid = arena_shared::ids::CharacterId(hello.cid);
                sess.interest = Interest::from_bits_truncate(hello.interest);
                if sess.zone.0 == 0 {
                    sess.zone = self.default_zone;
                }
                let msg = LinkMsg::AttachPlayer {
                    sid,
                    cid: sess.cid,
                    zid: sess.zone,
                    interest: sess.interest.bits(),
                };
                let zone = sess.zone;
                self.ack_only(sess);
                drop(table);
                self.send_to_zone(zone, msg);
            }
            Some(PacketType::Input) => {
                if sess.zone.0 == 0 {
                    return;
                }
                let Ok(input) = decode_input(&pkt.payload) else {
                    return;
                };
                let msg = LinkMsg::PlayerInput {
                    sid,
                    tick: input.tick,
                    mx: input.mx,
                    my: input.my,
                };
                let zone = sess.zone;
                drop(table);
                self.send_to_zone(zone, msg);
            }
            Some(PacketType::Action) => {
                if !reliable || sess.zone.0 == 0 {
                    return;
                }
                let Ok(action) = decode_action(&pkt.payload) else {
                    return;
                };
                let msg = LinkMsg::PlayerAction {
                    sid,
                    tick: action.tick,
                    skill: action.skill,
                    target: action.target,
                };
                let zone = sess.zone;
                self.ack_only(sess);
                drop(table);
                self.send_to_zone(zone, msg);
            }
            _ => {
                if reliable {
                    self.ack_only(sess);
                }
            }
        }
    }

    // ─── Zone-facing message handling ───

    fn handle_zone_msg(&self, from: ZoneId, msg: LinkMsg) {
        match msg {
            LinkMsg::AttachAck { sid } => {
                let mut commit_to: Option<ZoneId> = None;
                {
                    let mut table = self.table.lock().expect("session lock");
                    if let Some(inf) = table.inflight.get(&sid).copied() {
                        if inf.to == from {
                            table.inflight.remove(&sid);
                            commit_to = Some(inf.from);
                            if let Some(sess) = table.get_mut(sid) {
                                self.push_reliable(
                                    sess,
                                    PacketType::Text,
                                    Bytes::from_static(b"XFER_COMMIT"),
                                );
                            }
                        }
                    }
                }
                if let Some(origin) = commit_to {
                    self.send_to_zone(origin, LinkMsg::TransferCommit { sid });
                    self.counters
                        .transfers_committed
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    info!(sid = %sid, from = origin.0, to = from.0, "transfer committed");
                }
            }
            LinkMsg::Replicate {
                sid,
                server_tick,
                channel: _,
                events,
            } => {
                let text = format_rep_lines(server_tick, &events);
                if text.is_empty() {
                    return;
                }
                let mut table = self.table.lock().expect("session lock");
                let Some(sess) = table.get_mut(sid) else {
                    return;
                };
                // Unreliable channel: pacing drops are acceptable loss.
                if !sess.send_bucket.allow(text.len() as f64, Instant::now()) {
                    return;
                }
                self.counters.add_rep_bytes(text.len());
                self.push_unreliable(sess, PacketType::Rep, Bytes::from(text.into_bytes()));
            }
            LinkMsg::TransferPrepare {
                sid,
                cid,
                target,
                interest,
                x,
                y,
                hp,
            } => {
                self.handle_transfer_prepare(from, sid, cid, target, interest, x, y, hp);
            }
            LinkMsg::Error { sid, code, msg } => {
                warn!(zone = from.0, ?code, msg = %msg, "zone error");
                if sid != SessionId::default() {
                    let mut table = self.table.lock().expect("session lock");
                    if let Some(sess) = table.get_mut(sid) {
                        self.push_reliable(
                            sess,
                            PacketType::Text,
                            Bytes::from(format!("ERR code={} {msg}", code as u16).into_bytes()),
                        );
                    }
                }
            }
            other => {
                warn!(zone = from.0, ?other, "unexpected message from zone");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_transfer_prepare(
        &self,
        from: ZoneId,
        sid: SessionId,
        cid: arena_shared::ids::CharacterId,
        target: ZoneId,
        interest: u32,
        x: i16,
        y: i16,
        hp: u16,
    ) {
        if !self.links.contains_key(&target) {
            warn!(sid = %sid, target = target.0, "transfer rejected: unknown target zone");
            self.send_to_zone(from, LinkMsg::TransferAbort { sid });
            let mut table = self.table.lock().expect("session lock");
            if let Some(sess) = table.get_mut(sid) {
                self.push_reliable(
                    sess,
                    PacketType::Text,
                    Bytes::from_static(b"XFER_ABORT unknown_zone"),
                );
            }
            return;
        }

        {
            let mut table = self.table.lock().expect("session lock");
            if table.inflight.contains_key(&sid) {
                debug!(sid = %sid, "duplicate transfer prepare ignored");
                return;
            }
            let Some(sess) = table.get_mut(sid) else {
                // Session died between zone tick and here; tell the origin
                // to keep the character.
                drop(table);
                self.send_to_zone(from, LinkMsg::TransferAbort { sid });
                return;
            };
            // Reroute immediately: inputs from here on go to the target.
            sess.zone = target;
            self.push_reliable(
                sess,
                PacketType::Text,
                Bytes::from(format!("XFER_PREP {}->{}", from.0, target.0).into_bytes()),
            );
            table.inflight.insert(
                sid,
                InflightTransfer {
                    from,
                    to: target,
                    started_at: Instant::now(),
                },
            );
        }

        self.send_to_zone(
            target,
            LinkMsg::AttachWithState {
                sid,
                cid,
                zid: target,
                interest,
                x,
                y,
                hp,
            },
        );
        self.counters
            .transfers_started
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!(sid = %sid, from = from.0, to = target.0, x, y, "transfer prepared");
    }

    // ─── Sweepers ───

    /// Resends due reliable packets. Pending entries are collected under
    /// the lock; the socket writes happen outside it.
    fn retransmit_sweep(&self) {
        let now = Instant::now();
        let mut to_send: Vec<(SocketAddr, Bytes)> = Vec::new();
        {
            let mut table = self.table.lock().expect("session lock");
            for sess in table.sessions.values_mut() {
                let (resend, dropped) = sess.peer.due_retransmits(now);
                for (_, pkt) in resend {
                    to_send.push((sess.remote, pkt));
                }
                for seq in dropped {
                    warn!(sid = %sess.sid, seq, "reliable packet abandoned after max retries");
                }
            }
        }
        for (remote, pkt) in to_send {
            self.raw_send(&pkt, remote);
        }
    }

    /// Detaches idle sessions and prunes stale limiter state.
    fn cleanup_sweep(&self) {
        let now = Instant::now();
        let mut detach: Vec<(ZoneId, SessionId)> = Vec::new();
        {
            let mut table = self.table.lock().expect("session lock");
            for sid in table.idle_sids(now, self.cfg.idle_timeout()) {
                if let Some(sess) = table.remove(sid) {
                    info!(sid = %sid, "session idle; detaching");
                    if sess.zone.0 != 0 {
                        detach.push((sess.zone, sid));
                    }
                }
            }
        }
        for (zone, sid) in detach {
            self.send_to_zone(zone, LinkMsg::DetachPlayer { sid });
        }
        let pruned = self
            .limiters
            .lock()
            .expect("limiter lock")
            .prune(now);
        if pruned > 0 {
            debug!(pruned, "limiter state pruned");
        }
    }

    /// Aborts transfers whose AttachAck never arrived, reverting the
    /// session's routing to the origin zone.
    fn transfer_sweep(&self) {
        let now = Instant::now();
        let mut aborts: Vec<(ZoneId, SessionId)> = Vec::new();
        {
            let mut table = self.table.lock().expect("session lock");
            for sid in table.expired_transfers(now, self.cfg.transfer_timeout()) {
                let Some(inf) = table.inflight.remove(&sid) else {
                    continue;
                };
                if let Some(sess) = table.get_mut(sid) {
                    sess.zone = inf.from;
                    self.push_reliable(
                        sess,
                        PacketType::Text,
                        Bytes::from_static(b"XFER_ABORT timeout"),
                    );
                }
                aborts.push((inf.from, sid));
            }
        }
        for (origin, sid) in aborts {
            warn!(sid = %sid, origin = origin.0, "transfer timed out; aborting");
            self.send_to_zone(origin, LinkMsg::TransferAbort { sid });
            self.counters
                .transfers_aborted
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    // ─── Send helpers (all non-blocking) ───

    fn send_to_zone(&self, zone: ZoneId, msg: LinkMsg) {
        match self.links.get(&zone) {
            Some(link) => link.send(msg),
            None => warn!(zone = zone.0, "no link for zone"),
        }
    }

    /// Plaintext pre-session packet: no session state, zero ack window.
    fn send_plain(&self, remote: SocketAddr, ptype: PacketType, payload: Bytes) {
        let pkt = encode_packet(&Packet {
            proto: self.cfg.proto_version,
            chan: Channel::Unreliable as u8,
            ptype: ptype as u8,
            seq: 0,
            ack: 0,
            ack_bits: 0,
            payload,
        });
        self.raw_send(&pkt, remote);
    }

    /// Sends on the reliable channel and tracks the packet for
    /// retransmission. Backpressure (pending-bytes cap) rejects the send
    /// with a log line instead of dropping in-flight work.
    fn push_reliable(&self, sess: &mut Session, ptype: PacketType, payload: Bytes) {
        let seq = sess.peer.alloc_seq();
        let (ack, ack_bits) = sess.peer.ack_fields();
        let pkt = encode_packet(&Packet {
            proto: self.cfg.proto_version,
            chan: Channel::Reliable as u8,
            ptype: ptype as u8,
            seq,
            ack,
            ack_bits,
            payload,
        });
        match sess.peer.track(seq, pkt.clone(), Instant::now()) {
            Ok(()) => self.raw_send(&pkt, sess.remote),
            Err(e) => warn!(sid = %sess.sid, error = %e, "reliable send rejected"),
        }
    }

    fn push_unreliable(&self, sess: &mut Session, ptype: PacketType, payload: Bytes) {
        let (ack, ack_bits) = sess.peer.ack_fields();
        let pkt = encode_packet(&Packet {
            proto: self.cfg.proto_version,
            chan: Channel::Unreliable as u8,
            ptype: ptype as u8,
            seq: 0,
            ack,
            ack_bits,
            payload,
        });
        self.raw_send(&pkt, sess.remote);
    }

    /// Bare ack carrier so a reliable sender sees progress even when the
    /// gateway has nothing else to say.
    fn ack_only(&self, sess: &mut Session) {
        self.push_unreliable(sess, PacketType::Rep, Bytes::new());
    }

    fn raw_send(&self, pkt: &[u8], remote: SocketAddr) {
        self.counters
            .packets_out
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if let Err(e) = self.udp.try_send_to(pkt, remote) {
            debug!(%remote, error = %e, "udp send dropped");
        }
    }
}

/// Renders replicate events as the line protocol clients parse. The
/// leading TICK line preserves the payload's server tick so clients can
/// time lag-compensated actions.
fn format_rep_lines(server_tick: u32, events: &[RepEvent]) -> String {
    if events.is_empty() {
        return String::new();
    }
    let mut out = format!("TICK {server_tick}");
    for ev in events {
        out.push('\n');
        match ev {
            RepEvent::Spawn { eid, kind, mask, x, y } => {
                out.push_str(&format!(
                    "SPAWN {} {} {} kind={} mask={}",
                    eid.0, x, y, *kind as u8, mask
                ));
            }
            RepEvent::Move { eid, x, y } => {
                out.push_str(&format!("MOV {} {} {}", eid.0, x, y));
            }
            RepEvent::Despawn { eid } => {
                out.push_str(&format!("DESPAWN {}", eid.0));
            }
            RepEvent::StateHp { eid, hp } => {
                out.push_str(&format!("STAT {} hp={}", eid.0, hp));
            }
            RepEvent::EventText(s) => {
                out.push_str(&format!("EV {s}"));
            }
        }
    }
    out
}
