//! Client-side reliable peer and handshake driver.
//!
//! Mirrors the gateway's channel discipline from the other end of the
//! socket: every outbound packet carries the receive window, a background
//! ticker retransmits in-flight reliable packets, and the cookie
//! handshake walks HELLO → CHALLENGE → AUTH before any gameplay traffic.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use arena_shared::packet::{
    decode_challenge, decode_packet, encode_auth, encode_hello_attach, encode_hello_nonce,
    encode_packet, AuthRequest, Channel, HelloAttach, HelloNonce, Packet, PacketType,
};
use arena_shared::reliable::ReliablePeer;

/// How often the client retransmit ticker runs.
const RETRANSMIT_SWEEP: Duration = Duration::from_millis(50);
/// Per-attempt wait for handshake replies.
const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_millis(500);
/// Handshake attempts before giving up.
const HANDSHAKE_ATTEMPTS: u32 = 3;

/// A decoded application packet delivered to the consumer.
#[derive(Debug, Clone)]
pub struct Incoming {
    pub ptype: PacketType,
    pub payload: Bytes,
}

/// Connected client endpoint.
pub struct ClientPeer {
    udp: Arc<UdpSocket>,
    proto: u16,
    peer: Arc<Mutex<ReliablePeer>>,
    /// Latest server tick parsed from replication, for action timing.
    server_tick: Arc<AtomicU32>,
    incoming: mpsc::Receiver<Incoming>,
}

impl ClientPeer {
    /// Binds an ephemeral socket, connects it to the gateway, and spawns
    /// the reader and retransmit tasks.
    pub async fn connect(server: &str, proto: u16) -> anyhow::Result<Self> {
        let udp = UdpSocket::bind("0.0.0.0:0").await.context("udp bind")?;
        udp.connect(server)
            .await
            .with_context(|| format!("udp connect {server}"))?;
        let udp = Arc::new(udp);
        let peer = Arc::new(Mutex::new(ReliablePeer::new(64 * 1024)));
        let server_tick = Arc::new(AtomicU32::new(0));
        let (tx, rx) = mpsc::channel(256);

        {
            let udp = udp.clone();
            let peer = peer.clone();
            let server_tick = server_tick.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    let n = match udp.recv(&mut buf).await {
                        Ok(n) => n,
                        Err(e) => {
                            debug!(error = %e, "client socket closed");
                            return;
                        }
                    };
                    let Ok(pkt) = decode_packet(&buf[..n]) else {
                        continue;
                    };
                    if pkt.proto != proto {
                        continue;
                    }
                    {
                        let mut p = peer.lock().expect("peer lock");
                        p.on_acks(pkt.ack, pkt.ack_bits, Instant::now());
                        if pkt.channel() == Some(Channel::Reliable) {
                            p.update_recv(pkt.seq);
                        }
                    }
                    let Some(ptype) = pkt.packet_type() else {
                        continue;
                    };
                    // Bare ack carriers have nothing for the application.
                    if ptype == PacketType::Rep && pkt.payload.is_empty() {
                        continue;
                    }
                    if ptype == PacketType::Rep {
                        if let Some(tick) = parse_tick_header(&pkt.payload) {
                            server_tick.store(tick, Ordering::Relaxed);
                        }
                    }
                    if tx
                        .send(Incoming {
                            ptype,
                            payload: pkt.payload,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            });
        }

        {
            let udp = udp.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(RETRANSMIT_SWEEP);
                loop {
                    tick.tick().await;
                    let now = Instant::now();
                    let (resend, dropped) = {
                        let mut p = peer.lock().expect("peer lock");
                        p.due_retransmits(now)
                    };
                    for (_, pkt) in resend {
                        let _ = udp.try_send(&pkt);
                    }
                    for seq in dropped {
                        warn!(seq, "reliable packet abandoned");
                    }
                }
            });
        }

        Ok(Self {
            udp,
            proto,
            peer,
            server_tick,
            incoming: rx,
        })
    }

    /// Latest server tick observed in replication traffic.
    pub fn server_tick(&self) -> u32 {
        self.server_tick.load(Ordering::Relaxed)
    }

    pub fn pending_len(&self) -> usize {
        self.peer.lock().expect("peer lock").pending_len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.peer.lock().expect("peer lock").pending_bytes()
    }

    /// Sends on the unreliable channel (seq 0, window piggybacked).
    pub fn send_unreliable(&self, ptype: PacketType, payload: Bytes) {
        let (ack, ack_bits) = self.peer.lock().expect("peer lock").ack_fields();
        let pkt = encode_packet(&Packet {
            proto: self.proto,
            chan: Channel::Unreliable as u8,
            ptype: ptype as u8,
            seq: 0,
            ack,
            ack_bits,
            payload,
        });
        let _ = self.udp.try_send(&pkt);
    }

    /// Sends on the reliable channel; fails on backpressure.
    pub fn send_reliable(&self, ptype: PacketType, payload: Bytes) -> anyhow::Result<()> {
        let mut p = self.peer.lock().expect("peer lock");
        let seq = p.alloc_seq();
        let (ack, ack_bits) = p.ack_fields();
        let pkt = encode_packet(&Packet {
            proto: self.proto,
            chan: Channel::Reliable as u8,
            ptype: ptype as u8,
            seq,
            ack,
            ack_bits,
            payload,
        });
        p.track(seq, pkt.clone(), Instant::now())?;
        drop(p);
        let _ = self.udp.try_send(&pkt);
        Ok(())
    }

    /// Next application packet, if any arrives before `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Incoming> {
        tokio::time::timeout(timeout, self.incoming.recv())
            .await
            .ok()
            .flatten()
    }

    /// Waits for a reliable TEXT whose payload starts with `prefix`.
    pub async fn expect_text(&mut self, prefix: &str, timeout: Duration) -> anyhow::Result<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!("timed out waiting for text '{prefix}'");
            }
            let Some(inc) = self.recv_timeout(remaining).await else {
                bail!("timed out waiting for text '{prefix}'");
            };
            if inc.ptype != PacketType::Text {
                continue;
            }
            let text = String::from_utf8_lossy(&inc.payload).to_string();
            if text.starts_with(prefix) {
                return Ok(text);
            }
        }
    }

    /// Collects REP lines until `deadline`, flattening payloads.
    pub async fn collect_rep_lines(&mut self, window: Duration) -> Vec<String> {
        let deadline = Instant::now() + window;
        let mut lines = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return lines;
            }
            let Some(inc) = self.recv_timeout(remaining).await else {
                return lines;
            };
            if inc.ptype == PacketType::Rep {
                let text = String::from_utf8_lossy(&inc.payload).to_string();
                lines.extend(text.lines().map(str::to_string));
            }
        }
    }

    /// Plaintext handshake packet: pre-session, zero window.
    fn send_plain(&self, ptype: PacketType, payload: Bytes) {
        let pkt = encode_packet(&Packet {
            proto: self.proto,
            chan: Channel::Unreliable as u8,
            ptype: ptype as u8,
            seq: 0,
            ack: 0,
            ack_bits: 0,
            payload,
        });
        let _ = self.udp.try_send(&pkt);
    }

    /// Cookie handshake: HELLO → CHALLENGE → AUTH, retried a few times.
    /// Resolves to the session id line on success.
    pub async fn handshake(&mut self, nonce: u64, token: &str) -> anyhow::Result<String> {
        for attempt in 0..HANDSHAKE_ATTEMPTS {
            self.send_plain(PacketType::Hello, encode_hello_nonce(HelloNonce { nonce }));

            let challenge = match self.wait_for(PacketType::Challenge).await {
                Some(inc) => decode_challenge(&inc.payload)?,
                None => {
                    debug!(attempt, "challenge timed out");
                    continue;
                }
            };

            let auth = AuthRequest {
                nonce,
                bucket: challenge.bucket,
                cookie: challenge.cookie,
                token: token.to_string(),
            };
            self.send_plain(PacketType::Auth, encode_auth(&auth)?);

            let deadline = Instant::now() + HANDSHAKE_STEP_TIMEOUT;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let Some(inc) = self.recv_timeout(remaining).await else {
                    break;
                };
                match inc.ptype {
                    PacketType::AuthResp => {
                        bail!(
                            "authentication rejected: {}",
                            String::from_utf8_lossy(&inc.payload)
                        );
                    }
                    PacketType::Text => {
                        let text = String::from_utf8_lossy(&inc.payload).to_string();
                        if text.starts_with("HELLO_OK") {
                            return Ok(text);
                        }
                    }
                    _ => {}
                }
            }
        }
        bail!("handshake timed out after {HANDSHAKE_ATTEMPTS} attempts")
    }

    /// Reliable attach hello naming the character and interest mask.
    pub fn attach(&self, cid: u64, interest: u32) -> anyhow::Result<()> {
        self.send_reliable(
            PacketType::Hello,
            encode_hello_attach(HelloAttach { cid, interest }),
        )
    }

    async fn wait_for(&mut self, ptype: PacketType) -> Option<Incoming> {
        let deadline = Instant::now() + HANDSHAKE_STEP_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let inc = self.recv_timeout(remaining).await?;
            if inc.ptype == ptype {
                return Some(inc);
            }
        }
    }
}

/// Parses the `TICK n` header off a REP payload.
fn parse_tick_header(payload: &[u8]) -> Option<u32> {
    let text = std::str::from_utf8(payload).ok()?;
    let first = text.lines().next()?;
    first.strip_prefix("TICK ")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_header_parses() {
        assert_eq!(parse_tick_header(b"TICK 42\nMOV 1 2 3"), Some(42));
        assert_eq!(parse_tick_header(b"TICK 7"), Some(7));
        assert_eq!(parse_tick_header(b"MOV 1 2 3"), None);
        assert_eq!(parse_tick_header(b"TICK x"), None);
    }
}
