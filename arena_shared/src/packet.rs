//! Client-facing UDP packet format.
//!
//! Every datagram between a client and the gateway has the layout
//! (little-endian):
//!
//! `magic(u16) | proto(u16) | chan(u8) | ptype(u8) | seq(u32) | ack(u32) | ackBits(u32) | payload...`
//!
//! `seq` is zero on the unreliable channel and a nonzero monotonically
//! increasing value per session on the reliable channel. `ack`/`ackBits`
//! always carry the sender's receive window so every packet doubles as an
//! acknowledgement carrier.

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Packet magic; decode fails fast on mismatch.
pub const UDP_MAGIC: u16 = 0x4D4D;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 2 + 2 + 1 + 1 + 4 + 4 + 4;

/// Logical channel multiplexed over the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Channel {
    Unreliable = 0,
    Reliable = 1,
}

impl Channel {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Channel::Unreliable),
            1 => Some(Channel::Reliable),
            _ => None,
        }
    }
}

/// Payload discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Plaintext handshake hello (nonce) or, post-auth, the reliable
    /// attach hello (cid + interest).
    Hello = 1,
    Input = 2,
    Action = 3,
    Text = 4,
    Rep = 5,
    Challenge = 6,
    Auth = 7,
    AuthResp = 8,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PacketType::Hello),
            2 => Some(PacketType::Input),
            3 => Some(PacketType::Action),
            4 => Some(PacketType::Text),
            5 => Some(PacketType::Rep),
            6 => Some(PacketType::Challenge),
            7 => Some(PacketType::Auth),
            8 => Some(PacketType::AuthResp),
            _ => None,
        }
    }
}

/// A decoded UDP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub proto: u16,
    pub chan: u8,
    pub ptype: u8,
    pub seq: u32,
    pub ack: u32,
    pub ack_bits: u32,
    pub payload: Bytes,
}

impl Packet {
    pub fn channel(&self) -> Option<Channel> {
        Channel::from_u8(self.chan)
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_u8(self.ptype)
    }
}

/// Encodes a packet into a fresh buffer.
pub fn encode_packet(p: &Packet) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + p.payload.len());
    buf.put_u16_le(UDP_MAGIC);
    buf.put_u16_le(p.proto);
    buf.put_u8(p.chan);
    buf.put_u8(p.ptype);
    buf.put_u32_le(p.seq);
    buf.put_u32_le(p.ack);
    buf.put_u32_le(p.ack_bits);
    buf.extend_from_slice(&p.payload);
    buf.freeze()
}

/// Decodes a packet; fails on short buffers or bad magic.
pub fn decode_packet(b: &[u8]) -> anyhow::Result<Packet> {
    if b.len() < HEADER_LEN {
        bail!("short packet: {} bytes", b.len());
    }
    let mut r = b;
    let magic = r.get_u16_le();
    if magic != UDP_MAGIC {
        bail!("bad magic: {:#06x}", magic);
    }
    let proto = r.get_u16_le();
    let chan = r.get_u8();
    let ptype = r.get_u8();
    let seq = r.get_u32_le();
    let ack = r.get_u32_le();
    let ack_bits = r.get_u32_le();
    Ok(Packet {
        proto,
        chan,
        ptype,
        seq,
        ack,
        ack_bits,
        payload: Bytes::copy_from_slice(r),
    })
}

// ─── Payload codecs ───

/// Plaintext handshake hello: client nonce only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloNonce {
    pub nonce: u64,
}

pub fn encode_hello_nonce(p: HelloNonce) -> Bytes {
    let mut b = BytesMut::with_capacity(8);
    b.put_u64_le(p.nonce);
    b.freeze()
}

pub fn decode_hello_nonce(mut b: &[u8]) -> anyhow::Result<HelloNonce> {
    if b.len() < 8 {
        bail!("hello payload too short");
    }
    Ok(HelloNonce { nonce: b.get_u64_le() })
}

/// Reliable post-auth hello: the character the session wants to play and
/// its interest mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloAttach {
    pub cid: u64,
    pub interest: u32,
}

pub fn encode_hello_attach(p: HelloAttach) -> Bytes {
    let mut b = BytesMut::with_capacity(12);
    b.put_u64_le(p.cid);
    b.put_u32_le(p.interest);
    b.freeze()
}

pub fn decode_hello_attach(mut b: &[u8]) -> anyhow::Result<HelloAttach> {
    if b.len() < 12 {
        bail!("attach hello payload too short");
    }
    Ok(HelloAttach {
        cid: b.get_u64_le(),
        interest: b.get_u32_le(),
    })
}

/// Plaintext challenge: time bucket + stateless cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Challenge {
    pub bucket: u32,
    pub cookie: [u8; 16],
}

pub fn encode_challenge(p: Challenge) -> Bytes {
    let mut b = BytesMut::with_capacity(20);
    b.put_u32_le(p.bucket);
    b.extend_from_slice(&p.cookie);
    b.freeze()
}

pub fn decode_challenge(mut b: &[u8]) -> anyhow::Result<Challenge> {
    if b.len() < 20 {
        bail!("challenge payload too short");
    }
    let bucket = b.get_u32_le();
    let mut cookie = [0u8; 16];
    b.copy_to_slice(&mut cookie);
    Ok(Challenge { bucket, cookie })
}

/// Auth request: echoes the challenge and carries the access token.
///
/// Layout: `[nonce:8][bucket:4][cookie:16][tokenLen:2][tokenBytes]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub nonce: u64,
    pub bucket: u32,
    pub cookie: [u8; 16],
    pub token: String,
}

pub fn encode_auth(p: &AuthRequest) -> anyhow::Result<Bytes> {
    let tok = p.token.as_bytes();
    if tok.len() > u16::MAX as usize {
        bail!("token too large");
    }
    let mut b = BytesMut::with_capacity(8 + 4 + 16 + 2 + tok.len());
    b.put_u64_le(p.nonce);
    b.put_u32_le(p.bucket);
    b.extend_from_slice(&p.cookie);
    b.put_u16_le(tok.len() as u16);
    b.extend_from_slice(tok);
    Ok(b.freeze())
}

pub fn decode_auth(mut b: &[u8]) -> anyhow::Result<AuthRequest> {
    if b.len() < 8 + 4 + 16 + 2 {
        bail!("auth payload too short");
    }
    let nonce = b.get_u64_le();
    let bucket = b.get_u32_le();
    let mut cookie = [0u8; 16];
    b.copy_to_slice(&mut cookie);
    let tok_len = b.get_u16_le() as usize;
    if b.len() != tok_len {
        bail!("invalid token length");
    }
    let token = std::str::from_utf8(b)?.to_string();
    Ok(AuthRequest {
        nonce,
        bucket,
        cookie,
        token,
    })
}

/// Unreliable movement input for one client tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputCmd {
    pub tick: u32,
    pub mx: i16,
    pub my: i16,
}

pub fn encode_input(p: InputCmd) -> Bytes {
    let mut b = BytesMut::with_capacity(8);
    b.put_u32_le(p.tick);
    b.put_i16_le(p.mx);
    b.put_i16_le(p.my);
    b.freeze()
}

pub fn decode_input(mut b: &[u8]) -> anyhow::Result<InputCmd> {
    if b.len() < 8 {
        bail!("input payload too short");
    }
    Ok(InputCmd {
        tick: b.get_u32_le(),
        mx: b.get_i16_le(),
        my: b.get_i16_le(),
    })
}

/// Reliable skill action at a client-chosen reference tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionCmd {
    pub tick: u32,
    pub skill: u16,
    pub target: u32,
}

pub fn encode_action(p: ActionCmd) -> Bytes {
    let mut b = BytesMut::with_capacity(10);
    b.put_u32_le(p.tick);
    b.put_u16_le(p.skill);
    b.put_u32_le(p.target);
    b.freeze()
}

pub fn decode_action(mut b: &[u8]) -> anyhow::Result<ActionCmd> {
    if b.len() < 10 {
        bail!("action payload too short");
    }
    Ok(ActionCmd {
        tick: b.get_u32_le(),
        skill: b.get_u16_le(),
        target: b.get_u32_le(),
    })
}
