//! Gateway ↔ zone link messages.
//!
//! Every frame carries an explicit `SessionId`; the link never multiplexes
//! sessions implicitly. Gateway → zone types are < 100, zone → gateway
//! types are ≥ 100.

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::frame::Frame;
use crate::ids::{CharacterId, SessionId, ZoneId};
use crate::replicate::{decode_events, encode_events, RepChannel, RepEvent, REP_HEADER_LEN};

pub const MSG_ATTACH_PLAYER: u8 = 1;
pub const MSG_DETACH_PLAYER: u8 = 2;
pub const MSG_PLAYER_INPUT: u8 = 3;
pub const MSG_PLAYER_ACTION: u8 = 4;
pub const MSG_ATTACH_WITH_STATE: u8 = 5;
pub const MSG_TRANSFER_COMMIT: u8 = 6;
pub const MSG_TRANSFER_ABORT: u8 = 7;

pub const MSG_ATTACH_ACK: u8 = 101;
pub const MSG_ERROR: u8 = 102;
pub const MSG_REPLICATE: u8 = 103;
pub const MSG_TRANSFER_PREPARE: u8 = 104;

/// Structured error codes surfaced over the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrCode {
    Unknown = 0,
    BadMsg = 1,
    NoPlayer = 2,
    BadAction = 3,
    Cooldown = 4,
    OutOfRange = 5,
    Transfer = 6,
}

impl ErrCode {
    pub fn from_u16(v: u16) -> Self {
        match v {
            1 => ErrCode::BadMsg,
            2 => ErrCode::NoPlayer,
            3 => ErrCode::BadAction,
            4 => ErrCode::Cooldown,
            5 => ErrCode::OutOfRange,
            6 => ErrCode::Transfer,
            _ => ErrCode::Unknown,
        }
    }
}

/// All messages that travel over the gateway link, either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkMsg {
    // ─── Gateway → zone ───
    AttachPlayer {
        sid: SessionId,
        cid: CharacterId,
        zid: ZoneId,
        interest: u32,
    },
    AttachWithState {
        sid: SessionId,
        cid: CharacterId,
        zid: ZoneId,
        interest: u32,
        x: i16,
        y: i16,
        hp: u16,
    },
    DetachPlayer {
        sid: SessionId,
    },
    PlayerInput {
        sid: SessionId,
        tick: u32,
        mx: i16,
        my: i16,
    },
    PlayerAction {
        sid: SessionId,
        tick: u32,
        skill: u16,
        target: u32,
    },
    TransferCommit {
        sid: SessionId,
    },
    TransferAbort {
        sid: SessionId,
    },

    // ─── Zone → gateway ───
    AttachAck {
        sid: SessionId,
    },
    Error {
        sid: SessionId,
        code: ErrCode,
        msg: String,
    },
    Replicate {
        sid: SessionId,
        server_tick: u32,
        channel: RepChannel,
        events: Vec<RepEvent>,
    },
    TransferPrepare {
        sid: SessionId,
        cid: CharacterId,
        target: ZoneId,
        interest: u32,
        x: i16,
        y: i16,
        hp: u16,
    },
}

fn put_sid(b: &mut BytesMut, sid: SessionId) {
    b.extend_from_slice(sid.as_bytes());
}

fn get_sid(b: &mut &[u8]) -> anyhow::Result<SessionId> {
    if b.remaining() < SessionId::LEN {
        bail!("payload too short for session id");
    }
    let mut raw = [0u8; 16];
    b.copy_to_slice(&mut raw);
    Ok(SessionId::from_bytes(raw))
}

impl LinkMsg {
    /// Encodes into `(msg_type, payload)` for framing.
    pub fn encode(&self) -> (u8, Bytes) {
        match self {
            LinkMsg::AttachPlayer { sid, cid, zid, interest } => {
                let mut b = BytesMut::with_capacity(32);
                put_sid(&mut b, *sid);
                b.put_u64_le(cid.0);
                b.put_u32_le(zid.0);
                b.put_u32_le(*interest);
                (MSG_ATTACH_PLAYER, b.freeze())
            }
            LinkMsg::AttachWithState { sid, cid, zid, interest, x, y, hp } => {
                let mut b = BytesMut::with_capacity(38);
                put_sid(&mut b, *sid);
                b.put_u64_le(cid.0);
                b.put_u32_le(zid.0);
                b.put_u32_le(*interest);
                b.put_i16_le(*x);
                b.put_i16_le(*y);
                b.put_u16_le(*hp);
                (MSG_ATTACH_WITH_STATE, b.freeze())
            }
            LinkMsg::DetachPlayer { sid } => {
                let mut b = BytesMut::with_capacity(16);
                put_sid(&mut b, *sid);
                (MSG_DETACH_PLAYER, b.freeze())
            }
            LinkMsg::PlayerInput { sid, tick, mx, my } => {
                let mut b = BytesMut::with_capacity(24);
                put_sid(&mut b, *sid);
                b.put_u32_le(*tick);
                b.put_i16_le(*mx);
                b.put_i16_le(*my);
                (MSG_PLAYER_INPUT, b.freeze())
            }
            LinkMsg::PlayerAction { sid, tick, skill, target } => {
                let mut b = BytesMut::with_capacity(26);
                put_sid(&mut b, *sid);
                b.put_u32_le(*tick);
                b.put_u16_le(*skill);
                b.put_u32_le(*target);
                (MSG_PLAYER_ACTION, b.freeze())
            }
            LinkMsg::TransferCommit { sid } => {
                let mut b = BytesMut::with_capacity(16);
                put_sid(&mut b, *sid);
                (MSG_TRANSFER_COMMIT, b.freeze())
            }
            LinkMsg::TransferAbort { sid } => {
                let mut b = BytesMut::with_capacity(16);
                put_sid(&mut b, *sid);
                (MSG_TRANSFER_ABORT, b.freeze())
            }
            LinkMsg::AttachAck { sid } => {
                let mut b = BytesMut::with_capacity(16);
                put_sid(&mut b, *sid);
                (MSG_ATTACH_ACK, b.freeze())
            }
            LinkMsg::Error { sid, code, msg } => {
                let txt = &msg.as_bytes()[..msg.len().min(u16::MAX as usize)];
                let mut b = BytesMut::with_capacity(20 + txt.len());
                put_sid(&mut b, *sid);
                b.put_u16_le(*code as u16);
                b.put_u16_le(txt.len() as u16);
                b.extend_from_slice(txt);
                (MSG_ERROR, b.freeze())
            }
            LinkMsg::Replicate { sid, server_tick, channel, events } => {
                let count = events.len().min(u16::MAX as usize);
                let mut b = BytesMut::with_capacity(REP_HEADER_LEN + 16 * count);
                put_sid(&mut b, *sid);
                b.put_u32_le(*server_tick);
                b.put_u8(*channel as u8);
                b.put_u16_le(count as u16);
                encode_events(&mut b, &events[..count]);
                (MSG_REPLICATE, b.freeze())
            }
            LinkMsg::TransferPrepare { sid, cid, target, interest, x, y, hp } => {
                let mut b = BytesMut::with_capacity(38);
                put_sid(&mut b, *sid);
                b.put_u64_le(cid.0);
                b.put_u32_le(target.0);
                b.put_u32_le(*interest);
                b.put_i16_le(*x);
                b.put_i16_le(*y);
                b.put_u16_le(*hp);
                (MSG_TRANSFER_PREPARE, b.freeze())
            }
        }
    }

    /// Decodes a framed message; fails with `BadMsg`-worthy errors on any
    /// layout violation.
    pub fn decode(frame: &Frame) -> anyhow::Result<LinkMsg> {
        let mut b = &frame.payload[..];
        let msg = match frame.msg_type {
            MSG_ATTACH_PLAYER => {
                let sid = get_sid(&mut b)?;
                if b.remaining() < 16 {
                    bail!("bad attach payload");
                }
                LinkMsg::AttachPlayer {
                    sid,
                    cid: CharacterId(b.get_u64_le()),
                    zid: ZoneId(b.get_u32_le()),
                    interest: b.get_u32_le(),
                }
            }
            MSG_ATTACH_WITH_STATE => {
                let sid = get_sid(&mut b)?;
                if b.remaining() < 22 {
                    bail!("bad attach-with-state payload");
                }
                LinkMsg::AttachWithState {
                    sid,
                    cid: CharacterId(b.get_u64_le()),
                    zid: ZoneId(b.get_u32_le()),
                    interest: b.get_u32_le(),
                    x: b.get_i16_le(),
                    y: b.get_i16_le(),
                    hp: b.get_u16_le(),
                }
            }
            MSG_DETACH_PLAYER => LinkMsg::DetachPlayer { sid: get_sid(&mut b)? },
            MSG_PLAYER_INPUT => {
                let sid = get_sid(&mut b)?;
                if b.remaining() < 8 {
                    bail!("bad input payload");
                }
                LinkMsg::PlayerInput {
                    sid,
                    tick: b.get_u32_le(),
                    mx: b.get_i16_le(),
                    my: b.get_i16_le(),
                }
            }
            MSG_PLAYER_ACTION => {
                let sid = get_sid(&mut b)?;
                if b.remaining() < 10 {
                    bail!("bad action payload");
                }
                LinkMsg::PlayerAction {
                    sid,
                    tick: b.get_u32_le(),
                    skill: b.get_u16_le(),
                    target: b.get_u32_le(),
                }
            }
            MSG_TRANSFER_COMMIT => LinkMsg::TransferCommit { sid: get_sid(&mut b)? },
            MSG_TRANSFER_ABORT => LinkMsg::TransferAbort { sid: get_sid(&mut b)? },
            MSG_ATTACH_ACK => LinkMsg::AttachAck { sid: get_sid(&mut b)? },
            MSG_ERROR => {
                let sid = get_sid(&mut b)?;
                if b.remaining() < 4 {
                    bail!("bad error payload");
                }
                let code = ErrCode::from_u16(b.get_u16_le());
                let n = b.get_u16_le() as usize;
                if b.remaining() != n {
                    bail!("bad error payload length");
                }
                LinkMsg::Error {
                    sid,
                    code,
                    msg: std::str::from_utf8(b)?.to_string(),
                }
            }
            MSG_REPLICATE => {
                let sid = get_sid(&mut b)?;
                if b.remaining() < 7 {
                    bail!("bad replicate payload");
                }
                let server_tick = b.get_u32_le();
                let channel = match RepChannel::from_u8(b.get_u8()) {
                    Some(c) => c,
                    None => bail!("unknown replicate channel"),
                };
                let count = b.get_u16_le() as usize;
                let events = decode_events(&mut b, count)?;
                if !b.is_empty() {
                    bail!("extra bytes in replicate payload");
                }
                LinkMsg::Replicate {
                    sid,
                    server_tick,
                    channel,
                    events,
                }
            }
            MSG_TRANSFER_PREPARE => {
                let sid = get_sid(&mut b)?;
                if b.remaining() < 22 {
                    bail!("bad transfer-prepare payload");
                }
                LinkMsg::TransferPrepare {
                    sid,
                    cid: CharacterId(b.get_u64_le()),
                    target: ZoneId(b.get_u32_le()),
                    interest: b.get_u32_le(),
                    x: b.get_i16_le(),
                    y: b.get_i16_le(),
                    hp: b.get_u16_le(),
                }
            }
            other => bail!("unknown link message type {other}"),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::EntityId;
    use crate::replicate::EntityKind;

    fn roundtrip(msg: LinkMsg) {
        let (t, payload) = msg.encode();
        let frame = Frame {
            msg_type: t,
            payload,
        };
        assert_eq!(LinkMsg::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn link_messages_roundtrip() {
        let sid = SessionId([9u8; 16]);
        roundtrip(LinkMsg::AttachPlayer {
            sid,
            cid: CharacterId(5),
            zid: ZoneId(1),
            interest: 0xF,
        });
        roundtrip(LinkMsg::AttachWithState {
            sid,
            cid: CharacterId(5),
            zid: ZoneId(2),
            interest: 0xF,
            x: 101,
            y: 0,
            hp: 80,
        });
        roundtrip(LinkMsg::DetachPlayer { sid });
        roundtrip(LinkMsg::PlayerInput {
            sid,
            tick: 12,
            mx: -1,
            my: 1,
        });
        roundtrip(LinkMsg::PlayerAction {
            sid,
            tick: 498,
            skill: 1,
            target: 42,
        });
        roundtrip(LinkMsg::TransferCommit { sid });
        roundtrip(LinkMsg::TransferAbort { sid });
        roundtrip(LinkMsg::AttachAck { sid });
        roundtrip(LinkMsg::Error {
            sid,
            code: ErrCode::OutOfRange,
            msg: "out of range".to_string(),
        });
        roundtrip(LinkMsg::TransferPrepare {
            sid,
            cid: CharacterId(5),
            target: ZoneId(2),
            interest: 0xF,
            x: 101,
            y: 0,
            hp: 80,
        });
    }

    #[test]
    fn replicate_roundtrip_matches_payload_size() {
        let sid = SessionId([1u8; 16]);
        let events = vec![
            RepEvent::Spawn {
                eid: EntityId(3),
                kind: EntityKind::Npc,
                mask: 0xF,
                x: 5,
                y: 6,
            },
            RepEvent::Move {
                eid: EntityId(3),
                x: 6,
                y: 6,
            },
        ];
        let msg = LinkMsg::Replicate {
            sid,
            server_tick: 77,
            channel: RepChannel::Move,
            events: events.clone(),
        };
        let (t, payload) = msg.encode();
        assert_eq!(payload.len(), crate::replicate::payload_size(&events));
        let back = LinkMsg::decode(&Frame {
            msg_type: t,
            payload,
        })
        .unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let frame = Frame {
            msg_type: MSG_PLAYER_INPUT,
            payload: Bytes::from_static(&[0u8; 10]),
        };
        assert!(LinkMsg::decode(&frame).is_err());
    }
}
