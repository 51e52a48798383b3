//! Replication events.
//!
//! Events travel zone → gateway inside `Replicate` frames, one frame per
//! (session, channel) per tick. Per-event wire sizes are part of the
//! contract: the zone's byte-budget trimming accounts replication cost
//! with the exact encoded size.

use anyhow::bail;
use bytes::{Buf, BufMut};

use crate::ids::EntityId;

/// What an entity is; drives default HP and AI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntityKind {
    Player = 1,
    Npc = 2,
}

impl EntityKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(EntityKind::Player),
            2 => Some(EntityKind::Npc),
            _ => None,
        }
    }
}

/// The three replication channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RepChannel {
    Move = 1,
    State = 2,
    Event = 3,
}

impl RepChannel {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RepChannel::Move),
            2 => Some(RepChannel::State),
            3 => Some(RepChannel::Event),
            _ => None,
        }
    }
}

const OP_SPAWN: u8 = 1;
const OP_DESPAWN: u8 = 2;
const OP_MOVE: u8 = 3;
const OP_STATE_HP: u8 = 10;
const OP_EVENT_TEXT: u8 = 20;

/// Replicate payload header: sid(16) + serverTick(4) + channel(1) + count(2).
pub const REP_HEADER_LEN: usize = 16 + 4 + 1 + 2;

/// One replication event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepEvent {
    Spawn {
        eid: EntityId,
        kind: EntityKind,
        mask: u32,
        x: i16,
        y: i16,
    },
    Despawn {
        eid: EntityId,
    },
    Move {
        eid: EntityId,
        x: i16,
        y: i16,
    },
    StateHp {
        eid: EntityId,
        hp: u16,
    },
    EventText(String),
}

impl RepEvent {
    /// Exact encoded size of this event in bytes.
    pub fn wire_size(&self) -> usize {
        match self {
            RepEvent::Spawn { .. } => 1 + 4 + 1 + 4 + 2 + 2,
            RepEvent::Despawn { .. } => 1 + 4,
            RepEvent::Move { .. } => 1 + 4 + 2 + 2,
            RepEvent::StateHp { .. } => 1 + 4 + 2,
            RepEvent::EventText(s) => 1 + 2 + s.len().min(u16::MAX as usize),
        }
    }
}

/// Exact encoded size of a full replicate payload carrying `events`.
pub fn payload_size(events: &[RepEvent]) -> usize {
    REP_HEADER_LEN + events.iter().map(RepEvent::wire_size).sum::<usize>()
}

pub(crate) fn encode_events(buf: &mut impl BufMut, events: &[RepEvent]) {
    for ev in events {
        match ev {
            RepEvent::Spawn { eid, kind, mask, x, y } => {
                buf.put_u8(OP_SPAWN);
                buf.put_u32_le(eid.0);
                buf.put_u8(*kind as u8);
                buf.put_u32_le(*mask);
                buf.put_i16_le(*x);
                buf.put_i16_le(*y);
            }
            RepEvent::Despawn { eid } => {
                buf.put_u8(OP_DESPAWN);
                buf.put_u32_le(eid.0);
            }
            RepEvent::Move { eid, x, y } => {
                buf.put_u8(OP_MOVE);
                buf.put_u32_le(eid.0);
                buf.put_i16_le(*x);
                buf.put_i16_le(*y);
            }
            RepEvent::StateHp { eid, hp } => {
                buf.put_u8(OP_STATE_HP);
                buf.put_u32_le(eid.0);
                buf.put_u16_le(*hp);
            }
            RepEvent::EventText(s) => {
                let txt = &s.as_bytes()[..s.len().min(u16::MAX as usize)];
                buf.put_u8(OP_EVENT_TEXT);
                buf.put_u16_le(txt.len() as u16);
                buf.put_slice(txt);
            }
        }
    }
}

pub(crate) fn decode_events(b: &mut &[u8], count: usize) -> anyhow::Result<Vec<RepEvent>> {
    let mut events = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        if b.remaining() < 1 {
            bail!("truncated replicate event");
        }
        let op = b.get_u8();
        let ev = match op {
            OP_SPAWN => {
                if b.remaining() < 13 {
                    bail!("truncated spawn event");
                }
                let eid = EntityId(b.get_u32_le());
                let kind = match EntityKind::from_u8(b.get_u8()) {
                    Some(k) => k,
                    None => bail!("unknown entity kind"),
                };
                let mask = b.get_u32_le();
                let x = b.get_i16_le();
                let y = b.get_i16_le();
                RepEvent::Spawn { eid, kind, mask, x, y }
            }
            OP_DESPAWN => {
                if b.remaining() < 4 {
                    bail!("truncated despawn event");
                }
                RepEvent::Despawn { eid: EntityId(b.get_u32_le()) }
            }
            OP_MOVE => {
                if b.remaining() < 8 {
                    bail!("truncated move event");
                }
                let eid = EntityId(b.get_u32_le());
                let x = b.get_i16_le();
                let y = b.get_i16_le();
                RepEvent::Move { eid, x, y }
            }
            OP_STATE_HP => {
                if b.remaining() < 6 {
                    bail!("truncated state event");
                }
                let eid = EntityId(b.get_u32_le());
                let hp = b.get_u16_le();
                RepEvent::StateHp { eid, hp }
            }
            OP_EVENT_TEXT => {
                if b.remaining() < 2 {
                    bail!("truncated text event");
                }
                let n = b.get_u16_le() as usize;
                if b.remaining() < n {
                    bail!("truncated text event body");
                }
                let txt = std::str::from_utf8(&b[..n])?.to_string();
                b.advance(n);
                RepEvent::EventText(txt)
            }
            other => bail!("unknown replicate op {other}"),
        };
        events.push(ev);
    }
    Ok(events)
}
