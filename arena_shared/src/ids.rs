//! Identifier newtypes shared by every process role.
//!
//! `CharacterId` is stable across zone transfers; `EntityId` is scoped to a
//! single zone and reassigned on transfer. `EntityId(0)` is reserved as
//! "none".

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Opaque account identifier minted by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AccountId(pub u64);

/// Opaque character identifier, stable across zone transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CharacterId(pub u64);

/// Zone identifier. Zone 0 means "not attached".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ZoneId(pub u32);

/// Entity identifier scoped to one zone. 0 is "none".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct EntityId(pub u32);

impl EntityId {
    pub const NONE: EntityId = EntityId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// 128-bit random session identifier, hex-printable.
///
/// Identifies a client session independently of its remote address, so a
/// NAT rebind does not orphan the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SessionId(pub [u8; 16]);

impl SessionId {
    pub const LEN: usize = 16;

    /// Mints a fresh random session id.
    pub fn random() -> Self {
        let mut id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id);
        SessionId(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(b: [u8; 16]) -> Self {
        SessionId(b)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_hex_display() {
        let sid = SessionId([0xAB; 16]);
        assert_eq!(sid.to_string(), "ab".repeat(16));
    }

    #[test]
    fn session_id_random_is_unique() {
        assert_ne!(SessionId::random(), SessionId::random());
    }

    #[test]
    fn entity_id_none() {
        assert!(EntityId::NONE.is_none());
        assert!(!EntityId(7).is_none());
    }
}
