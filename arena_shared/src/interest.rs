//! Interest masks.
//!
//! A 32-bit bitfield carried both by observers (which channels they
//! subscribe to) and by entities (which channels they offer). Replication
//! keeps an entity for an observer only when the masks intersect.

use bitflags::bitflags;

bitflags! {
    /// Replication interest channels. Carried on the wire as raw bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u32 {
        const MOVE   = 1 << 0;
        const STATE  = 1 << 1;
        const EVENT  = 1 << 2;
        /// Reserved for combat log fan-out; does not gate replication.
        const COMBAT = 1 << 3;
    }
}

impl Interest {
    /// Default mask for entities and freshly attached players.
    pub fn all_channels() -> Self {
        Interest::MOVE | Interest::STATE | Interest::EVENT | Interest::COMBAT
    }

    /// True when the observer and entity masks share at least one channel.
    pub fn matches(self, entity: Interest) -> bool {
        !(self & entity).is_empty()
    }
}

impl Default for Interest {
    fn default() -> Self {
        Interest::all_channels()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_masks_do_not_match() {
        assert!(!Interest::MOVE.matches(Interest::STATE));
        assert!(Interest::all_channels().matches(Interest::STATE));
    }

    #[test]
    fn raw_bits_roundtrip() {
        let m = Interest::MOVE | Interest::EVENT;
        assert_eq!(Interest::from_bits_truncate(m.bits()), m);
    }
}
