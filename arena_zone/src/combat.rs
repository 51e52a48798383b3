//! Server-authoritative combat with lag compensation.
//!
//! Skill 1 is a melee strike. The client names the tick it acted on; the
//! server rewinds both attacker and target through the position-history
//! ring to that tick before the range check, then applies damage and
//! schedules the cooldown at the current tick.

use arena_shared::ids::EntityId;
use arena_shared::messages::ErrCode;
use arena_shared::replicate::EntityKind;

use crate::history::PositionHistory;
use crate::world::{dist2, World};

pub const SKILL_MELEE: u16 = 1;
pub const MELEE_RANGE: i16 = 4;
pub const MELEE_DAMAGE: u16 = 5;
pub const MELEE_COOLDOWN_TICKS: u32 = 10;

/// Combat rejection reasons; surfaced on the gateway link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombatError {
    BadAction,
    Cooldown,
    OutOfRange,
}

impl CombatError {
    pub fn code(self) -> ErrCode {
        match self {
            CombatError::BadAction => ErrCode::BadAction,
            CombatError::Cooldown => ErrCode::Cooldown,
            CombatError::OutOfRange => ErrCode::OutOfRange,
        }
    }
}

/// Resolves a melee action. On success the target's HP is reduced at the
/// current tick and the attacker's cooldown runs from the current tick.
pub fn resolve_skill(
    world: &mut World,
    history: &PositionHistory,
    attacker: EntityId,
    target: EntityId,
    skill: u16,
    action_tick: u32,
    server_tick: u32,
    rewind_max_ticks: u32,
) -> Result<(), CombatError> {
    if skill != SKILL_MELEE {
        return Err(CombatError::BadAction);
    }
    let Some(att_row) = world.row(attacker) else {
        return Err(CombatError::BadAction);
    };
    if world.kind[att_row] != EntityKind::Player {
        return Err(CombatError::BadAction);
    }
    let Some(tgt_row) = world.row(target) else {
        return Err(CombatError::BadAction);
    };
    if attacker == target || world.hp[tgt_row] == 0 {
        return Err(CombatError::BadAction);
    }

    if action_tick > server_tick || server_tick - action_tick > rewind_max_ticks {
        return Err(CombatError::BadAction);
    }

    let Some((ax, ay)) = history.sample_at(attacker, action_tick) else {
        return Err(CombatError::BadAction);
    };
    let Some((tx, ty)) = history.sample_at(target, action_tick) else {
        return Err(CombatError::BadAction);
    };

    if server_tick < world.skill1_cd[att_row] {
        return Err(CombatError::Cooldown);
    }
    if dist2(ax, ay, tx, ty) > (MELEE_RANGE as i64) * (MELEE_RANGE as i64) {
        return Err(CombatError::OutOfRange);
    }

    world.apply_damage(target, MELEE_DAMAGE);
    let att_row = world.row(attacker).expect("attacker row checked above");
    world.skill1_cd[att_row] = server_tick + MELEE_COOLDOWN_TICKS;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_shared::ids::CharacterId;

    struct Fixture {
        world: World,
        history: PositionHistory,
        attacker: EntityId,
        target: EntityId,
    }

    /// Attacker pinned at the origin; target at (2, 0) on tick 498 and
    /// (10, 0) on tick 500.
    fn fixture() -> Fixture {
        let mut world = World::new();
        let attacker = world.spawn(EntityKind::Player, CharacterId(1), 0, 0);
        let target = world.spawn(EntityKind::Player, CharacterId(2), 10, 0);
        let mut history = PositionHistory::new(32);
        for tick in 495..=500u32 {
            history.record(attacker, tick, 0, 0);
            let tx = if tick <= 498 { 2 } else { 10 };
            history.record(target, tick, tx, 0);
        }
        Fixture {
            world,
            history,
            attacker,
            target,
        }
    }

    #[test]
    fn rewound_hit_lands_and_schedules_cooldown() {
        let mut f = fixture();
        resolve_skill(&mut f.world, &f.history, f.attacker, f.target, 1, 498, 500, 5).unwrap();
        assert_eq!(f.world.hp_of(f.target), Some(95));
        let row = f.world.row(f.attacker).unwrap();
        assert_eq!(f.world.skill1_cd[row], 510);
    }

    #[test]
    fn present_tick_positions_miss() {
        let mut f = fixture();
        let err =
            resolve_skill(&mut f.world, &f.history, f.attacker, f.target, 1, 500, 500, 5)
                .unwrap_err();
        assert_eq!(err, CombatError::OutOfRange);
        assert_eq!(f.world.hp_of(f.target), Some(100));
    }

    #[test]
    fn cooldown_blocks_second_hit() {
        let mut f = fixture();
        resolve_skill(&mut f.world, &f.history, f.attacker, f.target, 1, 498, 500, 5).unwrap();
        let err =
            resolve_skill(&mut f.world, &f.history, f.attacker, f.target, 1, 498, 501, 5)
                .unwrap_err();
        assert_eq!(err, CombatError::Cooldown);
    }

    #[test]
    fn rewind_window_is_enforced() {
        let mut f = fixture();
        // Future tick.
        assert_eq!(
            resolve_skill(&mut f.world, &f.history, f.attacker, f.target, 1, 501, 500, 5),
            Err(CombatError::BadAction)
        );
        // Too far in the past.
        assert_eq!(
            resolve_skill(&mut f.world, &f.history, f.attacker, f.target, 1, 494, 500, 5),
            Err(CombatError::BadAction)
        );
    }

    #[test]
    fn missing_history_rejects() {
        let mut f = fixture();
        let ghost = f.world.spawn(EntityKind::Npc, CharacterId(0), 1, 0);
        assert_eq!(
            resolve_skill(&mut f.world, &f.history, f.attacker, ghost, 1, 498, 500, 5),
            Err(CombatError::BadAction)
        );
    }

    #[test]
    fn wrong_skill_and_dead_target_reject() {
        let mut f = fixture();
        assert_eq!(
            resolve_skill(&mut f.world, &f.history, f.attacker, f.target, 2, 498, 500, 5),
            Err(CombatError::BadAction)
        );
        let row = f.world.row(f.target).unwrap();
        f.world.hp[row] = 0;
        assert_eq!(
            resolve_skill(&mut f.world, &f.history, f.attacker, f.target, 1, 498, 500, 5),
            Err(CombatError::BadAction)
        );
    }

    #[test]
    fn npc_cannot_attack() {
        let mut f = fixture();
        let npc = f.world.spawn(EntityKind::Npc, CharacterId(0), 0, 0);
        assert_eq!(
            resolve_skill(&mut f.world, &f.history, npc, f.target, 1, 498, 500, 5),
            Err(CombatError::BadAction)
        );
    }
}
