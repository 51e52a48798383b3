//! NPC presets and the per-tick AI pass.
//!
//! The preset table is a process-wide read-only registry assembled once
//! and owned by the zone; systems get it by reference. The AI pass runs
//! under a per-tick decision budget with a level-of-detail filter: an NPC
//! with no player inside its preset's aggro radius is not simulated at
//! all.

use rand::Rng;

use arena_shared::replicate::EntityKind;

use crate::world::{within, World};

/// A spawnable NPC archetype.
#[derive(Debug, Clone)]
pub struct NpcPreset {
    pub name: &'static str,
    pub hp: u16,
    /// Wander velocity magnitude per axis.
    pub wander: i16,
    /// Players inside this radius wake the NPC's AI.
    pub aggro_radius: i16,
}

/// Read-only registry of NPC presets, indexed by the world's per-entity
/// preset column.
#[derive(Debug, Clone)]
pub struct NpcRegistry {
    presets: Vec<NpcPreset>,
}

impl NpcRegistry {
    pub fn builtin() -> Self {
        Self {
            presets: vec![
                NpcPreset {
                    name: "fallen",
                    hp: 30,
                    wander: 1,
                    aggro_radius: 35,
                },
                NpcPreset {
                    name: "fallen_shaman",
                    hp: 30,
                    wander: 1,
                    aggro_radius: 50,
                },
            ],
        }
    }

    pub fn presets(&self) -> &[NpcPreset] {
        &self.presets
    }

    pub fn get(&self, idx: usize) -> &NpcPreset {
        &self.presets[idx % self.presets.len()]
    }
}

/// Scatters `count` NPCs near the origin, cycling through the presets and
/// recording each entity's preset index for the AI pass.
pub fn seed_world(world: &mut World, registry: &NpcRegistry, count: usize, rng: &mut impl Rng) {
    let presets = registry.presets().len();
    for i in 0..count {
        let preset = registry.get(i);
        let ang = rng.gen::<f64>() * std::f64::consts::TAU;
        let r = rng.gen::<f64>() * 10.0;
        let x = (ang.cos() * r).round() as i16;
        let y = (ang.sin() * r).round() as i16;
        let eid = world.spawn_with_hp(
            EntityKind::Npc,
            arena_shared::ids::CharacterId(0),
            x,
            y,
            preset.hp,
        );
        if let Some(row) = world.row(eid) {
            world.preset[row] = (i % presets) as u8;
        }
    }
}

/// One AI pass: gives up to `budget` awake NPCs a small random wander
/// velocity. An NPC is awake when a player is inside its preset's aggro
/// radius. Returns the number of decisions spent.
pub fn run_ai(
    world: &mut World,
    registry: &NpcRegistry,
    budget: usize,
    rng: &mut impl Rng,
) -> usize {
    if budget == 0 {
        return 0;
    }
    let players: Vec<(i16, i16)> = (0..world.ids.len())
        .filter(|&r| world.kind[r] == EntityKind::Player)
        .map(|r| (world.x[r], world.y[r]))
        .collect();
    if players.is_empty() {
        return 0;
    }

    let mut spent = 0;
    for r in 0..world.ids.len() {
        if spent >= budget {
            break;
        }
        if world.kind[r] != EntityKind::Npc {
            continue;
        }
        let preset = registry.get(world.preset[r] as usize);
        let (nx, ny) = (world.x[r], world.y[r]);
        let awake = players
            .iter()
            .any(|&(px, py)| within(nx, ny, px, py, preset.aggro_radius));
        if !awake {
            continue;
        }
        let wander = preset.wander;
        world.vx[r] = rng.gen_range(-wander..=wander);
        world.vy[r] = rng.gen_range(-wander..=wander);
        spent += 1;
    }
    spent
}
