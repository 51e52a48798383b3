//! Area-of-interest replication.
//!
//! Per player and per tick the zone builds up to three channel payloads:
//! one drained text event, position deltas for nearby interest-matched
//! entities, and HP deltas at the state cadence. Channels are trimmed
//! greedily against a shared byte budget in priority order
//! event > move > state, accounting the exact encoded payload size.
//! Observer caches advance only for events that survive trimming, so
//! anything cut under pressure is retried on a later tick.

use std::collections::HashSet;

use arena_shared::ids::EntityId;
use arena_shared::replicate::{payload_size, RepChannel, RepEvent, REP_HEADER_LEN};

use crate::grid::Grid;
use crate::player::Player;
use crate::world::{dist2, World};

/// Cap on move-channel events per tick.
pub const MOVE_CAP: usize = 256;
/// Cap on state-channel events per tick.
pub const STATE_CAP: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct AoiParams {
    pub aoi_radius: i16,
    pub budget_bytes: usize,
    /// Whether this tick is on the state cadence.
    pub state_tick: bool,
}

/// Longest event prefix whose encoded payload fits `budget`.
fn fit_prefix(events: &[RepEvent], budget: usize) -> usize {
    if REP_HEADER_LEN > budget {
        return 0;
    }
    let mut size = REP_HEADER_LEN;
    let mut kept = 0;
    for ev in events {
        let s = ev.wire_size();
        if size + s > budget {
            break;
        }
        size += s;
        kept += 1;
    }
    kept
}

/// Builds this player's replication frames for one tick, advancing the
/// observer caches for everything that survived the budget.
pub fn build_player_frames(
    world: &World,
    grid: &Grid,
    player: &mut Player,
    params: &AoiParams,
) -> Vec<(RepChannel, Vec<RepEvent>)> {
    let mut frames = Vec::with_capacity(3);
    let mut budget = params.budget_bytes;

    // Event channel: at most one queued text event, and only if it fits.
    if let Some(text) = player.pending_events.front() {
        let ev = RepEvent::EventText(text.clone());
        let size = REP_HEADER_LEN + ev.wire_size();
        if size <= budget {
            budget -= size;
            player.pending_events.pop_front();
            frames.push((RepChannel::Event, vec![ev]));
        }
    }

    let Some((px, py)) = world.pos(player.eid) else {
        return frames;
    };
    let radius = params.aoi_radius;
    let r2 = (radius as i64) * (radius as i64);

    // Candidates within the AOI circle, nearest first (ties by id).
    let mut nearby: Vec<(i64, EntityId)> = grid
        .query_circle(px, py, radius)
        .into_iter()
        .filter_map(|eid| {
            let (x, y) = world.pos(eid)?;
            let d2 = dist2(px, py, x, y);
            (d2 <= r2).then_some((d2, eid))
        })
        .collect();
    nearby.sort_unstable();
    let nearby_set: HashSet<EntityId> = nearby.iter().map(|&(_, eid)| eid).collect();

    // Known entities that left the AOI (or the world) despawn first.
    let mut gone: Vec<EntityId> = player
        .known
        .iter()
        .copied()
        .filter(|eid| !nearby_set.contains(eid))
        .collect();
    gone.sort_unstable();

    let mut moves: Vec<RepEvent> = Vec::new();
    for eid in gone {
        if moves.len() >= MOVE_CAP {
            break;
        }
        moves.push(RepEvent::Despawn { eid });
    }
    for &(_, eid) in &nearby {
        if moves.len() >= MOVE_CAP {
            break;
        }
        let row = match world.row(eid) {
            Some(r) => r,
            None => continue,
        };
        if !player.interest.matches(world.mask[row]) {
            continue;
        }
        let pos = (world.x[row], world.y[row]);
        if !player.known.contains(&eid) {
            moves.push(RepEvent::Spawn {
                eid,
                kind: world.kind[row],
                mask: world.mask[row].bits(),
                x: pos.0,
                y: pos.1,
            });
        } else if player.last_pos.get(&eid) != Some(&pos) {
            moves.push(RepEvent::Move {
                eid,
                x: pos.0,
                y: pos.1,
            });
        }
    }

    let kept = fit_prefix(&moves, budget);
    if kept > 0 {
        moves.truncate(kept);
        budget -= payload_size(&moves);
        for ev in &moves {
            match *ev {
                RepEvent::Despawn { eid } => player.forget(eid),
                RepEvent::Spawn { eid, x, y, .. } => {
                    player.known.insert(eid);
                    player.last_pos.insert(eid, (x, y));
                }
                RepEvent::Move { eid, x, y } => {
                    player.last_pos.insert(eid, (x, y));
                }
                _ => {}
            }
        }
        frames.push((RepChannel::Move, moves));
    }

    // State channel, only at its cadence.
    if params.state_tick {
        let mut known_sorted: Vec<EntityId> = player.known.iter().copied().collect();
        known_sorted.sort_unstable();

        let mut states: Vec<RepEvent> = Vec::new();
        for eid in known_sorted {
            if states.len() >= STATE_CAP {
                break;
            }
            let row = match world.row(eid) {
                Some(r) => r,
                None => continue,
            };
            if !player.interest.matches(world.mask[row]) {
                continue;
            }
            let hp = world.hp[row];
            if player.last_hp.get(&eid) != Some(&hp) {
                states.push(RepEvent::StateHp { eid, hp });
            }
        }

        let kept = fit_prefix(&states, budget);
        if kept > 0 {
            states.truncate(kept);
            for ev in &states {
                if let RepEvent::StateHp { eid, hp } = *ev {
                    player.last_hp.insert(eid, hp);
                }
            }
            frames.push((RepChannel::State, states));
        }
    }

    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_shared::ids::{CharacterId, SessionId};
    use arena_shared::interest::Interest;
    use arena_shared::replicate::EntityKind;

    struct Fixture {
        world: World,
        grid: Grid,
        player: Player,
    }

    fn fixture_with_npcs(n: usize) -> Fixture {
        let mut world = World::new();
        let eid = world.spawn(EntityKind::Player, CharacterId(1), 0, 0);
        for i in 0..n {
            // Spread along +x inside the AOI so distance ordering is known.
            world.spawn(EntityKind::Npc, CharacterId(0), (i as i16) + 1, 0);
        }
        let mut grid = Grid::new(8);
        grid.rebuild(&world);
        let player = Player::new(SessionId([1u8; 16]), CharacterId(1), eid, Interest::all_channels());
        Fixture { world, grid, player }
    }

    fn params(budget: usize, state_tick: bool) -> AoiParams {
        AoiParams {
            aoi_radius: 25,
            budget_bytes: budget,
            state_tick,
        }
    }

    fn move_frame(frames: &[(RepChannel, Vec<RepEvent>)]) -> Option<&Vec<RepEvent>> {
        frames
            .iter()
            .find(|(c, _)| *c == RepChannel::Move)
            .map(|(_, e)| e)
    }

    #[test]
    fn first_pass_spawns_nearest_first() {
        let mut f = fixture_with_npcs(3);
        let frames = build_player_frames(&f.world, &f.grid, &mut f.player, &params(900, false));
        let moves = move_frame(&frames).unwrap();
        // Self first (distance 0), then NPCs by distance.
        assert_eq!(moves.len(), 4);
        assert!(matches!(moves[0], RepEvent::Spawn { eid, .. } if eid == f.player.eid));
        for w in moves.windows(2) {
            if let (RepEvent::Spawn { x: a, .. }, RepEvent::Spawn { x: b, .. }) = (&w[0], &w[1]) {
                assert!(a <= b);
            }
        }
        assert_eq!(f.player.known.len(), 4);
    }

    #[test]
    fn second_pass_is_quiet_when_nothing_moved() {
        let mut f = fixture_with_npcs(3);
        build_player_frames(&f.world, &f.grid, &mut f.player, &params(900, false));
        let frames = build_player_frames(&f.world, &f.grid, &mut f.player, &params(900, false));
        assert!(move_frame(&frames).is_none());
    }

    #[test]
    fn movement_emits_move_not_spawn() {
        let mut f = fixture_with_npcs(1);
        build_player_frames(&f.world, &f.grid, &mut f.player, &params(900, false));

        let npc = f.world.ids[1];
        let r = f.world.row(npc).unwrap();
        f.world.x[r] += 2;
        f.grid.rebuild(&f.world);

        let frames = build_player_frames(&f.world, &f.grid, &mut f.player, &params(900, false));
        let moves = move_frame(&frames).unwrap();
        assert_eq!(moves.len(), 1);
        assert!(matches!(moves[0], RepEvent::Move { eid, .. } if eid == npc));
    }

    #[test]
    fn leaving_aoi_emits_despawn_and_forgets() {
        let mut f = fixture_with_npcs(1);
        build_player_frames(&f.world, &f.grid, &mut f.player, &params(900, false));

        let npc = f.world.ids[1];
        let r = f.world.row(npc).unwrap();
        f.world.x[r] = 500;
        f.grid.rebuild(&f.world);

        let frames = build_player_frames(&f.world, &f.grid, &mut f.player, &params(900, false));
        let moves = move_frame(&frames).unwrap();
        assert!(moves.contains(&RepEvent::Despawn { eid: npc }));
        assert!(!f.player.known.contains(&npc));
    }

    #[test]
    fn interest_mask_filters_candidates() {
        let mut f = fixture_with_npcs(2);
        let npc = f.world.ids[1];
        let r = f.world.row(npc).unwrap();
        f.world.mask[r] = Interest::COMBAT; // player subscribes to all, but
        f.player.interest = Interest::MOVE; // entity offers no move channel
        let frames = build_player_frames(&f.world, &f.grid, &mut f.player, &params(900, false));
        let moves = move_frame(&frames).unwrap();
        assert!(!moves
            .iter()
            .any(|ev| matches!(ev, RepEvent::Spawn { eid, .. } if *eid == npc)));
    }

    #[test]
    fn budget_trims_to_nearest_eight_moves() {
        let mut f = fixture_with_npcs(40);
        // Make everything known with generous budget first.
        build_player_frames(&f.world, &f.grid, &mut f.player, &params(100_000, false));

        // Move every entity so each known id produces a 9-byte Move.
        for r in 0..f.world.ids.len() {
            f.world.y[r] += 1;
        }
        f.grid.rebuild(&f.world);

        let frames = build_player_frames(&f.world, &f.grid, &mut f.player, &params(100, true));
        let moves = move_frame(&frames).unwrap();
        // header 23 + 8 * 9 = 95 <= 100; a ninth would overflow.
        assert_eq!(moves.len(), 8);
        assert!(moves.iter().all(|ev| matches!(ev, RepEvent::Move { .. })));
        assert!(payload_size(moves) <= 100);
        // Nothing left for the state channel.
        assert!(!frames.iter().any(|(c, _)| *c == RepChannel::State));
        // Untrimmed entities keep their stale cache and retry later.
        let trimmed: Vec<_> = f
            .player
            .last_pos
            .values()
            .filter(|&&(_, y)| y == 0)
            .collect();
        assert_eq!(trimmed.len(), 33); // 41 known - 8 updated
    }

    #[test]
    fn trimmed_spawn_stays_unknown() {
        let mut f = fixture_with_npcs(10);
        // Budget fits the header plus two 14-byte spawns only.
        let frames = build_player_frames(&f.world, &f.grid, &mut f.player, &params(23 + 29, false));
        let moves = move_frame(&frames).unwrap();
        assert_eq!(moves.len(), 2);
        assert_eq!(f.player.known.len(), 2);

        // The rest arrive on the next pass with budget to spare.
        let frames = build_player_frames(&f.world, &f.grid, &mut f.player, &params(900, false));
        assert_eq!(move_frame(&frames).unwrap().len(), 9);
        assert_eq!(f.player.known.len(), 11);
    }

    #[test]
    fn event_channel_drains_one_and_consumes_budget_first() {
        let mut f = fixture_with_npcs(0);
        f.player.pending_events.push_back("hit".to_string());
        f.player.pending_events.push_back("later".to_string());

        let frames = build_player_frames(&f.world, &f.grid, &mut f.player, &params(900, false));
        assert_eq!(
            frames.iter().filter(|(c, _)| *c == RepChannel::Event).count(),
            1
        );
        assert_eq!(f.player.pending_events.len(), 1);

        // A budget too small for the event leaves it queued.
        let mut f2 = fixture_with_npcs(0);
        f2.player.pending_events.push_back("hit".to_string());
        let frames = build_player_frames(&f2.world, &f2.grid, &mut f2.player, &params(10, false));
        assert!(frames.is_empty());
        assert_eq!(f2.player.pending_events.len(), 1);
    }

    #[test]
    fn state_channel_sends_hp_deltas_at_cadence() {
        let mut f = fixture_with_npcs(2);
        build_player_frames(&f.world, &f.grid, &mut f.player, &params(900, false));

        // Not a state tick: HP changes are withheld.
        let npc = f.world.ids[1];
        f.world.apply_damage(npc, 5);
        let frames = build_player_frames(&f.world, &f.grid, &mut f.player, &params(900, false));
        assert!(!frames.iter().any(|(c, _)| *c == RepChannel::State));

        // State tick: every known entity without a cached HP reports.
        let frames = build_player_frames(&f.world, &f.grid, &mut f.player, &params(900, true));
        let (_, states) = frames
            .iter()
            .find(|(c, _)| *c == RepChannel::State)
            .unwrap();
        assert_eq!(states.len(), 3);
        assert!(states.contains(&RepEvent::StateHp { eid: npc, hp: 45 }));

        // Cached now; a further state tick with no change is silent.
        let frames = build_player_frames(&f.world, &f.grid, &mut f.player, &params(900, true));
        assert!(!frames.iter().any(|(c, _)| *c == RepChannel::State));
    }

    #[test]
    fn identical_state_gives_identical_output() {
        let mut a = fixture_with_npcs(5);
        let mut b = fixture_with_npcs(5);
        let fa = build_player_frames(&a.world, &a.grid, &mut a.player, &params(900, true));
        let fb = build_player_frames(&b.world, &b.grid, &mut b.player, &params(900, true));
        assert_eq!(fa, fb);
    }
}
