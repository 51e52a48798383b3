//! Spatial hash grid.
//!
//! Derived state, rebuilt from scratch each tick after physics; it holds
//! only entity ids and must never be read outside the tick task. Queries
//! return candidates from every cell overlapped by the circle; callers do
//! the exact distance check.

use std::collections::HashMap;

use arena_shared::ids::EntityId;

use crate::world::World;

#[derive(Debug)]
pub struct Grid {
    cell_size: i16,
    cells: HashMap<(i32, i32), Vec<EntityId>>,
}

impl Grid {
    pub fn new(cell_size: i16) -> Self {
        let cell_size = if cell_size <= 0 { 8 } else { cell_size };
        Self {
            cell_size,
            cells: HashMap::with_capacity(256),
        }
    }

    fn cell_of(&self, x: i16, y: i16) -> (i32, i32) {
        let cs = self.cell_size as i32;
        ((x as i32).div_euclid(cs), (y as i32).div_euclid(cs))
    }

    /// Drops every bucket and reinserts each live entity into exactly one
    /// cell based on its current position.
    pub fn rebuild(&mut self, world: &World) {
        self.cells.clear();
        for r in 0..world.ids.len() {
            let key = self.cell_of(world.x[r], world.y[r]);
            self.cells.entry(key).or_default().push(world.ids[r]);
        }
    }

    /// Candidate ids in cells overlapped by the circle at `(cx, cy)`.
    pub fn query_circle(&self, cx: i16, cy: i16, r: i16) -> Vec<EntityId> {
        if r < 0 {
            return Vec::new();
        }
        let (min_x, min_y) = self.cell_of(cx.saturating_sub(r), cy.saturating_sub(r));
        let (max_x, max_y) = self.cell_of(cx.saturating_add(r), cy.saturating_add(r));
        let mut out = Vec::new();
        for x in min_x..=max_x {
            for y in min_y..=max_y {
                if let Some(ids) = self.cells.get(&(x, y)) {
                    out.extend_from_slice(ids);
                }
            }
        }
        out
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Total ids across all cells; equals the world population after a
    /// rebuild.
    pub fn entry_count(&self) -> usize {
        self.cells.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_shared::ids::CharacterId;
    use arena_shared::replicate::EntityKind;

    #[test]
    fn rebuild_places_every_entity_in_exactly_one_cell() {
        let mut w = World::new();
        for i in 0..20 {
            w.spawn(EntityKind::Npc, CharacterId(0), i * 7 - 70, -i * 3);
        }
        let mut g = Grid::new(8);
        g.rebuild(&w);
        assert_eq!(g.entry_count(), w.len());

        // A second rebuild does not duplicate entries.
        g.rebuild(&w);
        assert_eq!(g.entry_count(), w.len());
    }

    #[test]
    fn query_finds_nearby_and_skips_far() {
        let mut w = World::new();
        let near = w.spawn(EntityKind::Npc, CharacterId(0), 3, 3);
        let far = w.spawn(EntityKind::Npc, CharacterId(0), 500, 500);
        let mut g = Grid::new(8);
        g.rebuild(&w);

        let hits = g.query_circle(0, 0, 10);
        assert!(hits.contains(&near));
        assert!(!hits.contains(&far));
    }

    #[test]
    fn negative_coordinates_floor_correctly() {
        let mut w = World::new();
        let e = w.spawn(EntityKind::Npc, CharacterId(0), -1, -1);
        let mut g = Grid::new(8);
        g.rebuild(&w);
        // (-1, -1) lives in cell (-1, -1), not (0, 0).
        assert!(g.query_circle(-4, -4, 3).contains(&e));
        assert_eq!(g.cell_count(), 1);
    }
}
