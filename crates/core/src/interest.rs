use std::collections::{BTreeSet, HashMap};

use glam::Vec3;

use crate::config::BroadcastConfig;
use crate::net::ConnectionId;

pub type Cell = (i32, i32);

/// Spatial index of actors by integer cell.
pub trait ChunkInterest {
    fn cell_size(&self) -> i32;

    fn cell_of(&self, pos: Vec3) -> Cell {
        let size = self.cell_size().max(1) as f32;
        ((pos.x / size).floor() as i32, (pos.z / size).floor() as i32)
    }

    fn actor_cell(&self, conn: ConnectionId) -> Option<Cell>;

    /// Connections whose actor lies within Chebyshev distance `radius` of `owner`'s
    /// cell, excluding `owner`.
    fn collect_within_radius(
        &self,
        owner: ConnectionId,
        radius: i32,
        out: &mut BTreeSet<ConnectionId>,
    );
}

#[derive(Debug, Clone)]
pub struct GridInterest {
    cell_size: i32,
    actors: HashMap<ConnectionId, Cell>,
}

impl GridInterest {
    pub fn new(cell_size: i32) -> Self {
        Self {
            cell_size: cell_size.max(1),
            actors: HashMap::new(),
        }
    }

    /// Returns true when the actor changed cell or was newly registered.
    pub fn update_actor(&mut self, conn: ConnectionId, pos: Vec3) -> bool {
        let cell = self.cell_of(pos);
        self.actors.insert(conn, cell) != Some(cell)
    }

    pub fn remove_actor(&mut self, conn: ConnectionId) {
        self.actors.remove(&conn);
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }
}

impl ChunkInterest for GridInterest {
    fn cell_size(&self) -> i32 {
        self.cell_size
    }

    fn actor_cell(&self, conn: ConnectionId) -> Option<Cell> {
        self.actors.get(&conn).copied()
    }

    fn collect_within_radius(
        &self,
        owner: ConnectionId,
        radius: i32,
        out: &mut BTreeSet<ConnectionId>,
    ) {
        let Some((ox, oy)) = self.actor_cell(owner) else {
            return;
        };
        out.extend(
            self.actors
                .iter()
                .filter(|(conn, (x, y))| {
                    **conn != owner && (x - ox).abs().max((y - oy).abs()) <= radius
                })
                .map(|(conn, _)| *conn),
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ring {
    Near,
    Mid,
    Far,
}

impl Ring {
    pub const ALL: [Ring; 3] = [Ring::Near, Ring::Mid, Ring::Far];

    pub fn radius(self, config: &BroadcastConfig) -> i32 {
        match self {
            Ring::Near => config.near_ring,
            Ring::Mid => config.mid_ring,
            Ring::Far => config.far_ring,
        }
    }

    pub fn hz(self, config: &BroadcastConfig) -> f64 {
        match self {
            Ring::Near => config.near_hz,
            Ring::Mid => config.mid_hz,
            Ring::Far => config.far_hz,
        }
    }

    pub fn interval(self, config: &BroadcastConfig) -> f64 {
        1.0 / self.hz(config).max(0.1)
    }
}

/// Observers of one actor split into disjoint rings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RingSets {
    pub near: BTreeSet<ConnectionId>,
    pub mid: BTreeSet<ConnectionId>,
    pub far: BTreeSet<ConnectionId>,
}

impl RingSets {
    pub fn collect(
        interest: &dyn ChunkInterest,
        owner: ConnectionId,
        config: &BroadcastConfig,
    ) -> Self {
        let mut near = BTreeSet::new();
        let mut mid = BTreeSet::new();
        let mut far = BTreeSet::new();
        interest.collect_within_radius(owner, config.near_ring, &mut near);
        interest.collect_within_radius(owner, config.mid_ring, &mut mid);
        interest.collect_within_radius(owner, config.far_ring, &mut far);

        mid.retain(|c| !near.contains(c));
        far.retain(|c| !near.contains(c) && !mid.contains(c));
        Self { near, mid, far }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Ring, ConnectionId)> + '_ {
        self.near
            .iter()
            .map(|c| (Ring::Near, *c))
            .chain(self.mid.iter().map(|c| (Ring::Mid, *c)))
            .chain(self.far.iter().map(|c| (Ring::Far, *c)))
    }

    pub fn ring_of(&self, conn: ConnectionId) -> Option<Ring> {
        self.iter().find(|(_, c)| *c == conn).map(|(ring, _)| ring)
    }

    pub fn len(&self) -> usize {
        self.near.len() + self.mid.len() + self.far.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> GridInterest {
        let mut grid = GridInterest::new(10);
        grid.update_actor(1, Vec3::new(5.0, 0.0, 5.0));
        grid.update_actor(2, Vec3::new(15.0, 0.0, -5.0));
        grid.update_actor(3, Vec3::new(25.0, 0.0, 5.0));
        grid.update_actor(4, Vec3::new(-25.0, 0.0, 35.0));
        grid.update_actor(5, Vec3::new(100.0, 0.0, 0.0));
        grid
    }

    #[test]
    fn cells_floor_negative_positions() {
        let grid = GridInterest::new(10);
        assert_eq!(grid.cell_of(Vec3::new(-0.5, 3.0, 19.9)), (-1, 1));
        assert_eq!(grid.cell_of(Vec3::new(10.0, 0.0, -10.0)), (1, -1));
    }

    #[test]
    fn update_reports_cell_changes() {
        let mut grid = GridInterest::new(10);
        assert!(grid.update_actor(1, Vec3::new(1.0, 0.0, 1.0)));
        assert!(!grid.update_actor(1, Vec3::new(2.0, 0.0, 1.0)));
        assert!(grid.update_actor(1, Vec3::new(12.0, 0.0, 1.0)));
    }

    #[test]
    fn rings_are_disjoint_and_exclude_owner() {
        let grid = grid();
        let rings = RingSets::collect(&grid, 1, &BroadcastConfig::default());
        assert_eq!(rings.near, BTreeSet::from([2]));
        assert_eq!(rings.mid, BTreeSet::from([3]));
        assert_eq!(rings.far, BTreeSet::from([4]));
        assert_eq!(rings.ring_of(5), None);
        assert_eq!(rings.ring_of(1), None);
        assert_eq!(rings.len(), 3);
    }

    #[test]
    fn unknown_owner_has_no_observers() {
        let grid = grid();
        let rings = RingSets::collect(&grid, 99, &BroadcastConfig::default());
        assert!(rings.is_empty());
    }

    #[test]
    fn ring_intervals_follow_hz() {
        let config = BroadcastConfig::default();
        assert!((Ring::Near.interval(&config) - 1.0 / 30.0).abs() < 1e-12);
        assert!((Ring::Far.interval(&config) - 1.0 / 3.0).abs() < 1e-12);
    }
}
