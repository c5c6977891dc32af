use std::collections::VecDeque;
use std::fmt::Write;

use crate::config::ReplayConfig;
use crate::movement::MovementSnapshot;

/// Rolling history of authoritative snapshots for one actor, ordered by server time.
/// Bounded by count (`history_seconds * tick_hz`) and by age.
#[derive(Debug, Clone)]
pub struct SnapshotReplay {
    history: VecDeque<MovementSnapshot>,
    capacity: usize,
    history_seconds: f64,
}

impl SnapshotReplay {
    pub fn new(config: &ReplayConfig) -> Self {
        let capacity = (config.history_seconds.max(0.0) * f64::from(config.tick_hz)).ceil() as usize;
        Self::with_capacity(capacity.max(1), config.history_seconds)
    }

    pub fn with_capacity(capacity: usize, history_seconds: f64) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            history_seconds,
        }
    }

    pub fn save(&mut self, snap: MovementSnapshot) {
        match self.history.back() {
            Some(last) if snap.server_time < last.server_time => {
                let at = self.history.partition_point(|s| s.server_time <= snap.server_time);
                self.history.insert(at, snap);
            }
            _ => self.history.push_back(snap),
        }

        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
        if let Some(newest) = self.history.back().map(|s| s.server_time) {
            let cutoff = newest - self.history_seconds;
            while self.history.front().is_some_and(|s| s.server_time < cutoff) {
                self.history.pop_front();
            }
        }
    }

    /// Latest snapshot at or before `t`.
    pub fn snapshot_at(&self, t: f64) -> Option<&MovementSnapshot> {
        let idx = self.history.partition_point(|s| s.server_time <= t);
        idx.checked_sub(1).and_then(|i| self.history.get(i))
    }

    pub fn range(&self, from: f64, to: f64) -> impl Iterator<Item = &MovementSnapshot> + '_ {
        self.history
            .iter()
            .filter(move |s| s.server_time >= from && s.server_time <= to)
    }

    /// Visits every snapshot in `[from, to]` oldest first. Returns how many were visited.
    pub fn replay(&self, from: f64, to: f64, mut visit: impl FnMut(&MovementSnapshot)) -> usize {
        let mut count = 0;
        for snap in self.range(from, to) {
            visit(snap);
            count += 1;
        }
        count
    }

    /// CSV dump: `server_time,seq,pos_x,pos_y,pos_z,vel_x,vel_y,vel_z,anim`.
    pub fn export_trace(&self) -> String {
        let mut out = String::from("server_time,seq,pos_x,pos_y,pos_z,vel_x,vel_y,vel_z,anim\n");
        for s in &self.history {
            let _ = writeln!(
                out,
                "{:.3},{},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{}",
                s.server_time, s.seq, s.pos.x, s.pos.y, s.pos.z, s.vel.x, s.vel.y, s.vel.z, s.anim_state
            );
        }
        out
    }

    pub fn latest(&self) -> Option<&MovementSnapshot> {
        self.history.back()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;

    fn snap(t: f64, seq: u32) -> MovementSnapshot {
        MovementSnapshot {
            pos: Vec3::new(t as f32, 0.0, 0.0),
            server_time: t,
            seq,
            ..Default::default()
        }
    }

    #[test]
    fn capacity_drops_oldest() {
        let mut replay = SnapshotReplay::with_capacity(4, 100.0);
        for i in 0..10 {
            replay.save(snap(i as f64, i));
        }
        assert_eq!(replay.len(), 4);
        assert_eq!(replay.snapshot_at(100.0).unwrap().seq, 9);
        assert!(replay.snapshot_at(5.5).is_none());
    }

    #[test]
    fn age_prunes_old_entries() {
        let mut replay = SnapshotReplay::with_capacity(1000, 1.0);
        for i in 0..40 {
            replay.save(snap(i as f64 * 0.1, i));
        }
        assert!(replay.range(0.0, 10.0).all(|s| s.server_time >= 2.9 - 1e-9));
    }

    #[test]
    fn lookup_and_replay_in_order() {
        let mut replay = SnapshotReplay::new(&ReplayConfig::default());
        replay.save(snap(1.0, 1));
        replay.save(snap(3.0, 3));
        replay.save(snap(2.0, 2));

        assert_eq!(replay.snapshot_at(2.5).unwrap().seq, 2);
        assert_eq!(replay.snapshot_at(3.0).unwrap().seq, 3);
        assert!(replay.snapshot_at(0.5).is_none());

        let mut seen = Vec::new();
        assert_eq!(replay.replay(1.0, 3.0, |s| seen.push(s.seq)), 3);
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn trace_has_header_and_rows() {
        let mut replay = SnapshotReplay::with_capacity(8, 10.0);
        replay.save(snap(0.5, 7));
        let trace = replay.export_trace();
        let lines: Vec<_> = trace.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("0.500,7,0.500,"));
        replay.clear();
        assert!(replay.is_empty());
    }
}
