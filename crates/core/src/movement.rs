use glam::Vec3;

use crate::config::LocomotionConfig;
use crate::net::hash64;

pub const ANIM_IDLE: u8 = 0;
pub const ANIM_WALK: u8 = 1;
pub const ANIM_RUN: u8 = 2;

/// Authoritative state of one actor at one accepted input.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MovementSnapshot {
    pub pos: Vec3,
    pub vel: Vec3,
    pub server_time: f64,
    pub seq: u32,
    pub anim_state: u8,
}

/// Input the owner has sent but the server has not yet acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct InputState {
    pub dir: Vec3,
    pub running: bool,
    pub seq: u32,
    pub dt: f32,
    pub local_time: f64,
}

pub fn planar(v: Vec3) -> Vec3 {
    Vec3::new(v.x, 0.0, v.z)
}

pub fn planar_distance(a: Vec3, b: Vec3) -> f32 {
    planar(a - b).length()
}

pub fn anim_state_for(planar_speed: f32, running: bool) -> u8 {
    if planar_speed <= 0.12 {
        ANIM_IDLE
    } else if running {
        ANIM_RUN
    } else {
        ANIM_WALK
    }
}

/// One planar step. The server and the owner's input replay both go through here so
/// their results agree bit for bit.
pub fn integrate_step(
    start: Vec3,
    dir: Vec3,
    running: bool,
    dt: f32,
    locomotion: &LocomotionConfig,
) -> Vec3 {
    let step = planar(dir).normalize_or_zero() * locomotion.speed(running) * dt;
    start + step
}

/// Digest of the fields a receiver can observe after decoding.
pub fn state_hash(snap: &MovementSnapshot) -> u64 {
    let mut buf = Vec::with_capacity(48);
    buf.extend_from_slice(&snap.server_time.to_le_bytes());
    buf.extend_from_slice(&f64::from(snap.pos.x).to_le_bytes());
    buf.extend_from_slice(&f64::from(snap.pos.z).to_le_bytes());
    buf.extend_from_slice(&f64::from(snap.vel.x).to_le_bytes());
    buf.extend_from_slice(&f64::from(snap.vel.z).to_le_bytes());
    buf.extend_from_slice(&i64::from(snap.seq).to_le_bytes());
    hash64(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrate_ignores_vertical_and_normalizes() {
        let locomotion = LocomotionConfig::default();
        let out = integrate_step(Vec3::ZERO, Vec3::new(3.0, 5.0, 4.0), false, 0.5, &locomotion);
        assert!((out.x - 1.2).abs() < 1e-5);
        assert!((out.z - 1.6).abs() < 1e-5);
        assert_eq!(out.y, 0.0);
    }

    #[test]
    fn running_applies_multiplier() {
        let locomotion = LocomotionConfig::default();
        let out = integrate_step(Vec3::ZERO, Vec3::X, true, 1.0, &locomotion);
        assert!((out.x - 6.0).abs() < 1e-5);
    }

    #[test]
    fn zero_direction_stays_put() {
        let locomotion = LocomotionConfig::default();
        let start = Vec3::new(1.0, 2.0, 3.0);
        assert_eq!(integrate_step(start, Vec3::ZERO, true, 0.1, &locomotion), start);
    }

    #[test]
    fn state_hash_ignores_height_and_anim() {
        let a = MovementSnapshot {
            pos: Vec3::new(1.0, 2.0, 3.0),
            vel: Vec3::X,
            server_time: 4.5,
            seq: 9,
            anim_state: ANIM_WALK,
        };
        let b = MovementSnapshot {
            pos: Vec3::new(1.0, 8.0, 3.0),
            anim_state: ANIM_RUN,
            ..a
        };
        assert_eq!(state_hash(&a), state_hash(&b));
        let c = MovementSnapshot { seq: 10, ..a };
        assert_ne!(state_hash(&a), state_hash(&c));
    }
}
