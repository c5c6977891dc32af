use glam::{Vec2, Vec3};

use crate::config::AntiCheatConfig;
use crate::movement::{planar, planar_distance};
use crate::net::ConnectionId;

/// One input as the server sees it before accepting the client's prediction.
#[derive(Debug, Clone, Copy)]
pub struct AntiCheatContext<'a> {
    pub conn: ConnectionId,
    pub last_server_pos: Vec3,
    pub predicted_pos: Vec3,
    /// Planar allowance for this input, slack included.
    pub max_step: f32,
    pub path_corners: Option<&'a [Vec3]>,
    pub running: bool,
    pub dt: f32,
}

/// Advisory check of a client prediction. A `false` result soft-clamps the input; it
/// never disconnects anyone.
pub trait AntiCheatValidator: Send + Sync {
    fn validate_input(&self, ctx: &AntiCheatContext<'_>) -> bool;
}

/// Accepts predictions inside the planar speed envelope and, for click-to-move
/// inputs, near the announced path.
#[derive(Debug, Clone, Copy)]
pub struct SpeedEnvelopeValidator {
    pub path_tolerance: f32,
}

impl SpeedEnvelopeValidator {
    pub fn new(config: &AntiCheatConfig) -> Self {
        Self {
            path_tolerance: config.path_tolerance,
        }
    }
}

impl Default for SpeedEnvelopeValidator {
    fn default() -> Self {
        Self::new(&AntiCheatConfig::default())
    }
}

impl AntiCheatValidator for SpeedEnvelopeValidator {
    fn validate_input(&self, ctx: &AntiCheatContext<'_>) -> bool {
        if planar_distance(ctx.predicted_pos, ctx.last_server_pos) > ctx.max_step + 1e-4 {
            return false;
        }
        match ctx.path_corners {
            Some(corners) if !corners.is_empty() => {
                distance_to_path(ctx.predicted_pos, ctx.last_server_pos, corners)
                    <= self.path_tolerance
            }
            _ => true,
        }
    }
}

fn xz(v: Vec3) -> Vec2 {
    Vec2::new(v.x, v.z)
}

fn distance_to_segment(p: Vec2, a: Vec2, b: Vec2) -> f32 {
    let ab = b - a;
    let len_sq = ab.length_squared();
    if len_sq < 1e-8 {
        return p.distance(a);
    }
    let t = ((p - a).dot(ab) / len_sq).clamp(0.0, 1.0);
    p.distance(a + ab * t)
}

/// Planar distance from `pos` to the polyline `start -> corners...`.
pub fn distance_to_path(pos: Vec3, start: Vec3, corners: &[Vec3]) -> f32 {
    let p = xz(pos);
    let mut prev = xz(start);
    let mut best = p.distance(prev);
    for corner in corners {
        let next = xz(*corner);
        best = best.min(distance_to_segment(p, prev, next));
        prev = next;
    }
    best
}

/// `clamp(1 + 2 * latency * k, min, max)`: late inputs integrate over a longer dt.
pub fn step_slack(one_way_latency: f32, config: &AntiCheatConfig) -> f32 {
    (1.0 + 2.0 * one_way_latency.max(0.0) * config.slack_k).clamp(config.slack_min, config.slack_max)
}

pub fn allowed_step(speed: f32, dt: f32, slack: f32, config: &AntiCheatConfig) -> f32 {
    speed * dt * config.max_speed_tolerance * slack
}

/// Pulls `predicted` back onto the allowance circle around `last` and bounds the
/// vertical change to `max_vertical_speed * dt`.
pub fn soft_clamp(last: Vec3, predicted: Vec3, allowed: f32, max_vertical_speed: f32, dt: f32) -> Vec3 {
    let dir = planar(predicted - last).normalize_or_zero();
    let max_dy = max_vertical_speed * dt;
    let dy = (predicted.y - last.y).clamp(-max_dy, max_dy);
    Vec3::new(last.x + dir.x * allowed, last.y + dy, last.z + dir.z * allowed)
}

/// Shortens the planar part of `pos - last` to at most `allowed`.
pub fn bound_planar_step(last: Vec3, pos: Vec3, allowed: f32) -> Vec3 {
    let delta = planar(pos - last);
    let len = delta.length();
    if len <= allowed || len < 1e-6 {
        return pos;
    }
    let bounded = delta * (allowed / len);
    Vec3::new(last.x + bounded.x, pos.y, last.z + bounded.z)
}

/// Nearest walkable point lookup. Implemented by the host's navigation data.
pub trait NavMeshProjector: Send + Sync {
    fn sample_position(&self, pos: Vec3, max_dist: f32) -> Option<Vec3>;
}

/// Walkable axis-aligned rectangle on the xz plane.
#[derive(Debug, Clone, Copy)]
pub struct RectNavMesh {
    pub min: Vec2,
    pub max: Vec2,
}

impl RectNavMesh {
    pub fn new(min: Vec2, max: Vec2) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }
}

impl NavMeshProjector for RectNavMesh {
    fn sample_position(&self, pos: Vec3, max_dist: f32) -> Option<Vec3> {
        let clamped = xz(pos).clamp(self.min, self.max);
        if clamped.distance(xz(pos)) > max_dist {
            return None;
        }
        Some(Vec3::new(clamped.x, pos.y, clamped.y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(predicted: Vec3, corners: Option<&[Vec3]>) -> AntiCheatContext<'_> {
        AntiCheatContext {
            conn: 1,
            last_server_pos: Vec3::ZERO,
            predicted_pos: predicted,
            max_step: 0.5,
            path_corners: corners,
            running: false,
            dt: 1.0 / 30.0,
        }
    }

    #[test]
    fn slack_is_clamped() {
        let config = AntiCheatConfig::default();
        assert_eq!(step_slack(0.0, &config), 1.0);
        assert!((step_slack(0.25, &config) - 1.3).abs() < 1e-6);
        assert_eq!(step_slack(5.0, &config), 1.75);
    }

    #[test]
    fn validator_checks_planar_envelope() {
        let validator = SpeedEnvelopeValidator::default();
        assert!(validator.validate_input(&ctx(Vec3::new(0.3, 4.0, 0.3), None)));
        assert!(!validator.validate_input(&ctx(Vec3::new(0.6, 0.0, 0.0), None)));
    }

    #[test]
    fn click_to_move_stays_near_path() {
        let validator = SpeedEnvelopeValidator {
            path_tolerance: 0.1,
        };
        let corners = [Vec3::new(10.0, 0.0, 0.0)];
        assert!(validator.validate_input(&ctx(Vec3::new(0.4, 0.0, 0.05), Some(&corners))));
        assert!(!validator.validate_input(&ctx(Vec3::new(0.0, 0.0, 0.4), Some(&corners))));
    }

    #[test]
    fn soft_clamp_lands_on_allowance() {
        let last = Vec3::new(1.0, 0.0, 1.0);
        let out = soft_clamp(last, last + Vec3::new(100.0, 5.0, 0.0), 0.2, 2.0, 0.1);
        assert!((out - Vec3::new(1.2, 0.2, 1.0)).length() < 1e-5);
    }

    #[test]
    fn bound_planar_step_keeps_short_steps() {
        let last = Vec3::ZERO;
        let short = Vec3::new(0.1, 0.0, 0.1);
        assert_eq!(bound_planar_step(last, short, 1.0), short);
        let long = bound_planar_step(last, Vec3::new(3.0, 1.0, 4.0), 1.0);
        assert!((planar(long).length() - 1.0).abs() < 1e-5);
        assert_eq!(long.y, 1.0);
    }

    #[test]
    fn rect_navmesh_projects_nearby_points() {
        let mesh = RectNavMesh::new(Vec2::new(-5.0, -5.0), Vec2::new(5.0, 5.0));
        let inside = Vec3::new(1.0, 2.0, 1.0);
        assert_eq!(mesh.sample_position(inside, 1.0), Some(inside));
        assert_eq!(
            mesh.sample_position(Vec3::new(5.5, 0.0, 0.0), 1.0),
            Some(Vec3::new(5.0, 0.0, 0.0))
        );
        assert_eq!(mesh.sample_position(Vec3::new(9.0, 0.0, 0.0), 1.0), None);
    }
}
