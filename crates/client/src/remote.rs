use std::collections::VecDeque;
use std::sync::Arc;

use glam::{EulerRot, Quat, Vec3};

use stride::movement::planar;
use stride::{ANIM_RUN, ElevationPolicyMode, GroundSampler, MovementConfig, MovementSnapshot};

const DEFAULT_RTT_SECONDS: f64 = 0.06;
const LOW_VELOCITY_SQ: f32 = 0.0001;
const TINY_MOVE_SQ: f32 = 0.000_004;
const FACING_MIN_MOVE_SQ: f32 = 0.0004;
const FACING_MIN_SPEED: f32 = 0.5;

/// What the host should show for a remote actor after a render step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteView {
    pub pos: Vec3,
    pub facing: Quat,
    pub display_speed: f32,
    pub anim_state: u8,
    pub running: bool,
    pub extrapolating: bool,
}

/// A render target picked from the buffer, before smoothing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderSample {
    pub target: Vec3,
    pub anim_state: u8,
    pub vertical_intent: bool,
    pub extrapolated: bool,
}

fn hermite(p0: Vec3, v0: Vec3, p1: Vec3, v1: Vec3, t: f32) -> Vec3 {
    let t2 = t * t;
    let t3 = t2 * t;
    let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
    let h10 = t3 - 2.0 * t2 + t;
    let h01 = -2.0 * t3 + 3.0 * t2;
    let h11 = t3 - t2;
    h00 * p0 + h10 * v0 + h01 * p1 + h11 * v1
}

/// Interpolation state for one remote actor.
///
/// Snapshots are kept ordered by server time. Rendering happens at `now - backoff`,
/// where the backoff follows the measured delay and jitter of incoming snapshots.
pub struct RemoteRenderer {
    config: Arc<MovementConfig>,
    ground: Option<Arc<dyn GroundSampler>>,
    buffer: VecDeque<MovementSnapshot>,
    ema_delay: Option<f64>,
    ema_jitter: Option<f64>,
    back: f64,
    back_target: f64,
    position: Option<Vec3>,
    last_render_pos: Vec3,
    display_speed: f32,
    facing: Quat,
}

impl RemoteRenderer {
    /// `rtt` seeds the initial backoff, if one is known.
    pub fn new(config: Arc<MovementConfig>, rtt: Option<f64>) -> Self {
        let interp = &config.interpolation;
        let rtt = rtt.map_or(DEFAULT_RTT_SECONDS, |r| r.max(0.01));
        let back = (rtt * 0.6).clamp(interp.min_back, interp.max_back);
        let capacity = interp.max_buffer;
        Self {
            config,
            ground: None,
            buffer: VecDeque::with_capacity(capacity),
            ema_delay: None,
            ema_jitter: None,
            back,
            back_target: back,
            position: None,
            last_render_pos: Vec3::ZERO,
            display_speed: 0.0,
            facing: Quat::IDENTITY,
        }
    }

    pub fn with_ground(mut self, ground: Arc<dyn GroundSampler>) -> Self {
        self.ground = Some(ground);
        self
    }

    pub fn buffer(&self) -> &VecDeque<MovementSnapshot> {
        &self.buffer
    }

    pub fn latest(&self) -> Option<&MovementSnapshot> {
        self.buffer.back()
    }

    pub fn backoff(&self) -> f64 {
        self.back
    }

    pub fn backoff_target(&self) -> f64 {
        self.back_target
    }

    pub fn ema_delay(&self) -> f64 {
        self.ema_delay.unwrap_or(0.0)
    }

    pub fn ema_jitter(&self) -> f64 {
        self.ema_jitter.unwrap_or(0.0)
    }

    pub fn position(&self) -> Option<Vec3> {
        self.position
    }

    /// Inserts a decoded snapshot in server-time order and updates the backoff target.
    pub fn push(&mut self, snap: MovementSnapshot, server_now: f64) {
        if self.buffer.iter().any(|s| s.seq == snap.seq) {
            return;
        }
        if self.position.is_none() {
            self.position = Some(snap.pos);
            self.last_render_pos = snap.pos;
        }

        let at = self
            .buffer
            .partition_point(|s| s.server_time <= snap.server_time);
        self.buffer.insert(at, snap);
        while self.buffer.len() > self.config.interpolation.max_buffer.max(2) {
            self.buffer.pop_front();
        }

        let interp = &self.config.interpolation;
        let delay = (server_now - snap.server_time).max(0.0);
        let ema_delay = self.ema_delay.map_or(delay, |ema| {
            (1.0 - interp.delay_alpha) * ema + interp.delay_alpha * delay
        });
        let deviation = (delay - ema_delay).abs();
        let ema_jitter = self.ema_jitter.map_or(deviation, |ema| {
            (1.0 - interp.jitter_alpha) * ema + interp.jitter_alpha * deviation
        });
        self.ema_delay = Some(ema_delay);
        self.ema_jitter = Some(ema_jitter);

        self.back_target = (ema_delay * interp.delay_gain + ema_jitter * interp.jitter_gain)
            .clamp(interp.min_back, interp.max_back);
        if self.back <= 0.0 {
            self.back = self.back_target;
        }
    }

    /// Indices `(a, b)` with `a.t <= render_t < b.t`.
    fn bracket(&self, render_t: f64) -> Option<(usize, usize)> {
        if self.buffer.len() < 2 {
            return None;
        }
        match self.buffer.iter().position(|s| s.server_time > render_t) {
            Some(r) if r > 0 => Some((r - 1, r)),
            _ => None,
        }
    }

    /// Position the actor should head for at `render_t`, without smoothing.
    pub fn sample(&self, render_t: f64) -> Option<RenderSample> {
        let interp = &self.config.interpolation;
        if let Some((ia, ib)) = self.bracket(render_t) {
            let a = &self.buffer[ia];
            let b = &self.buffer[ib];
            let span = b.server_time - a.server_time;
            let t = if span > 1e-6 {
                ((render_t - a.server_time) / span).clamp(0.0, 1.0) as f32
            } else {
                1.0
            };

            let low_vel =
                a.vel.length_squared() < LOW_VELOCITY_SQ && b.vel.length_squared() < LOW_VELOCITY_SQ;
            let tiny_move = (a.pos - b.pos).length_squared() < TINY_MOVE_SQ;
            let use_hermite = span > interp.hermite_min_span
                && span < interp.hermite_max_span
                && self.ema_jitter() < interp.hermite_max_jitter;

            let target = if !use_hermite || low_vel || tiny_move {
                a.pos.lerp(b.pos, t)
            } else {
                let s = span as f32;
                hermite(a.pos, a.vel * s, b.pos, b.vel * s, t)
            };
            return Some(RenderSample {
                target,
                anim_state: a.anim_state,
                vertical_intent: a.vel.y.abs() > 1e-4 || b.vel.y.abs() > 1e-4,
                extrapolated: false,
            });
        }

        let last = self.buffer.back()?;
        let ahead = (render_t - last.server_time).clamp(0.0, interp.extrapolation_limit);
        Some(RenderSample {
            target: last.pos + last.vel * ahead as f32,
            anim_state: last.anim_state,
            vertical_intent: last.vel.y.abs() > 1e-4,
            extrapolated: true,
        })
    }

    /// Advances presentation by `dt`. `server_now` is the local time mapped onto the
    /// server clock.
    pub fn render(&mut self, dt: f32, server_now: f64) -> Option<RemoteView> {
        if self.buffer.is_empty() {
            return None;
        }
        let interp = &self.config.interpolation;
        let lerp = (f64::from(dt) * interp.backoff_lerp_rate).clamp(0.0, 1.0);
        self.back += (self.back_target - self.back) * lerp;

        let render_t = server_now - self.back;
        let sample = self.sample(render_t)?;
        let view = self.drive(sample, dt);
        self.cleanup(render_t - self.config.interpolation.cleanup_window);
        Some(view)
    }

    fn drive(&mut self, sample: RenderSample, dt: f32) -> RemoteView {
        let interp = &self.config.interpolation;
        let elevation = self.config.locomotion.elevation;
        let current = self.position.unwrap_or(sample.target);
        let target = elevation.resolve_client(
            sample.target,
            current,
            self.ground.as_deref(),
            elevation == ElevationPolicyMode::PreserveNetwork || sample.vertical_intent,
        );

        let k = 1.0 - (-interp.lerp_speed * dt).exp();
        let smoothed = current.lerp(target, k);
        self.position = Some(smoothed);

        let moved = smoothed - self.last_render_pos;
        let raw_speed = moved.length() / dt.max(1e-6);
        let blend = (dt * interp.anim_smooth).clamp(0.0, 1.0);
        self.display_speed += (raw_speed - self.display_speed) * blend;

        let heading = planar(moved);
        if heading.length_squared() > FACING_MIN_MOVE_SQ && self.display_speed > FACING_MIN_SPEED {
            let face = Quat::from_rotation_y(heading.x.atan2(heading.z));
            let turned = self
                .facing
                .slerp(face, (dt * interp.facing_turn_rate).clamp(0.0, 1.0));
            let (yaw, _, _) = turned.to_euler(EulerRot::YXZ);
            self.facing = Quat::from_rotation_y(yaw);
        }
        self.last_render_pos = smoothed;

        RemoteView {
            pos: smoothed,
            facing: self.facing,
            display_speed: self.display_speed,
            anim_state: sample.anim_state,
            running: sample.anim_state == ANIM_RUN
                && self.display_speed > interp.run_speed_threshold * 0.75,
            extrapolating: sample.extrapolated,
        }
    }

    /// Drops entries older than `cutoff`, always keeping two for bracketing.
    fn cleanup(&mut self, cutoff: f64) {
        let stale = self
            .buffer
            .iter()
            .take_while(|s| s.server_time < cutoff)
            .count();
        if stale > 0 && self.buffer.len() - stale >= 2 {
            self.buffer.drain(..stale);
        }
    }
}
