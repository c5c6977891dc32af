use std::collections::VecDeque;
use std::sync::Arc;

use glam::Vec3;
use log::debug;

use stride::movement::planar_distance;
use stride::net::InputCommand;
use stride::{
    GroundSampler, InputState, MovementConfig, RECONCILE_COOLDOWN_SEC, Telemetry, integrate_step,
};

pub const MAX_PENDING_INPUTS: usize = 128;

/// What the local player wants to do this tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MoveIntent {
    pub dir: Vec3,
    pub running: bool,
    /// Corners of an active click-to-move path.
    pub path_corners: Option<Vec<Vec3>>,
}

impl MoveIntent {
    pub fn walk(dir: Vec3) -> Self {
        Self {
            dir,
            ..Self::default()
        }
    }

    pub fn has_vertical_intent(&self) -> bool {
        self.dir.y.abs() > 1e-4
    }
}

#[derive(Debug, Clone, Copy)]
struct Elastic {
    start: Vec3,
    target: Vec3,
    elapsed: f32,
    duration: f32,
    multiplier: f32,
}

fn move_towards(current: Vec3, target: Vec3, max_delta: f32) -> Vec3 {
    let to = target - current;
    let dist = to.length();
    if dist <= max_delta || dist <= f32::EPSILON {
        target
    } else {
        current + to / dist * max_delta
    }
}

/// Prediction and correction for the locally owned actor.
///
/// The runtime owns the predicted position. Each fixed step moves it by the local
/// intent, sends input at the configured rate, then applies elastic correction, a
/// pending hard snap and reconciliation, in that order.
pub struct OwnerRuntime {
    config: Arc<MovementConfig>,
    telemetry: Arc<dyn Telemetry>,
    ground: Option<Arc<dyn GroundSampler>>,
    position: Vec3,
    inputs: VecDeque<InputState>,
    next_seq: u32,
    send_timer: f32,
    elastic: Option<Elastic>,
    reconcile_target: Option<Vec3>,
    pending_hard_snap: Option<Vec3>,
    last_hard_snap_at: Option<f64>,
    last_reconcile_at: Option<f64>,
    vertical_intent: bool,
}

impl OwnerRuntime {
    pub fn new(spawn: Vec3, config: Arc<MovementConfig>, telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            config,
            telemetry,
            ground: None,
            position: spawn,
            inputs: VecDeque::with_capacity(MAX_PENDING_INPUTS),
            next_seq: 1,
            send_timer: 0.0,
            elastic: None,
            reconcile_target: None,
            pending_hard_snap: None,
            last_hard_snap_at: None,
            last_reconcile_at: None,
            vertical_intent: false,
        }
    }

    pub fn with_ground(mut self, ground: Arc<dyn GroundSampler>) -> Self {
        self.ground = Some(ground);
        self
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn pending_inputs(&self) -> &VecDeque<InputState> {
        &self.inputs
    }

    pub fn is_elastic_active(&self) -> bool {
        self.elastic.is_some()
    }

    pub fn reconcile_target(&self) -> Option<Vec3> {
        self.reconcile_target
    }

    pub fn pending_hard_snap(&self) -> Option<Vec3> {
        self.pending_hard_snap
    }

    pub fn last_hard_snap_at(&self) -> Option<f64> {
        self.last_hard_snap_at
    }

    /// Drops all correction state and teleports to `pos`.
    pub fn reset(&mut self, pos: Vec3, clear_inputs: bool) {
        self.position = pos;
        self.send_timer = 0.0;
        if clear_inputs {
            self.inputs.clear();
        }
        self.elastic = None;
        self.reconcile_target = None;
        self.pending_hard_snap = None;
        self.last_hard_snap_at = None;
    }

    fn send_interval(&self) -> f32 {
        1.0 / self.config.send.send_rate_hz.max(1.0)
    }

    /// Local movement for one fixed step.
    pub fn predict(&mut self, intent: &MoveIntent, dt: f32) {
        let locomotion = &self.config.locomotion;
        self.vertical_intent = intent.has_vertical_intent();
        let mut next = integrate_step(self.position, intent.dir, intent.running, dt, locomotion);
        if self.vertical_intent {
            next.y += intent.dir.y * locomotion.speed(intent.running) * dt;
        }
        self.position =
            locomotion
                .elevation
                .resolve_server(next, self.ground.as_deref(), self.vertical_intent);
    }

    /// Emits an input once per send interval and buffers it for replay. `server_timestamp`
    /// is the local time mapped onto the server clock.
    pub fn tick_send(
        &mut self,
        intent: &MoveIntent,
        dt: f32,
        local_time: f64,
        server_timestamp: f64,
    ) -> Option<InputCommand> {
        let send_dt = self.send_interval();
        self.send_timer += dt;
        if self.send_timer + 1e-6 < send_dt {
            return None;
        }
        self.send_timer = (self.send_timer - send_dt).max(0.0);

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);

        self.telemetry.observe(
            "client.sent_timestamp_diff_ms",
            (server_timestamp - local_time) * 1000.0,
        );

        self.inputs.push_back(InputState {
            dir: intent.dir,
            running: intent.running,
            seq,
            dt: send_dt,
            local_time,
        });
        while self.inputs.len() > MAX_PENDING_INPUTS {
            self.inputs.pop_front();
        }

        let path_corners = intent
            .path_corners
            .as_ref()
            .filter(|corners| !corners.is_empty());
        Some(InputCommand {
            dir: intent.dir.to_array(),
            pred_pos: self.position.to_array(),
            running: intent.running,
            seq,
            is_ctm: path_corners.is_some(),
            path_corners: path_corners.map(|c| c.iter().map(|p| p.to_array()).collect()),
            client_timestamp: server_timestamp,
        })
    }

    pub fn tick_elastic(&mut self, dt: f32) {
        let Some(mut elastic) = self.elastic else {
            return;
        };
        let cfg = &self.config.elastic;

        elastic.elapsed += dt;
        let t = (elastic.elapsed / elastic.duration).clamp(0.0, 1.0);
        let ease = 1.0 - (1.0 - t).powi(3);

        let goal = elastic.start.lerp(elastic.target, ease);
        let max_step = self.config.reconcile.max_correction_speed * dt * elastic.multiplier;
        let next = move_towards(self.position, goal, max_step);

        self.telemetry.observe(
            "client.elastic_applied_cm",
            f64::from(next.distance(self.position)) * 100.0,
        );
        self.position = next;
        elastic.multiplier *= cfg.decay;

        if t >= 1.0 || next.distance(elastic.target) < cfg.min_visible {
            self.elastic = None;
        } else {
            self.elastic = Some(elastic);
        }
    }

    pub fn tick_hard_snap(&mut self) {
        if self.elastic.is_some() {
            return;
        }
        if let Some(target) = self.pending_hard_snap.take() {
            debug!("owner hard snap to {target}");
            self.position = target;
        }
    }

    pub fn tick_reconciliation(&mut self, dt: f32, now: f64) {
        if self.elastic.is_some() {
            return;
        }
        let Some(target) = self.reconcile_target else {
            return;
        };
        let cfg = &self.config.reconcile;
        let max_step = cfg.max_correction_speed * dt;
        let current = self.position;
        let distance = current.distance(target);

        if distance <= 1e-4 {
            self.reconcile_target = None;
            return;
        }

        if distance > cfg.hard_snap_dist {
            let armed = self
                .last_hard_snap_at
                .is_none_or(|t| now - t > cfg.hard_snap_rate_limit_seconds);
            if armed {
                self.pending_hard_snap = Some(target);
                self.reconcile_target = None;
                self.last_hard_snap_at = Some(now);
                self.telemetry.increment("reconcile.hard_snaps", 1);
            } else {
                let next = current + (target - current).clamp_length_max(max_step);
                self.position = current.lerp(next, 1.0 - cfg.smoothing);
                self.telemetry.increment("reconcile.rate_limited_snaps", 1);
            }
            return;
        }

        let alpha = 1.0 - (-cfg.reconcile_rate * dt * 0.66).exp();
        let desired = current.lerp(target, alpha);
        let capped = move_towards(current, desired, max_step);
        let smoothed = current.lerp(capped, 1.0 - cfg.smoothing);
        self.position = smoothed;
        if (smoothed - target).length_squared() < 4e-4 {
            self.reconcile_target = None;
        }
        self.telemetry.increment("reconcile.smooth_steps", 1);
    }

    /// Runs one fixed step and returns the input to send, if any.
    pub fn fixed_tick(
        &mut self,
        intent: &MoveIntent,
        dt: f32,
        now: f64,
        server_timestamp: f64,
    ) -> Option<InputCommand> {
        self.predict(intent, dt);
        let input = self.tick_send(intent, dt, now, server_timestamp);
        self.tick_elastic(dt);
        self.tick_hard_snap();
        self.tick_reconciliation(dt, now);
        input
    }

    /// Pending inputs replayed over `start` with the server's integration.
    pub fn replay_pending(&self, start: Vec3) -> Vec3 {
        let locomotion = &self.config.locomotion;
        self.inputs.iter().fold(start, |pos, input| {
            integrate_step(pos, input.dir, input.running, input.dt, locomotion)
        })
    }

    /// Applies an authoritative `(seq, pos)`. Returns true when a reconcile started.
    pub fn on_owner_correction(&mut self, server_seq: u32, server_pos: Vec3, now: f64) -> bool {
        if self
            .last_reconcile_at
            .is_some_and(|t| now - t < RECONCILE_COOLDOWN_SEC)
        {
            self.telemetry.increment("reconcile.cooldown_skipped", 1);
            return false;
        }

        while self.inputs.front().is_some_and(|i| i.seq <= server_seq) {
            self.inputs.pop_front();
        }

        let corrected = self.replay_pending(server_pos);
        let err = planar_distance(self.position, corrected);
        if err < self.config.reconcile.dead_zone {
            self.telemetry.increment("reconcile.ignored_dead_zone", 1);
            return false;
        }

        let corrected = self.config.locomotion.elevation.resolve_client(
            corrected,
            self.position,
            self.ground.as_deref(),
            self.vertical_intent,
        );
        self.telemetry.event(
            "reconcile.requested",
            &[("seq", server_seq.to_string())],
            &[("err_xz_cm", f64::from(err) * 100.0)],
        );
        debug!(
            "owner reconcile seq={server_seq} err={err:.3} pending={}",
            self.inputs.len()
        );

        self.reconcile_target = Some(corrected);
        self.last_reconcile_at = Some(now);
        self.start_elastic(corrected);
        true
    }

    fn start_elastic(&mut self, target: Vec3) {
        let cfg = &self.config.elastic;
        if self.position.distance(target) < cfg.min_visible {
            return;
        }
        self.elastic = Some(Elastic {
            start: self.position,
            target,
            elapsed: 0.0,
            duration: cfg.duration.max(0.05),
            multiplier: cfg.initial_multiplier.max(0.01),
        });
    }
}

#[cfg(test)]
mod tests {
    use stride::MemoryTelemetry;

    use super::*;

    const DT: f32 = 1.0 / 60.0;

    fn runtime() -> (OwnerRuntime, Arc<MemoryTelemetry>) {
        let telemetry = Arc::new(MemoryTelemetry::new());
        let owner = OwnerRuntime::new(
            Vec3::ZERO,
            Arc::new(MovementConfig::default()),
            telemetry.clone(),
        );
        (owner, telemetry)
    }

    #[test]
    fn sends_at_send_rate() {
        let (mut owner, _) = runtime();
        let intent = MoveIntent::walk(Vec3::X);
        let sent: Vec<_> = (0..60)
            .filter_map(|i| owner.fixed_tick(&intent, DT, i as f64 * DT as f64, 0.0))
            .collect();
        assert_eq!(sent.len(), 30);
        assert_eq!(sent[0].seq, 1);
        assert_eq!(sent[29].seq, 30);
        // the first input reports the position after two fixed steps
        assert!((sent[0].pred_pos[0] - 4.0 * 2.0 * DT).abs() < 1e-5);
        assert_eq!(owner.pending_inputs().len(), 30);
    }

    #[test]
    fn input_buffer_is_bounded() {
        let (mut owner, _) = runtime();
        let intent = MoveIntent::default();
        for i in 0..400 {
            owner.fixed_tick(&intent, DT, i as f64 * DT as f64, 0.0);
        }
        assert_eq!(owner.pending_inputs().len(), MAX_PENDING_INPUTS);
        assert_eq!(owner.pending_inputs().back().unwrap().seq, 200);
    }

    #[test]
    fn matching_correction_is_ignored() {
        let (mut owner, telemetry) = runtime();
        let intent = MoveIntent::walk(Vec3::X);
        for i in 0..10 {
            owner.fixed_tick(&intent, DT, i as f64 * DT as f64, 0.0);
        }
        // server has processed seq 3 of 5
        let server_pos = Vec3::new(4.0 * 3.0 / 30.0, 0.0, 0.0);
        assert!(!owner.on_owner_correction(3, server_pos, 1.0));
        assert_eq!(owner.pending_inputs().len(), 2);
        assert_eq!(telemetry.counter("reconcile.ignored_dead_zone"), 1);
    }

    #[test]
    fn replay_uses_pending_inputs() {
        let (mut owner, _) = runtime();
        let intent = MoveIntent::walk(Vec3::Z);
        for i in 0..6 {
            owner.fixed_tick(&intent, DT, i as f64 * DT as f64, 0.0);
        }
        let replayed = owner.replay_pending(Vec3::new(1.0, 0.0, 0.0));
        assert!((replayed.z - 4.0 * 3.0 / 30.0).abs() < 1e-5);
        assert!((replayed.x - 1.0).abs() < 1e-6);
    }

    #[test]
    fn reconcile_converges_monotonically() {
        let (mut owner, _) = runtime();
        let target = Vec3::new(0.5, 0.0, 0.0);
        assert!(owner.on_owner_correction(0, target, 0.0));

        let idle = MoveIntent::default();
        let mut last = owner.position().distance(target);
        for i in 1..240 {
            owner.fixed_tick(&idle, DT, i as f64 * DT as f64, 0.0);
            let d = owner.position().distance(target);
            assert!(d <= last + 1e-6 || d < 0.03, "distance grew from {last} to {d}");
            last = d;
        }
        assert!(last < 0.03);
        assert!(owner.reconcile_target().is_none());
    }

    #[test]
    fn cooldown_drops_back_to_back_corrections() {
        let (mut owner, telemetry) = runtime();
        assert!(owner.on_owner_correction(0, Vec3::new(0.5, 0.0, 0.0), 1.0));
        assert!(!owner.on_owner_correction(0, Vec3::new(0.6, 0.0, 0.0), 1.1));
        assert_eq!(telemetry.counter("reconcile.cooldown_skipped"), 1);
        assert!(owner.on_owner_correction(0, Vec3::new(0.6, 0.0, 0.0), 1.25));
    }

    #[test]
    fn large_error_arms_one_hard_snap_per_window() {
        let (mut owner, telemetry) = runtime();
        let idle = MoveIntent::default();
        let target = Vec3::new(1.5, 0.0, 0.0);
        assert!(owner.on_owner_correction(0, target, 0.0));

        let mut now = 0.0;
        while telemetry.counter("reconcile.hard_snaps") == 0 && now < 1.0 {
            now += f64::from(DT);
            owner.fixed_tick(&idle, DT, now, 0.0);
        }
        assert_eq!(telemetry.counter("reconcile.hard_snaps"), 1);
        owner.fixed_tick(&idle, DT, now + f64::from(DT), 0.0);
        assert_eq!(owner.position(), target);

        // second divergence inside the rate-limit window steps instead of snapping
        let second = Vec3::new(3.0, 0.0, 0.0);
        now += 0.3;
        assert!(owner.on_owner_correction(0, second, now));
        for _ in 0..30 {
            now += f64::from(DT);
            owner.fixed_tick(&idle, DT, now, 0.0);
        }
        assert_eq!(telemetry.counter("reconcile.hard_snaps"), 1);
        assert!(telemetry.counter("reconcile.rate_limited_snaps") > 0);
    }

    #[test]
    fn elastic_moves_toward_target_and_stops() {
        let (mut owner, _) = runtime();
        let target = Vec3::new(0.4, 0.0, 0.0);
        assert!(owner.on_owner_correction(0, target, 0.0));
        assert!(owner.is_elastic_active());
        for _ in 0..30 {
            owner.tick_elastic(DT);
        }
        assert!(!owner.is_elastic_active());
        assert!(owner.position().x > 0.0);
    }
}
