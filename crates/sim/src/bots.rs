use glam::Vec3;
use rand::Rng;
use rand::rngs::StdRng;

use stride_client::MoveIntent;

/// Wandering input for one simulated player: holds a heading for a while, then picks
/// a new one, sometimes running, sometimes standing still.
#[derive(Debug, Clone)]
pub struct BotDriver {
    dir: Vec3,
    running: bool,
    remaining: f32,
}

impl Default for BotDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl BotDriver {
    pub fn new() -> Self {
        Self {
            dir: Vec3::ZERO,
            running: false,
            remaining: 0.0,
        }
    }

    pub fn next_intent(&mut self, rng: &mut StdRng, dt: f32) -> MoveIntent {
        self.remaining -= dt;
        if self.remaining <= 0.0 {
            self.remaining = rng.gen_range(0.4..2.5);
            if rng.gen_bool(0.15) {
                self.dir = Vec3::ZERO;
                self.running = false;
            } else {
                let yaw: f32 = rng.gen_range(0.0..std::f32::consts::TAU);
                self.dir = Vec3::new(yaw.cos(), 0.0, yaw.sin());
                self.running = rng.gen_bool(0.3);
            }
        }
        MoveIntent {
            dir: self.dir,
            running: self.running,
            path_corners: None,
        }
    }
}
