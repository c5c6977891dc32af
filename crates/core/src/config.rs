use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::elevation::ElevationPolicyMode;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Every tunable of the movement pipeline. Missing TOML keys keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfig {
    pub send: SendConfig,
    pub interpolation: InterpolationConfig,
    pub reconcile: ReconcileConfig,
    pub elastic: ElasticConfig,
    pub fec: FecConfig,
    pub anti_cheat: AntiCheatConfig,
    pub broadcast: BroadcastConfig,
    pub delta_bounds: DeltaBounds,
    pub rate_limit: RateLimitConfig,
    pub locomotion: LocomotionConfig,
    pub replay: ReplayConfig,
    pub clock: ClockConfig,
}

impl MovementConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        Ok(config.sanitized())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Pulls out-of-range values back into their legal ranges.
    pub fn sanitized(mut self) -> Self {
        self.send.send_rate_hz = self.send.send_rate_hz.clamp(10.0, 60.0);

        let interp = &mut self.interpolation;
        interp.min_back = interp.min_back.max(0.0);
        interp.max_back = interp.max_back.max(interp.min_back);
        interp.max_buffer = interp.max_buffer.max(2);

        self.fec.shard_size = self.fec.shard_size.max(8);
        self.fec.parity_shards = self.fec.parity_shards.min(crate::net::MAX_RS_PARITY);

        let ac = &mut self.anti_cheat;
        ac.slack_min = ac.slack_min.max(0.0);
        ac.slack_max = ac.slack_max.max(ac.slack_min);
        ac.max_speed_tolerance = ac.max_speed_tolerance.max(1.0);

        let b = &mut self.broadcast;
        b.keyframe_every = b.keyframe_every.max(2);
        b.mid_ring = b.mid_ring.max(b.near_ring);
        b.far_ring = b.far_ring.max(b.mid_ring);
        b.cell_size = b.cell_size.max(1);
        for hz in [&mut b.near_hz, &mut b.mid_hz, &mut b.far_hz] {
            *hz = hz.max(0.1);
        }

        self.elastic.decay = self.elastic.decay.clamp(0.0, 1.0);
        self.reconcile.smoothing = self.reconcile.smoothing.clamp(0.0, 1.0);
        self.replay.tick_hz = self.replay.tick_hz.max(1);
        self.clock.ping_interval = self.clock.ping_interval.max(0.05);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendConfig {
    pub send_rate_hz: f32,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self { send_rate_hz: 30.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpolationConfig {
    pub min_back: f64,
    pub max_back: f64,
    pub delay_alpha: f64,
    pub jitter_alpha: f64,
    pub delay_gain: f64,
    pub jitter_gain: f64,
    pub backoff_lerp_rate: f64,
    pub lerp_speed: f32,
    pub anim_smooth: f32,
    pub run_speed_threshold: f32,
    pub facing_turn_rate: f32,
    pub extrapolation_limit: f64,
    pub cleanup_window: f64,
    pub hermite_min_span: f64,
    pub hermite_max_span: f64,
    pub hermite_max_jitter: f64,
    pub max_buffer: usize,
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            min_back: 0.14,
            max_back: 0.32,
            delay_alpha: 0.18,
            jitter_alpha: 0.18,
            delay_gain: 1.35,
            jitter_gain: 1.6,
            backoff_lerp_rate: 1.0,
            lerp_speed: 16.0,
            anim_smooth: 8.0,
            run_speed_threshold: 5.0,
            facing_turn_rate: 6.0,
            extrapolation_limit: 0.15,
            cleanup_window: 0.35,
            hermite_min_span: 0.02,
            hermite_max_span: 0.5,
            hermite_max_jitter: 0.12,
            max_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub dead_zone: f32,
    pub hard_snap_dist: f32,
    pub reconcile_rate: f32,
    pub max_correction_speed: f32,
    pub smoothing: f32,
    pub hard_snap_rate_limit_seconds: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            dead_zone: 0.22,
            hard_snap_dist: 0.8,
            reconcile_rate: 12.0,
            max_correction_speed: 6.0,
            smoothing: 0.85,
            hard_snap_rate_limit_seconds: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticConfig {
    pub duration: f32,
    pub initial_multiplier: f32,
    pub decay: f32,
    pub min_visible: f32,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            duration: 0.25,
            initial_multiplier: 2.0,
            decay: 0.55,
            min_visible: 0.03,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FecConfig {
    pub parity_shards: usize,
    pub shard_size: usize,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            parity_shards: 1,
            shard_size: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiCheatConfig {
    pub max_speed_tolerance: f32,
    pub slack_k: f32,
    pub slack_min: f32,
    pub slack_max: f32,
    pub max_vertical_speed: f32,
    pub validate_navmesh: bool,
    pub navmesh_max_sample_dist: f32,
    /// Corridor half-width around click-to-move path corners.
    pub path_tolerance: f32,
}

impl Default for AntiCheatConfig {
    fn default() -> Self {
        Self {
            max_speed_tolerance: 1.18,
            slack_k: 0.6,
            slack_min: 1.0,
            slack_max: 1.75,
            max_vertical_speed: 2.0,
            validate_navmesh: false,
            navmesh_max_sample_dist: 1.0,
            path_tolerance: 1.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub keyframe_every: u32,
    pub near_ring: i32,
    pub mid_ring: i32,
    pub far_ring: i32,
    pub near_hz: f64,
    pub mid_hz: f64,
    pub far_hz: f64,
    pub cell_size: i32,
    pub force_broadcast_all: bool,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            keyframe_every: 20,
            near_ring: 1,
            mid_ring: 2,
            far_ring: 3,
            near_hz: 30.0,
            mid_hz: 10.0,
            far_hz: 3.0,
            cell_size: 128,
            force_broadcast_all: false,
        }
    }
}

/// Limits of a delta against the observer's last keyframe. Anything larger goes out
/// as a full snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaBounds {
    pub max_pos_delta_cm: i32,
    pub max_vel_delta_cms: i32,
    pub max_dt_ms: i32,
}

impl Default for DeltaBounds {
    fn default() -> Self {
        Self {
            max_pos_delta_cm: 1000,
            max_vel_delta_cms: 1500,
            max_dt_ms: 2500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_inputs_per_second: f64,
    pub burst_allowance: f64,
    pub refill_per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_inputs_per_second: 120.0,
            burst_allowance: 30.0,
            refill_per_second: 120.0,
        }
    }
}

impl RateLimitConfig {
    pub fn capacity(&self) -> f64 {
        self.max_inputs_per_second + self.burst_allowance
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocomotionConfig {
    pub walk_speed: f32,
    pub run_multiplier: f32,
    pub elevation: ElevationPolicyMode,
}

impl Default for LocomotionConfig {
    fn default() -> Self {
        Self {
            walk_speed: 4.0,
            run_multiplier: 1.5,
            elevation: ElevationPolicyMode::PreserveNetwork,
        }
    }
}

impl LocomotionConfig {
    pub fn speed(&self, running: bool) -> f32 {
        if running {
            self.walk_speed * self.run_multiplier
        } else {
            self.walk_speed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub enabled: bool,
    pub history_seconds: f64,
    pub tick_hz: u32,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            history_seconds: 10.0,
            tick_hz: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub ping_interval: f64,
    pub offset_alpha: f64,
    pub jitter_alpha: f64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            ping_interval: 1.0,
            offset_alpha: 0.15,
            jitter_alpha: 0.12,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = MovementConfig::default();
        assert_eq!(config.send.send_rate_hz, 30.0);
        assert_eq!(config.reconcile.hard_snap_dist, 0.8);
        assert_eq!(config.fec.parity_shards, 1);
        assert_eq!(config.fec.shard_size, 1024);
        assert_eq!(config.broadcast.keyframe_every, 20);
        assert_eq!(config.rate_limit.capacity(), 150.0);
        assert_eq!(config.delta_bounds.max_pos_delta_cm, 1000);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = MovementConfig::from_toml_str(
            r#"
            [fec]
            parity_shards = 2

            [locomotion]
            elevation = "ground_snap"
            "#,
        )
        .unwrap();
        assert_eq!(config.fec.parity_shards, 2);
        assert_eq!(config.fec.shard_size, 1024);
        assert_eq!(config.locomotion.elevation, ElevationPolicyMode::GroundSnap);
        assert_eq!(config.interpolation.min_back, 0.14);
    }

    #[test]
    fn sanitize_clamps_ranges() {
        let mut config = MovementConfig::default();
        config.send.send_rate_hz = 500.0;
        config.interpolation.max_back = 0.01;
        config.broadcast.far_ring = 0;
        let config = config.sanitized();
        assert_eq!(config.send.send_rate_hz, 60.0);
        assert_eq!(config.interpolation.max_back, config.interpolation.min_back);
        assert_eq!(config.broadcast.far_ring, config.broadcast.mid_ring);
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(matches!(
            MovementConfig::from_toml_str("[fec]\nparity_shards = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
