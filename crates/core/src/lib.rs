pub mod anticheat;
pub mod clock;
pub mod config;
pub mod elevation;
pub mod interest;
pub mod movement;
pub mod net;
pub mod replay;
pub mod telemetry;

pub use anticheat::{
    AntiCheatContext, AntiCheatValidator, NavMeshProjector, RectNavMesh, SpeedEnvelopeValidator,
};
pub use clock::{ClockSync, EmaClockSync, ManualClock, NetClock, SystemClock};
pub use config::{
    AntiCheatConfig, BroadcastConfig, ClockConfig, ConfigError, DeltaBounds, ElasticConfig,
    FecConfig, InterpolationConfig, LocomotionConfig, MovementConfig, RateLimitConfig,
    ReconcileConfig, ReplayConfig, SendConfig,
};
pub use elevation::{ElevationPolicyMode, FlatGround, GroundSampler};
pub use interest::{Cell, ChunkInterest, GridInterest, Ring, RingSets};
pub use movement::{
    ANIM_IDLE, ANIM_RUN, ANIM_WALK, InputState, MovementSnapshot, integrate_step, state_hash,
};
pub use replay::SnapshotReplay;
pub use telemetry::{MemoryTelemetry, NullTelemetry, Observation, Telemetry};

/// Minimum spacing between two owner corrections, on both ends of the wire.
pub const RECONCILE_COOLDOWN_SEC: f64 = 0.20;
/// Client-side spacing between two full snapshot requests.
pub const FULL_REQUEST_COOLDOWN_SECONDS: f64 = 0.75;
pub const FULL_REQUEST_WINDOW_SECONDS: f64 = 6.0;
pub const FULL_REQUEST_DISABLE_THRESHOLD: u32 = 4;
pub const FEC_DISABLE_DURATION_SECONDS: f64 = 10.0;
