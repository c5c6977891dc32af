//! Authoritative side of the movement sync: one driver per actor, fed by
//! [`MovementServer`].

pub mod canary;
pub mod config;
pub mod driver;
pub mod events;
pub mod rate_limit;
pub mod retry;
pub mod server;

pub use canary::{CanaryEmitter, canary_payload};
pub use config::ServerConfig;
pub use driver::{ServerDriver, ServerServices};
pub use events::{LeaveReason, ServerEvent};
pub use rate_limit::TokenBucket;
pub use retry::{FULL_RETRY_MAX, FULL_RETRY_SECONDS, RetryManager, RetryRecord};
pub use server::MovementServer;
