use stride::MovementConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tick_rate: u32,
    pub max_connections: usize,
    /// Canary frames are sent to every connection at this interval when set.
    pub canary_interval: Option<f64>,
    pub canary_len: usize,
    pub movement: MovementConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            max_connections: 32,
            canary_interval: None,
            canary_len: 2048,
            movement: MovementConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_movement(movement: MovementConfig) -> Self {
        Self {
            movement: movement.sanitized(),
            ..Self::default()
        }
    }
}
