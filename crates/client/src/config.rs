use stride::MovementConfig;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Rate of [`MovementClient::fixed_tick`](crate::MovementClient::fixed_tick).
    pub fixed_tick_rate: u32,
    pub movement: MovementConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            fixed_tick_rate: 60,
            movement: MovementConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_movement(movement: MovementConfig) -> Self {
        Self {
            movement: movement.sanitized(),
            ..Self::default()
        }
    }

    pub fn fixed_dt(&self) -> f32 {
        1.0 / self.fixed_tick_rate.max(1) as f32
    }
}
