use stride::RateLimitConfig;

/// Input token bucket. Starts full.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Option<f64>,
}

impl TokenBucket {
    pub fn new(config: &RateLimitConfig) -> Self {
        let capacity = config.capacity().max(1.0);
        Self {
            capacity,
            refill_per_second: config.refill_per_second.max(0.0),
            tokens: capacity,
            last_refill: None,
        }
    }

    pub fn try_take(&mut self, now: f64) -> bool {
        if let Some(last) = self.last_refill {
            let elapsed = (now - last).max(0.0);
            self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        }
        self.last_refill = Some(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}
