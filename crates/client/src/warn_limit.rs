use std::fmt::Display;

use log::warn;

pub const WARN_WINDOW_SECONDS: f64 = 5.0;
pub const WARN_MAX_PER_WINDOW: u32 = 5;

/// Caps decode warnings per window. Whatever was swallowed is reported once when the
/// next window opens.
#[derive(Debug, Clone)]
pub struct WarnLimiter {
    window: f64,
    max_per_window: u32,
    window_start: Option<f64>,
    emitted: u32,
    suppressed: u32,
}

impl Default for WarnLimiter {
    fn default() -> Self {
        Self::new(WARN_WINDOW_SECONDS, WARN_MAX_PER_WINDOW)
    }
}

impl WarnLimiter {
    pub fn new(window: f64, max_per_window: u32) -> Self {
        Self {
            window,
            max_per_window,
            window_start: None,
            emitted: 0,
            suppressed: 0,
        }
    }

    /// Logs `message` unless this window is used up. Returns whether it was logged.
    pub fn warn(&mut self, now: f64, message: impl Display) -> bool {
        let expired = self.window_start.is_none_or(|start| now - start >= self.window);
        if expired {
            if self.suppressed > 0 {
                warn!(
                    "{} decode warnings suppressed in the last {:.0}s",
                    self.suppressed, self.window
                );
            }
            self.window_start = Some(now);
            self.emitted = 0;
            self.suppressed = 0;
        }

        if self.emitted < self.max_per_window {
            self.emitted += 1;
            warn!("{message}");
            true
        } else {
            self.suppressed += 1;
            false
        }
    }

    pub fn suppressed(&self) -> u32 {
        self.suppressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_per_window() {
        let mut limiter = WarnLimiter::default();
        let logged = (0..8).filter(|i| limiter.warn(1.0 + *i as f64 * 0.1, "crc")).count();
        assert_eq!(logged, 5);
        assert_eq!(limiter.suppressed(), 3);

        assert!(limiter.warn(6.5, "crc"));
        assert_eq!(limiter.suppressed(), 0);
    }
}
