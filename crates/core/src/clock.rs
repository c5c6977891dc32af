use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::config::ClockConfig;

/// Local monotonic time in seconds.
pub trait NetClock: Send + Sync {
    fn now(&self) -> f64;
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl NetClock for SystemClock {
    fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Externally stepped clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            bits: Arc::new(AtomicU64::new(start.to_bits())),
        }
    }

    pub fn set(&self, secs: f64) {
        self.bits.store(secs.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, dt: f64) {
        self.set(self.now() + dt);
    }
}

impl NetClock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

/// Clock offset between a client and the server, learned from ping exchanges.
pub trait ClockSync: Send {
    fn record_sample(&mut self, rtt_ms: f64, offset_ms: f64);

    fn offset_ema_ms(&self) -> f64;

    fn offset_jitter_ms(&self) -> f64;

    fn last_rtt_ms(&self) -> f64;

    fn sample_count(&self) -> u32;

    fn offset_seconds(&self) -> f64 {
        self.offset_ema_ms() / 1000.0
    }

    fn client_to_server_time(&self, t: f64) -> f64 {
        t + self.offset_seconds()
    }

    fn server_to_client_time(&self, t: f64) -> f64 {
        t - self.offset_seconds()
    }

    /// Folds one `(clientSend, serverRecv, serverSend, clientRecv)` exchange in.
    fn on_ping_reply(
        &mut self,
        client_send: f64,
        server_recv: f64,
        server_send: f64,
        client_recv: f64,
    ) {
        let rtt = (client_recv - client_send).max(0.0);
        let offset = (server_recv + server_send) * 0.5 - (client_send + client_recv) * 0.5;
        self.record_sample(rtt * 1000.0, offset * 1000.0);
    }
}

/// Exponential moving average of the offset and of its absolute deviation. The first
/// sample seeds the average directly.
#[derive(Debug, Clone)]
pub struct EmaClockSync {
    offset_alpha: f64,
    jitter_alpha: f64,
    offset_ema_ms: f64,
    offset_jitter_ms: f64,
    last_rtt_ms: f64,
    samples: u32,
}

impl EmaClockSync {
    pub fn new(config: &ClockConfig) -> Self {
        Self {
            offset_alpha: config.offset_alpha,
            jitter_alpha: config.jitter_alpha,
            offset_ema_ms: 0.0,
            offset_jitter_ms: 0.0,
            last_rtt_ms: 0.0,
            samples: 0,
        }
    }
}

impl Default for EmaClockSync {
    fn default() -> Self {
        Self::new(&ClockConfig::default())
    }
}

impl ClockSync for EmaClockSync {
    fn record_sample(&mut self, rtt_ms: f64, offset_ms: f64) {
        if !rtt_ms.is_finite() || !offset_ms.is_finite() {
            return;
        }
        if self.samples == 0 {
            self.offset_ema_ms = offset_ms;
            self.offset_jitter_ms = 0.0;
        } else {
            let deviation = (offset_ms - self.offset_ema_ms).abs();
            self.offset_ema_ms += self.offset_alpha * (offset_ms - self.offset_ema_ms);
            self.offset_jitter_ms += self.jitter_alpha * (deviation - self.offset_jitter_ms);
        }
        self.last_rtt_ms = rtt_ms;
        self.samples = self.samples.saturating_add(1);
    }

    fn offset_ema_ms(&self) -> f64 {
        self.offset_ema_ms
    }

    fn offset_jitter_ms(&self) -> f64 {
        self.offset_jitter_ms
    }

    fn last_rtt_ms(&self) -> f64 {
        self.last_rtt_ms
    }

    fn sample_count(&self) -> u32 {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Ping exchange against a server whose clock runs `offset` ahead.
    fn exchange(sync: &mut EmaClockSync, start: f64, rtt: f64, offset: f64) {
        let server_recv = start + rtt / 2.0 + offset;
        sync.on_ping_reply(start, server_recv, server_recv, start + rtt);
    }

    #[test]
    fn first_sample_seeds_offset() {
        let mut sync = EmaClockSync::default();
        exchange(&mut sync, 10.0, 0.08, 0.12);
        assert!((sync.offset_ema_ms() - 120.0).abs() < 1e-6);
        assert!((sync.last_rtt_ms() - 80.0).abs() < 1e-6);
        assert!((sync.client_to_server_time(1.0) - 1.12).abs() < 1e-9);
        assert!((sync.server_to_client_time(1.12) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn converges_from_a_bad_first_sample() {
        let mut sync = EmaClockSync::default();
        sync.record_sample(80.0, 60.0);
        for i in 0..20 {
            exchange(&mut sync, i as f64, 0.08, 0.12);
        }
        assert!((sync.offset_ema_ms() - 120.0).abs() < 5.0);
        assert_eq!(sync.sample_count(), 21);
    }

    #[test]
    fn outlier_moves_offset_by_alpha_share() {
        let mut sync = EmaClockSync::default();
        sync.record_sample(80.0, 120.0);
        sync.record_sample(80.0, 1120.0);
        assert!((sync.offset_ema_ms() - 270.0).abs() < 1e-6);
        assert!((sync.offset_jitter_ms() - 120.0).abs() < 1e-6);
    }

    #[test]
    fn manual_clock_is_shared() {
        let clock = ManualClock::new(1.0);
        let other = clock.clone();
        clock.advance(0.5);
        assert_eq!(other.now(), 1.5);
    }
}
