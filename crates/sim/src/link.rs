use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use stride::net::{Channel, ConnectionId};

/// Impairments applied to every packet crossing a [`LossyLink`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkConfig {
    /// Drop probability for unreliable packets, in `[0, 1]`.
    pub loss: f64,
    /// Drop probability for reliable packets. The engine is expected to heal either way.
    pub reliable_loss: f64,
    /// One-way latency in seconds.
    pub latency: f64,
    /// Uniform extra delay in `[0, jitter)` seconds.
    pub jitter: f64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            loss: 0.0,
            reliable_loss: 0.0,
            latency: 0.04,
            jitter: 0.01,
        }
    }
}

impl LinkConfig {
    pub fn perfect() -> Self {
        Self {
            latency: 0.0,
            jitter: 0.0,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub sent: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub bytes: u64,
}

#[derive(Debug)]
struct Delayed<P> {
    release_at: f64,
    order: u64,
    to: ConnectionId,
    packet: P,
}

impl<P> PartialEq for Delayed<P> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<P> Eq for Delayed<P> {}

impl<P> PartialOrd for Delayed<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for Delayed<P> {
    fn cmp(&self, other: &Self) -> Ordering {
        // min-heap on release time, FIFO among equals
        other
            .release_at
            .total_cmp(&self.release_at)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// One direction of a simulated network. Unreliable packets may be dropped and
/// reordered; reliable ones keep their order per destination.
pub struct LossyLink<P> {
    config: LinkConfig,
    rng: StdRng,
    queue: BinaryHeap<Delayed<P>>,
    reliable_tail: HashMap<ConnectionId, f64>,
    next_order: u64,
    stats: LinkStats,
}

impl<P> LossyLink<P> {
    pub fn new(config: LinkConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            queue: BinaryHeap::new(),
            reliable_tail: HashMap::new(),
            next_order: 0,
            stats: LinkStats::default(),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    /// Queues `packet` for `to`. Returns false when the link dropped it.
    pub fn send(
        &mut self,
        now: f64,
        to: ConnectionId,
        channel: Channel,
        packet: P,
        bytes: usize,
    ) -> bool {
        self.stats.sent += 1;
        self.stats.bytes += bytes as u64;

        let loss = match channel {
            Channel::Reliable => self.config.reliable_loss,
            Channel::Unreliable => self.config.loss,
        };
        if loss > 0.0 && self.rng.r#gen::<f64>() < loss {
            self.stats.dropped += 1;
            return false;
        }

        let jitter = if self.config.jitter > 0.0 {
            self.rng.gen_range(0.0..self.config.jitter)
        } else {
            0.0
        };
        let mut release_at = now + self.config.latency.max(0.0) + jitter;
        if channel == Channel::Reliable {
            let tail = self.reliable_tail.entry(to).or_insert(release_at);
            release_at = release_at.max(*tail);
            *tail = release_at;
        }

        let order = self.next_order;
        self.next_order += 1;
        self.queue.push(Delayed {
            release_at,
            order,
            to,
            packet,
        });
        true
    }

    /// Everything due at `now`, in release order.
    pub fn take_due(&mut self, now: f64) -> Vec<(ConnectionId, P)> {
        let mut due = Vec::new();
        while self.queue.peek().is_some_and(|d| d.release_at <= now) {
            if let Some(delayed) = self.queue.pop() {
                due.push((delayed.to, delayed.packet));
            }
        }
        self.stats.delivered += due.len() as u64;
        due
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.reliable_tail.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_after_latency() {
        let mut link = LossyLink::new(
            LinkConfig {
                latency: 0.05,
                jitter: 0.0,
                ..LinkConfig::default()
            },
            1,
        );
        link.send(1.0, 3, Channel::Unreliable, "a", 1);
        assert!(link.take_due(1.04).is_empty());
        assert_eq!(link.take_due(1.05), vec![(3, "a")]);
    }

    #[test]
    fn reliable_keeps_order_under_jitter() {
        let mut link = LossyLink::new(
            LinkConfig {
                latency: 0.02,
                jitter: 0.2,
                ..LinkConfig::default()
            },
            7,
        );
        for i in 0..50 {
            link.send(f64::from(i) * 0.001, 1, Channel::Reliable, i, 1);
        }
        let got: Vec<i32> = link.take_due(10.0).into_iter().map(|(_, p)| p).collect();
        assert_eq!(got, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn loss_is_seeded() {
        let config = LinkConfig {
            loss: 0.3,
            ..LinkConfig::perfect()
        };
        let run = |seed| {
            let mut link = LossyLink::new(config, seed);
            (0..1000)
                .filter(|i| link.send(0.0, 1, Channel::Unreliable, *i, 1))
                .count()
        };
        assert_eq!(run(42), run(42));
        let kept = run(42);
        assert!((600..800).contains(&kept), "kept {kept}");
    }
}
