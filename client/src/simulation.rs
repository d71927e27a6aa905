//! Artificial latency and packet loss on the client's incoming link, for
//! trying out the sync behavior on a bad connection.
//!
//! Every datagram read from the socket is either dropped or held until a
//! delivery time drawn uniformly from `[min_latency, max_latency]`. Datagrams
//! with the same delivery time keep their arrival order.

use rand::rngs::StdRng;
use rand::Rng;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkSimulation {
    pub min_latency: Duration,
    pub max_latency: Duration,
    /// Chance, in percent, that a datagram is dropped.
    pub packet_loss_percent: u8,
}

impl NetworkSimulation {
    /// The usual test setting: latency between half of `max_latency` and
    /// `max_latency`, with 10% loss. A zero latency disables the simulation.
    pub fn from_max_latency(max_latency: Duration) -> Option<Self> {
        if max_latency.is_zero() {
            return None;
        }
        Some(Self {
            min_latency: max_latency / 2,
            max_latency,
            packet_loss_percent: 10,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub received: u64,
    pub dropped: u64,
    pub delivered: u64,
}

struct InFlightDatagram {
    from: SocketAddr,
    datagram: Vec<u8>,
    deliver_at: Instant,
}

pub struct LinkSimulator {
    settings: NetworkSimulation,
    rng: StdRng,
    in_flight: VecDeque<InFlightDatagram>,
    stats: LinkStats,
}

impl LinkSimulator {
    pub fn new(settings: NetworkSimulation, rng: StdRng) -> Self {
        Self {
            settings,
            rng,
            in_flight: VecDeque::new(),
            stats: LinkStats::default(),
        }
    }

    pub fn settings(&self) -> NetworkSimulation {
        self.settings
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Takes a datagram that just arrived. Returns false if it was dropped.
    pub fn submit(&mut self, from: SocketAddr, datagram: &[u8], now: Instant) -> bool {
        self.stats.received += 1;
        if self.rng.gen_range(0..100u8) < self.settings.packet_loss_percent {
            self.stats.dropped += 1;
            return false;
        }

        let deliver_at = now + self.sample_latency();
        // Insert after everything due no later, so ties keep arrival order
        let index = self
            .in_flight
            .partition_point(|queued| queued.deliver_at <= deliver_at);
        self.in_flight.insert(
            index,
            InFlightDatagram {
                from,
                datagram: datagram.to_vec(),
                deliver_at,
            },
        );
        true
    }

    /// Next datagram whose delay has elapsed by `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(SocketAddr, Vec<u8>)> {
        if self.in_flight.front()?.deliver_at > now {
            return None;
        }
        let queued = self.in_flight.pop_front()?;
        self.stats.delivered += 1;
        Some((queued.from, queued.datagram))
    }

    /// Forgets everything still in flight.
    pub fn clear(&mut self) {
        self.in_flight.clear();
    }

    fn sample_latency(&mut self) -> Duration {
        let NetworkSimulation {
            min_latency,
            max_latency,
            ..
        } = self.settings;
        if max_latency <= min_latency {
            return min_latency;
        }
        self.rng.gen_range(min_latency..=max_latency)
    }
}
