//! Per-peer byte/packet counters, queried by identifier rather than the
//! session/interface pair a transport-level counter would use — a node's
//! proxies outlive any one endpoint registration.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use mesh_core::Identifier;
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy)]
pub enum Stat {
    ReceivedBytes(usize),
    SendBytes(usize),
    ReceivedPkts(usize),
    SendPkts(usize),
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct Counts<T> {
    pub received_bytes: T,
    pub send_bytes: T,
    pub received_pkts: T,
    pub send_pkts: T,
}

impl<T: Number> Counts<T> {
    fn add(&self, stat: &Stat) {
        match stat {
            Stat::ReceivedBytes(v) => self.received_bytes.add(*v),
            Stat::ReceivedPkts(v) => self.received_pkts.add(*v),
            Stat::SendBytes(v) => self.send_bytes.add(*v),
            Stat::SendPkts(v) => self.send_pkts.add(*v),
        }
    }
}

#[derive(Clone, Default)]
pub struct Statistics(Arc<RwLock<AHashMap<Identifier, Counts<Count>>>>);

impl Statistics {
    pub fn register(&self, peer: Identifier) {
        self.0.write().entry(peer).or_default();
    }

    pub fn unregister(&self, peer: &Identifier) {
        self.0.write().remove(peer);
    }

    pub fn record(&self, peer: Identifier, stat: Stat) {
        self.0.write().entry(peer).or_default().add(&stat);
    }

    pub fn get(&self, peer: &Identifier) -> Option<Counts<usize>> {
        self.0.read().get(peer).map(|counts| Counts {
            received_bytes: counts.received_bytes.get(),
            received_pkts: counts.received_pkts.get(),
            send_bytes: counts.send_bytes.get(),
            send_pkts: counts.send_pkts.get(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identifier(byte: u8) -> Identifier {
        Identifier::from_bytes([byte; 32])
    }

    #[test]
    fn record_accumulates_per_peer() {
        let statistics = Statistics::default();
        let peer = identifier(1);
        statistics.register(peer);
        statistics.record(peer, Stat::ReceivedBytes(10));
        statistics.record(peer, Stat::ReceivedBytes(5));
        statistics.record(peer, Stat::SendPkts(1));

        let counts = statistics.get(&peer).unwrap();
        assert_eq!(counts.received_bytes, 15);
        assert_eq!(counts.send_pkts, 1);
    }

    #[test]
    fn unregister_drops_counters() {
        let statistics = Statistics::default();
        let peer = identifier(2);
        statistics.register(peer);
        statistics.unregister(&peer);
        assert!(statistics.get(&peer).is_none());
    }
}
