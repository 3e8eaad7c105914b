//! # Peer table (C7)
//!
//! Open-addressed map keyed by TSI, one entry per sender this host has
//! received from. Created on first ODATA/RDATA/SPM from an unknown source;
//! removed on expiry. Iteration is insertion-ordered, matching the teacher's
//! habit of hand-rolling the data structure it needs (`pool.rs`'s slab)
//! rather than reaching for an ordered-map crate.

use std::collections::HashMap;
use std::net::SocketAddr;

use quanta::Instant;

use crate::rxw::Rxw;
use crate::tsi::{Sqn, Tsi};

/// Per-source receive state. Holds the RXW by value — no back-pointer to
/// the engine or the peer table, per Design Note §9.
pub struct Peer {
    pub tsi: Tsi,
    pub rxw: Rxw,
    pub expiry: Instant,
    pub last_seen: Instant,
    pub source_nla: Option<SocketAddr>,
    pub group_nla: Option<SocketAddr>,
    pub observed_spm_sqn: Option<Sqn>,
}

impl Peer {
    pub fn new(tsi: Tsi, rxw: Rxw, now: Instant, peer_expiry: std::time::Duration) -> Self {
        Peer {
            tsi,
            rxw,
            expiry: now + peer_expiry,
            last_seen: now,
            source_nla: None,
            group_nla: None,
            observed_spm_sqn: None,
        }
    }

    /// Refresh liveness on any receipt from this source, per spec §4.6.
    pub fn touch(&mut self, now: Instant, peer_expiry: std::time::Duration) {
        self.last_seen = now;
        self.expiry = now + peer_expiry;
    }
}

/// TSI-keyed peer table with deterministic, insertion-ordered iteration
/// (spec §4.7 — useful for test reproducibility, and cheap since peer
/// counts are bounded by distinct senders rather than packet volume).
#[derive(Default)]
pub struct PeerTable {
    peers: HashMap<Tsi, Peer>,
    order: Vec<Tsi>,
}

impl PeerTable {
    pub fn new() -> Self {
        PeerTable {
            peers: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, tsi: &Tsi) -> Option<&Peer> {
        self.peers.get(tsi)
    }

    pub fn get_mut(&mut self, tsi: &Tsi) -> Option<&mut Peer> {
        self.peers.get_mut(tsi)
    }

    pub fn contains(&self, tsi: &Tsi) -> bool {
        self.peers.contains_key(tsi)
    }

    /// Insert a freshly created peer. Panics if `tsi` is already present —
    /// callers must check `contains` (or use `get_or_insert_with`) first.
    pub fn insert(&mut self, peer: Peer) {
        let tsi = peer.tsi;
        assert!(
            !self.peers.contains_key(&tsi),
            "peer table: tsi already present"
        );
        self.order.push(tsi);
        self.peers.insert(tsi, peer);
    }

    /// Fetch the peer for `tsi`, creating it via `make` on first contact.
    pub fn get_or_insert_with(&mut self, tsi: Tsi, make: impl FnOnce() -> Peer) -> &mut Peer {
        if !self.peers.contains_key(&tsi) {
            self.order.push(tsi);
            self.peers.insert(tsi, make());
        }
        self.peers.get_mut(&tsi).expect("just inserted")
    }

    pub fn remove(&mut self, tsi: &Tsi) -> Option<Peer> {
        self.order.retain(|t| t != tsi);
        self.peers.remove(tsi)
    }

    /// Remove and return every peer whose expiry deadline has elapsed.
    pub fn expire(&mut self, now: Instant) -> Vec<Tsi> {
        let expired: Vec<Tsi> = self
            .order
            .iter()
            .filter(|t| self.peers.get(t).map(|p| p.expiry <= now).unwrap_or(false))
            .copied()
            .collect();
        for tsi in &expired {
            self.remove(tsi);
        }
        expired
    }

    /// Insertion-ordered iteration, per spec §4.7.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.order.iter().filter_map(move |t| self.peers.get(t))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    /// Earliest deadline among every peer's expiry and outstanding NAK
    /// timers, for the engine's `next_deadline()`.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        let mut consider = |d: Instant| {
            earliest = Some(match earliest {
                Some(e) if e <= d => e,
                _ => d,
            });
        };
        for peer in self.peers.values() {
            consider(peer.expiry);
            if let Some(d) = peer.rxw.next_deadline() {
                consider(d);
            }
        }
        earliest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rxw::RxwConfig;
    use std::time::Duration;

    fn test_rxw() -> Rxw {
        Rxw::new(
            RxwConfig {
                capacity: 16,
                nak_bo_ivl: Duration::from_millis(10),
                nak_rpt_ivl: Duration::from_millis(10),
                nak_rdata_ivl: Duration::from_millis(10),
                nak_data_retries: 3,
                nak_ncf_retries: 3,
                abort_on_reset: false,
            },
            None,
        )
    }

    fn tsi(n: u8) -> Tsi {
        Tsi::new([n; 6], 1000 + n as u16)
    }

    #[test]
    fn insertion_order_iteration_is_deterministic() {
        let mut table = PeerTable::new();
        let now = Instant::now();
        for n in [3u8, 1, 2] {
            table.insert(Peer::new(tsi(n), test_rxw(), now, Duration::from_secs(5)));
        }
        let order: Vec<u8> = table.iter().map(|p| p.tsi.gsi()[0]).collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn get_or_insert_with_creates_once() {
        let mut table = PeerTable::new();
        let now = Instant::now();
        let t = tsi(1);
        table.get_or_insert_with(t, || Peer::new(t, test_rxw(), now, Duration::from_secs(5)));
        table.get_mut(&t).unwrap().observed_spm_sqn = Some(Sqn(5));
        table.get_or_insert_with(t, || Peer::new(t, test_rxw(), now, Duration::from_secs(5)));
        assert_eq!(table.get(&t).unwrap().observed_spm_sqn, Some(Sqn(5)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn expiry_removes_stale_peers_only() {
        let mut table = PeerTable::new();
        let now = Instant::now();
        table.insert(Peer::new(tsi(1), test_rxw(), now, Duration::from_millis(10)));
        table.insert(Peer::new(tsi(2), test_rxw(), now, Duration::from_secs(60)));

        let expired = table.expire(now + Duration::from_millis(20));
        assert_eq!(expired, vec![tsi(1)]);
        assert_eq!(table.len(), 1);
        assert!(table.contains(&tsi(2)));
    }

    #[test]
    fn touch_extends_expiry() {
        let mut table = PeerTable::new();
        let now = Instant::now();
        table.insert(Peer::new(tsi(1), test_rxw(), now, Duration::from_millis(10)));
        let later = now + Duration::from_millis(5);
        table
            .get_mut(&tsi(1))
            .unwrap()
            .touch(later, Duration::from_millis(10));
        assert!(table.expire(now + Duration::from_millis(12)).is_empty());
    }
}
