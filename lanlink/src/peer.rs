//! Peer table and liveness tracking.
//!
//! The table holds every peer that announced itself within the
//! liveness window. DEAD peers are removed on the spot, so queries can
//! never observe one.

use crate::core::ethernet::MacAddr;
use std::collections::HashMap;

/// Liveness state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Heard from within the stale threshold.
    Active,

    /// Silent past the stale threshold but not yet removed.
    Stale,

    /// Silent past the dead threshold, or departed via GOODBYE.
    /// Dead peers are removed immediately and never stored.
    Dead,
}

/// One known peer on the broadcast domain.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// The peer's interface address.
    pub mac: MacAddr,

    /// Display name from the most recent HELLO, if any.
    pub display_name: Option<String>,

    /// When this record was created.
    pub first_seen: u64,

    /// When the peer last announced itself.
    pub last_seen: u64,

    /// Current liveness state.
    pub state: PeerState,
}

/// Table of live peers, owned by the discovery engine.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<MacAddr, PeerRecord>,
}

impl PeerTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an announcement from `mac`. Returns true when the peer
    /// is new to the table.
    ///
    /// A peer that reappears after removal gets a fresh record with a
    /// new `first_seen`.
    pub fn observe(&mut self, mac: MacAddr, display_name: Option<String>, now: u64) -> bool {
        match self.peers.get_mut(&mac) {
            Some(record) => {
                record.last_seen = now;
                record.state = PeerState::Active;
                if display_name.is_some() {
                    record.display_name = display_name;
                }
                false
            }
            None => {
                self.peers.insert(
                    mac,
                    PeerRecord {
                        mac,
                        display_name,
                        first_seen: now,
                        last_seen: now,
                        state: PeerState::Active,
                    },
                );
                true
            }
        }
    }

    /// Removes a peer, returning its record if it was present.
    pub fn remove(&mut self, mac: MacAddr) -> Option<PeerRecord> {
        self.peers.remove(&mac)
    }

    /// Applies the liveness thresholds: peers silent past `stale_ms`
    /// become STALE, peers silent past `dead_ms` are removed. Returns
    /// the removed addresses.
    pub fn sweep(&mut self, now: u64, stale_ms: u64, dead_ms: u64) -> Vec<MacAddr> {
        let mut dead = Vec::new();

        self.peers.retain(|mac, record| {
            let silence = now.saturating_sub(record.last_seen);
            if silence >= dead_ms {
                dead.push(*mac);
                false
            } else {
                if silence >= stale_ms {
                    record.state = PeerState::Stale;
                }
                true
            }
        });

        dead
    }

    /// Looks up one peer.
    pub fn get(&self, mac: MacAddr) -> Option<&PeerRecord> {
        self.peers.get(&mac)
    }

    /// Returns a snapshot of every known peer.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<_> = self.peers.values().cloned().collect();
        peers.sort_by_key(|p| p.mac);
        peers
    }

    /// Returns the number of known peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns true when no peers are known.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: MacAddr = MacAddr([1, 2, 3, 4, 5, 6]);

    #[test]
    fn test_observe_insert_and_refresh() {
        let mut table = PeerTable::new();

        assert!(table.observe(MAC, Some("alpha".into()), 1_000));
        assert!(!table.observe(MAC, None, 2_000));

        let record = table.get(MAC).unwrap();
        assert_eq!(record.first_seen, 1_000);
        assert_eq!(record.last_seen, 2_000);
        // A nameless refresh keeps the known name.
        assert_eq!(record.display_name.as_deref(), Some("alpha"));
    }

    #[test]
    fn test_sweep_marks_stale_then_removes() {
        let mut table = PeerTable::new();
        table.observe(MAC, None, 0);

        assert!(table.sweep(14_999, 15_000, 30_000).is_empty());
        assert_eq!(table.get(MAC).unwrap().state, PeerState::Active);

        assert!(table.sweep(15_000, 15_000, 30_000).is_empty());
        assert_eq!(table.get(MAC).unwrap().state, PeerState::Stale);

        let dead = table.sweep(30_000, 15_000, 30_000);
        assert_eq!(dead, vec![MAC]);
        assert!(table.is_empty());

        // Removed peers are not reported twice.
        assert!(table.sweep(60_000, 15_000, 30_000).is_empty());
    }

    #[test]
    fn test_activity_revives_stale_peer() {
        let mut table = PeerTable::new();
        table.observe(MAC, None, 0);
        table.sweep(20_000, 15_000, 30_000);
        assert_eq!(table.get(MAC).unwrap().state, PeerState::Stale);

        table.observe(MAC, None, 21_000);
        assert_eq!(table.get(MAC).unwrap().state, PeerState::Active);
    }

    #[test]
    fn test_reappearing_peer_is_fresh() {
        let mut table = PeerTable::new();
        table.observe(MAC, None, 0);
        table.remove(MAC);

        assert!(table.observe(MAC, None, 50_000));
        assert_eq!(table.get(MAC).unwrap().first_seen, 50_000);
    }
}
