use std::time::{Duration, Instant};

use tracing::debug;

use crate::{
    peers::{ConnectedPeer, PeerHandle, PeerTable},
    settings::EngineSettings,
};

/// Frees a connection slot when the torrent is at its connection cap by
/// picking one peer to drop.
#[derive(Debug, Clone)]
pub struct InactivePeerManager {
    inactive_time: Duration,
    max_connections: usize,
}

impl InactivePeerManager {
    pub fn new(settings: &EngineSettings) -> Self {
        Self::with_limits(settings.inactive_peer_timeout, settings.max_connections)
    }

    pub fn with_limits(inactive_time: Duration, max_connections: usize) -> Self {
        Self {
            inactive_time,
            max_connections,
        }
    }

    fn inactive(&self, peer: &ConnectedPeer, now: Instant) -> bool {
        if peer.time_connected(now) < self.inactive_time {
            return false;
        }
        peer.last_block_received
            .is_none_or(|t| now.saturating_duration_since(t) >= self.inactive_time)
    }

    /// Bytes exchanged per second connected.
    fn retention_score(peer: &ConnectedPeer, now: Instant) -> f64 {
        let secs = peer.time_connected(now).as_secs_f64().max(1.);
        (peer.monitor.bytes_downloaded() + peer.monitor.bytes_uploaded()) as f64 / secs
    }

    /// Returns the peer to disconnect, if any. Inactive peers we are not
    /// interested in go first, then inactive peers we are interested in,
    /// then the long-connected peer that exchanged the least data.
    pub fn time_passed(&self, peers: &PeerTable, now: Instant) -> Option<PeerHandle> {
        if self.max_connections == 0 || peers.len() < self.max_connections {
            return None;
        }

        let mut uninteresting = None;
        let mut interesting = None;
        let mut least_attractive: Option<(PeerHandle, f64)> = None;

        for peer in peers.iter() {
            if peer.time_connected(now) < self.inactive_time {
                continue;
            }
            if self.inactive(peer, now) {
                if !peer.am_interested {
                    uninteresting.get_or_insert(peer.handle);
                } else {
                    interesting.get_or_insert(peer.handle);
                }
            }
            let score = Self::retention_score(peer, now);
            if least_attractive.is_none_or(|(_, s)| score < s) {
                least_attractive = Some((peer.handle, score));
            }
        }

        let chosen = uninteresting
            .or(interesting)
            .or(least_attractive.map(|(h, _)| h));
        if let Some(h) = chosen {
            debug!(peer = %h, connected = peers.len(), "disconnecting inactive peer");
        }
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picker::test_peers::peer;

    const HOUR: Duration = Duration::from_secs(3600);

    fn old_table(now: Instant, n: u64) -> PeerTable {
        let mut t = PeerTable::new();
        for i in 0..n {
            let mut p = peer(i, 4);
            p.connected_at = now - HOUR;
            p.last_block_received = Some(now);
            p.am_interested = true;
            p.monitor.record_download(1_000_000);
            t.insert(p);
        }
        t
    }

    #[test]
    fn test_below_cap_does_nothing() {
        let now = Instant::now() + 2 * HOUR;
        let t = old_table(now, 3);
        let m = InactivePeerManager::with_limits(Duration::from_secs(600), 4);
        assert_eq!(m.time_passed(&t, now), None);
    }

    #[test]
    fn test_uninteresting_inactive_first() {
        let now = Instant::now() + 2 * HOUR;
        let mut t = old_table(now, 4);
        t.get_mut(PeerHandle(1)).unwrap().last_block_received = None;
        let p3 = t.get_mut(PeerHandle(3)).unwrap();
        p3.last_block_received = Some(now - HOUR);
        p3.am_interested = false;
        let m = InactivePeerManager::with_limits(Duration::from_secs(600), 4);
        assert_eq!(m.time_passed(&t, now), Some(PeerHandle(3)));

        t.get_mut(PeerHandle(3)).unwrap().last_block_received = Some(now);
        assert_eq!(m.time_passed(&t, now), Some(PeerHandle(1)));
    }

    #[test]
    fn test_falls_back_to_least_attractive() {
        let now = Instant::now() + 2 * HOUR;
        let t = old_table(now, 4);
        t.get(PeerHandle(0)).unwrap().monitor.record_upload(50_000);
        t.get(PeerHandle(1)).unwrap().monitor.record_upload(10_000);
        t.get(PeerHandle(2)).unwrap().monitor.record_upload(90_000);
        t.get(PeerHandle(3)).unwrap().monitor.record_upload(70_000);
        let m = InactivePeerManager::with_limits(Duration::from_secs(600), 4);
        assert_eq!(m.time_passed(&t, now), Some(PeerHandle(1)));
    }

    #[test]
    fn test_young_peers_are_spared() {
        let now = Instant::now() + 2 * HOUR;
        let mut t = old_table(now, 2);
        for h in [PeerHandle(0), PeerHandle(1)] {
            let p = t.get_mut(h).unwrap();
            p.connected_at = now - Duration::from_secs(60);
            p.last_block_received = None;
        }
        let m = InactivePeerManager::with_limits(Duration::from_secs(600), 2);
        assert_eq!(m.time_passed(&t, now), None);
    }
}
