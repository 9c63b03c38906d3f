//! Upload slot allocation.
//!
//! Every tick, [`ChokeUnchokeManager::unchoke_review`] decides which
//! interested peers may download from us. A full review (rating every peer by
//! what it transferred since the previous review) runs at most once per
//! review interval; in between, freed slots are handed out from the last
//! review's rankings.

pub mod inactive;
pub mod peer_list;

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::{
    peers::{ConnectedPeer, PeerHandle, PeerTable},
    settings::EngineSettings,
    wire::Message,
};

pub use inactive::InactivePeerManager;
pub use peer_list::PeerList;

/// Chokes a peer. Uploads it queued while unchoked are rejected (fast
/// extension, except allowed-fast pieces which it may still fetch) or
/// silently dropped.
pub fn choke(peer: &mut ConnectedPeer) {
    if peer.am_choking {
        return;
    }
    peer.am_choking = true;
    peer.outgoing.push(Message::Choke);
    if peer.supports_fast_peer {
        let allowed = peer.am_allowed_fast.clone();
        let rejected = peer.outgoing.remove_uploads(|r| !allowed.contains(&r.piece));
        for r in rejected.iter() {
            peer.outgoing.push(Message::Reject(*r));
        }
        trace!(peer = %peer.handle, rejected = rejected.len(), "choked");
    } else {
        let dropped = peer.outgoing.remove_uploads(|_| true);
        trace!(peer = %peer.handle, dropped = dropped.len(), "choked");
    }
}

pub fn unchoke(peer: &mut ConnectedPeer, now: Instant) {
    if !peer.am_choking {
        return;
    }
    peer.am_choking = false;
    peer.outgoing.push(Message::Unchoke);
    peer.review.last_unchoked = Some(now);
    peer.review.first_review_period = true;
    trace!(peer = %peer.handle, "unchoked");
}

#[derive(Debug)]
pub struct ChokeUnchokeManager {
    upload_slots: usize,
    review_interval: Duration,
    min_unchoke_time: Duration,
    last_review: Option<Instant>,
    optimistic_unchoke: Option<PeerHandle>,
    nascent: PeerList,
    candidates: PeerList,
    optimistic: PeerList,
}

impl ChokeUnchokeManager {
    pub fn new(settings: &EngineSettings) -> Self {
        Self::with_slots(
            settings.upload_slots,
            settings.review_interval,
            settings.min_unchoke_time,
        )
    }

    pub fn with_slots(upload_slots: usize, review_interval: Duration, min_unchoke_time: Duration) -> Self {
        Self {
            upload_slots,
            review_interval,
            min_unchoke_time,
            last_review: None,
            optimistic_unchoke: None,
            nascent: Default::default(),
            candidates: Default::default(),
            optimistic: Default::default(),
        }
    }

    pub fn optimistic_unchoke(&self) -> Option<PeerHandle> {
        self.optimistic_unchoke
    }

    pub fn last_review(&self) -> Option<Instant> {
        self.last_review
    }

    pub fn peer_disconnected(&mut self, peer: PeerHandle) {
        if self.optimistic_unchoke == Some(peer) {
            self.optimistic_unchoke = None;
        }
        self.nascent.remove(peer);
        self.candidates.remove(peer);
        self.optimistic.remove(peer);
    }

    pub fn unchoke_review(&mut self, peers: &mut PeerTable, seeding: bool) {
        self.unchoke_review_at(peers, seeding, Instant::now())
    }

    pub fn unchoke_review_at(&mut self, peers: &mut PeerTable, seeding: bool, now: Instant) {
        if self.upload_slots == 0 || peers.interested_count() <= self.upload_slots {
            for peer in peers.iter_mut() {
                if peer.is_interested && peer.am_choking && !peer.is_seeder() {
                    unchoke(peer, now);
                }
            }
            if self.upload_slots > 0 {
                let mut excess = peers.unchoked_count().saturating_sub(self.upload_slots);
                for peer in peers.iter_mut() {
                    if excess == 0 {
                        break;
                    }
                    if !peer.am_choking && !peer.is_interested {
                        choke(peer);
                        excess -= 1;
                    }
                }
            }
            return;
        }

        let due = self
            .last_review
            .is_none_or(|t| now.saturating_duration_since(t) >= self.review_interval);
        if due {
            self.execute_review(peers, seeding, now);
            self.last_review = Some(now);
        } else {
            self.allocate_slots(peers, now);
        }
    }

    fn execute_review(&mut self, peers: &mut PeerTable, seeding: bool, now: Instant) {
        let elapsed = self
            .last_review
            .map_or(self.review_interval, |t| now.saturating_duration_since(t))
            .as_secs_f64()
            .max(0.001);

        self.nascent.clear();
        self.candidates.clear();
        self.optimistic.clear();
        if self.optimistic_unchoke.is_some_and(|h| !peers.contains(h)) {
            self.optimistic_unchoke = None;
        }

        for peer in peers.iter_mut() {
            let downloaded = peer.monitor.bytes_downloaded();
            let uploaded = peer.monitor.bytes_uploaded();
            let down = downloaded.saturating_sub(peer.review.bytes_downloaded_at_last_review);
            let up = uploaded.saturating_sub(peer.review.bytes_uploaded_at_last_review);
            peer.review.bytes_downloaded_at_last_review = downloaded;
            peer.review.bytes_uploaded_at_last_review = uploaded;
            peer.review.last_review_download_rate = down as f64 / elapsed;
            peer.review.last_review_upload_rate = up as f64 / elapsed;

            if peer.is_seeder() || (!peer.am_choking && !peer.is_interested) {
                choke(peer);
                continue;
            }

            let (transferred, rate) = if seeding {
                (up, peer.review.last_review_upload_rate)
            } else {
                (down, peer.review.last_review_download_rate)
            };

            if !peer.am_choking {
                let unchoked_for = peer
                    .review
                    .last_unchoked
                    .map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
                let first_review_period = peer.review.first_review_period;
                peer.review.first_review_period = false;
                if unchoked_for < self.min_unchoke_time || (first_review_period && transferred > 0) {
                    self.nascent.push(peer.handle, rate);
                } else if transferred > 0 {
                    self.candidates.push(peer.handle, rate);
                } else {
                    self.optimistic.push(peer.handle, rate);
                }
            } else if !seeding && peer.am_interested && down > 0 {
                // Don't punish a peer that only just started sending.
                let instant = peer.monitor.download_rate() as f64;
                self.candidates
                    .push(peer.handle, instant.max(peer.review.last_review_download_rate));
            } else if peer.is_interested {
                self.optimistic.push(peer.handle, rate);
            }
        }

        self.nascent.sort_by_rate();
        self.candidates.sort_by_rate();
        self.optimistic.sort_by_rate();

        let optimistic_is_nascent = self
            .optimistic_unchoke
            .is_some_and(|h| self.nascent.contains(h));
        let mut kept = Vec::new();

        if self.nascent.len() >= self.upload_slots || optimistic_is_nascent {
            self.reallocate_slots(peers, self.upload_slots, now, &mut kept);
            if self
                .optimistic_unchoke
                .is_some_and(|h| !kept.contains(&h))
            {
                self.optimistic_unchoke = None;
            }
        } else {
            let chosen = self.optimistic.handles().find(|h| {
                peers
                    .get(*h)
                    .is_some_and(|p| p.am_choking && p.is_interested)
            });
            match chosen {
                Some(h) => {
                    if let Some(peer) = peers.get_mut(h) {
                        unchoke(peer, now);
                    }
                    self.peer_disconnected(h);
                    self.optimistic_unchoke = Some(h);
                    self.reallocate_slots(peers, self.upload_slots - 1, now, &mut kept);
                }
                None => {
                    self.optimistic_unchoke = None;
                    self.reallocate_slots(peers, self.upload_slots, now, &mut kept);
                }
            }
        }

        let leftovers: Vec<PeerHandle> = self
            .nascent
            .handles()
            .chain(self.candidates.handles())
            .chain(self.optimistic.handles())
            .filter(|h| !kept.contains(h) && Some(*h) != self.optimistic_unchoke)
            .collect();
        for h in leftovers {
            if let Some(peer) = peers.get_mut(h) {
                choke(peer);
            }
        }

        debug!(
            nascent = self.nascent.len(),
            candidates = self.candidates.len(),
            optimistic = self.optimistic.len(),
            optimistic_unchoke = ?self.optimistic_unchoke,
            unchoked = peers.unchoked_count(),
            "unchoke review"
        );
    }

    /// Walks nascent, candidate, then optimistic peers handing out `slots`.
    /// Peers already unchoked keep their slot; at most
    /// `max(slots / 2, slots - already_unchoked)` choked peers get a new one.
    fn reallocate_slots(
        &mut self,
        peers: &mut PeerTable,
        slots: usize,
        now: Instant,
        kept: &mut Vec<PeerHandle>,
    ) {
        let already_unchoked = self
            .nascent
            .handles()
            .chain(self.candidates.handles())
            .chain(self.optimistic.handles())
            .filter(|h| peers.get(*h).is_some_and(|p| !p.am_choking))
            .count();
        let mut max_new_unchokes = (slots / 2).max(slots.saturating_sub(already_unchoked));
        let mut slots = slots;

        for list in [&mut self.nascent, &mut self.candidates, &mut self.optimistic] {
            list.reset_cursor();
            while slots > 0 {
                let Some(h) = list.next_peer() else {
                    break;
                };
                let Some(peer) = peers.get_mut(h) else {
                    continue;
                };
                if !peer.am_choking {
                    kept.push(h);
                    slots -= 1;
                } else if max_new_unchokes > 0 && peer.is_interested {
                    unchoke(peer, now);
                    kept.push(h);
                    slots -= 1;
                    max_new_unchokes -= 1;
                }
            }
        }
    }

    /// Hands out slots freed since the last review.
    fn allocate_slots(&mut self, peers: &mut PeerTable, now: Instant) {
        let mut free = self.upload_slots.saturating_sub(peers.unchoked_count());
        if free == 0 {
            return;
        }
        let ranked: Vec<PeerHandle> = self
            .nascent
            .handles()
            .chain(self.candidates.handles())
            .chain(self.optimistic.handles())
            .collect();
        for h in ranked {
            if free == 0 {
                return;
            }
            if let Some(peer) = peers.get_mut(h) {
                if peer.am_choking && peer.is_interested && !peer.is_seeder() {
                    unchoke(peer, now);
                    free -= 1;
                }
            }
        }
        for peer in peers.iter_mut() {
            if free == 0 {
                return;
            }
            if peer.am_choking && peer.is_interested && !peer.is_seeder() {
                unchoke(peer, now);
                free -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use piecework_core::BitField;

    use super::*;
    use crate::{
        peers::Outgoing,
        picker::test_peers::peer,
        wire::BlockRequest,
    };

    const PIECES: usize = 8;

    fn table(n: u64) -> PeerTable {
        let mut t = PeerTable::new();
        for i in 0..n {
            let mut p = peer(i, PIECES);
            p.is_interested = true;
            t.insert(p);
        }
        t
    }

    fn manager(slots: usize) -> ChokeUnchokeManager {
        ChokeUnchokeManager::with_slots(slots, Duration::from_secs(30), Duration::from_secs(30))
    }

    fn unchoked(t: &PeerTable) -> Vec<u64> {
        t.iter().filter(|p| !p.am_choking).map(|p| p.handle.0).collect()
    }

    #[test]
    fn test_fast_path_unchokes_everyone_interested() {
        let mut t = table(3);
        t.get_mut(PeerHandle(2)).unwrap().is_interested = false;
        let mut m = manager(4);
        m.unchoke_review_at(&mut t, false, Instant::now());
        assert_eq!(unchoked(&t), vec![0, 1]);
        assert!(m.last_review().is_none());
    }

    #[test]
    fn test_five_peers_two_slots() {
        let mut t = table(5);
        let mut m = manager(2);
        let t0 = Instant::now();

        m.unchoke_review_at(&mut t, false, t0);
        assert_eq!(unchoked(&t).len(), 2);
        assert_eq!(m.optimistic_unchoke(), Some(PeerHandle(0)));
        let first = unchoked(&t);

        // Between reviews nothing changes.
        m.unchoke_review_at(&mut t, false, t0 + Duration::from_secs(10));
        assert_eq!(unchoked(&t), first);

        // Nobody transferred anything: the old optimistic peer keeps its
        // slot, a fresh optimistic peer is picked and no other peer is
        // newly unchoked.
        m.unchoke_review_at(&mut t, false, t0 + Duration::from_secs(30));
        let second = unchoked(&t);
        assert_eq!(second.len(), 2);
        assert_eq!(m.optimistic_unchoke(), Some(PeerHandle(2)));
        assert_eq!(second, vec![0, 2]);
        assert!(first.contains(&0));
    }

    #[test]
    fn test_slot_conservation_with_transfer() {
        let mut t = table(10);
        let mut m = manager(3);
        let t0 = Instant::now();
        for round in 0..6u64 {
            for p in t.iter() {
                if !p.am_choking {
                    p.monitor.record_upload(1000 * (p.handle.0 + 1));
                    p.monitor.record_download(500 * (10 - p.handle.0));
                }
            }
            m.unchoke_review_at(&mut t, round % 2 == 0, t0 + Duration::from_secs(30 * round));
            assert!(t.unchoked_count() <= 3, "round {round}");
        }
    }

    #[test]
    fn test_nascent_peers_keep_slots() {
        let mut t = table(4);
        let mut m = manager(2);
        let t0 = Instant::now();
        m.unchoke_review_at(&mut t, false, t0);
        let first = unchoked(&t);
        // Unchoked peers that are still warming up stay unchoked.
        for h in first.iter() {
            t.get(PeerHandle(*h)).unwrap().monitor.record_download(100_000);
            t.get_mut(PeerHandle(*h)).unwrap().review.last_unchoked = Some(t0 + Duration::from_secs(20));
        }
        m.unchoke_review_at(&mut t, false, t0 + Duration::from_secs(30));
        assert_eq!(unchoked(&t), first);
    }

    #[test]
    fn test_allocate_fills_freed_slot() {
        let mut t = table(4);
        let mut m = manager(2);
        let t0 = Instant::now();
        m.unchoke_review_at(&mut t, false, t0);
        let gone = PeerHandle(unchoked(&t)[0]);
        t.remove(gone);
        m.peer_disconnected(gone);
        m.unchoke_review_at(&mut t, false, t0 + Duration::from_secs(1));
        assert_eq!(t.unchoked_count(), 2);
    }

    #[test]
    fn test_choke_rejects_queued_uploads_for_fast_peers() {
        let mut p = peer(1, PIECES);
        p.supports_fast_peer = true;
        p.bitfield = BitField::new(PIECES);
        p.am_allowed_fast = vec![3];
        unchoke(&mut p, Instant::now());
        p.outgoing.try_pop();
        p.outgoing.push_upload(BlockRequest::new(1, 0, 16384));
        p.outgoing.push_upload(BlockRequest::new(3, 0, 16384));

        choke(&mut p);
        assert_eq!(p.outgoing.try_pop(), Some(Outgoing::Message(Message::Choke)));
        assert_eq!(
            p.outgoing.try_pop(),
            Some(Outgoing::Upload(BlockRequest::new(3, 0, 16384)))
        );
        assert_eq!(
            p.outgoing.try_pop(),
            Some(Outgoing::Message(Message::Reject(BlockRequest::new(1, 0, 16384))))
        );
    }

    #[test]
    fn test_choke_drops_uploads_for_plain_peers() {
        let mut p = peer(1, PIECES);
        unchoke(&mut p, Instant::now());
        p.outgoing.try_pop();
        p.outgoing.push_upload(BlockRequest::new(1, 0, 16384));
        choke(&mut p);
        assert_eq!(p.outgoing.try_pop(), Some(Outgoing::Message(Message::Choke)));
        assert_eq!(p.outgoing.try_pop(), None);
    }
}
