use std::{collections::HashMap, sync::Arc, time::Instant};

use piecework_core::BitField;
use tracing::{debug, trace};

use crate::{
    peers::{ConnectedPeer, PeerHandle, PeerTable},
    picker::PickerContext,
    requester::PieceRequester,
    torrent_info::{Priority, TorrentInfo},
    wire::{BlockRequest, Message, PieceMessage},
};

/// What became of a received block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PieceReceived {
    /// False when the block was not asked of this peer. It must be dropped.
    pub accepted: bool,
    pub piece_complete: bool,
    pub peers_involved: Vec<PeerHandle>,
}

/// Per-torrent piece state: what we have, what is waiting for a hash check,
/// and the requester deciding what to ask for next.
pub struct PieceManager {
    info: Arc<TorrentInfo>,
    requester: Box<dyn PieceRequester>,
    have: BitField,
    /// Fully received, not hash checked yet.
    pending_hash: BitField,
    /// Not verified since startup. Skipped by the picker until hashed.
    unhashed: BitField,
    priorities: Vec<Priority>,
    /// Contributors of every piece waiting for its hash check.
    contributors: HashMap<u32, Vec<PeerHandle>>,
    hash_fails: u64,
}

impl PieceManager {
    pub fn new(info: Arc<TorrentInfo>, mut requester: Box<dyn PieceRequester>) -> Self {
        let n = info.piece_count();
        requester.initialise(&info.lengths);
        let mut pm = Self {
            priorities: vec![Priority::default(); info.files.len()],
            info,
            requester,
            have: BitField::new(n),
            pending_hash: BitField::new(n),
            unhashed: BitField::new_all_true(n),
            contributors: HashMap::new(),
            hash_fails: 0,
        };
        pm.refresh();
        pm
    }

    pub fn have(&self) -> &BitField {
        &self.have
    }

    pub fn unhashed(&self) -> &BitField {
        &self.unhashed
    }

    pub fn pending_hash(&self) -> &BitField {
        &self.pending_hash
    }

    pub fn priorities(&self) -> &[Priority] {
        &self.priorities
    }

    pub fn hash_fails(&self) -> u64 {
        self.hash_fails
    }

    pub fn requester(&self) -> &dyn PieceRequester {
        &*self.requester
    }

    pub fn requester_mut(&mut self) -> &mut dyn PieceRequester {
        &mut *self.requester
    }

    pub fn is_complete(&self) -> bool {
        self.have.all_true()
    }

    /// Missing pieces that some wanted file overlaps.
    pub fn needed_count(&self) -> usize {
        let mut needed = self.unwanted();
        needed.or(&self.have).not();
        needed.true_count()
    }

    /// Pieces no wanted file overlaps.
    fn unwanted(&self) -> BitField {
        let mut wanted = BitField::new(self.have.len());
        for (idx, f) in self.info.files.iter().enumerate() {
            if f.length == 0 {
                continue;
            }
            if self.priorities.get(idx).copied().unwrap_or_default() != Priority::DoNotDownload {
                wanted.set_range(f.start_piece as usize, f.end_piece as usize, true);
            }
        }
        wanted.not();
        wanted
    }

    /// Recomputes the picker masks. Called whenever have, pending, unhashed
    /// or priorities change.
    pub fn refresh(&mut self) {
        let mut ignored = self.unwanted();
        ignored.or(&self.pending_hash).or(&self.unhashed);
        let ctx = PickerContext {
            lengths: &self.info.lengths,
            have: &self.have,
            ignored: &ignored,
            files: &self.info.files,
            priorities: &self.priorities,
        };
        self.requester.refresh(&ctx);
    }

    /// Adopts persisted state. Pieces in `unhashed` are not trusted and get
    /// checked on start.
    pub fn restore(&mut self, have: BitField, unhashed: BitField) {
        self.have = have;
        self.unhashed = unhashed;
        self.pending_hash.set_all(false);
        self.contributors.clear();
        self.requester.initialise(&self.info.lengths);
        self.refresh();
    }

    /// Forgets in-flight request state. Pieces received but not checked
    /// yet become unhashed so the next start verifies them.
    pub fn reset_requests(&mut self) {
        self.unhashed.or(&self.pending_hash);
        self.pending_hash.set_all(false);
        self.contributors.clear();
        self.requester.initialise(&self.info.lengths);
        self.refresh();
    }

    pub fn set_file_priority(&mut self, file: usize, priority: Priority) -> crate::Result<()> {
        let slot = self
            .priorities
            .get_mut(file)
            .ok_or(crate::Error::InvalidFileIndex(file))?;
        if *slot != priority {
            *slot = priority;
            self.refresh();
        }
        Ok(())
    }

    pub fn is_interesting(&self, peer: &ConnectedPeer) -> bool {
        self.requester.is_interesting(peer)
    }

    pub fn add_piece_requests(&mut self, peer: PeerHandle, peers: &mut PeerTable) -> usize {
        self.requester.add_requests(peer, peers)
    }

    /// Releases every request of a departing peer so others can pick its blocks up.
    pub fn cancel_peer_requests(&mut self, handle: PeerHandle, peers: &mut PeerTable) -> usize {
        let last = self.info.lengths.last_piece_id().get();
        let cancelled = self.requester.cancel_requests(handle, 0, last);
        if let Some(peer) = peers.get_mut(handle) {
            peer.outstanding_requests = 0;
        }
        if !cancelled.is_empty() {
            trace!(peer = %handle, count = cancelled.len(), "released requests");
        }
        cancelled.len()
    }

    pub fn request_rejected(&mut self, handle: PeerHandle, request: &BlockRequest, peers: &mut PeerTable) -> bool {
        if !self.requester.request_rejected(handle, request) {
            return false;
        }
        if let Some(peer) = peers.get_mut(handle) {
            peer.outstanding_requests = peer.outstanding_requests.saturating_sub(1);
        }
        true
    }

    pub fn piece_data_received(
        &mut self,
        handle: PeerHandle,
        message: &PieceMessage,
        peers: &mut PeerTable,
        now: Instant,
    ) -> PieceReceived {
        let request = message.request();
        let Some(validated) = self.requester.validate_piece(handle, &request) else {
            debug!(peer = %handle, %request, "dropping unexpected block");
            return PieceReceived::default();
        };

        if let Some(peer) = peers.get_mut(handle) {
            peer.outstanding_requests = peer.outstanding_requests.saturating_sub(1);
            peer.last_block_received = Some(now);
        }
        for (other, r) in validated.cancellations.iter() {
            if let Some(peer) = peers.get_mut(*other) {
                peer.outstanding_requests = peer.outstanding_requests.saturating_sub(1);
                peer.outgoing.push(Message::Cancel(*r));
            }
        }

        if validated.piece_complete {
            trace!(piece = request.piece, "all blocks received");
            self.pending_hash.set(request.piece as usize, true);
            self.contributors
                .insert(request.piece, validated.peers_involved.clone());
            self.refresh();
        }
        PieceReceived {
            accepted: true,
            piece_complete: validated.piece_complete,
            peers_involved: validated.peers_involved,
        }
    }

    /// Records the startup check of a piece. Missing data is not a hash
    /// failure. The caller refreshes once all checks are done.
    pub fn mark_checked(&mut self, piece: u32, present: bool) {
        self.unhashed.set(piece as usize, false);
        self.have.set(piece as usize, present);
    }

    /// Records a hash check outcome. A failed piece becomes requestable
    /// again and everyone who sent a block of it is charged a fail. Returns
    /// the contributors.
    pub fn piece_hashed(&mut self, piece: u32, passed: bool, peers: &mut PeerTable) -> Vec<PeerHandle> {
        let idx = piece as usize;
        self.pending_hash.set(idx, false);
        self.unhashed.set(idx, false);
        self.have.set(idx, passed);
        let contributors = self.contributors.remove(&piece).unwrap_or_default();
        if !passed {
            self.hash_fails += 1;
            for handle in contributors.iter() {
                if let Some(peer) = peers.get_mut(*handle) {
                    peer.hash_fails += 1;
                }
            }
        }
        self.refresh();
        contributors
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use bytes::Bytes;
    use piecework_core::Id20;

    use super::*;
    use crate::{
        peers::Outgoing,
        picker::test_peers::{peer, seeder},
        requester::StandardPieceRequester,
        torrent_info::PieceHashes,
    };

    fn manager(piece_count: u64, files: &[(&str, u64)]) -> PieceManager {
        let files: Vec<(PathBuf, u64)> = if files.is_empty() {
            vec![(PathBuf::from("f"), piece_count * 16384)]
        } else {
            files.iter().map(|(n, l)| (PathBuf::from(n), *l)).collect()
        };
        let info = TorrentInfo::new(Id20::default(), "t", 16384, files, PieceHashes::default()).unwrap();
        let mut pm = PieceManager::new(Arc::new(info), Box::new(StandardPieceRequester::new(0)));
        let n = pm.have().len();
        pm.restore(BitField::new(n), BitField::new(n));
        pm
    }

    fn block(piece: u32) -> PieceMessage {
        PieceMessage {
            piece,
            offset: 0,
            data: Bytes::from(vec![0u8; 16384]),
        }
    }

    fn sent_requests(peers: &PeerTable, h: PeerHandle) -> Vec<BlockRequest> {
        let q = &peers.get(h).unwrap().outgoing;
        let mut out = Vec::new();
        while let Some(item) = q.try_pop() {
            if let Outgoing::Message(Message::Request(r)) = item {
                out.push(r);
            }
        }
        out
    }

    #[test]
    fn test_unexpected_block_is_dropped() {
        let mut pm = manager(4, &[]);
        let mut peers = PeerTable::new();
        peers.insert(seeder(0, 4));
        let r = pm.piece_data_received(PeerHandle(0), &block(0), &mut peers, Instant::now());
        assert!(!r.accepted);
    }

    #[test]
    fn test_complete_piece_waits_for_hash_then_counts() {
        let mut pm = manager(4, &[]);
        let mut peers = PeerTable::new();
        peers.insert(seeder(0, 4));
        pm.add_piece_requests(PeerHandle(0), &mut peers);
        let requested = sent_requests(&peers, PeerHandle(0));
        let first = requested[0];

        let now = Instant::now();
        let r = pm.piece_data_received(PeerHandle(0), &block(first.piece), &mut peers, now);
        assert!(r.accepted && r.piece_complete);
        assert_eq!(r.peers_involved, vec![PeerHandle(0)]);
        assert!(pm.pending_hash().get(first.piece as usize));
        assert_eq!(peers.get(PeerHandle(0)).unwrap().last_block_received, Some(now));

        // Accepting twice is impossible.
        let again = pm.piece_data_received(PeerHandle(0), &block(first.piece), &mut peers, now);
        assert!(!again.accepted);

        pm.piece_hashed(first.piece, true, &mut peers);
        assert!(pm.have().get(first.piece as usize));
        assert!(!pm.pending_hash().get(first.piece as usize));
    }

    #[test]
    fn test_failed_hash_makes_piece_requestable_and_charges_peers() {
        let mut pm = manager(1, &[]);
        let mut peers = PeerTable::new();
        peers.insert(seeder(0, 1));
        pm.add_piece_requests(PeerHandle(0), &mut peers);
        sent_requests(&peers, PeerHandle(0));
        pm.piece_data_received(PeerHandle(0), &block(0), &mut peers, Instant::now());
        // Pending hash: nothing more to ask for.
        assert_eq!(pm.add_piece_requests(PeerHandle(0), &mut peers), 0);

        pm.piece_hashed(0, false, &mut peers);
        assert!(!pm.have().get(0));
        assert_eq!(pm.hash_fails(), 1);
        assert_eq!(peers.get(PeerHandle(0)).unwrap().hash_fails, 1);
        assert_eq!(pm.add_piece_requests(PeerHandle(0), &mut peers), 1);
    }

    #[test]
    fn test_interest_and_do_not_download() {
        let mut pm = manager(4, &[("a", 16384 * 2), ("b", 16384 * 2)]);
        let mut p = peer(0, 4);
        p.bitfield.set(3, true);
        assert!(pm.is_interesting(&p));
        pm.set_file_priority(1, Priority::DoNotDownload).unwrap();
        assert!(!pm.is_interesting(&p));
        assert!(matches!(
            pm.set_file_priority(7, Priority::High),
            Err(crate::Error::InvalidFileIndex(7))
        ));
    }

    #[test]
    fn test_disconnect_releases_requests() {
        let mut pm = manager(4, &[]);
        let mut peers = PeerTable::new();
        peers.insert(seeder(0, 4));
        peers.insert(seeder(1, 4));
        let n = pm.add_piece_requests(PeerHandle(0), &mut peers);
        assert_eq!(pm.cancel_peer_requests(PeerHandle(0), &mut peers), n);
        assert_eq!(peers.get(PeerHandle(0)).unwrap().outstanding_requests, 0);
        assert_eq!(pm.requester().current_request_count(), 0);
    }
}
