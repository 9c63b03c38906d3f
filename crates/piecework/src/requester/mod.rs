//! Per-peer request scheduling on top of a picker chain.

pub mod streaming;

use piecework_core::lengths::Lengths;
use tracing::trace;

use crate::{
    peers::{ConnectedPeer, PeerHandle, PeerTable},
    picker::{ActivePieceRequest, PickerContext, PiecePicker, Validated, default_picker},
    wire::{BlockRequest, Message},
};

pub use streaming::StreamingPieceRequester;

pub trait PieceRequester: Send {
    fn initialise(&mut self, lengths: &Lengths);

    /// Called whenever have/ignored masks or file priorities change.
    fn refresh(&mut self, ctx: &PickerContext<'_>);

    /// Tops up the peer's request pipeline. New requests are queued on the
    /// peer's outgoing queue and counted in `outstanding_requests`.
    fn add_requests(&mut self, peer: PeerHandle, peers: &mut PeerTable) -> usize;

    fn validate_piece(&mut self, peer: PeerHandle, request: &BlockRequest) -> Option<Validated>;

    fn cancel_requests(&mut self, peer: PeerHandle, start: u32, end: u32) -> Vec<BlockRequest>;

    fn request_rejected(&mut self, peer: PeerHandle, request: &BlockRequest) -> bool;

    fn is_interesting(&self, peer: &ConnectedPeer) -> bool;

    fn in_endgame_mode(&self) -> bool;

    fn export_active_requests(&self) -> Vec<ActivePieceRequest>;

    fn current_request_count(&self) -> usize;

    /// The streaming requester, for seeking. Other requesters have no window.
    fn as_streaming(&mut self) -> Option<&mut StreamingPieceRequester> {
        None
    }
}

/// The request-filling loop shared by all requesters:
/// continue the peer's own pieces, then pick fresh batches, until the
/// peer's pipeline is full or nothing is left to ask it for.
pub(crate) fn fill_requests(
    picker: &mut dyn PiecePicker,
    lengths: &Lengths,
    handle: PeerHandle,
    peers: &mut PeerTable,
) -> usize {
    let requests = {
        let Some(peer) = peers.get(handle) else {
            return 0;
        };
        if !peer.can_request() {
            return 0;
        }
        let max = peer.max_pending_requests();
        let mut budget = max.saturating_sub(peer.outstanding_requests);
        if budget == 0 {
            return 0;
        }
        let others: Vec<&ConnectedPeer> = peers.iter().filter(|p| p.handle != handle).collect();
        let last = lengths.last_piece_id().get();
        let mut requests = Vec::new();

        while budget > 0 {
            match picker.continue_existing_request(peer, 0, last) {
                Some(r) => {
                    requests.push(r);
                    budget -= 1;
                }
                None => break,
            }
        }

        let batch = peer.preferred_request_amount(lengths.default_piece_length());
        while budget > 0 {
            let picked = picker.pick_piece(peer, &peer.bitfield, &others, batch.min(budget), 0, last);
            if picked.is_empty() {
                break;
            }
            budget = budget.saturating_sub(picked.len());
            requests.extend(picked);
        }
        requests
    };

    let Some(peer) = peers.get_mut(handle) else {
        return 0;
    };
    peer.outstanding_requests += requests.len();
    for r in requests.iter() {
        peer.outgoing.push(Message::Request(*r));
    }
    if !requests.is_empty() {
        trace!(peer = %handle, count = requests.len(), outstanding = peer.outstanding_requests, "queued requests");
    }
    requests.len()
}

/// Drops a peer's requests in `start..=end` and tells the peer.
pub(crate) fn cancel_and_notify(
    picker: &mut dyn PiecePicker,
    handle: PeerHandle,
    peers: &mut PeerTable,
    start: u32,
    end: u32,
) -> usize {
    let cancelled = picker.cancel_requests(handle, start, end);
    if let Some(peer) = peers.get_mut(handle) {
        peer.outstanding_requests = peer.outstanding_requests.saturating_sub(cancelled.len());
        for r in cancelled.iter() {
            peer.outgoing.push(Message::Cancel(*r));
        }
    }
    cancelled.len()
}

/// Requester for regular downloads: the default picker chain, switching to
/// endgame near the end.
pub struct StandardPieceRequester {
    picker: Box<dyn PiecePicker>,
    lengths: Option<Lengths>,
}

impl StandardPieceRequester {
    pub fn new(endgame_threshold_blocks: usize) -> Self {
        Self::with_picker(Box::new(default_picker(endgame_threshold_blocks)))
    }

    pub fn with_picker(picker: Box<dyn PiecePicker>) -> Self {
        Self {
            picker,
            lengths: None,
        }
    }
}

impl PieceRequester for StandardPieceRequester {
    fn initialise(&mut self, lengths: &Lengths) {
        self.lengths = Some(*lengths);
        self.picker.initialise(lengths);
    }

    fn refresh(&mut self, ctx: &PickerContext<'_>) {
        self.picker.refresh(ctx)
    }

    fn add_requests(&mut self, peer: PeerHandle, peers: &mut PeerTable) -> usize {
        let Some(lengths) = self.lengths else {
            return 0;
        };
        fill_requests(&mut *self.picker, &lengths, peer, peers)
    }

    fn validate_piece(&mut self, peer: PeerHandle, request: &BlockRequest) -> Option<Validated> {
        self.picker.validate_piece(peer, request)
    }

    fn cancel_requests(&mut self, peer: PeerHandle, start: u32, end: u32) -> Vec<BlockRequest> {
        self.picker.cancel_requests(peer, start, end)
    }

    fn request_rejected(&mut self, peer: PeerHandle, request: &BlockRequest) -> bool {
        self.picker.request_rejected(peer, request)
    }

    fn is_interesting(&self, peer: &ConnectedPeer) -> bool {
        self.picker.is_interesting(peer, &peer.bitfield)
    }

    fn in_endgame_mode(&self) -> bool {
        self.picker.in_endgame_mode()
    }

    fn export_active_requests(&self) -> Vec<ActivePieceRequest> {
        self.picker.export_active_requests()
    }

    fn current_request_count(&self) -> usize {
        self.picker.current_request_count()
    }
}

#[cfg(test)]
mod tests {
    use piecework_core::BitField;

    use super::*;
    use crate::{peers::Outgoing, picker::test_peers::seeder};

    fn setup(total: u64, piece_length: u32) -> (Lengths, StandardPieceRequester, PeerTable) {
        let lengths = Lengths::new(total, piece_length).unwrap();
        let mut r = StandardPieceRequester::new(256);
        r.initialise(&lengths);
        let n = lengths.total_pieces() as usize;
        let have = BitField::new(n);
        r.refresh(&PickerContext {
            lengths: &lengths,
            have: &have,
            ignored: &have,
            files: &[],
            priorities: &[],
        });
        (lengths, r, PeerTable::new())
    }

    #[test]
    fn test_fills_up_to_pending_limit() {
        let (_l, mut r, mut peers) = setup(16384 * 16, 16384);
        peers.insert(seeder(0, 16));
        // No rate measured yet: the pipeline starts at two.
        assert_eq!(r.add_requests(PeerHandle(0), &mut peers), 2);
        assert_eq!(peers.get(PeerHandle(0)).unwrap().outstanding_requests, 2);
        assert_eq!(r.add_requests(PeerHandle(0), &mut peers), 0);
        assert_eq!(r.current_request_count(), 2);

        let q = &peers.get(PeerHandle(0)).unwrap().outgoing;
        assert!(matches!(q.try_pop(), Some(Outgoing::Message(Message::Request(_)))));
    }

    #[test]
    fn test_choked_peer_gets_nothing() {
        let (_l, mut r, mut peers) = setup(16384 * 4, 16384);
        let mut p = seeder(0, 4);
        p.is_choking = true;
        peers.insert(p);
        assert_eq!(r.add_requests(PeerHandle(0), &mut peers), 0);
    }

    #[test]
    fn test_cancel_and_notify_sends_cancels() {
        let (_l, mut r, mut peers) = setup(16384 * 4, 16384);
        peers.insert(seeder(0, 4));
        r.add_requests(PeerHandle(0), &mut peers);
        let q = peers.get(PeerHandle(0)).unwrap().outgoing.clone();
        while q.try_pop().is_some() {}

        let n = cancel_and_notify(r.picker.as_mut(), PeerHandle(0), &mut peers, 0, 3);
        assert_eq!(n, 2);
        assert_eq!(peers.get(PeerHandle(0)).unwrap().outstanding_requests, 0);
        assert!(matches!(q.try_pop(), Some(Outgoing::Message(Message::Cancel(_)))));
    }
}
