use std::collections::VecDeque;

use piecework_core::{BitField, lengths::Lengths};
use tracing::debug;

use crate::{
    peers::{ConnectedPeer, PeerHandle},
    wire::BlockRequest,
};

use super::{ActivePieceRequest, PickerContext, PiecePicker, Validated, piece::PieceSet};

/// Base picker for the last few blocks of a download.
///
/// Every block still missing may be requested from every peer that has it.
/// Blocks nobody requested come first, then those with the fewest
/// requesters. The first delivery wins and the remaining requesters are
/// cancelled.
#[derive(Debug, Default)]
pub struct EndGamePicker {
    lengths: Option<Lengths>,
    pieces: PieceSet,
    /// Outstanding (peer, piece, block) requests, oldest first. A block
    /// moves to the back whenever it gets another requester.
    queue: VecDeque<(PeerHandle, u32, usize)>,
}

impl EndGamePicker {
    fn eligible(peer: &ConnectedPeer, available: &BitField, piece: u32, start: u32, end: u32) -> bool {
        piece >= start
            && piece <= end
            && available.get(piece as usize)
            && (!peer.is_choking || peer.is_allowed_fast(piece))
    }

    fn push_request(&mut self, peer: PeerHandle, piece: u32, block: usize) -> Option<BlockRequest> {
        let r = self.pieces.get_mut(piece)?.request_block(block, peer)?;
        let (moved, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queue)
            .into_iter()
            .partition(|(_, p, b)| *p == piece && *b == block);
        self.queue = rest.into();
        self.queue.extend(moved);
        self.queue.push_back((peer, piece, block));
        Some(r)
    }

    fn pick_one(
        &mut self,
        peer: &ConnectedPeer,
        available: &BitField,
        start: u32,
        end: u32,
    ) -> Option<BlockRequest> {
        let handle = peer.handle;

        // Blocks nobody asked for yet, in pieces already in flight.
        let untouched = self.pieces.range(start, end).find_map(|p| {
            if !Self::eligible(peer, available, p.index, start, end) {
                return None;
            }
            p.first_unrequested().map(|b| (p.index, b))
        });
        if let Some((piece, block)) = untouched {
            return self.push_request(handle, piece, block);
        }

        // A piece nobody started.
        let lengths = self.lengths?;
        let mut idx = start;
        while idx <= end && (idx as usize) < available.len() {
            if Self::eligible(peer, available, idx, start, end) && !self.pieces.contains(idx) {
                let index = lengths.validate_piece_index(idx)?;
                self.pieces.get_or_insert(&lengths, index);
                return self.push_request(handle, idx, 0);
            }
            idx += 1;
        }

        // Duplicate the least requested block, oldest first.
        let mut min = usize::MAX;
        for p in self.pieces.range(start, end) {
            if !Self::eligible(peer, available, p.index, start, end) {
                continue;
            }
            for b in p.blocks.iter() {
                if !b.is_received() && !b.is_requested_by(handle) {
                    min = min.min(b.requested_by.len());
                }
            }
        }
        if min == usize::MAX {
            return None;
        }
        let target = self.queue.iter().find_map(|&(_, piece, block)| {
            if !Self::eligible(peer, available, piece, start, end) {
                return None;
            }
            let b = self.pieces.get(piece)?.blocks.get(block)?;
            (!b.is_received() && !b.is_requested_by(handle) && b.requested_by.len() == min)
                .then_some((piece, block))
        })?;
        self.push_request(handle, target.0, target.1)
    }

    fn forget_block(&mut self, piece: u32, offset: u32) {
        let Some(block) = self
            .pieces
            .get(piece)
            .and_then(|p| p.blocks.iter().position(|b| b.offset == offset))
        else {
            // Piece completed and left the set.
            self.queue.retain(|(_, p, _)| *p != piece);
            return;
        };
        self.queue.retain(|(_, p, b)| !(*p == piece && *b == block));
    }
}

impl PiecePicker for EndGamePicker {
    fn initialise(&mut self, lengths: &Lengths) {
        self.lengths = Some(*lengths);
        self.pieces.clear();
        self.queue.clear();
    }

    fn import_active_requests(&mut self, requests: &[ActivePieceRequest]) {
        let Some(lengths) = self.lengths else {
            return;
        };
        self.pieces.import(&lengths, requests);
        for r in requests.iter().filter(|r| !r.received) {
            let Some(block) = self
                .pieces
                .get(r.request.piece)
                .and_then(|p| p.block_index(r.request.offset, r.request.length))
            else {
                continue;
            };
            self.queue.push_back((r.peer, r.request.piece, block));
        }
    }

    fn pick_piece(
        &mut self,
        peer: &ConnectedPeer,
        available: &BitField,
        _others: &[&ConnectedPeer],
        count: usize,
        start: u32,
        end: u32,
    ) -> Vec<BlockRequest> {
        let mut out = Vec::new();
        while out.len() < count {
            match self.pick_one(peer, available, start, end) {
                Some(r) => out.push(r),
                None => break,
            }
        }
        out
    }

    fn continue_existing_request(
        &mut self,
        _peer: &ConnectedPeer,
        _start: u32,
        _end: u32,
    ) -> Option<BlockRequest> {
        None
    }

    fn continue_any_existing_request(
        &mut self,
        _peer: &ConnectedPeer,
        _start: u32,
        _end: u32,
        _max_duplicates: usize,
    ) -> Option<BlockRequest> {
        None
    }

    fn validate_piece(&mut self, peer: PeerHandle, request: &BlockRequest) -> Option<Validated> {
        let validated = self.pieces.validate(peer, request)?;
        self.forget_block(request.piece, request.offset);
        Some(validated)
    }

    fn cancel_requests(&mut self, peer: PeerHandle, start: u32, end: u32) -> Vec<BlockRequest> {
        let cancelled = self.pieces.cancel(peer, start, end);
        let pieces = &self.pieces;
        self.queue.retain(|(p, piece, _)| {
            !(*p == peer && *piece >= start && *piece <= end) && pieces.contains(*piece)
        });
        cancelled
    }

    fn request_rejected(&mut self, peer: PeerHandle, request: &BlockRequest) -> bool {
        if !self.pieces.reject(peer, request) {
            return false;
        }
        let pieces = &self.pieces;
        let Some(block) = pieces
            .get(request.piece)
            .and_then(|p| p.block_index(request.offset, request.length))
        else {
            self.queue.retain(|(_, p, _)| *p != request.piece);
            return true;
        };
        self.queue
            .retain(|(p, piece, b)| !(*p == peer && *piece == request.piece && *b == block));
        true
    }

    fn is_interesting(&self, _peer: &ConnectedPeer, available: &BitField) -> bool {
        !available.all_false()
    }

    fn export_active_requests(&self) -> Vec<ActivePieceRequest> {
        self.pieces.export()
    }

    fn current_request_count(&self) -> usize {
        self.pieces.outstanding_requests()
    }

    fn received_block_count(&self) -> usize {
        self.pieces.received_blocks()
    }
}

/// Delegates to the standard picker until fewer than `threshold` blocks
/// remain to be received, then to the endgame picker. Request state moves
/// across on every switch, in both directions.
pub struct EndGameSwitcher {
    standard: Box<dyn PiecePicker>,
    endgame: EndGamePicker,
    in_endgame: bool,
    threshold: usize,
}

impl EndGameSwitcher {
    pub fn new(standard: Box<dyn PiecePicker>, endgame: EndGamePicker, threshold: usize) -> Self {
        Self {
            standard,
            endgame,
            in_endgame: false,
            threshold,
        }
    }

    fn active(&self) -> &dyn PiecePicker {
        if self.in_endgame {
            &self.endgame
        } else {
            &*self.standard
        }
    }

    fn active_mut(&mut self) -> &mut dyn PiecePicker {
        if self.in_endgame {
            &mut self.endgame
        } else {
            &mut *self.standard
        }
    }

    /// Blocks of wanted, unverified pieces not yet received.
    fn remaining_blocks(&self, ctx: &PickerContext<'_>) -> usize {
        let mut remaining = 0usize;
        for info in ctx.lengths.iter_piece_infos() {
            let idx = info.piece_index.get() as usize;
            if ctx.have.get(idx) || ctx.ignored.get(idx) {
                continue;
            }
            remaining += ctx.lengths.blocks_per_piece(info.piece_index) as usize;
        }
        remaining.saturating_sub(self.active().received_block_count())
    }

    fn switch(&mut self, to_endgame: bool, lengths: &Lengths) {
        let exported = self.active().export_active_requests();
        self.active_mut().initialise(lengths);
        self.in_endgame = to_endgame;
        self.active_mut().import_active_requests(&exported);
        debug!(
            endgame = to_endgame,
            carried_requests = exported.len(),
            "switched picker"
        );
    }
}

impl PiecePicker for EndGameSwitcher {
    fn initialise(&mut self, lengths: &Lengths) {
        self.standard.initialise(lengths);
        self.endgame.initialise(lengths);
        self.in_endgame = false;
    }

    fn import_active_requests(&mut self, requests: &[ActivePieceRequest]) {
        self.active_mut().import_active_requests(requests)
    }

    fn refresh(&mut self, ctx: &PickerContext<'_>) {
        self.standard.refresh(ctx);
        self.endgame.refresh(ctx);
        let remaining = self.remaining_blocks(ctx);
        let should = remaining > 0 && remaining < self.threshold;
        if should != self.in_endgame {
            self.switch(should, ctx.lengths);
        }
    }

    fn pick_piece(
        &mut self,
        peer: &ConnectedPeer,
        available: &BitField,
        others: &[&ConnectedPeer],
        count: usize,
        start: u32,
        end: u32,
    ) -> Vec<BlockRequest> {
        self.active_mut()
            .pick_piece(peer, available, others, count, start, end)
    }

    fn continue_existing_request(
        &mut self,
        peer: &ConnectedPeer,
        start: u32,
        end: u32,
    ) -> Option<BlockRequest> {
        self.active_mut().continue_existing_request(peer, start, end)
    }

    fn continue_any_existing_request(
        &mut self,
        peer: &ConnectedPeer,
        start: u32,
        end: u32,
        max_duplicates: usize,
    ) -> Option<BlockRequest> {
        self.active_mut()
            .continue_any_existing_request(peer, start, end, max_duplicates)
    }

    fn validate_piece(&mut self, peer: PeerHandle, request: &BlockRequest) -> Option<Validated> {
        self.active_mut().validate_piece(peer, request)
    }

    fn cancel_requests(&mut self, peer: PeerHandle, start: u32, end: u32) -> Vec<BlockRequest> {
        self.active_mut().cancel_requests(peer, start, end)
    }

    fn request_rejected(&mut self, peer: PeerHandle, request: &BlockRequest) -> bool {
        self.active_mut().request_rejected(peer, request)
    }

    fn is_interesting(&self, peer: &ConnectedPeer, available: &BitField) -> bool {
        self.active().is_interesting(peer, available)
    }

    fn export_active_requests(&self) -> Vec<ActivePieceRequest> {
        self.active().export_active_requests()
    }

    fn current_request_count(&self) -> usize {
        self.active().current_request_count()
    }

    fn received_block_count(&self) -> usize {
        self.active().received_block_count()
    }

    fn in_endgame_mode(&self) -> bool {
        self.in_endgame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picker::{StandardPicker, test_peers::seeder};

    fn refresh(s: &mut EndGameSwitcher, lengths: &Lengths, have: &BitField) {
        let ignored = BitField::new(have.len());
        s.refresh(&PickerContext {
            lengths,
            have,
            ignored: &ignored,
            files: &[],
            priorities: &[],
        });
    }

    fn endgame(total: u64, piece_length: u32) -> EndGamePicker {
        let mut p = EndGamePicker::default();
        p.initialise(&Lengths::new(total, piece_length).unwrap());
        p
    }

    #[test]
    fn test_every_peer_requests_every_block() {
        let mut picker = endgame(32768, 32768);
        let a = seeder(1, 1);
        let b = seeder(2, 1);
        let ra = picker.pick_piece(&a, &a.bitfield, &[], 10, 0, 0);
        let rb = picker.pick_piece(&b, &b.bitfield, &[], 10, 0, 0);
        assert_eq!(ra.len(), 2);
        assert_eq!(rb.len(), 2);
        assert_eq!(picker.current_request_count(), 4);
        assert!(picker.pick_piece(&a, &a.bitfield, &[], 10, 0, 0).is_empty());
    }

    #[test]
    fn test_first_delivery_wins() {
        let mut picker = endgame(16384, 16384);
        let a = seeder(1, 1);
        let b = seeder(2, 1);
        let c = seeder(3, 1);
        let r = picker.pick_piece(&a, &a.bitfield, &[], 1, 0, 0)[0];
        picker.pick_piece(&b, &b.bitfield, &[], 1, 0, 0);
        picker.pick_piece(&c, &c.bitfield, &[], 1, 0, 0);

        let v = picker.validate_piece(b.handle, &r).unwrap();
        assert!(v.piece_complete);
        assert_eq!(v.peers_involved, vec![b.handle]);
        assert_eq!(v.cancellations, vec![(a.handle, r), (c.handle, r)]);
        assert!(picker.validate_piece(a.handle, &r).is_none());
        assert!(picker.queue.is_empty());
    }

    #[test]
    fn test_least_requested_block_first() {
        let mut picker = endgame(32768, 32768);
        let a = seeder(1, 1);
        let b = seeder(2, 1);
        let c = seeder(3, 1);
        // a holds both blocks, b duplicates one of them.
        picker.pick_piece(&a, &a.bitfield, &[], 2, 0, 0);
        let rb = picker.pick_piece(&b, &b.bitfield, &[], 1, 0, 0);
        assert_eq!(rb, vec![BlockRequest::new(0, 0, 16384)]);
        let rc = picker.pick_piece(&c, &c.bitfield, &[], 1, 0, 0);
        assert_eq!(rc, vec![BlockRequest::new(0, 16384, 16384)]);
    }

    #[test]
    fn test_switches_below_threshold_and_carries_requests() {
        let lengths = Lengths::new(16384 * 8, 16384).unwrap();
        let mut standard = StandardPicker::default();
        standard.initialise(&lengths);
        let mut switcher = EndGameSwitcher::new(Box::new(standard), EndGamePicker::default(), 4);
        switcher.initialise(&lengths);

        let a = seeder(1, 8);
        let r = switcher.pick_piece(&a, &a.bitfield, &[], 1, 0, 7);
        assert_eq!(r.len(), 1);

        let mut have = BitField::new(8);
        refresh(&mut switcher, &lengths, &have);
        assert!(!switcher.in_endgame_mode());

        have.set_range(1, 5, true);
        refresh(&mut switcher, &lengths, &have);
        assert!(switcher.in_endgame_mode());
        assert_eq!(switcher.current_request_count(), 1);
        assert!(switcher.validate_piece(a.handle, &r[0]).is_some());

        have.set_all(false);
        refresh(&mut switcher, &lengths, &have);
        assert!(!switcher.in_endgame_mode());
    }
}
