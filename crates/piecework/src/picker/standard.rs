use piecework_core::{BitField, lengths::Lengths};
use tracing::trace;

use crate::{
    peers::{ConnectedPeer, PeerHandle},
    wire::BlockRequest,
};

use super::{ActivePieceRequest, PiecePicker, Validated, piece::PieceSet};

/// Base picker for normal operation. Each peer works through its own piece
/// in block order so pieces complete quickly and hash incrementally; a block
/// is only ever requested from one peer at a time unless a caller explicitly
/// asks for duplicates.
#[derive(Debug, Default)]
pub struct StandardPicker {
    lengths: Option<Lengths>,
    pieces: PieceSet,
}

impl StandardPicker {
    fn can_request_piece(peer: &ConnectedPeer, piece: u32) -> bool {
        peer.bitfield.get(piece as usize) && (!peer.is_choking || peer.is_allowed_fast(piece))
    }

    /// Requests up to `count` unrequested blocks from one piece, starting a
    /// new active piece if needed.
    fn request_from_piece(
        &mut self,
        peer: PeerHandle,
        piece: u32,
        count: usize,
        out: &mut Vec<BlockRequest>,
    ) {
        let Some(lengths) = self.lengths.as_ref() else {
            return;
        };
        let Some(index) = lengths.validate_piece_index(piece) else {
            return;
        };
        let p = self.pieces.get_or_insert(lengths, index);
        while out.len() < count {
            let Some(block) = p.first_unrequested() else {
                break;
            };
            match p.request_block(block, peer) {
                Some(r) => out.push(r),
                None => break,
            }
        }
    }

    /// Pieces from `list` in order: untouched ones are started, in-progress
    /// ones continued.
    fn pick_from_list(
        &mut self,
        peer: &ConnectedPeer,
        available: &BitField,
        list: &[u32],
        count: usize,
        start: u32,
        end: u32,
    ) -> Vec<BlockRequest> {
        let mut out = Vec::new();
        for &piece in list {
            if out.len() >= count {
                break;
            }
            if piece < start || piece > end || !available.get(piece as usize) {
                continue;
            }
            if let Some(p) = self.pieces.get(piece) {
                if !p.has_unrequested() {
                    continue;
                }
            }
            self.request_from_piece(peer.handle, piece, count, &mut out);
        }
        out
    }

    /// First run of consecutive available pieces that aren't active yet,
    /// preferring one long enough to cover `pieces_needed`.
    fn find_fresh_run(&self, available: &BitField, pieces_needed: u32, start: u32, end: u32) -> Option<(u32, u32)> {
        let mut first_run = None;
        let mut run: Option<(u32, u32)> = None;
        let mut idx = start;
        while idx <= end {
            let eligible = available.get(idx as usize) && !self.pieces.contains(idx);
            if eligible {
                let r = run.get_or_insert((idx, idx));
                r.1 = idx;
                if r.1 - r.0 + 1 >= pieces_needed {
                    return Some(*r);
                }
            } else if let Some(r) = run.take() {
                first_run.get_or_insert(r);
            }
            if idx == u32::MAX {
                break;
            }
            idx += 1;
        }
        first_run.or(run)
    }
}

impl PiecePicker for StandardPicker {
    fn initialise(&mut self, lengths: &Lengths) {
        self.lengths = Some(*lengths);
        self.pieces.clear();
    }

    fn import_active_requests(&mut self, requests: &[ActivePieceRequest]) {
        if let Some(lengths) = self.lengths.as_ref() {
            self.pieces.import(lengths, requests);
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
        let Some(lengths) = self.lengths else {
            return Vec::new();
        };
        if available.all_false() || count == 0 {
            return Vec::new();
        }

        // The peer's own pieces first.
        let mut out = Vec::new();
        while out.len() < count {
            match self.continue_existing_request(peer, start, end) {
                Some(r) => out.push(r),
                None => break,
            }
        }
        if !out.is_empty() {
            return out;
        }

        if peer.is_choking {
            if !peer.supports_fast_peer {
                return out;
            }
            let allowed = peer.allowed_fast.clone();
            return self.pick_from_list(peer, available, &allowed, count, start, end);
        }

        if !peer.suggested.is_empty() {
            let suggested = peer.suggested.clone();
            let out = self.pick_from_list(peer, available, &suggested, count, start, end);
            if !out.is_empty() {
                return out;
            }
        }

        let blocks_per_piece = lengths.default_max_blocks_per_piece().max(1);
        let pieces_needed = (count as u32).div_ceil(blocks_per_piece).max(1);
        if let Some((run_start, run_end)) = self.find_fresh_run(available, pieces_needed, start, end) {
            for piece in run_start..=run_end {
                if out.len() >= count {
                    break;
                }
                self.request_from_piece(peer.handle, piece, count, &mut out);
            }
            trace!(peer = %peer.handle, run_start, run_end, picked = out.len(), "fresh pieces");
            return out;
        }

        // Nothing new: help with somebody else's piece.
        if let Some(r) = self.continue_any_existing_request(peer, start, end, 1) {
            out.push(r);
        }
        out
    }

    fn continue_existing_request(
        &mut self,
        peer: &ConnectedPeer,
        start: u32,
        end: u32,
    ) -> Option<BlockRequest> {
        let handle = peer.handle;
        let mut fallback = None;
        for p in self.pieces.range(start, end) {
            if !Self::can_request_piece(peer, p.index) || !p.has_unrequested() {
                continue;
            }
            if p.assigned_to() == Some(handle) {
                fallback = Some(p.index);
                break;
            }
            if fallback.is_none() && p.requests_by(handle) > 0 {
                fallback = Some(p.index);
            }
        }
        let piece = self.pieces.get_mut(fallback?)?;
        let block = piece.first_unrequested()?;
        piece.request_block(block, handle)
    }

    fn continue_any_existing_request(
        &mut self,
        peer: &ConnectedPeer,
        start: u32,
        end: u32,
        max_duplicates: usize,
    ) -> Option<BlockRequest> {
        let handle = peer.handle;
        // Tail end first: the owner works forward from the front.
        for p in self.pieces.range_mut(start, end).rev() {
            if !Self::can_request_piece(peer, p.index) {
                continue;
            }
            if let Some(block) = p.last_unrequested() {
                return p.request_block(block, handle);
            }
        }
        if max_duplicates <= 1 {
            return None;
        }
        for p in self.pieces.range_mut(start, end).rev() {
            if !Self::can_request_piece(peer, p.index) {
                continue;
            }
            let candidate = p.blocks.iter().rposition(|b| {
                !b.is_received()
                    && !b.is_requested_by(handle)
                    && b.requested_by.len() < max_duplicates
            });
            if let Some(block) = candidate {
                return p.request_block(block, handle);
            }
        }
        None
    }

    fn validate_piece(&mut self, peer: PeerHandle, request: &BlockRequest) -> Option<Validated> {
        self.pieces.validate(peer, request)
    }

    fn cancel_requests(&mut self, peer: PeerHandle, start: u32, end: u32) -> Vec<BlockRequest> {
        self.pieces.cancel(peer, start, end)
    }

    fn request_rejected(&mut self, peer: PeerHandle, request: &BlockRequest) -> bool {
        self.pieces.reject(peer, request)
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
