use std::collections::BTreeMap;

use piecework_core::lengths::{Lengths, ValidPieceIndex};

use crate::{peers::PeerHandle, wire::BlockRequest};

use super::{ActivePieceRequest, Validated};

/// One block of an in-progress piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub offset: u32,
    pub length: u32,
    /// Peers with an outstanding request for this block, in request order.
    pub requested_by: Vec<PeerHandle>,
    pub received_from: Option<PeerHandle>,
}

impl Block {
    pub fn is_received(&self) -> bool {
        self.received_from.is_some()
    }

    pub fn is_requested(&self) -> bool {
        !self.requested_by.is_empty()
    }

    pub fn is_requested_by(&self, peer: PeerHandle) -> bool {
        self.requested_by.contains(&peer)
    }

    pub fn remove_requester(&mut self, peer: PeerHandle) -> bool {
        let before = self.requested_by.len();
        self.requested_by.retain(|p| *p != peer);
        before != self.requested_by.len()
    }
}

/// A piece with at least one requested or received block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub index: u32,
    pub blocks: Vec<Block>,
    received: usize,
}

impl Piece {
    pub fn new(lengths: &Lengths, index: ValidPieceIndex) -> Self {
        let blocks = lengths
            .iter_block_infos(index)
            .map(|b| Block {
                offset: b.offset,
                length: b.size,
                requested_by: Vec::new(),
                received_from: None,
            })
            .collect();
        Self {
            index: index.get(),
            blocks,
            received: 0,
        }
    }

    /// The peer that requested this piece's first block.
    pub fn assigned_to(&self) -> Option<PeerHandle> {
        self.blocks
            .first()
            .and_then(|b| b.requested_by.first().copied().or(b.received_from))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn total_received(&self) -> usize {
        self.received
    }

    pub fn all_blocks_received(&self) -> bool {
        self.received == self.blocks.len()
    }

    pub fn has_unrequested(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| !b.is_received() && !b.is_requested())
    }

    /// True when no block is requested or received, i.e. the piece is back
    /// to the untouched state and can leave the active set.
    pub fn is_untouched(&self) -> bool {
        self.received == 0 && self.blocks.iter().all(|b| !b.is_requested())
    }

    pub fn requests_by(&self, peer: PeerHandle) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.is_requested_by(peer))
            .count()
    }

    pub fn first_unrequested(&self) -> Option<usize> {
        self.blocks
            .iter()
            .position(|b| !b.is_received() && !b.is_requested())
    }

    pub fn last_unrequested(&self) -> Option<usize> {
        self.blocks
            .iter()
            .rposition(|b| !b.is_received() && !b.is_requested())
    }

    pub fn block_index(&self, offset: u32, length: u32) -> Option<usize> {
        self.blocks
            .iter()
            .position(|b| b.offset == offset && b.length == length)
    }

    pub fn request_block(&mut self, block: usize, peer: PeerHandle) -> Option<BlockRequest> {
        let index = self.index;
        let b = self.blocks.get_mut(block)?;
        if b.is_received() || b.is_requested_by(peer) {
            return None;
        }
        b.requested_by.push(peer);
        Some(BlockRequest::new(index, b.offset, b.length))
    }

    fn mark_received(&mut self, block: usize, peer: PeerHandle) -> Vec<PeerHandle> {
        let b = &mut self.blocks[block];
        b.remove_requester(peer);
        b.received_from = Some(peer);
        self.received += 1;
        std::mem::take(&mut b.requested_by)
    }

    pub fn request_for(&self, block: usize) -> Option<BlockRequest> {
        let b = self.blocks.get(block)?;
        Some(BlockRequest::new(self.index, b.offset, b.length))
    }
}

/// The in-progress pieces of a picker, sorted by index, with the
/// request/receive state machine shared by the standard and endgame pickers.
#[derive(Debug, Default, Clone)]
pub struct PieceSet {
    pieces: BTreeMap<u32, Piece>,
}

impl PieceSet {
    pub fn clear(&mut self) {
        self.pieces.clear()
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn contains(&self, index: u32) -> bool {
        self.pieces.contains_key(&index)
    }

    pub fn get(&self, index: u32) -> Option<&Piece> {
        self.pieces.get(&index)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut Piece> {
        self.pieces.get_mut(&index)
    }

    pub fn get_or_insert(&mut self, lengths: &Lengths, index: ValidPieceIndex) -> &mut Piece {
        self.pieces
            .entry(index.get())
            .or_insert_with(|| Piece::new(lengths, index))
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Piece> {
        self.pieces.values()
    }

    pub fn range(&self, start: u32, end: u32) -> impl DoubleEndedIterator<Item = &Piece> {
        self.pieces.range(start..=end).map(|(_, p)| p)
    }

    pub fn range_mut(
        &mut self,
        start: u32,
        end: u32,
    ) -> impl DoubleEndedIterator<Item = &mut Piece> {
        self.pieces.range_mut(start..=end).map(|(_, p)| p)
    }

    pub fn received_blocks(&self) -> usize {
        self.pieces.values().map(|p| p.total_received()).sum()
    }

    pub fn outstanding_requests(&self) -> usize {
        self.pieces
            .values()
            .flat_map(|p| p.blocks.iter())
            .map(|b| b.requested_by.len())
            .sum()
    }

    /// Marks the block received if `peer` has it outstanding. Other requesters
    /// of the same block are returned for cancellation; a completed piece
    /// leaves the set.
    pub fn validate(&mut self, peer: PeerHandle, request: &BlockRequest) -> Option<Validated> {
        let piece = self.pieces.get_mut(&request.piece)?;
        let block = piece.block_index(request.offset, request.length)?;
        {
            let b = &piece.blocks[block];
            if b.is_received() || !b.is_requested_by(peer) {
                return None;
            }
        }
        let others = piece.mark_received(block, peer);
        let cancellations = others
            .into_iter()
            .map(|other| (other, *request))
            .collect();

        if !piece.all_blocks_received() {
            return Some(Validated {
                piece_complete: false,
                peers_involved: Vec::new(),
                cancellations,
            });
        }

        let piece = self.pieces.remove(&request.piece)?;
        let mut peers_involved: Vec<PeerHandle> = Vec::new();
        for b in piece.blocks.iter() {
            if let Some(p) = b.received_from {
                if !peers_involved.contains(&p) {
                    peers_involved.push(p);
                }
            }
        }
        Some(Validated {
            piece_complete: true,
            peers_involved,
            cancellations,
        })
    }

    /// Drops every outstanding request of `peer` for pieces in `start..=end`.
    pub fn cancel(&mut self, peer: PeerHandle, start: u32, end: u32) -> Vec<BlockRequest> {
        let mut cancelled = Vec::new();
        for piece in self.range_mut(start, end) {
            let index = piece.index;
            for b in piece.blocks.iter_mut() {
                if !b.is_received() && b.remove_requester(peer) {
                    cancelled.push(BlockRequest::new(index, b.offset, b.length));
                }
            }
        }
        self.pieces.retain(|_, p| !p.is_untouched());
        cancelled
    }

    pub fn reject(&mut self, peer: PeerHandle, request: &BlockRequest) -> bool {
        let Some(piece) = self.pieces.get_mut(&request.piece) else {
            return false;
        };
        let Some(block) = piece.block_index(request.offset, request.length) else {
            return false;
        };
        let removed = piece.blocks[block].remove_requester(peer);
        if piece.is_untouched() {
            self.pieces.remove(&request.piece);
        }
        removed
    }

    pub fn export(&self) -> Vec<ActivePieceRequest> {
        let mut out = Vec::new();
        for piece in self.pieces.values() {
            for b in piece.blocks.iter() {
                let request = BlockRequest::new(piece.index, b.offset, b.length);
                if let Some(peer) = b.received_from {
                    out.push(ActivePieceRequest {
                        request,
                        peer,
                        received: true,
                    });
                }
                for peer in b.requested_by.iter().copied() {
                    out.push(ActivePieceRequest {
                        request,
                        peer,
                        received: false,
                    });
                }
            }
        }
        out
    }

    pub fn import(&mut self, lengths: &Lengths, requests: &[ActivePieceRequest]) {
        for r in requests {
            let Some(index) = lengths.validate_piece_index(r.request.piece) else {
                continue;
            };
            let piece = self.get_or_insert(lengths, index);
            let Some(block) = piece.block_index(r.request.offset, r.request.length) else {
                continue;
            };
            if r.received {
                if !piece.blocks[block].is_received() {
                    piece.blocks[block].received_from = Some(r.peer);
                    piece.received += 1;
                }
            } else if !piece.blocks[block].is_received()
                && !piece.blocks[block].is_requested_by(r.peer)
            {
                piece.blocks[block].requested_by.push(r.peer);
            }
        }
        self.pieces.retain(|_, p| !p.is_untouched());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lengths() -> Lengths {
        Lengths::new(16384 * 5, 16384 * 2).unwrap()
    }

    #[test]
    fn test_validate_is_idempotent() {
        let l = lengths();
        let mut set = PieceSet::default();
        let a = PeerHandle(1);
        let piece = set.get_or_insert(&l, l.validate_piece_index(0).unwrap());
        let r0 = piece.request_block(0, a).unwrap();
        let r1 = piece.request_block(1, a).unwrap();

        let v = set.validate(a, &r0).unwrap();
        assert!(!v.piece_complete);
        assert!(set.validate(a, &r0).is_none());

        let v = set.validate(a, &r1).unwrap();
        assert!(v.piece_complete);
        assert_eq!(v.peers_involved, vec![a]);
        assert!(!set.contains(0));
    }

    #[test]
    fn test_foreign_peer_is_rejected() {
        let l = lengths();
        let mut set = PieceSet::default();
        let piece = set.get_or_insert(&l, l.validate_piece_index(1).unwrap());
        let r = piece.request_block(0, PeerHandle(1)).unwrap();
        assert!(set.validate(PeerHandle(2), &r).is_none());
        assert!(set.validate(PeerHandle(1), &BlockRequest::new(1, 0, 100)).is_none());
        assert!(set.validate(PeerHandle(1), &BlockRequest::new(3, 0, 16384)).is_none());
    }

    #[test]
    fn test_duplicate_requesters_get_cancelled() {
        let l = lengths();
        let mut set = PieceSet::default();
        let piece = set.get_or_insert(&l, l.validate_piece_index(0).unwrap());
        let r = piece.request_block(0, PeerHandle(1)).unwrap();
        piece.request_block(0, PeerHandle(2)).unwrap();
        piece.request_block(0, PeerHandle(3)).unwrap();
        let v = set.validate(PeerHandle(2), &r).unwrap();
        assert_eq!(
            v.cancellations,
            vec![(PeerHandle(1), r), (PeerHandle(3), r)]
        );
        assert!(set.validate(PeerHandle(1), &r).is_none());
    }

    #[test]
    fn test_cancel_reverts_untouched_pieces() {
        let l = lengths();
        let mut set = PieceSet::default();
        let a = PeerHandle(1);
        let b = PeerHandle(2);
        set.get_or_insert(&l, l.validate_piece_index(0).unwrap())
            .request_block(0, a);
        let p1 = set.get_or_insert(&l, l.validate_piece_index(1).unwrap());
        p1.request_block(0, a);
        p1.request_block(1, b);

        let cancelled = set.cancel(a, 0, 2);
        assert_eq!(cancelled.len(), 2);
        assert!(!set.contains(0));
        assert!(set.contains(1));
        assert_eq!(set.outstanding_requests(), 1);
    }

    #[test]
    fn test_export_import() {
        let l = lengths();
        let mut set = PieceSet::default();
        let a = PeerHandle(1);
        let p = set.get_or_insert(&l, l.validate_piece_index(2).unwrap());
        let r = p.request_block(0, a).unwrap();
        set.validate(a, &r).unwrap();
        // last piece has a single block, so it completed
        assert!(set.is_empty());

        let p = set.get_or_insert(&l, l.validate_piece_index(0).unwrap());
        let r = p.request_block(0, a).unwrap();
        p.request_block(1, a).unwrap();
        p.request_block(1, PeerHandle(2)).unwrap();
        set.validate(a, &r).unwrap();

        let exported = set.export();
        assert_eq!(exported.len(), 3);
        let mut other = PieceSet::default();
        other.import(&l, &exported);
        assert_eq!(other.get(0), set.get(0));
        assert_eq!(other.received_blocks(), 1);
    }
}
