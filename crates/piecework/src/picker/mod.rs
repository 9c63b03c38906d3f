//! Piece selection.
//!
//! A picker is a chain of [`PickerStage`]s in front of a base
//! [`PiecePicker`] that owns block-level request state. Each stage narrows
//! the candidate bitfield or reorders the piece range and forwards to the
//! next one through [`Next`]; the base turns the result into block requests.
//!
//! The default chain is
//! `Ignoring -> EndGameSwitcher(Priority -> RarestFirst -> Randomised -> Standard | EndGame)`.

pub mod endgame;
pub mod ignoring;
pub mod piece;
pub mod pipeline;
pub mod priority;
pub mod randomised;
pub mod rarest_first;
pub mod standard;
pub mod streaming;

use piecework_core::{BitField, lengths::Lengths};

use crate::{
    peers::{ConnectedPeer, PeerHandle},
    torrent_info::{FileInfo, Priority},
    wire::BlockRequest,
};

pub use endgame::{EndGamePicker, EndGameSwitcher};
pub use ignoring::IgnoringStage;
pub use pipeline::{Next, NextRef, PickerPipeline, PickerStage};
pub use priority::PriorityStage;
pub use randomised::RandomisedStage;
pub use rarest_first::RarestFirstStage;
pub use standard::StandardPicker;
pub use streaming::StreamingStage;

/// Torrent state a picker derives its masks from. Passed on every refresh,
/// never retained.
#[derive(Debug, Clone, Copy)]
pub struct PickerContext<'a> {
    pub lengths: &'a Lengths,
    pub have: &'a BitField,
    /// Pieces that must not be picked even though we lack them: waiting for
    /// a hash check, not yet verified after resume, or fully unwanted.
    pub ignored: &'a BitField,
    pub files: &'a [FileInfo],
    pub priorities: &'a [Priority],
}

/// Outcome of accepting a received block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validated {
    pub piece_complete: bool,
    /// Every peer that delivered a block of the piece. Only filled when the
    /// piece is complete.
    pub peers_involved: Vec<PeerHandle>,
    /// Duplicate requests for the same block that must now be cancelled.
    pub cancellations: Vec<(PeerHandle, BlockRequest)>,
}

/// One entry of a picker's exported request state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivePieceRequest {
    pub request: BlockRequest,
    pub peer: PeerHandle,
    pub received: bool,
}

pub trait PiecePicker: Send {
    /// Forgets all request state and adopts the torrent geometry.
    fn initialise(&mut self, lengths: &Lengths);

    /// Adopts request state exported from another picker.
    fn import_active_requests(&mut self, requests: &[ActivePieceRequest]);

    fn refresh(&mut self, _ctx: &PickerContext<'_>) {}

    /// Picks up to `count` new block requests for `peer` among pieces set in
    /// `available` within `start..=end`.
    fn pick_piece(
        &mut self,
        peer: &ConnectedPeer,
        available: &BitField,
        others: &[&ConnectedPeer],
        count: usize,
        start: u32,
        end: u32,
    ) -> Vec<BlockRequest>;

    /// Next unrequested block of a piece this peer is already working on.
    fn continue_existing_request(
        &mut self,
        peer: &ConnectedPeer,
        start: u32,
        end: u32,
    ) -> Option<BlockRequest>;

    /// A block of any in-progress piece the peer has, as long as fewer than
    /// `max_duplicates` peers already requested it.
    fn continue_any_existing_request(
        &mut self,
        peer: &ConnectedPeer,
        start: u32,
        end: u32,
        max_duplicates: usize,
    ) -> Option<BlockRequest>;

    /// Accepts a received block if `peer` had it requested. `None` means the
    /// data was not expected and must be dropped.
    fn validate_piece(&mut self, peer: PeerHandle, request: &BlockRequest) -> Option<Validated>;

    /// Drops all of `peer`'s outstanding requests in `start..=end`, returning them.
    fn cancel_requests(&mut self, peer: PeerHandle, start: u32, end: u32) -> Vec<BlockRequest>;

    fn request_rejected(&mut self, peer: PeerHandle, request: &BlockRequest) -> bool;

    fn is_interesting(&self, peer: &ConnectedPeer, available: &BitField) -> bool;

    fn export_active_requests(&self) -> Vec<ActivePieceRequest>;

    /// Outstanding (peer, block) request pairs.
    fn current_request_count(&self) -> usize;

    /// Blocks already received for pieces that are not complete yet.
    fn received_block_count(&self) -> usize;

    fn in_endgame_mode(&self) -> bool {
        false
    }
}

impl<P: PiecePicker + ?Sized> PiecePicker for Box<P> {
    fn initialise(&mut self, lengths: &Lengths) {
        (**self).initialise(lengths)
    }

    fn import_active_requests(&mut self, requests: &[ActivePieceRequest]) {
        (**self).import_active_requests(requests)
    }

    fn refresh(&mut self, ctx: &PickerContext<'_>) {
        (**self).refresh(ctx)
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
        (**self).pick_piece(peer, available, others, count, start, end)
    }

    fn continue_existing_request(
        &mut self,
        peer: &ConnectedPeer,
        start: u32,
        end: u32,
    ) -> Option<BlockRequest> {
        (**self).continue_existing_request(peer, start, end)
    }

    fn continue_any_existing_request(
        &mut self,
        peer: &ConnectedPeer,
        start: u32,
        end: u32,
        max_duplicates: usize,
    ) -> Option<BlockRequest> {
        (**self).continue_any_existing_request(peer, start, end, max_duplicates)
    }

    fn validate_piece(&mut self, peer: PeerHandle, request: &BlockRequest) -> Option<Validated> {
        (**self).validate_piece(peer, request)
    }

    fn cancel_requests(&mut self, peer: PeerHandle, start: u32, end: u32) -> Vec<BlockRequest> {
        (**self).cancel_requests(peer, start, end)
    }

    fn request_rejected(&mut self, peer: PeerHandle, request: &BlockRequest) -> bool {
        (**self).request_rejected(peer, request)
    }

    fn is_interesting(&self, peer: &ConnectedPeer, available: &BitField) -> bool {
        (**self).is_interesting(peer, available)
    }

    fn export_active_requests(&self) -> Vec<ActivePieceRequest> {
        (**self).export_active_requests()
    }

    fn current_request_count(&self) -> usize {
        (**self).current_request_count()
    }

    fn received_block_count(&self) -> usize {
        (**self).received_block_count()
    }

    fn in_endgame_mode(&self) -> bool {
        (**self).in_endgame_mode()
    }
}

/// The default chain used by the standard requester.
pub fn default_picker(endgame_threshold_blocks: usize) -> PickerPipeline<EndGameSwitcher> {
    let standard = PickerPipeline::new(StandardPicker::default())
        .with_stage(PriorityStage::default())
        .with_stage(RarestFirstStage)
        .with_stage(RandomisedStage::default());
    let switcher = EndGameSwitcher::new(
        Box::new(standard),
        EndGamePicker::default(),
        endgame_threshold_blocks,
    );
    PickerPipeline::new(switcher).with_stage(IgnoringStage::default())
}

#[cfg(test)]
pub(crate) mod test_peers {
    use std::net::SocketAddr;

    use piecework_core::{BitField, Id20};

    use crate::peers::{ConnectedPeer, PeerHandle};

    pub fn peer(handle: u64, piece_count: usize) -> ConnectedPeer {
        let addr: SocketAddr = format!("127.0.0.1:{}", 10000 + handle).parse().unwrap();
        let mut p = ConnectedPeer::new(PeerHandle(handle), addr, Id20::default(), piece_count);
        p.is_choking = false;
        p
    }

    pub fn seeder(handle: u64, piece_count: usize) -> ConnectedPeer {
        let mut p = peer(handle, piece_count);
        p.bitfield = BitField::new_all_true(piece_count);
        p
    }
}
