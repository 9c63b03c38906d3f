use std::sync::Arc;

use piecework_core::lengths::Lengths;
use tracing::debug;

use crate::{
    peers::{ConnectedPeer, PeerHandle, PeerTable},
    picker::{
        ActivePieceRequest, EndGamePicker, EndGameSwitcher, IgnoringStage, PickerContext,
        PickerPipeline, PiecePicker, PriorityStage, RandomisedStage, RarestFirstStage,
        StandardPicker, StreamingStage, Validated, streaming::StreamingWindow,
    },
    torrent_info::FileInfo,
    wire::BlockRequest,
};

use super::{PieceRequester, cancel_and_notify, fill_requests};

/// Requester for sequential consumption (media playback). Pieces in a window
/// after the read position are fetched first and in order; the rest of the
/// torrent is fetched rarest-first in the background.
pub struct StreamingPieceRequester {
    picker: PickerPipeline<EndGameSwitcher>,
    window: Arc<StreamingWindow>,
    lengths: Option<Lengths>,
}

impl StreamingPieceRequester {
    pub fn new(window_pieces: u32, endgame_threshold_blocks: usize) -> Self {
        let window = StreamingWindow::new(window_pieces);
        let switcher = EndGameSwitcher::new(
            Box::new(StandardPicker::default()),
            EndGamePicker::default(),
            endgame_threshold_blocks,
        );
        let picker = PickerPipeline::new(switcher)
            .with_stage(RandomisedStage::default())
            .with_stage(RarestFirstStage)
            .with_stage(StreamingStage::new(window.clone()))
            .with_stage(PriorityStage::default())
            .with_stage(IgnoringStage::default());
        Self {
            picker,
            window,
            lengths: None,
        }
    }

    pub fn window(&self) -> Option<(u32, u32)> {
        let last = self.lengths?.last_piece_id().get();
        let (s, e) = self.window.bounds()?;
        Some((s.min(last), e.min(last)))
    }

    fn piece_for(&self, file: &FileInfo, position: u64) -> Option<u32> {
        let lengths = self.lengths?;
        let offset = file.offset_in_torrent + position.min(file.length.saturating_sub(1));
        let piece = (offset / lengths.default_piece_length() as u64) as u32;
        Some(piece.min(lengths.last_piece_id().get()))
    }

    /// Moves the window to `position` within `file`. Requests outside the
    /// new window are cancelled and every peer's pipeline is refilled, so
    /// the window is served first. Returns the number of cancelled requests.
    pub fn seek_to_position(&mut self, file: &FileInfo, position: u64, peers: &mut PeerTable) -> usize {
        let Some(piece) = self.piece_for(file, position) else {
            return 0;
        };
        self.window.set_start(piece);
        let Some((ws, we)) = self.window() else {
            return 0;
        };
        let last = self.lengths.map_or(0, |l| l.last_piece_id().get());

        let mut cancelled = 0;
        for handle in peers.handles() {
            if ws > 0 {
                cancelled += cancel_and_notify(&mut self.picker, handle, peers, 0, ws - 1);
            }
            if we < last {
                cancelled += cancel_and_notify(&mut self.picker, handle, peers, we + 1, last);
            }
        }
        debug!(piece, window_end = we, cancelled, "seek");
        for handle in peers.handles() {
            self.add_requests(handle, peers);
        }
        cancelled
    }

    /// Advances the window as data is consumed, without cancelling anything.
    pub fn read_to_position(&mut self, file: &FileInfo, position: u64) {
        let Some(piece) = self.piece_for(file, position) else {
            return;
        };
        if self.window.bounds().map(|(s, _)| s) != Some(piece) {
            self.window.set_start(piece);
        }
    }
}

impl PieceRequester for StreamingPieceRequester {
    fn initialise(&mut self, lengths: &Lengths) {
        self.lengths = Some(*lengths);
        self.picker.initialise(lengths);
        self.window.set_start(0);
    }

    fn refresh(&mut self, ctx: &PickerContext<'_>) {
        self.picker.refresh(ctx)
    }

    fn add_requests(&mut self, peer: PeerHandle, peers: &mut PeerTable) -> usize {
        let Some(lengths) = self.lengths else {
            return 0;
        };
        fill_requests(&mut self.picker, &lengths, peer, peers)
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

    fn as_streaming(&mut self) -> Option<&mut StreamingPieceRequester> {
        Some(self)
    }
}
