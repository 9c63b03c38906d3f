use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use piecework_core::BitField;

use crate::{peers::ConnectedPeer, wire::BlockRequest};

use super::{Next, PickerStage};

/// Duplicate requests allowed per block inside the high-priority window.
pub const STREAMING_MAX_DUPLICATES: usize = 2;

const NO_WINDOW: u32 = u32::MAX;

/// Position of the high-priority window, shared between the picker stage and
/// whoever moves the playback position.
#[derive(Debug)]
pub struct StreamingWindow {
    start: AtomicU32,
    len: u32,
}

impl StreamingWindow {
    pub fn new(len: u32) -> Arc<Self> {
        Arc::new(Self {
            start: AtomicU32::new(NO_WINDOW),
            len: len.max(1),
        })
    }

    pub fn set_start(&self, piece: u32) {
        self.start.store(piece, Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.start.store(NO_WINDOW, Ordering::Relaxed)
    }

    /// Inclusive bounds of the window, if one is set.
    pub fn bounds(&self) -> Option<(u32, u32)> {
        let start = self.start.load(Ordering::Relaxed);
        if start == NO_WINDOW {
            return None;
        }
        Some((start, start.saturating_add(self.len - 1)))
    }

    pub fn size(&self) -> u32 {
        self.len
    }
}

/// Fetches the pieces right after the playback position in order, straight
/// from the base picker, before anything else. Blocks inside the window may
/// be requested from two peers at once so one slow peer can't stall
/// playback. Everything outside the window goes down the normal chain.
pub struct StreamingStage {
    window: Arc<StreamingWindow>,
}

impl StreamingStage {
    pub fn new(window: Arc<StreamingWindow>) -> Self {
        Self { window }
    }

    fn clamp(&self, start: u32, end: u32) -> Option<(u32, u32)> {
        let (ws, we) = self.window.bounds()?;
        let (s, e) = (ws.max(start), we.min(end));
        (s <= e).then_some((s, e))
    }
}

impl PickerStage for StreamingStage {
    fn pick_piece(
        &mut self,
        mut next: Next<'_>,
        peer: &ConnectedPeer,
        available: &BitField,
        others: &[&ConnectedPeer],
        count: usize,
        start: u32,
        end: u32,
    ) -> Vec<BlockRequest> {
        if let Some((ws, we)) = self.clamp(start, end) {
            let picked = next.base().pick_piece(peer, available, others, count, ws, we);
            if !picked.is_empty() {
                return picked;
            }
            if let Some(r) =
                next.base()
                    .continue_any_existing_request(peer, ws, we, STREAMING_MAX_DUPLICATES)
            {
                return vec![r];
            }
        }
        next.pick_piece(peer, available, others, count, start, end)
    }
}
