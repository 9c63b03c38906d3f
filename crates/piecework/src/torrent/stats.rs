use serde::Serialize;

use crate::error::TorrentErrorReason;

use super::TorrentMode;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerCounts {
    pub connected: usize,
    pub connecting: usize,
    pub unchoked: usize,
    pub interested: usize,
    /// Peers that are not choking us.
    pub unchoking_us: usize,
}

/// Snapshot of a torrent's progress.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentStats {
    pub mode: TorrentMode,
    pub error: Option<TorrentErrorReason>,
    pub error_message: Option<String>,
    pub total_pieces: usize,
    pub have_pieces: usize,
    /// Pieces of wanted files still missing.
    pub needed_pieces: usize,
    pub unhashed_pieces: usize,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub hash_fails: u64,
    pub endgame: bool,
    pub outstanding_requests: usize,
    pub peers: PeerCounts,
}

impl TorrentStats {
    pub fn is_finished(&self) -> bool {
        self.needed_pieces == 0
    }
}
