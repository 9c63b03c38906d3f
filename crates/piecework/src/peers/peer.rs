use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use piecework_core::{BitField, Id20, constants::BLOCK_SIZE, speed_estimator::SpeedEstimator};
use tokio_util::sync::CancellationToken;

use super::{PeerHandle, outgoing::OutgoingQueue};

/// Default request pipeline depth when the peer did not advertise one.
pub const DEFAULT_MAX_PENDING_REQUESTS: usize = 250;

/// Byte counters for one connection. Shared with the connection's reader and
/// writer tasks, hence atomics.
#[derive(Debug, Default)]
pub struct TransferMonitor {
    bytes_downloaded: AtomicU64,
    bytes_uploaded: AtomicU64,
    download_speed: SpeedEstimator,
    upload_speed: SpeedEstimator,
}

impl TransferMonitor {
    pub fn record_download(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_upload(&self, bytes: u64) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded.load(Ordering::Relaxed)
    }

    pub fn download_rate(&self) -> u64 {
        self.download_speed.bps()
    }

    pub fn upload_rate(&self) -> u64 {
        self.upload_speed.bps()
    }

    /// Samples the running totals into the moving averages.
    pub fn tick(&self, now: Instant) {
        self.download_speed.add_snapshot(self.bytes_downloaded(), now);
        self.upload_speed.add_snapshot(self.bytes_uploaded(), now);
    }
}

/// Per-peer bookkeeping owned by the choke reviewer.
#[derive(Debug, Clone)]
pub struct ReviewState {
    pub bytes_downloaded_at_last_review: u64,
    pub bytes_uploaded_at_last_review: u64,
    pub last_review_download_rate: f64,
    pub last_review_upload_rate: f64,
    pub first_review_period: bool,
    pub last_unchoked: Option<Instant>,
}

impl Default for ReviewState {
    fn default() -> Self {
        Self {
            bytes_downloaded_at_last_review: 0,
            bytes_uploaded_at_last_review: 0,
            last_review_download_rate: 0.,
            last_review_upload_rate: 0.,
            first_review_period: true,
            last_unchoked: None,
        }
    }
}

/// A live, handshaken peer connection.
pub struct ConnectedPeer {
    pub handle: PeerHandle,
    pub addr: SocketAddr,
    pub peer_id: Id20,
    pub connected_at: Instant,

    pub am_choking: bool,
    pub am_interested: bool,
    pub is_choking: bool,
    pub is_interested: bool,

    pub supports_fast_peer: bool,
    pub bitfield: BitField,
    /// Pieces this peer lets us request while it chokes us.
    pub allowed_fast: Vec<u32>,
    /// Pieces we let this peer request while we choke it.
    pub am_allowed_fast: Vec<u32>,
    pub suggested: Vec<u32>,

    /// Requests we have outstanding with this peer.
    pub outstanding_requests: usize,
    pub max_supported_pending_requests: usize,

    pub monitor: Arc<TransferMonitor>,
    pub review: ReviewState,
    pub last_block_received: Option<Instant>,
    pub hash_fails: u32,

    pub outgoing: Arc<OutgoingQueue>,
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for ConnectedPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedPeer")
            .field("handle", &self.handle)
            .field("addr", &self.addr)
            .field("am_choking", &self.am_choking)
            .field("is_interested", &self.is_interested)
            .field("outstanding_requests", &self.outstanding_requests)
            .finish_non_exhaustive()
    }
}

impl ConnectedPeer {
    pub fn new(handle: PeerHandle, addr: SocketAddr, peer_id: Id20, piece_count: usize) -> Self {
        Self {
            handle,
            addr,
            peer_id,
            connected_at: Instant::now(),
            am_choking: true,
            am_interested: false,
            is_choking: true,
            is_interested: false,
            supports_fast_peer: false,
            bitfield: BitField::new(piece_count),
            allowed_fast: Vec::new(),
            am_allowed_fast: Vec::new(),
            suggested: Vec::new(),
            outstanding_requests: 0,
            max_supported_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
            monitor: Default::default(),
            review: Default::default(),
            last_block_received: None,
            hash_fails: 0,
            outgoing: Default::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_seeder(&self) -> bool {
        !self.bitfield.is_empty() && self.bitfield.all_true()
    }

    pub fn is_allowed_fast(&self, piece: u32) -> bool {
        self.allowed_fast.contains(&piece)
    }

    /// Whether anything can be requested from this peer right now.
    pub fn can_request(&self) -> bool {
        !self.is_choking || (self.supports_fast_peer && !self.allowed_fast.is_empty())
    }

    /// Request pipeline depth: grows with the observed download rate so that
    /// roughly two seconds worth of blocks are in flight.
    pub fn max_pending_requests(&self) -> usize {
        let by_rate = (self.monitor.download_rate() * 2 / BLOCK_SIZE as u64) as usize;
        by_rate.clamp(2, self.max_supported_pending_requests.max(2))
    }

    /// Blocks to ask for in one pick. Fast peers get whole pieces at a time.
    pub fn preferred_request_amount(&self, piece_length: u32) -> usize {
        let blocks_per_piece = piece_length.div_ceil(BLOCK_SIZE) as usize;
        let rate = self.monitor.download_rate();
        if rate >= piece_length as u64 {
            blocks_per_piece.max(1)
        } else {
            1
        }
    }

    pub fn time_connected(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.connected_at)
    }
}
