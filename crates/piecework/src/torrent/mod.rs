//! One torrent's engine.
//!
//! [`TorrentManager`] owns every piece of mutable torrent state (bitfields,
//! picker, peer table, choke lists) and is the only thing that mutates it.
//! Connection pumps, the block writer and hash checks run as separate tasks
//! and report back as [`TorrentEvent`]s on a channel the manager drains in
//! [`TorrentManager::run`].

pub mod allowed_fast;
pub mod fast_resume;
pub mod piece_manager;
pub mod stats;

use std::{
    collections::VecDeque,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use piecework_core::{BitField, Id20, spawn_utils::spawn};
use rand::RngCore;
use serde::Serialize;
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, info, trace, warn};

use crate::{
    Error,
    choke::{ChokeUnchokeManager, InactivePeerManager},
    connection::{Connected, ConnectionManager, PeerConnector},
    disk::{DiskManager, DiskTorrent, PieceWriter},
    error::TorrentErrorReason,
    limits::{Limits, LimitsConfig},
    peers::{ConnectedPeer, PeerHandle, PeerTable},
    requester::{PieceRequester, StandardPieceRequester},
    settings::EngineSettings,
    torrent_info::{Priority, TorrentInfo},
    wire::{BlockRequest, Message, PieceMessage},
};

pub use fast_resume::FastResume;
pub use piece_manager::{PieceManager, PieceReceived};
pub use stats::{PeerCounts, TorrentStats};

use allowed_fast::{ALLOWED_FAST_COUNT, allowed_fast_set};

pub const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Largest block a peer may ask us for.
const MAX_REQUEST_LENGTH: u32 = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TorrentMode {
    Stopped,
    Hashing,
    Downloading,
    Seeding,
    Error,
}

/// Things the torrent's background tasks report.
#[derive(Debug)]
pub enum TorrentEvent {
    PeerConnected {
        addr: SocketAddr,
        connected: Connected,
    },
    ConnectFailed {
        addr: SocketAddr,
        error: Error,
    },
    PeerMessage {
        peer: PeerHandle,
        message: Message,
    },
    PeerDisconnected {
        peer: PeerHandle,
        reason: Option<anyhow::Error>,
    },
    /// Reading a block to upload failed.
    DiskFailure {
        peer: PeerHandle,
        error: Error,
    },
    BlockWritten {
        request: BlockRequest,
        piece_complete: bool,
        result: crate::Result<()>,
    },
    /// `Ok(false)` means the data did not match or was incomplete.
    PieceHashed {
        piece: u32,
        result: crate::Result<bool>,
    },
}

pub enum TorrentCommand {
    Start(oneshot::Sender<crate::Result<()>>),
    Stop(oneshot::Sender<crate::Result<()>>),
    ClearError(oneshot::Sender<crate::Result<()>>),
    AddPeer(SocketAddr),
    SetFilePriority {
        file: usize,
        priority: Priority,
        done: oneshot::Sender<crate::Result<()>>,
    },
    Seek {
        file: usize,
        position: u64,
        done: oneshot::Sender<crate::Result<usize>>,
    },
    SaveFastResume {
        path: PathBuf,
        done: oneshot::Sender<anyhow::Result<()>>,
    },
    SetNetworkLimits(LimitsConfig),
    Stats(oneshot::Sender<TorrentStats>),
}

/// Talks to a [`TorrentManager`] running in its own task.
#[derive(Clone)]
pub struct TorrentHandle {
    commands: UnboundedSender<TorrentCommand>,
}

impl TorrentHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> TorrentCommand,
    ) -> crate::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| Error::TorrentStopped)?;
        rx.await.map_err(|_| Error::TorrentStopped)
    }

    pub async fn start(&self) -> crate::Result<()> {
        self.request(TorrentCommand::Start).await?
    }

    pub async fn stop(&self) -> crate::Result<()> {
        self.request(TorrentCommand::Stop).await?
    }

    pub async fn clear_error(&self) -> crate::Result<()> {
        self.request(TorrentCommand::ClearError).await?
    }

    pub fn add_peer(&self, addr: SocketAddr) -> crate::Result<()> {
        self.commands
            .send(TorrentCommand::AddPeer(addr))
            .map_err(|_| Error::TorrentStopped)
    }

    pub async fn set_file_priority(&self, file: usize, priority: Priority) -> crate::Result<()> {
        self.request(|done| TorrentCommand::SetFilePriority {
            file,
            priority,
            done,
        })
        .await?
    }

    pub async fn seek_to_position(&self, file: usize, position: u64) -> crate::Result<usize> {
        self.request(|done| TorrentCommand::Seek {
            file,
            position,
            done,
        })
        .await?
    }

    pub async fn save_fast_resume(&self, path: PathBuf) -> anyhow::Result<()> {
        self.request(|done| TorrentCommand::SaveFastResume { path, done })
            .await?
    }

    pub fn set_network_limits(&self, limits: LimitsConfig) -> crate::Result<()> {
        self.commands
            .send(TorrentCommand::SetNetworkLimits(limits))
            .map_err(|_| Error::TorrentStopped)
    }

    pub async fn stats(&self) -> crate::Result<TorrentStats> {
        self.request(TorrentCommand::Stats).await
    }
}

/// Azureus-style peer id: client tag and version, then random bytes.
pub fn generate_peer_id() -> Id20 {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(b"-PW0100-");
    rand::rng().fill_bytes(&mut id[8..]);
    Id20::new(id)
}

struct BlockWriter {
    jobs: UnboundedSender<WriteJob>,
    task: tokio::task::JoinHandle<()>,
}

struct WriteJob {
    request: BlockRequest,
    data: Bytes,
    piece_complete: bool,
}

#[derive(Debug)]
struct TorrentError {
    reason: Option<TorrentErrorReason>,
    message: String,
}

pub struct TorrentManager {
    info: Arc<TorrentInfo>,
    settings: EngineSettings,
    mode: TorrentMode,
    error: Option<TorrentError>,

    pieces: PieceManager,
    peers: PeerTable,
    choker: ChokeUnchokeManager,
    inactive: InactivePeerManager,
    connections: ConnectionManager,
    known_peers: VecDeque<SocketAddr>,

    disk: Arc<DiskManager>,
    disk_torrent: Arc<DiskTorrent>,
    writer: Option<BlockWriter>,

    events_tx: UnboundedSender<TorrentEvent>,
    events_rx: UnboundedReceiver<TorrentEvent>,

    downloaded_bytes: u64,
    uploaded_by_departed: u64,
}

impl TorrentManager {
    pub fn new(
        info: Arc<TorrentInfo>,
        settings: &EngineSettings,
        disk: Arc<DiskManager>,
        storage: Arc<dyn PieceWriter>,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        let requester = Box::new(StandardPieceRequester::new(settings.endgame_threshold_blocks));
        Self::with_requester(info, settings, disk, storage, connector, requester)
    }

    pub fn with_requester(
        info: Arc<TorrentInfo>,
        settings: &EngineSettings,
        disk: Arc<DiskManager>,
        storage: Arc<dyn PieceWriter>,
        connector: Arc<dyn PeerConnector>,
        requester: Box<dyn PieceRequester>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let disk_torrent = disk.add_torrent(info.clone(), storage);
        let connections = ConnectionManager::new(
            settings,
            connector,
            info.info_hash,
            generate_peer_id(),
            events_tx.clone(),
            disk.clone(),
            disk_torrent.clone(),
            Arc::new(Limits::new(settings.network_limits)),
        );
        Self {
            pieces: PieceManager::new(info.clone(), requester),
            info,
            settings: settings.clone(),
            mode: TorrentMode::Stopped,
            error: None,
            peers: PeerTable::new(),
            choker: ChokeUnchokeManager::new(settings),
            inactive: InactivePeerManager::new(settings),
            connections,
            known_peers: VecDeque::new(),
            disk,
            disk_torrent,
            writer: None,
            events_tx,
            events_rx,
            downloaded_bytes: 0,
            uploaded_by_departed: 0,
        }
    }

    pub fn info(&self) -> &Arc<TorrentInfo> {
        &self.info
    }

    pub fn mode(&self) -> TorrentMode {
        self.mode
    }

    pub fn pieces(&self) -> &PieceManager {
        &self.pieces
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    fn is_active(&self) -> bool {
        matches!(self.mode, TorrentMode::Downloading | TorrentMode::Seeding)
    }

    /// Hashes every piece not known to be verified, then starts downloading
    /// or seeding.
    pub async fn start(&mut self) -> crate::Result<()> {
        if self.mode != TorrentMode::Stopped {
            return Err(Error::InvalidMode(self.mode));
        }
        self.mode = TorrentMode::Hashing;
        let to_check = self.pieces.unhashed().true_count();
        info!(torrent = %self.info.name, to_check, "starting");
        if let Err(e) = self.check_unhashed().await {
            self.enter_error(&e);
            return Err(e);
        }
        self.pieces.refresh();

        self.writer = Some(self.spawn_block_writer());
        self.mode = if self.pieces.is_complete() {
            TorrentMode::Seeding
        } else {
            TorrentMode::Downloading
        };
        info!(
            torrent = %self.info.name,
            mode = ?self.mode,
            have = self.pieces.have().true_count(),
            "started"
        );
        self.connect_to_known_peers();
        Ok(())
    }

    async fn check_unhashed(&mut self) -> crate::Result<()> {
        let unhashed: Vec<u32> = self
            .pieces
            .unhashed()
            .iter_ones()
            .map(|i| i as u32)
            .collect();
        for piece in unhashed {
            let Some(index) = self.info.lengths.validate_piece_index(piece) else {
                continue;
            };
            let present = match self.disk.get_hash(&self.disk_torrent, index).await? {
                Some(hash) => self.info.verify_piece(index, &hash),
                None => false,
            };
            trace!(piece, present, "checked");
            self.pieces.mark_checked(piece, present);
        }
        Ok(())
    }

    /// Disconnects everything, waits for queued writes to reach storage,
    /// then stops.
    pub async fn stop(&mut self) -> crate::Result<()> {
        match self.mode {
            TorrentMode::Stopped => return Ok(()),
            TorrentMode::Error => return Err(Error::InvalidMode(self.mode)),
            _ => {}
        }
        info!(torrent = %self.info.name, "stopping");
        self.shutdown_network();
        let flushed = self.drain_writes().await;
        self.pieces.reset_requests();
        self.mode = TorrentMode::Stopped;
        flushed
    }

    /// Moves an errored torrent back to Stopped. Data received but never
    /// verified is checked again on the next start.
    pub async fn clear_error(&mut self) -> crate::Result<()> {
        if self.mode != TorrentMode::Error {
            return Err(Error::InvalidMode(self.mode));
        }
        if let Some(w) = self.writer.take() {
            drop(w.jobs);
            let _ = w.task.await;
        }
        let _ = self.disk_torrent.take_error();
        if let Err(e) = self.disk.close_torrent(&self.disk_torrent).await {
            warn!(torrent = %self.info.name, "error closing storage: {e:#}");
        }
        self.pieces.reset_requests();
        self.error = None;
        self.mode = TorrentMode::Stopped;
        Ok(())
    }

    async fn drain_writes(&mut self) -> crate::Result<()> {
        if let Some(w) = self.writer.take() {
            drop(w.jobs);
            let _ = w.task.await;
        }
        self.disk.close_torrent(&self.disk_torrent).await
    }

    fn enter_error(&mut self, error: &Error) {
        if self.mode == TorrentMode::Error {
            return;
        }
        error!(torrent = %self.info.name, "{error:#}");
        self.error = Some(TorrentError {
            reason: error.torrent_error_reason(),
            message: format!("{error:#}"),
        });
        self.mode = TorrentMode::Error;
        self.shutdown_network();
    }

    fn shutdown_network(&mut self) {
        self.connections.cancel_pending_connects();
        for handle in self.peers.handles() {
            self.remove_peer(handle);
        }
    }

    fn spawn_block_writer(&self) -> BlockWriter {
        let (jobs, mut rx) = mpsc::unbounded_channel::<WriteJob>();
        let disk = self.disk.clone();
        let torrent = self.disk_torrent.clone();
        let events = self.events_tx.clone();
        // One writer per torrent, so blocks reach the disk in arrival order
        // and sequential pieces hash incrementally.
        let task = spawn(
            debug_span!("block_writer", info_hash = %self.info.info_hash),
            async move {
                while let Some(job) = rx.recv().await {
                    let result = disk.write(&torrent, job.request, job.data).await;
                    let failed = result.is_err();
                    let _ = events.send(TorrentEvent::BlockWritten {
                        request: job.request,
                        piece_complete: job.piece_complete,
                        result,
                    });
                    if failed {
                        break;
                    }
                }
                Ok(())
            },
        );
        BlockWriter { jobs, task }
    }

    fn spawn_hash_check(&self, piece: u32) {
        let Some(index) = self.info.lengths.validate_piece_index(piece) else {
            return;
        };
        let disk = self.disk.clone();
        let torrent = self.disk_torrent.clone();
        let info = self.info.clone();
        let events = self.events_tx.clone();
        spawn(debug_span!("hash", piece), async move {
            let result = disk
                .get_hash(&torrent, index)
                .await
                .map(|h| h.is_some_and(|h| info.verify_piece(index, &h)));
            let _ = events.send(TorrentEvent::PieceHashed { piece, result });
            Ok(())
        });
    }

    /// Queues a peer address. It is connected to once the torrent runs and
    /// has room.
    pub fn add_peer(&mut self, addr: SocketAddr) {
        if !self.known_peers.contains(&addr) {
            self.known_peers.push_back(addr);
        }
        if self.is_active() {
            self.connect_to_known_peers();
        }
    }

    fn connect_to_known_peers(&mut self) {
        while self.peers.len() + self.connections.pending_connects() < self.settings.max_connections {
            let Some(addr) = self.known_peers.pop_front() else {
                break;
            };
            if self.peers.find_by_addr(addr).is_some() || self.connections.is_connecting(addr) {
                continue;
            }
            self.connections.connect_to_peer(addr);
        }
    }

    fn remove_peer(&mut self, handle: PeerHandle) -> bool {
        self.pieces.cancel_peer_requests(handle, &mut self.peers);
        let Some(peer) = self.peers.remove(handle) else {
            return false;
        };
        self.choker.peer_disconnected(handle);
        self.connections.disconnect(&peer);
        self.uploaded_by_departed += peer.monitor.bytes_uploaded();
        debug!(peer = %handle, addr = %peer.addr, "removed peer");
        true
    }

    fn request_all(&mut self) {
        for handle in self.peers.handles() {
            self.pieces.add_piece_requests(handle, &mut self.peers);
        }
    }

    fn update_interest(&mut self, handle: PeerHandle) {
        let Some(peer) = self.peers.get(handle) else {
            return;
        };
        let interesting = self.pieces.is_interesting(peer);
        if interesting == peer.am_interested {
            return;
        }
        if let Some(peer) = self.peers.get_mut(handle) {
            peer.am_interested = interesting;
            peer.outgoing.push(if interesting {
                Message::Interested
            } else {
                Message::NotInterested
            });
        }
    }

    pub fn handle_event(&mut self, event: TorrentEvent) {
        match event {
            TorrentEvent::PeerConnected { addr, connected } => self.on_peer_connected(addr, connected),
            TorrentEvent::ConnectFailed { addr, error } => {
                self.connections.connect_finished(addr);
                debug!(%addr, "connect failed: {error:#}");
            }
            TorrentEvent::PeerMessage { peer, message } => self.on_peer_message(peer, message),
            TorrentEvent::PeerDisconnected { peer, reason } => {
                if let Some(reason) = reason {
                    debug!(%peer, "disconnected: {reason:#}");
                }
                if self.remove_peer(peer) && self.mode == TorrentMode::Downloading {
                    self.request_all();
                }
            }
            TorrentEvent::DiskFailure { peer, error } => {
                debug!(%peer, "upload read failed");
                self.enter_error(&error);
            }
            TorrentEvent::BlockWritten {
                request,
                piece_complete,
                result,
            } => match result {
                Err(e) if self.is_active() => self.enter_error(&e),
                Err(e) => warn!(%request, "write failed while not running: {e:#}"),
                Ok(()) if piece_complete && self.is_active() => self.spawn_hash_check(request.piece),
                Ok(()) => {}
            },
            TorrentEvent::PieceHashed { piece, result } => {
                if !self.is_active() {
                    trace!(piece, "ignoring hash result, not running");
                    return;
                }
                match result {
                    Ok(passed) => self.on_piece_hashed(piece, passed),
                    Err(e) => self.enter_error(&e),
                }
            }
        }
    }

    fn on_peer_connected(&mut self, addr: SocketAddr, connected: Connected) {
        self.connections.connect_finished(addr);
        if !self.is_active() {
            trace!(%addr, "dropping connection, torrent not running");
            return;
        }
        if self.peers.len() >= self.settings.max_connections || self.peers.find_by_addr(addr).is_some() {
            debug!(%addr, "dropping connection, no room or duplicate");
            return;
        }

        let Connected {
            handshake,
            reader,
            writer,
        } = connected;
        let handle = self.peers.allocate_handle();
        let mut peer = ConnectedPeer::new(handle, addr, handshake.peer_id, self.info.piece_count());
        peer.supports_fast_peer = handshake.supports_fast_peer;

        let have = self.pieces.have();
        if peer.supports_fast_peer {
            peer.outgoing.push(if have.all_true() {
                Message::HaveAll
            } else if have.all_false() {
                Message::HaveNone
            } else {
                Message::Bitfield(Bytes::copy_from_slice(have.as_bytes()))
            });
            peer.am_allowed_fast = allowed_fast_set(
                addr.ip(),
                self.info.info_hash,
                self.info.piece_count() as u32,
                ALLOWED_FAST_COUNT,
            );
            for piece in peer.am_allowed_fast.iter() {
                peer.outgoing.push(Message::AllowedFast(*piece));
            }
            peer.outgoing.set_allowed_fast(peer.am_allowed_fast.clone());
        } else if !have.all_false() {
            peer.outgoing
                .push(Message::Bitfield(Bytes::copy_from_slice(have.as_bytes())));
        }

        self.connections.start_peer(&peer, reader, writer);
        debug!(peer = %handle, %addr, fast = peer.supports_fast_peer, "peer connected");
        self.peers.insert(peer);
    }

    fn on_peer_message(&mut self, handle: PeerHandle, message: Message) {
        if !self.is_active() {
            return;
        }
        let piece_count = self.info.piece_count();
        let Some(peer) = self.peers.get_mut(handle) else {
            trace!(peer = %handle, "message from removed peer");
            return;
        };
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                peer.is_choking = true;
                // Without the fast extension a choke silently discards
                // everything we asked for. Fast peers reject explicitly.
                if !peer.supports_fast_peer {
                    self.pieces.cancel_peer_requests(handle, &mut self.peers);
                }
            }
            Message::Unchoke => {
                peer.is_choking = false;
                self.pieces.add_piece_requests(handle, &mut self.peers);
            }
            Message::Interested => peer.is_interested = true,
            Message::NotInterested => peer.is_interested = false,
            Message::Have(piece) => {
                if piece as usize >= piece_count {
                    debug!(peer = %handle, piece, "have for invalid piece");
                    self.remove_peer(handle);
                    return;
                }
                peer.bitfield.set(piece as usize, true);
                self.peer_availability_changed(handle);
            }
            Message::Bitfield(bytes) => match BitField::from_bytes(&bytes, piece_count) {
                Ok(b) => {
                    peer.bitfield = b;
                    self.peer_availability_changed(handle);
                }
                Err(e) => {
                    debug!(peer = %handle, "bad bitfield: {e:#}");
                    self.remove_peer(handle);
                }
            },
            Message::HaveAll => {
                peer.bitfield.set_all(true);
                self.peer_availability_changed(handle);
            }
            Message::HaveNone => {
                peer.bitfield.set_all(false);
                self.peer_availability_changed(handle);
            }
            Message::Request(request) => self.on_upload_request(handle, request),
            Message::Piece(piece) => self.on_block(handle, piece),
            Message::Cancel(request) => {
                peer.outgoing.cancel_upload(&request);
            }
            Message::Suggest(piece) => {
                if (piece as usize) < piece_count && !peer.suggested.contains(&piece) {
                    peer.suggested.push(piece);
                }
            }
            Message::Reject(request) => {
                if self.pieces.request_rejected(handle, &request, &mut self.peers) {
                    self.pieces.add_piece_requests(handle, &mut self.peers);
                } else {
                    debug!(peer = %handle, %request, "reject for a request we didn't make");
                }
            }
            Message::AllowedFast(piece) => {
                if (piece as usize) < piece_count && !peer.allowed_fast.contains(&piece) {
                    peer.allowed_fast.push(piece);
                    if peer.is_choking {
                        self.pieces.add_piece_requests(handle, &mut self.peers);
                    }
                }
            }
        }
    }

    fn peer_availability_changed(&mut self, handle: PeerHandle) {
        self.update_interest(handle);
        if self.mode == TorrentMode::Downloading {
            self.pieces.add_piece_requests(handle, &mut self.peers);
        }
    }

    fn on_upload_request(&mut self, handle: PeerHandle, request: BlockRequest) {
        let valid = self
            .info
            .lengths
            .validate_piece_index(request.piece)
            .is_some_and(|index| {
                self.pieces.have().get(request.piece as usize)
                    && request.length > 0
                    && request.length <= MAX_REQUEST_LENGTH
                    && request.offset as u64 + request.length as u64
                        <= self.info.lengths.piece_length(index) as u64
            });
        let Some(peer) = self.peers.get(handle) else {
            return;
        };
        let permitted = !peer.am_choking || peer.am_allowed_fast.contains(&request.piece);
        if valid && permitted {
            peer.outgoing.push_upload(request);
        } else if peer.supports_fast_peer {
            trace!(peer = %handle, %request, valid, "rejecting request");
            peer.outgoing.push(Message::Reject(request));
        } else {
            trace!(peer = %handle, %request, valid, "ignoring request");
        }
    }

    fn on_block(&mut self, handle: PeerHandle, piece: PieceMessage) {
        let len = piece.data.len() as u64;
        if let Some(peer) = self.peers.get(handle) {
            peer.monitor.record_download(len);
        }
        let received = self
            .pieces
            .piece_data_received(handle, &piece, &mut self.peers, Instant::now());
        if !received.accepted {
            return;
        }
        self.downloaded_bytes += len;

        let job = WriteJob {
            request: piece.request(),
            data: piece.data,
            piece_complete: received.piece_complete,
        };
        let queued = self
            .writer
            .as_ref()
            .is_some_and(|w| w.jobs.send(job).is_ok());
        if !queued {
            // The writer only exits after a failed write, whose event
            // puts the torrent in error.
            warn!(peer = %handle, "block writer gone, dropping block");
            return;
        }
        self.pieces.add_piece_requests(handle, &mut self.peers);
    }

    fn on_piece_hashed(&mut self, piece: u32, passed: bool) {
        let contributors = self.pieces.piece_hashed(piece, passed, &mut self.peers);
        if !passed {
            warn!(piece, ?contributors, "piece failed hash check");
            self.disk.forget_hash(&self.disk_torrent, piece);
            self.request_all();
            return;
        }
        debug!(piece, "piece verified");

        for peer in self.peers.iter() {
            if !peer.bitfield.get(piece as usize) {
                peer.outgoing.push(Message::Have(piece));
            }
        }
        for handle in self.peers.handles() {
            self.update_interest(handle);
        }
        if self.pieces.is_complete() && self.mode == TorrentMode::Downloading {
            info!(torrent = %self.info.name, "download complete, seeding");
            self.mode = TorrentMode::Seeding;
        }
    }

    /// Periodic housekeeping: rate sampling, choke review, inactive peer
    /// eviction, new connections and request top-ups.
    pub fn tick(&mut self, now: Instant) {
        if !self.is_active() {
            return;
        }
        if let Some(e) = self.disk_torrent.take_error() {
            self.enter_error(&e);
            return;
        }
        for peer in self.peers.iter() {
            peer.monitor.tick(now);
        }
        let seeding = self.mode == TorrentMode::Seeding;
        self.choker.unchoke_review_at(&mut self.peers, seeding, now);

        if let Some(handle) = self.inactive.time_passed(&self.peers, now) {
            debug!(peer = %handle, "disconnecting inactive peer");
            self.remove_peer(handle);
        }
        self.connect_to_known_peers();
        if !seeding {
            self.request_all();
        }
    }

    pub fn set_file_priority(&mut self, file: usize, priority: Priority) -> crate::Result<()> {
        self.pieces.set_file_priority(file, priority)?;
        for handle in self.peers.handles() {
            self.update_interest(handle);
        }
        if self.mode == TorrentMode::Downloading {
            self.request_all();
        }
        Ok(())
    }

    /// Moves the streaming window. Returns the number of cancelled requests,
    /// 0 when the torrent doesn't stream.
    pub fn seek_to_position(&mut self, file: usize, position: u64) -> crate::Result<usize> {
        let info = self.info.clone();
        let file = info.files.get(file).ok_or(Error::InvalidFileIndex(file))?;
        let Some(streaming) = self.pieces.requester_mut().as_streaming() else {
            debug!("seek on a torrent that doesn't stream");
            return Ok(0);
        };
        Ok(streaming.seek_to_position(file, position, &mut self.peers))
    }

    pub fn network_limits(&self) -> LimitsConfig {
        self.connections.limits().config()
    }

    /// Applies to every peer of this torrent, including already connected ones.
    pub fn set_network_limits(&mut self, limits: LimitsConfig) {
        debug!(?limits, "network limits changed");
        self.settings.network_limits = limits;
        self.connections.limits().update(limits);
    }

    pub fn fast_resume(&self) -> FastResume {
        let mut unhashed = self.pieces.unhashed().clone();
        unhashed.or(self.pieces.pending_hash());
        FastResume::new(self.info.info_hash, self.pieces.have().clone(), unhashed)
    }

    pub async fn save_fast_resume(&self, path: &Path) -> anyhow::Result<()> {
        self.fast_resume().save_to(path).await
    }

    /// Adopts persisted piece state. Only while stopped.
    pub fn restore_fast_resume(&mut self, resume: FastResume) -> crate::Result<()> {
        if self.mode != TorrentMode::Stopped {
            return Err(Error::InvalidMode(self.mode));
        }
        resume.validate(self.info.info_hash, self.info.piece_count())?;
        self.pieces.restore(resume.bitfield, resume.unhashed);
        Ok(())
    }

    pub async fn load_fast_resume(&mut self, path: &Path) -> crate::Result<()> {
        let resume = FastResume::load_from(path).await?;
        self.restore_fast_resume(resume)
    }

    pub fn stats(&self) -> TorrentStats {
        let requester = self.pieces.requester();
        let uploaded: u64 = self.peers.iter().map(|p| p.monitor.bytes_uploaded()).sum();
        TorrentStats {
            mode: self.mode,
            error: self.error.as_ref().and_then(|e| e.reason),
            error_message: self.error.as_ref().map(|e| e.message.clone()),
            total_pieces: self.info.piece_count(),
            have_pieces: self.pieces.have().true_count(),
            needed_pieces: self.pieces.needed_count(),
            unhashed_pieces: self.pieces.unhashed().true_count(),
            downloaded_bytes: self.downloaded_bytes,
            uploaded_bytes: self.uploaded_by_departed + uploaded,
            hash_fails: self.pieces.hash_fails(),
            endgame: requester.in_endgame_mode(),
            outstanding_requests: requester.current_request_count(),
            peers: PeerCounts {
                connected: self.peers.len(),
                connecting: self.connections.pending_connects(),
                unchoked: self.peers.unchoked_count(),
                interested: self.peers.interested_count(),
                unchoking_us: self.peers.iter().filter(|p| !p.is_choking).count(),
            },
        }
    }

    async fn handle_command(&mut self, command: TorrentCommand) {
        match command {
            TorrentCommand::Start(done) => {
                let _ = done.send(self.start().await);
            }
            TorrentCommand::Stop(done) => {
                let _ = done.send(self.stop().await);
            }
            TorrentCommand::ClearError(done) => {
                let _ = done.send(self.clear_error().await);
            }
            TorrentCommand::AddPeer(addr) => self.add_peer(addr),
            TorrentCommand::SetFilePriority {
                file,
                priority,
                done,
            } => {
                let _ = done.send(self.set_file_priority(file, priority));
            }
            TorrentCommand::Seek {
                file,
                position,
                done,
            } => {
                let _ = done.send(self.seek_to_position(file, position));
            }
            TorrentCommand::SaveFastResume { path, done } => {
                let resume = self.fast_resume();
                let _ = done.send(resume.save_to(&path).await);
            }
            TorrentCommand::SetNetworkLimits(limits) => self.set_network_limits(limits),
            TorrentCommand::Stats(done) => {
                let _ = done.send(self.stats());
            }
        }
    }

    /// The event loop. Returns when cancelled or when every handle is gone,
    /// stopping the torrent first.
    pub async fn run(
        mut self,
        mut commands: UnboundedReceiver<TorrentCommand>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = ticker.tick() => self.tick(Instant::now()),
            }
        }
        match self.mode {
            TorrentMode::Stopped | TorrentMode::Error => Ok(()),
            _ => Ok(self.stop().await?),
        }
    }

    #[cfg(test)]
    pub(crate) async fn process_next_event(&mut self) -> bool {
        match self.events_rx.recv().await {
            Some(event) => {
                self.handle_event(event);
                true
            }
            None => false,
        }
    }

    /// Runs the manager in its own task.
    pub fn spawn(self, cancel: CancellationToken) -> TorrentHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        spawn(
            debug_span!("torrent", info_hash = %self.info.info_hash),
            self.run(rx, cancel),
        );
        TorrentHandle { commands: tx }
    }
}
