//! Rate-limited, cached block I/O with incremental piece hashing.
//!
//! Every torrent registers with the engine's single [`DiskManager`] and gets
//! a [`DiskTorrent`] handle. Reads and writes that find no tokens in their
//! rate limiter are queued and drained by [`DiskManager::tick`] in
//! submission order. Writes that continue a piece sequentially are fed
//! straight into the piece's running hash and bypass the cache, so
//! [`DiskManager::get_hash`] is usually free.

pub mod buffer_pool;
pub mod cache;
pub mod incremental_hash;
pub mod piece_writer;
pub mod rate_limiter;

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use piecework_core::{
    lengths::ValidPieceIndex, merkle::MERKLE_BLOCK_SIZE, spawn_utils::spawn_with_cancel,
};
use serde::Serialize;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::{
    Error,
    settings::EngineSettings,
    torrent_info::{PieceHash, TorrentInfo},
    wire::BlockRequest,
};

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use cache::MemoryCache;
pub use incremental_hash::{HashStatePool, IncrementalHashData};
pub use piece_writer::{FilesystemPieceWriter, InMemoryPieceWriter, PieceWriter};
pub use rate_limiter::RateLimiter;

use incremental_hash::HashStateGuard;

/// Queued operations are drained at most this often.
pub const DISK_TICK_INTERVAL: Duration = Duration::from_millis(800);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TorrentId(pub u64);

/// One torrent's view of the disk: its files, its storage, and the writes
/// still in flight for it.
pub struct DiskTorrent {
    id: TorrentId,
    info: Arc<TorrentInfo>,
    writer: Arc<dyn PieceWriter>,
    pending_writes: AtomicUsize,
    writes_done: Notify,
    error: Mutex<Option<Error>>,
}

impl std::fmt::Debug for DiskTorrent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskTorrent")
            .field("id", &self.id)
            .field("name", &self.info.name)
            .finish_non_exhaustive()
    }
}

impl DiskTorrent {
    pub(crate) fn new(id: TorrentId, info: Arc<TorrentInfo>, writer: Arc<dyn PieceWriter>) -> Self {
        Self {
            id,
            info,
            writer,
            pending_writes: AtomicUsize::new(0),
            writes_done: Notify::new(),
            error: Mutex::new(None),
        }
    }

    pub fn id(&self) -> TorrentId {
        self.id
    }

    pub fn info(&self) -> &Arc<TorrentInfo> {
        &self.info
    }

    pub fn pending_writes(&self) -> usize {
        self.pending_writes.load(Ordering::Acquire)
    }

    /// An error raised outside any caller's request (cache eviction),
    /// waiting to be picked up by the torrent.
    pub fn take_error(&self) -> Option<Error> {
        self.error.lock().take()
    }

    pub(crate) fn set_error(&self, e: Error) {
        let mut g = self.error.lock();
        if g.is_none() {
            *g = Some(e);
        }
    }

    /// Splits `[absolute, absolute + len)` into per-file segments:
    /// `(file index, offset in file, offset in buffer, length)`.
    fn segments(&self, absolute: u64, len: usize) -> Vec<(usize, u64, usize, usize)> {
        let end = absolute + len as u64;
        self.info
            .files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.length > 0)
            .filter_map(|(idx, f)| {
                let fstart = f.offset_in_torrent;
                let fend = fstart + f.length;
                let s = absolute.max(fstart);
                let e = end.min(fend);
                (s < e).then(|| (idx, s - fstart, (s - absolute) as usize, (e - s) as usize))
            })
            .collect()
    }

    fn absolute_offset(&self, request: &BlockRequest) -> anyhow::Result<u64> {
        let piece = self
            .info
            .lengths
            .validate_piece_index(request.piece)
            .with_context(|| format!("invalid piece {}", request.piece))?;
        Ok(self.info.lengths.piece_offset(piece) + request.offset as u64)
    }

    /// Reads straight from storage. Returns false on a short read.
    pub(crate) fn read_block(&self, request: &BlockRequest, buf: &mut [u8]) -> anyhow::Result<bool> {
        let absolute = self.absolute_offset(request)?;
        let mut total = 0;
        for (file, offset, buf_offset, len) in self.segments(absolute, buf.len()) {
            let path = &self.info.files[file].relative_path;
            let n = self
                .writer
                .read(path, offset, &mut buf[buf_offset..buf_offset + len])?;
            total += n;
            if n < len {
                return Ok(false);
            }
        }
        Ok(total == buf.len())
    }

    pub(crate) fn write_block(&self, request: &BlockRequest, data: &[u8]) -> anyhow::Result<()> {
        let absolute = self.absolute_offset(request)?;
        for (file, offset, buf_offset, len) in self.segments(absolute, data.len()) {
            let path = &self.info.files[file].relative_path;
            self.writer
                .write(path, offset, &data[buf_offset..buf_offset + len])?;
        }
        Ok(())
    }

    fn flush_files(&self, pieces: std::ops::RangeInclusive<u32>) -> anyhow::Result<()> {
        for (_, f) in self.info.files_for_pieces(*pieces.start(), *pieces.end()) {
            self.writer.flush(&f.relative_path)?;
        }
        Ok(())
    }

    fn close_files(&self) -> anyhow::Result<()> {
        for f in self.info.files.iter() {
            self.writer.close(&f.relative_path)?;
        }
        Ok(())
    }

    fn leaf_count(&self) -> u32 {
        self.info
            .lengths
            .default_piece_length()
            .div_ceil(MERKLE_BLOCK_SIZE)
    }
}

/// Decrements a torrent's in-flight write count when the write finishes,
/// whichever way it finishes.
struct PendingWrite(Arc<DiskTorrent>);

impl PendingWrite {
    fn new(t: &Arc<DiskTorrent>) -> Self {
        t.pending_writes.fetch_add(1, Ordering::AcqRel);
        Self(t.clone())
    }
}

impl Drop for PendingWrite {
    fn drop(&mut self) {
        if self.0.pending_writes.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.writes_done.notify_waiters();
        }
    }
}

enum IoKind {
    Read {
        buf: PooledBuffer,
        done: oneshot::Sender<crate::Result<Option<PooledBuffer>>>,
    },
    Write {
        data: Bytes,
        skip_cache: bool,
        done: oneshot::Sender<crate::Result<()>>,
    },
}

/// An operation parked until its rate limiter has tokens.
struct BufferedIo {
    torrent: Arc<DiskTorrent>,
    request: BlockRequest,
    kind: IoKind,
}

impl BufferedIo {
    fn len(&self) -> u64 {
        self.request.length as u64
    }
}

#[derive(Default)]
struct Queues {
    reads: VecDeque<BufferedIo>,
    writes: VecDeque<BufferedIo>,
    since_last_drain: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    pending_read_bytes: AtomicU64,
    pending_write_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DiskStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_bytes: u64,
    pub pending_read_bytes: u64,
    pub pending_write_bytes: u64,
    pub queued_reads: usize,
    pub queued_writes: usize,
    /// Pieces with a hash being built from sequential writes.
    pub running_hashes: usize,
}

pub struct DiskManager {
    cache: Arc<Mutex<MemoryCache>>,
    read_limiter: RateLimiter,
    write_limiter: RateLimiter,
    queues: Mutex<Queues>,
    // Serializes execution so queued operations hit storage in FIFO order.
    io_lock: tokio::sync::Mutex<()>,
    hashes: DashMap<(TorrentId, u32), IncrementalHashData>,
    hash_pool: HashStatePool,
    buffers: BufferPool,
    counters: Counters,
    next_torrent_id: AtomicU64,
}

impl DiskManager {
    pub fn new(settings: &EngineSettings, buffers: BufferPool) -> Self {
        Self {
            cache: Arc::new(Mutex::new(MemoryCache::new(settings.disk_cache_bytes))),
            read_limiter: RateLimiter::new(settings.max_disk_read_rate),
            write_limiter: RateLimiter::new(settings.max_disk_write_rate),
            queues: Default::default(),
            io_lock: Default::default(),
            hashes: Default::default(),
            hash_pool: Default::default(),
            buffers,
            counters: Default::default(),
            next_torrent_id: AtomicU64::new(0),
        }
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    pub fn add_torrent(&self, info: Arc<TorrentInfo>, writer: Arc<dyn PieceWriter>) -> Arc<DiskTorrent> {
        let id = TorrentId(self.next_torrent_id.fetch_add(1, Ordering::Relaxed));
        Arc::new(DiskTorrent::new(id, info, writer))
    }

    pub fn set_read_rate(&self, bytes_per_sec: u64) {
        self.read_limiter.set_rate(bytes_per_sec)
    }

    pub fn set_write_rate(&self, bytes_per_sec: u64) {
        self.write_limiter.set_rate(bytes_per_sec)
    }

    /// Drives [`Self::tick`] from a background task until cancelled.
    pub fn spawn_ticker(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        spawn_with_cancel(tracing::debug_span!("disk_ticker"), cancel, async move {
            let period = DISK_TICK_INTERVAL / 4;
            let mut interval = tokio::time::interval(period);
            let mut last = tokio::time::Instant::now();
            loop {
                interval.tick().await;
                let now = tokio::time::Instant::now();
                this.tick(now - last).await;
                last = now;
            }
        })
    }

    /// Accumulates `delta`; once [`DISK_TICK_INTERVAL`] has passed, refills
    /// both rate limiters and runs as many queued operations as they allow,
    /// oldest first.
    pub async fn tick(&self, delta: Duration) {
        let (reads, writes) = {
            let mut q = self.queues.lock();
            q.since_last_drain += delta;
            if q.since_last_drain < DISK_TICK_INTERVAL {
                return;
            }
            let elapsed = std::mem::take(&mut q.since_last_drain);
            self.read_limiter.refill(elapsed);
            self.write_limiter.refill(elapsed);
            let reads = Self::drain(&mut q.reads, &self.read_limiter);
            let writes = Self::drain(&mut q.writes, &self.write_limiter);
            (reads, writes)
        };
        if reads.is_empty() && writes.is_empty() {
            return;
        }
        trace!(reads = reads.len(), writes = writes.len(), "draining disk queues");
        let _g = self.io_lock.lock().await;
        for op in writes.into_iter().chain(reads) {
            self.perform(op).await;
        }
    }

    fn drain(queue: &mut VecDeque<BufferedIo>, limiter: &RateLimiter) -> Vec<BufferedIo> {
        let mut out = Vec::new();
        while let Some(op) = queue.front() {
            if !limiter.try_acquire(op.len()) {
                break;
            }
            out.extend(queue.pop_front());
        }
        out
    }

    async fn perform(&self, op: BufferedIo) {
        let BufferedIo {
            torrent,
            request,
            kind,
        } = op;
        match kind {
            IoKind::Read { buf, done } => {
                let r = self.perform_read(torrent, request, buf).await;
                let _ = done.send(r);
            }
            IoKind::Write {
                data,
                skip_cache,
                done,
            } => {
                let r = self.perform_write(torrent, request, data, skip_cache).await;
                let _ = done.send(r);
            }
        }
    }

    async fn perform_read(
        &self,
        torrent: Arc<DiskTorrent>,
        request: BlockRequest,
        mut buf: PooledBuffer,
    ) -> crate::Result<Option<PooledBuffer>> {
        let cache = self.cache.clone();
        let len = request.length as u64;
        let result = tokio::task::spawn_blocking(move || {
            let ok = cache.lock().read(&torrent, &request, &mut buf)?;
            anyhow::Ok(ok.then_some(buf))
        })
        .await
        .context("disk read task panicked")
        .and_then(|r| r);
        self.counters.pending_read_bytes.fetch_sub(len, Ordering::AcqRel);
        match result {
            Ok(r) => {
                if r.is_some() {
                    self.counters.bytes_read.fetch_add(len, Ordering::Relaxed);
                }
                Ok(r)
            }
            Err(e) => {
                error!(%request, "read failed: {e:#}");
                Err(Error::ReadFailure(e))
            }
        }
    }

    async fn perform_write(
        &self,
        torrent: Arc<DiskTorrent>,
        request: BlockRequest,
        data: Bytes,
        skip_cache: bool,
    ) -> crate::Result<()> {
        let _pending = PendingWrite::new(&torrent);
        let cache = self.cache.clone();
        let len = data.len() as u64;
        let result = tokio::task::spawn_blocking(move || {
            cache.lock().write(&torrent, &request, data, skip_cache)
        })
        .await
        .context("disk write task panicked")
        .and_then(|r| r);
        self.counters.pending_write_bytes.fetch_sub(len, Ordering::AcqRel);
        match result {
            Ok(()) => {
                self.counters.bytes_written.fetch_add(len, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                error!(%request, "write failed: {e:#}");
                Err(Error::WriteFailure(e))
            }
        }
    }

    /// Reads one block. `Ok(None)` means the data isn't there (short read).
    pub async fn read(
        &self,
        torrent: &Arc<DiskTorrent>,
        request: BlockRequest,
    ) -> crate::Result<Option<PooledBuffer>> {
        let buf = self.buffers.checkout(request.length as usize);
        self.counters
            .pending_read_bytes
            .fetch_add(request.length as u64, Ordering::AcqRel);
        let queued = {
            let mut q = self.queues.lock();
            if q.reads.is_empty() && self.read_limiter.try_acquire(request.length as u64) {
                Err(buf)
            } else {
                let (tx, rx) = oneshot::channel();
                q.reads.push_back(BufferedIo {
                    torrent: torrent.clone(),
                    request,
                    kind: IoKind::Read { buf, done: tx },
                });
                Ok(rx)
            }
        };
        match queued {
            Err(buf) => {
                let _g = self.io_lock.lock().await;
                self.perform_read(torrent.clone(), request, buf).await
            }
            Ok(rx) => rx.await.map_err(|_| Error::TorrentStopped)?,
        }
    }

    /// Writes one block. Sequential writes also advance the piece's hash.
    pub async fn write(
        &self,
        torrent: &Arc<DiskTorrent>,
        request: BlockRequest,
        data: Bytes,
    ) -> crate::Result<()> {
        let _pending = PendingWrite::new(torrent);
        let skip_cache = self.feed_incremental_hash(torrent, &request, &data);
        self.counters
            .pending_write_bytes
            .fetch_add(data.len() as u64, Ordering::AcqRel);
        let queued = {
            let mut q = self.queues.lock();
            if q.writes.is_empty() && self.write_limiter.try_acquire(data.len() as u64) {
                Err(data)
            } else {
                let (tx, rx) = oneshot::channel();
                q.writes.push_back(BufferedIo {
                    torrent: torrent.clone(),
                    request,
                    kind: IoKind::Write {
                        data,
                        skip_cache,
                        done: tx,
                    },
                });
                Ok(rx)
            }
        };
        match queued {
            Err(data) => {
                let _g = self.io_lock.lock().await;
                self.perform_write(torrent.clone(), request, data, skip_cache)
                    .await
            }
            Ok(rx) => rx.await.map_err(|_| Error::TorrentStopped)?,
        }
    }

    /// Feeds the write into the piece's running hash if it continues it.
    /// Returns true when it did, meaning the block needn't stay in cache.
    fn feed_incremental_hash(
        &self,
        torrent: &DiskTorrent,
        request: &BlockRequest,
        data: &[u8],
    ) -> bool {
        let info = torrent.info();
        if !info.has_v1_hashes() && !info.has_v2_hashes() {
            return false;
        }
        let key = (torrent.id(), request.piece);
        if request.offset == 0 && !self.hashes.contains_key(&key) {
            self.hashes.insert(
                key,
                self.hash_pool
                    .checkout(info.has_v1_hashes(), info.has_v2_hashes()),
            );
        }
        match self.hashes.get_mut(&key) {
            Some(mut h) if h.next_offset() == request.offset => {
                h.update(data);
                true
            }
            _ => false,
        }
    }

    /// Resolves once no writes for the torrent are in flight.
    pub async fn wait_for_pending_writes(&self, torrent: &DiskTorrent) {
        loop {
            let notified = torrent.writes_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if torrent.pending_writes() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Hash of a piece. Uses the incremental state when the whole piece was
    /// written in order, otherwise reads whatever wasn't hashed yet.
    /// `Ok(None)` means part of the piece is missing from storage.
    pub async fn get_hash(
        &self,
        torrent: &Arc<DiskTorrent>,
        piece: ValidPieceIndex,
    ) -> crate::Result<Option<PieceHash>> {
        self.wait_for_pending_writes(torrent).await;

        let info = torrent.info().clone();
        let state = match self.hashes.remove(&(torrent.id(), piece.get())) {
            Some((_, s)) => s,
            None => self
                .hash_pool
                .checkout(info.has_v1_hashes(), info.has_v2_hashes()),
        };
        let mut guard = HashStateGuard::new(&self.hash_pool, state);
        let piece_len = info.lengths.piece_length(piece);
        let block_len = info.lengths.default_block_length();

        loop {
            let Some(state) = guard.get() else {
                return Ok(None);
            };
            let offset = state.next_offset();
            if offset >= piece_len {
                trace!(%piece, "hash ready");
                return Ok(Some(state.finish(torrent.leaf_count())));
            }
            let len = block_len.min(piece_len - offset);
            let request = BlockRequest::new(piece.get(), offset, len);
            let Some(buf) = self.read(torrent, request).await? else {
                debug!(%piece, offset, "piece incomplete on disk");
                return Ok(None);
            };
            if let Some(state) = guard.get() {
                state.update(&buf);
            }
        }
    }

    /// Drops any running hash of the piece, e.g. after its data was
    /// found corrupt.
    pub fn forget_hash(&self, torrent: &DiskTorrent, piece: u32) {
        if let Some((_, s)) = self.hashes.remove(&(torrent.id(), piece)) {
            self.hash_pool.give_back(s);
        }
    }

    pub async fn flush(&self, torrent: &Arc<DiskTorrent>) -> crate::Result<()> {
        let last = torrent.info().lengths.last_piece_id().get();
        self.flush_range(torrent, 0, last).await
    }

    /// Waits for in-flight writes, writes back cached blocks in the piece
    /// range and syncs the files they touch.
    pub async fn flush_range(
        &self,
        torrent: &Arc<DiskTorrent>,
        start: u32,
        end: u32,
    ) -> crate::Result<()> {
        self.wait_for_pending_writes(torrent).await;
        let cache = self.cache.clone();
        let t = torrent.clone();
        tokio::task::spawn_blocking(move || {
            cache.lock().flush(t.id(), start..=end)?;
            t.flush_files(start..=end)
        })
        .await
        .context("flush task panicked")
        .and_then(|r| r)
        .map_err(Error::WriteFailure)
    }

    /// Forgets the torrent's running hashes, then flushes and closes its
    /// files. Hash states are dropped even if the flush fails, so a
    /// restart never resumes a hash begun before it.
    pub async fn close_torrent(&self, torrent: &Arc<DiskTorrent>) -> crate::Result<()> {
        let id = torrent.id();
        let keys: Vec<_> = self
            .hashes
            .iter()
            .map(|e| *e.key())
            .filter(|(t, _)| *t == id)
            .collect();
        for key in keys {
            if let Some((_, s)) = self.hashes.remove(&key) {
                self.hash_pool.give_back(s);
            }
        }
        debug!(torrent = ?id, "closing");
        self.flush(torrent).await?;
        torrent.close_files().map_err(Error::WriteFailure)
    }

    pub fn stats(&self) -> DiskStats {
        let (queued_reads, queued_writes) = {
            let q = self.queues.lock();
            (q.reads.len(), q.writes.len())
        };
        let cache = self.cache.lock();
        DiskStats {
            bytes_read: self.counters.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
            cache_hits: cache.hits(),
            cache_misses: cache.misses(),
            cache_bytes: cache.used_bytes(),
            pending_read_bytes: self.counters.pending_read_bytes.load(Ordering::Relaxed),
            pending_write_bytes: self.counters.pending_write_bytes.load(Ordering::Relaxed),
            queued_reads,
            queued_writes,
            running_hashes: self.hashes.len(),
        }
    }
}
