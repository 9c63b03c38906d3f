use std::{ops::RangeInclusive, sync::Arc};

use bytes::Bytes;
use lru::LruCache;
use tracing::{trace, warn};

use crate::{Error, wire::BlockRequest};

use super::{DiskTorrent, TorrentId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BlockKey {
    torrent: TorrentId,
    piece: u32,
    offset: u32,
}

impl BlockKey {
    fn new(torrent: TorrentId, r: &BlockRequest) -> Self {
        Self {
            torrent,
            piece: r.piece,
            offset: r.offset,
        }
    }
}

struct CachedBlock {
    torrent: Arc<DiskTorrent>,
    data: Bytes,
}

/// Write-back block cache in front of the piece writers, bounded in bytes.
/// Blocks evicted to make room are written out; a failure there is pinned
/// on the owning torrent.
pub struct MemoryCache {
    capacity: u64,
    used: u64,
    blocks: LruCache<BlockKey, CachedBlock>,
    hits: u64,
    misses: u64,
}

impl MemoryCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: 0,
            blocks: LruCache::unbounded(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn used_bytes(&self) -> u64 {
        self.used
    }

    pub fn cached_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Returns false on a short read.
    pub fn read(
        &mut self,
        torrent: &DiskTorrent,
        request: &BlockRequest,
        buf: &mut [u8],
    ) -> anyhow::Result<bool> {
        if let Some(block) = self.blocks.get(&BlockKey::new(torrent.id(), request)) {
            if block.data.len() == buf.len() {
                buf.copy_from_slice(&block.data);
                self.hits += 1;
                return Ok(true);
            }
        }
        self.misses += 1;
        torrent.read_block(request, buf)
    }

    pub fn write(
        &mut self,
        torrent: &Arc<DiskTorrent>,
        request: &BlockRequest,
        data: Bytes,
        skip_cache: bool,
    ) -> anyhow::Result<()> {
        let key = BlockKey::new(torrent.id(), request);
        if let Some(old) = self.blocks.pop(&key) {
            self.used -= old.data.len() as u64;
        }
        let len = data.len() as u64;
        if skip_cache || len > self.capacity {
            return torrent.write_block(request, &data);
        }
        self.blocks.push(
            key,
            CachedBlock {
                torrent: torrent.clone(),
                data,
            },
        );
        self.used += len;
        self.evict_to_capacity();
        Ok(())
    }

    fn evict_to_capacity(&mut self) {
        while self.used > self.capacity {
            let Some((key, block)) = self.blocks.pop_lru() else {
                break;
            };
            self.used -= block.data.len() as u64;
            let request = BlockRequest::new(key.piece, key.offset, block.data.len() as u32);
            trace!(torrent = key.torrent.0, %request, "evicting");
            if let Err(e) = block.torrent.write_block(&request, &block.data) {
                warn!(torrent = key.torrent.0, %request, "error writing evicted block: {e:#}");
                block.torrent.set_error(Error::WriteFailure(e));
            }
        }
    }

    /// Writes out and drops every cached block of the torrent in the piece range.
    pub fn flush(&mut self, torrent: TorrentId, pieces: RangeInclusive<u32>) -> anyhow::Result<()> {
        let keys: Vec<BlockKey> = self
            .blocks
            .iter()
            .map(|(k, _)| *k)
            .filter(|k| k.torrent == torrent && pieces.contains(&k.piece))
            .collect();
        let mut result = Ok(());
        for key in keys {
            let Some(block) = self.blocks.pop(&key) else {
                continue;
            };
            self.used -= block.data.len() as u64;
            let request = BlockRequest::new(key.piece, key.offset, block.data.len() as u32);
            if let Err(e) = block.torrent.write_block(&request, &block.data) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}
