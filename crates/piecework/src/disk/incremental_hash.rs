use parking_lot::Mutex;
use piecework_core::{
    Id20, Id32,
    merkle::{self, MERKLE_BLOCK_SIZE},
};
use sha1w::{ISha1, ISha256};

use crate::torrent_info::PieceHash;

/// Running hash of one piece, fed with sequential writes.
///
/// v1 is a plain SHA-1 over the piece. v2 hashes every 16 KiB leaf with
/// SHA-256 and reduces the leaves to the piece root when finished.
pub struct IncrementalHashData {
    sha1: Option<sha1w::Sha1>,
    leaf: Option<sha1w::Sha256>,
    leaf_filled: usize,
    leaves: Vec<Id32>,
    v2: bool,
    next_offset: u32,
}

impl IncrementalHashData {
    fn empty() -> Self {
        Self {
            sha1: None,
            leaf: None,
            leaf_filled: 0,
            leaves: Vec::new(),
            v2: false,
            next_offset: 0,
        }
    }

    fn reset(&mut self, v1: bool, v2: bool) {
        self.sha1 = v1.then(sha1w::Sha1::new);
        self.leaf = None;
        self.leaf_filled = 0;
        self.leaves.clear();
        self.v2 = v2;
        self.next_offset = 0;
    }

    /// Offset within the piece of the first byte not hashed yet.
    pub fn next_offset(&self) -> u32 {
        self.next_offset
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.next_offset += data.len() as u32;
        if let Some(h) = self.sha1.as_mut() {
            h.update(data);
        }
        if !self.v2 {
            return;
        }
        while !data.is_empty() {
            let room = MERKLE_BLOCK_SIZE as usize - self.leaf_filled;
            let take = room.min(data.len());
            self.leaf
                .get_or_insert_with(sha1w::Sha256::new)
                .update(&data[..take]);
            self.leaf_filled += take;
            data = &data[take..];
            if self.leaf_filled == MERKLE_BLOCK_SIZE as usize {
                self.finish_leaf();
            }
        }
    }

    fn finish_leaf(&mut self) {
        if let Some(h) = self.leaf.take() {
            self.leaves.push(Id32::new(h.finish()));
        }
        self.leaf_filled = 0;
    }

    /// Consumes the hash state. `leaf_count` is the merkle width of a full
    /// piece; shorter pieces are zero-padded up to it.
    pub fn finish(&mut self, leaf_count: u32) -> PieceHash {
        let v1 = self.sha1.take().map(|h| Id20::new(h.finish()));
        let v2 = if self.v2 {
            if self.leaf_filled > 0 {
                self.finish_leaf();
            }
            merkle::piece_root(&self.leaves, leaf_count.max(1).next_power_of_two())
        } else {
            None
        };
        PieceHash { v1, v2 }
    }
}

/// Recycles hash state objects between pieces.
#[derive(Default)]
pub struct HashStatePool {
    free: Mutex<Vec<IncrementalHashData>>,
}

impl HashStatePool {
    pub fn checkout(&self, v1: bool, v2: bool) -> IncrementalHashData {
        let mut h = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(IncrementalHashData::empty);
        h.reset(v1, v2);
        h
    }

    pub fn give_back(&self, mut h: IncrementalHashData) {
        h.reset(false, false);
        self.free.lock().push(h);
    }

    pub fn pooled(&self) -> usize {
        self.free.lock().len()
    }
}

/// Returns the hash state to its pool however the holder exits.
pub(crate) struct HashStateGuard<'a> {
    pool: &'a HashStatePool,
    state: Option<IncrementalHashData>,
}

impl<'a> HashStateGuard<'a> {
    pub fn new(pool: &'a HashStatePool, state: IncrementalHashData) -> Self {
        Self {
            pool,
            state: Some(state),
        }
    }

    pub fn get(&mut self) -> Option<&mut IncrementalHashData> {
        self.state.as_mut()
    }
}

impl Drop for HashStateGuard<'_> {
    fn drop(&mut self) {
        if let Some(s) = self.state.take() {
            self.pool.give_back(s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha1(data: &[u8]) -> Id20 {
        let mut h = sha1w::Sha1::new();
        h.update(data);
        Id20::new(h.finish())
    }

    #[test]
    fn test_split_updates_match_one_shot() {
        let data: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let pool = HashStatePool::default();
        let mut h = pool.checkout(true, true);
        for chunk in data.chunks(7_000) {
            h.update(chunk);
        }
        assert_eq!(h.next_offset(), 40_000);
        let out = h.finish(4);

        assert_eq!(out.v1, Some(sha1(&data)));
        let leaves: Vec<Id32> = data.chunks(16384).map(merkle::hash_block).collect();
        assert_eq!(out.v2, merkle::piece_root(&leaves, 4));
        pool.give_back(h);
        assert_eq!(pool.pooled(), 1);
    }

    #[test]
    fn test_v1_only() {
        let pool = HashStatePool::default();
        let mut h = pool.checkout(true, false);
        h.update(b"abc");
        let out = h.finish(1);
        assert!(out.v2.is_none());
        assert_eq!(out.v1, Some(sha1(b"abc")));
    }

    #[test]
    fn test_guard_returns_state() {
        let pool = HashStatePool::default();
        {
            let mut g = HashStateGuard::new(&pool, pool.checkout(true, false));
            g.get().unwrap().update(b"x");
        }
        assert_eq!(pool.pooled(), 1);
        assert_eq!(pool.checkout(true, false).next_offset(), 0);
    }
}
