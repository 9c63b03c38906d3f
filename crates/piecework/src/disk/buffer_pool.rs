use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use parking_lot::Mutex;

const DEFAULT_MAX_POOLED: usize = 64;

/// Reusable byte buffers for disk reads. Constructed explicitly and handed
/// to whoever needs scratch space; buffers find their way back on drop.
#[derive(Debug, Clone)]
pub struct BufferPool {
    free: Arc<Mutex<Vec<Vec<u8>>>>,
    max_pooled: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_POOLED)
    }
}

impl BufferPool {
    pub fn new(max_pooled: usize) -> Self {
        Self {
            free: Default::default(),
            max_pooled,
        }
    }

    /// A zeroed buffer of exactly `len` bytes.
    pub fn checkout(&self, len: usize) -> PooledBuffer {
        let mut buf = self.free.lock().pop().unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);
        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }

    pub fn pooled(&self) -> usize {
        self.free.lock().len()
    }

    fn give_back(&self, buf: Vec<u8>) {
        let mut g = self.free.lock();
        if g.len() < self.max_pooled {
            g.push(buf);
        }
    }
}

pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: BufferPool,
}

impl PooledBuffer {
    /// Shrinks the visible length, e.g. after a short read.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len)
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PooledBuffer({})", self.buf.len())
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_return_on_every_path() {
        let pool = BufferPool::new(2);
        fn fails(pool: &BufferPool) -> anyhow::Result<()> {
            let mut b = pool.checkout(10);
            b[0] = 1;
            anyhow::bail!("boom")
        }
        assert!(fails(&pool).is_err());
        assert_eq!(pool.pooled(), 1);

        let b = pool.checkout(5);
        assert_eq!(&b[..], &[0; 5]);
        assert_eq!(pool.pooled(), 0);
        let c = pool.checkout(5);
        let d = pool.checkout(5);
        drop((b, c, d));
        assert_eq!(pool.pooled(), 2);
    }
}
