//! Network bandwidth caps, shared by every peer pump of a torrent.

use std::{sync::Arc, time::Duration};

use leaky_bucket::RateLimiter;
use parking_lot::RwLock;
use piecework_core::constants::BLOCK_SIZE;
use serde::{Deserialize, Serialize};

const REFILL_INTERVAL: Duration = Duration::from_millis(100);

/// Bytes per second in each direction. `None` or 0 means unlimited.
#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct LimitsConfig {
    pub upload_bps: Option<usize>,
    pub download_bps: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

struct Bucket {
    bps: Option<usize>,
    limiter: Option<Arc<RateLimiter>>,
}

impl Bucket {
    fn new(bps: Option<usize>) -> Self {
        let bps = bps.filter(|bps| *bps > 0);
        let limiter = bps.map(|bps| {
            Arc::new(
                RateLimiter::builder()
                    .interval(REFILL_INTERVAL)
                    .refill(bps.div_ceil(10))
                    // A block larger than the bucket would wait forever.
                    .max(bps.max(BLOCK_SIZE as usize))
                    .build(),
            )
        });
        Self { bps, limiter }
    }
}

pub struct Limits {
    upload: RwLock<Bucket>,
    download: RwLock<Bucket>,
}

impl Limits {
    pub fn new(config: LimitsConfig) -> Self {
        Self {
            upload: RwLock::new(Bucket::new(config.upload_bps)),
            download: RwLock::new(Bucket::new(config.download_bps)),
        }
    }

    fn bucket(&self, direction: Direction) -> &RwLock<Bucket> {
        match direction {
            Direction::Upload => &self.upload,
            Direction::Download => &self.download,
        }
    }

    /// Waits until `bytes` may move in `direction`.
    pub async fn acquire(&self, direction: Direction, bytes: usize) {
        let limiter = self.bucket(direction).read().limiter.clone();
        if let Some(limiter) = limiter {
            limiter.acquire(bytes).await
        }
    }

    /// Replaces one direction's cap. Waiters on the old bucket finish on it.
    pub fn set(&self, direction: Direction, bps: Option<usize>) {
        *self.bucket(direction).write() = Bucket::new(bps);
    }

    pub fn update(&self, config: LimitsConfig) {
        self.set(Direction::Upload, config.upload_bps);
        self.set(Direction::Download, config.download_bps);
    }

    pub fn config(&self) -> LimitsConfig {
        LimitsConfig {
            upload_bps: self.upload.read().bps,
            download_bps: self.download.read().bps,
        }
    }
}
