use std::{
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
    time::Duration,
};

use piecework_core::constants::BLOCK_SIZE;

/// Token bucket refilled explicitly by the disk manager's tick. Shared by
/// every torrent of one engine, so the balance lives in atomics.
#[derive(Debug, Default)]
pub struct RateLimiter {
    /// Bytes per second. 0 means unlimited.
    rate: AtomicU64,
    tokens: AtomicI64,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            rate: AtomicU64::new(bytes_per_sec),
            tokens: AtomicI64::new(0),
        }
    }

    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    pub fn set_rate(&self, bytes_per_sec: u64) {
        self.rate.store(bytes_per_sec, Ordering::Relaxed);
        let cap = Self::capacity(bytes_per_sec);
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| Some(t.min(cap)));
    }

    pub fn tokens(&self) -> i64 {
        self.tokens.load(Ordering::Acquire)
    }

    fn capacity(rate: u64) -> i64 {
        rate.max(BLOCK_SIZE as u64) as i64
    }

    /// Takes `amount` tokens if the balance allows it. An op larger than
    /// the bucket goes through once the bucket is full and leaves the
    /// balance negative until refills pay it back.
    pub fn try_acquire(&self, amount: u64) -> bool {
        let rate = self.rate();
        if rate == 0 {
            return true;
        }
        let cap = Self::capacity(rate);
        let amount = amount as i64;
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                (t >= amount || t >= cap).then_some(t - amount)
            })
            .is_ok()
    }

    /// Adds the tokens earned over `elapsed`.
    pub fn refill(&self, elapsed: Duration) {
        let rate = self.rate();
        if rate == 0 {
            return;
        }
        let earned = (rate as f64 * elapsed.as_secs_f64()) as i64;
        let cap = Self::capacity(rate);
        let _ = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| {
                Some(t.saturating_add(earned).min(cap))
            });
    }
}
