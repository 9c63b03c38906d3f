use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use parking_lot::Mutex;

#[derive(Clone, Copy)]
struct ProgressSnapshot {
    progress_bytes: u64,
    instant: Instant,
}

/// Moving-average transfer rate over a sliding window of snapshots.
///
/// Snapshots are pushed on every engine tick with the running byte total; the
/// rate is computed between the oldest and newest snapshot in the window.
pub struct SpeedEstimator {
    snapshots: Mutex<VecDeque<ProgressSnapshot>>,
    window: usize,
    bytes_per_second: AtomicU64,
}

impl std::fmt::Debug for SpeedEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SpeedEstimator({} B/s)", self.bps())
    }
}

impl Default for SpeedEstimator {
    fn default() -> Self {
        Self::new(5)
    }
}

impl SpeedEstimator {
    pub fn new(window: usize) -> Self {
        let window = window.max(2);
        Self {
            snapshots: Mutex::new(VecDeque::with_capacity(window)),
            window,
            bytes_per_second: Default::default(),
        }
    }

    pub fn bps(&self) -> u64 {
        self.bytes_per_second.load(Ordering::Relaxed)
    }

    pub fn mbps(&self) -> f64 {
        self.bps() as f64 / 1024f64 / 1024f64
    }

    pub fn reset(&self) {
        self.snapshots.lock().clear();
        self.bytes_per_second.store(0, Ordering::Relaxed);
    }

    pub fn add_snapshot(&self, progress_bytes: u64, instant: Instant) {
        let first = {
            let mut g = self.snapshots.lock();
            let current = ProgressSnapshot {
                progress_bytes,
                instant,
            };
            if g.len() >= self.window {
                g.pop_front();
            }
            g.push_back(current);
            match g.front() {
                Some(first) if g.len() > 1 => *first,
                _ => return,
            }
        };

        let diff = progress_bytes.saturating_sub(first.progress_bytes);
        let elapsed = instant.saturating_duration_since(first.instant).as_secs_f64();
        if elapsed <= 0f64 {
            return;
        }
        let bps = diff as f64 / elapsed;
        self.bytes_per_second.store(bps as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_rate_over_window() {
        let e = SpeedEstimator::new(3);
        let t = Instant::now();
        e.add_snapshot(0, t);
        assert_eq!(e.bps(), 0);
        e.add_snapshot(1000, t + Duration::from_secs(1));
        assert_eq!(e.bps(), 1000);
        e.add_snapshot(3000, t + Duration::from_secs(2));
        assert_eq!(e.bps(), 1500);
        // Oldest snapshot drops out of the window.
        e.add_snapshot(3000, t + Duration::from_secs(3));
        assert_eq!(e.bps(), 1000);
    }
}
