use std::time::Duration;

use piecework_core::constants::ENDGAME_THRESHOLD_BLOCKS;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::limits::LimitsConfig;

/// Engine-wide knobs. Passed explicitly to every component that needs them.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Peers that may be unchoked at once. 0 means unlimited.
    pub upload_slots: usize,
    pub max_connections: usize,

    /// Disk read limit in bytes/sec. 0 means unlimited.
    pub max_disk_read_rate: u64,
    /// Disk write limit in bytes/sec. 0 means unlimited.
    pub max_disk_write_rate: u64,
    pub max_open_files: usize,
    pub disk_cache_bytes: u64,

    #[serde_as(as = "serde_with::DurationSeconds")]
    pub review_interval: Duration,
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub min_unchoke_time: Duration,

    #[serde_as(as = "serde_with::DurationSeconds")]
    pub connect_timeout: Duration,
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub read_write_timeout: Duration,
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub inactive_peer_timeout: Duration,

    pub network_limits: LimitsConfig,
    pub endgame_threshold_blocks: usize,
    /// Pieces in the streaming high-priority window.
    pub streaming_window_pieces: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            upload_slots: 8,
            max_connections: 60,
            max_disk_read_rate: 0,
            max_disk_write_rate: 0,
            max_open_files: 20,
            disk_cache_bytes: 5 * 1024 * 1024,
            review_interval: Duration::from_secs(30),
            min_unchoke_time: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            read_write_timeout: Duration::from_secs(30),
            inactive_peer_timeout: Duration::from_secs(600),
            network_limits: LimitsConfig::default(),
            endgame_threshold_blocks: ENDGAME_THRESHOLD_BLOCKS,
            streaming_window_pieces: 15,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let s: EngineSettings =
            serde_json::from_str(r#"{"upload_slots": 4, "review_interval": 10}"#).unwrap();
        assert_eq!(s.upload_slots, 4);
        assert_eq!(s.review_interval, Duration::from_secs(10));
        assert_eq!(s.min_unchoke_time, Duration::from_secs(30));
        assert_eq!(s.endgame_threshold_blocks, 256);
    }
}
