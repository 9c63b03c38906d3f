//! BitTorrent engine core.
//!
//! Decides what to request from whom ([`picker`], [`requester`]), who gets
//! upload bandwidth ([`choke`]), and moves the bytes through a rate-limited,
//! cached, incrementally hashing disk layer ([`disk`]). [`torrent`] ties these
//! together for one torrent; [`connection`] runs the peer sockets.
//!
//! Metadata parsing, trackers, DHT and the byte-level wire codec live
//! elsewhere. The core sees them only through [`TorrentInfo`],
//! [`connection::PeerConnector`] and the typed messages in [`wire`].
//!
//! # Example
//!
//! ```no_run
//! use std::{path::PathBuf, sync::Arc};
//!
//! use piecework::{
//!     EngineSettings, TorrentInfo, TorrentManager,
//!     connection::memory::MemoryConnector,
//!     disk::{BufferPool, DiskManager, FilesystemPieceWriter},
//!     torrent_info::PieceHashes,
//! };
//! use piecework_core::Id20;
//! use tokio_util::sync::CancellationToken;
//!
//! tokio_test::block_on(async {
//!     let settings = EngineSettings::default();
//!     let cancel = CancellationToken::new();
//!     let disk = Arc::new(DiskManager::new(&settings, BufferPool::default()));
//!     disk.spawn_ticker(cancel.clone());
//!     let info = TorrentInfo::new(
//!         Id20::default(),
//!         "example",
//!         262144,
//!         [(PathBuf::from("file.bin"), 1 << 20)],
//!         PieceHashes::default(),
//!     )
//!     .unwrap();
//!     let storage = Arc::new(FilesystemPieceWriter::new("/tmp/downloads", settings.max_open_files));
//!     let torrent = TorrentManager::new(
//!         Arc::new(info),
//!         &settings,
//!         disk,
//!         storage,
//!         Arc::new(MemoryConnector::new()),
//!     );
//!     let handle = torrent.spawn(cancel);
//!     handle.start().await.unwrap();
//!     handle.add_peer("127.0.0.1:6881".parse().unwrap()).unwrap();
//! })
//! ```

pub mod choke;
pub mod connection;
pub mod disk;
pub mod error;
pub mod limits;
pub mod peers;
pub mod picker;
pub mod requester;
pub mod settings;
pub mod torrent;
pub mod torrent_info;
#[cfg(feature = "tracing-subscriber-utils")]
pub mod tracing_subscriber_config_utils;
pub mod wire;

pub use error::{Error, Result, TorrentErrorReason};
pub use settings::EngineSettings;
pub use torrent::{TorrentHandle, TorrentManager, TorrentMode, TorrentStats};
pub use torrent_info::{FileInfo, PieceHash, PieceHashes, Priority, TorrentInfo};

#[cfg(test)]
mod tests;

/// The cargo version of piecework.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
