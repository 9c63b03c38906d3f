use std::{path::Path, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    EngineSettings, TorrentErrorReason, TorrentHandle, TorrentManager, TorrentMode, TorrentStats,
    connection::memory::MemoryConnector,
    disk::{BufferPool, DiskManager, InMemoryPieceWriter},
    torrent_info::TorrentInfo,
};

use super::test_util::{addr, handshake, serve_seeder, setup_test_logging, torrent_with_data};

const PIECE_LENGTH: u32 = 32768;

struct Setup {
    info: Arc<TorrentInfo>,
    data: Arc<Vec<u8>>,
    storage: Arc<InMemoryPieceWriter>,
    disk: Arc<DiskManager>,
    cancel: CancellationToken,
}

impl Setup {
    fn new(len: usize) -> Self {
        setup_test_logging();
        let (info, data) = torrent_with_data(PIECE_LENGTH, len, 42);
        let settings = EngineSettings::default();
        let disk = Arc::new(DiskManager::new(&settings, BufferPool::default()));
        let cancel = CancellationToken::new();
        disk.spawn_ticker(cancel.clone());
        Self {
            info,
            data,
            storage: Arc::new(InMemoryPieceWriter::new()),
            disk,
            cancel,
        }
    }

    fn seeder_connector(&self, port: u16) -> Arc<MemoryConnector> {
        let connector = Arc::new(MemoryConnector::new());
        let (reader, writer) = connector.add_peer(addr(port), handshake(self.info.info_hash, true));
        tokio::spawn(serve_seeder(reader, writer, self.data.clone(), PIECE_LENGTH));
        connector
    }

    fn manager(&self, connector: Arc<MemoryConnector>) -> TorrentManager {
        TorrentManager::new(
            self.info.clone(),
            &EngineSettings::default(),
            self.disk.clone(),
            self.storage.clone(),
            connector,
        )
    }

    fn stored(&self) -> Option<Vec<u8>> {
        self.storage.contents(Path::new("data.bin"))
    }
}

impl Drop for Setup {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn wait_for(handle: &TorrentHandle, what: impl Fn(&TorrentStats) -> bool) -> TorrentStats {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let stats = handle.stats().await.unwrap();
            if what(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_download_from_one_seeder() {
    // Last piece is short.
    let setup = Setup::new(PIECE_LENGTH as usize * 5 + 1000);
    let handle = setup
        .manager(setup.seeder_connector(7001))
        .spawn(setup.cancel.child_token());

    handle.start().await.unwrap();
    handle.add_peer(addr(7001)).unwrap();

    let stats = wait_for(&handle, |s| s.mode == TorrentMode::Seeding).await;
    assert_eq!(stats.have_pieces, 6);
    assert!(stats.is_finished());
    assert_eq!(stats.hash_fails, 0);
    assert_eq!(stats.downloaded_bytes, setup.data.len() as u64);

    handle.stop().await.unwrap();
    assert_eq!(setup.stored().unwrap(), *setup.data);
}

#[tokio::test]
async fn test_fast_resume_skips_rehash() {
    let dir = tempfile::tempdir().unwrap();
    let resume_path = dir.path().join("resume.json");
    let setup = Setup::new(PIECE_LENGTH as usize * 3);

    let handle = setup
        .manager(setup.seeder_connector(7002))
        .spawn(setup.cancel.child_token());
    handle.start().await.unwrap();
    handle.add_peer(addr(7002)).unwrap();
    wait_for(&handle, |s| s.mode == TorrentMode::Seeding).await;
    handle.stop().await.unwrap();
    handle.save_fast_resume(resume_path.clone()).await.unwrap();

    // A fresh disk manager, so any read would show up in its counters.
    let settings = EngineSettings::default();
    let disk = Arc::new(DiskManager::new(&settings, BufferPool::default()));
    disk.spawn_ticker(setup.cancel.child_token());
    let mut restarted = TorrentManager::new(
        setup.info.clone(),
        &settings,
        disk.clone(),
        setup.storage.clone(),
        Arc::new(MemoryConnector::new()),
    );
    restarted.load_fast_resume(&resume_path).await.unwrap();
    let stats = restarted.stats();
    assert_eq!(stats.have_pieces, 3);
    assert_eq!(stats.unhashed_pieces, 0);

    restarted.start().await.unwrap();
    assert_eq!(restarted.mode(), TorrentMode::Seeding);
    assert_eq!(disk.stats().bytes_read, 0);
    restarted.stop().await.unwrap();
}

#[tokio::test]
async fn test_restart_without_resume_rehashes_existing_data() {
    let setup = Setup::new(PIECE_LENGTH as usize * 2 + 5);
    let handle = setup
        .manager(setup.seeder_connector(7003))
        .spawn(setup.cancel.child_token());
    handle.start().await.unwrap();
    handle.add_peer(addr(7003)).unwrap();
    wait_for(&handle, |s| s.mode == TorrentMode::Seeding).await;
    handle.stop().await.unwrap();

    let mut restarted = setup.manager(Arc::new(MemoryConnector::new()));
    assert_eq!(restarted.stats().unhashed_pieces, 3);
    restarted.start().await.unwrap();
    assert_eq!(restarted.mode(), TorrentMode::Seeding);
    assert_eq!(restarted.pieces().have().true_count(), 3);
    assert_eq!(restarted.stats().hash_fails, 0);
}

#[tokio::test]
async fn test_write_failure_moves_torrent_to_error() {
    let setup = Setup::new(PIECE_LENGTH as usize * 2);
    setup.storage.set_fail_writes(true);
    let handle = setup
        .manager(setup.seeder_connector(7004))
        .spawn(setup.cancel.child_token());
    handle.start().await.unwrap();
    handle.add_peer(addr(7004)).unwrap();

    let stats = wait_for(&handle, |s| s.mode == TorrentMode::Error).await;
    assert_eq!(stats.error, Some(TorrentErrorReason::WriteFailure));
    assert!(stats.error_message.is_some());
    assert_eq!(stats.peers.connected, 0);

    assert!(handle.start().await.is_err());
    assert!(handle.stop().await.is_err());
    handle.clear_error().await.unwrap();
    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.mode, TorrentMode::Stopped);
    assert_eq!(stats.error, None);
    assert_eq!(stats.have_pieces, 0);
}

#[tokio::test]
async fn test_handle_fails_after_manager_is_cancelled() {
    let setup = Setup::new(PIECE_LENGTH as usize);
    let cancel = setup.cancel.child_token();
    let handle = setup.manager(Arc::new(MemoryConnector::new())).spawn(cancel.clone());
    handle.start().await.unwrap();
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.stats().await.is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(matches!(handle.stop().await, Err(crate::Error::TorrentStopped)));
}
