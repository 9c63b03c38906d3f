//! Socket lifecycle for one torrent: connect attempts, and the reader and
//! writer pumps of every live peer.
//!
//! The pumps never touch torrent state. Everything they learn goes to the
//! torrent's event channel; everything they send comes from the peer's
//! [`OutgoingQueue`].

pub mod memory;

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use piecework_core::{Id20, spawn_utils::spawn_with_cancel};
use tokio::{sync::mpsc::UnboundedSender, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, trace, warn};

use crate::{
    Error,
    disk::{DiskManager, DiskTorrent},
    limits::{Direction, Limits},
    peers::{ConnectedPeer, Outgoing, OutgoingQueue, PeerHandle, TransferMonitor},
    settings::EngineSettings,
    torrent::TorrentEvent,
    wire::{Handshake, Message, PieceMessage},
};

pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Receiving half of a framed peer connection.
#[async_trait]
pub trait PeerWireReader: Send {
    async fn read_message(&mut self) -> anyhow::Result<Message>;
}

/// Sending half of a framed peer connection.
#[async_trait]
pub trait PeerWireWriter: Send {
    async fn write_message(&mut self, msg: &Message) -> anyhow::Result<()>;
}

/// A connection after the handshake exchange.
pub struct Connected {
    pub handshake: Handshake,
    pub reader: Box<dyn PeerWireReader>,
    pub writer: Box<dyn PeerWireWriter>,
}

impl std::fmt::Debug for Connected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connected")
            .field("handshake", &self.handshake)
            .finish_non_exhaustive()
    }
}

/// Opens connections: transport, encryption negotiation and handshake.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, addr: SocketAddr, info_hash: Id20, our_id: Id20) -> anyhow::Result<Connected>;
}

pub(crate) async fn with_timeout<T, E>(
    timeout_value: Duration,
    fut: impl std::future::Future<Output = Result<T, E>>,
) -> anyhow::Result<T>
where
    E: Into<anyhow::Error>,
{
    match timeout(timeout_value, fut).await {
        Ok(v) => v.map_err(Into::into),
        Err(_) => anyhow::bail!("timeout at {timeout_value:?}"),
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn PeerConnector>,
    info_hash: Id20,
    our_peer_id: Id20,
    connect_timeout: Duration,
    read_write_timeout: Duration,
    pending: Mutex<HashMap<SocketAddr, CancellationToken>>,
    events: UnboundedSender<TorrentEvent>,
    disk: Arc<DiskManager>,
    disk_torrent: Arc<DiskTorrent>,
    limits: Arc<Limits>,
}

#[allow(clippy::too_many_arguments)]
impl ConnectionManager {
    pub fn new(
        settings: &EngineSettings,
        connector: Arc<dyn PeerConnector>,
        info_hash: Id20,
        our_peer_id: Id20,
        events: UnboundedSender<TorrentEvent>,
        disk: Arc<DiskManager>,
        disk_torrent: Arc<DiskTorrent>,
        limits: Arc<Limits>,
    ) -> Self {
        Self {
            connector,
            info_hash,
            our_peer_id,
            connect_timeout: settings.connect_timeout,
            read_write_timeout: settings.read_write_timeout,
            pending: Default::default(),
            events,
            disk,
            disk_torrent,
            limits,
        }
    }

    pub fn pending_connects(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn is_connecting(&self, addr: SocketAddr) -> bool {
        self.pending.lock().contains_key(&addr)
    }

    /// Starts a connect attempt in the background. The outcome arrives on
    /// the torrent's event channel as `PeerConnected` or `ConnectFailed`;
    /// a cancelled attempt reports nothing.
    pub fn connect_to_peer(&self, addr: SocketAddr) {
        let token = CancellationToken::new();
        {
            let mut g = self.pending.lock();
            if g.contains_key(&addr) {
                return;
            }
            g.insert(addr, token.clone());
        }

        let connector = self.connector.clone();
        let events = self.events.clone();
        let (info_hash, our_id) = (self.info_hash, self.our_peer_id);
        let connect_timeout = self.connect_timeout;
        tokio::spawn(
            async move {
                let attempt = tokio::select! {
                    _ = token.cancelled() => Err(Error::ConnectCancelled),
                    r = timeout(connect_timeout, connector.connect(addr, info_hash, our_id)) => match r {
                        Ok(Ok(c)) if c.handshake.info_hash != info_hash => Err(Error::WrongInfoHash),
                        Ok(Ok(c)) => Ok(c),
                        Ok(Err(e)) => Err(Error::Anyhow(e)),
                        Err(_) => Err(Error::Timeout("connect")),
                    },
                };
                match attempt {
                    Ok(connected) => {
                        trace!("connected");
                        let _ = events.send(TorrentEvent::PeerConnected { addr, connected });
                    }
                    Err(Error::ConnectCancelled) => trace!("connect cancelled"),
                    Err(error) => {
                        debug!("connect failed: {error:#}");
                        let _ = events.send(TorrentEvent::ConnectFailed { addr, error });
                    }
                }
            }
            .instrument(debug_span!("connect", %addr)),
        );
    }

    /// Called by the torrent once it has handled a connect outcome.
    pub fn connect_finished(&self, addr: SocketAddr) {
        self.pending.lock().remove(&addr);
    }

    pub fn cancel_pending_connects(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        for (addr, token) in pending {
            trace!(%addr, "cancelling connect");
            token.cancel();
        }
    }

    /// Spawns the reader and writer pumps of a freshly added peer.
    pub fn start_peer(
        &self,
        peer: &ConnectedPeer,
        reader: Box<dyn PeerWireReader>,
        writer: Box<dyn PeerWireWriter>,
    ) {
        let pump = PeerPump {
            handle: peer.handle,
            outgoing: peer.outgoing.clone(),
            monitor: peer.monitor.clone(),
            events: self.events.clone(),
            disk: self.disk.clone(),
            disk_torrent: self.disk_torrent.clone(),
            limits: self.limits.clone(),
            read_write_timeout: self.read_write_timeout,
        };
        let events = self.events.clone();
        let handle = peer.handle;
        let token = peer.cancel.clone();
        spawn_with_cancel(
            debug_span!("peer", peer = %handle, addr = %peer.addr),
            token,
            async move {
                let reason = pump.run(reader, writer).await.err();
                if let Some(e) = reason.as_ref() {
                    debug!("connection closed: {e:#}");
                }
                let _ = events.send(TorrentEvent::PeerDisconnected {
                    peer: handle,
                    reason,
                });
                Ok(())
            },
        );
    }

    /// Stops the peer's pumps. Already queued disk operations are left alone.
    pub fn disconnect(&self, peer: &ConnectedPeer) {
        trace!(peer = %peer.handle, "disconnecting");
        peer.cancel.cancel();
    }
}

struct PeerPump {
    handle: PeerHandle,
    outgoing: Arc<OutgoingQueue>,
    monitor: Arc<TransferMonitor>,
    events: UnboundedSender<TorrentEvent>,
    disk: Arc<DiskManager>,
    disk_torrent: Arc<DiskTorrent>,
    limits: Arc<Limits>,
    read_write_timeout: Duration,
}

impl PeerPump {
    async fn run(
        &self,
        mut reader: Box<dyn PeerWireReader>,
        mut writer: Box<dyn PeerWireWriter>,
    ) -> anyhow::Result<()> {
        let reader = async {
            // Idle peers still send a keep-alive every couple of minutes.
            let idle_timeout = KEEP_ALIVE_INTERVAL + self.read_write_timeout;
            loop {
                let message = with_timeout(idle_timeout, reader.read_message())
                    .await
                    .context("error reading message")?;
                trace!(?message, "received");
                if let Message::Piece(p) = &message {
                    self.limits.acquire(Direction::Download, p.data.len()).await;
                }
                if self
                    .events
                    .send(TorrentEvent::PeerMessage {
                        peer: self.handle,
                        message,
                    })
                    .is_err()
                {
                    return Ok(());
                }
            }

            // For type inference.
            #[allow(unreachable_code)]
            Ok::<_, anyhow::Error>(())
        };

        let writer = async {
            loop {
                let item = match timeout(KEEP_ALIVE_INTERVAL, self.outgoing.next()).await {
                    Ok(item) => item,
                    Err(_) => Outgoing::Message(Message::KeepAlive),
                };
                let message = match item {
                    Outgoing::Message(m) => m,
                    Outgoing::Upload(request) => {
                        self.limits
                            .acquire(Direction::Upload, request.length as usize)
                            .await;
                        let buf = match self.disk.read(&self.disk_torrent, request).await {
                            Ok(Some(buf)) => buf,
                            Ok(None) => anyhow::bail!("peer requested {request} which we don't have"),
                            Err(error) => {
                                let _ = self.events.send(TorrentEvent::DiskFailure {
                                    peer: self.handle,
                                    error,
                                });
                                anyhow::bail!("error reading {request} for upload");
                            }
                        };
                        // A choke may have been queued while we were reading.
                        if !self.outgoing.upload_permitted(request.piece) {
                            trace!(%request, "dropping upload, peer is choked");
                            continue;
                        }
                        Message::Piece(PieceMessage {
                            piece: request.piece,
                            offset: request.offset,
                            data: Bytes::copy_from_slice(&buf),
                        })
                    }
                };
                trace!(?message, "sending");
                with_timeout(self.read_write_timeout, writer.write_message(&message))
                    .await
                    .context("error writing message")?;
                if let Message::Piece(p) = &message {
                    self.monitor.record_upload(p.data.len() as u64);
                }
            }

            // For type inference.
            #[allow(unreachable_code)]
            Ok::<_, anyhow::Error>(())
        };

        let r = tokio::select! {
            r = reader => {
                trace!("reader is done");
                r
            }
            r = writer => {
                trace!("writer is done");
                r
            }
        };
        if let Err(e) = r.as_ref() {
            warn!(peer = %self.handle, "{e:#}");
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::sync::mpsc;

    use super::{memory::MemoryConnector, *};
    use crate::{
        disk::{BufferPool, InMemoryPieceWriter},
        limits::LimitsConfig,
        torrent_info::{PieceHashes, TorrentInfo},
        wire::BlockRequest,
    };

    const INFO_HASH: Id20 = Id20::new([1; 20]);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn handshake(info_hash: Id20) -> Handshake {
        Handshake {
            info_hash,
            peer_id: Id20::new([9; 20]),
            supports_fast_peer: true,
        }
    }

    fn setup(
        connector: Arc<MemoryConnector>,
    ) -> (ConnectionManager, mpsc::UnboundedReceiver<TorrentEvent>, Arc<DiskTorrent>, Arc<DiskManager>) {
        let settings = EngineSettings {
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let info = TorrentInfo::new(
            INFO_HASH,
            "t",
            16384,
            [(PathBuf::from("f"), 16384 * 2)],
            PieceHashes::default(),
        )
        .unwrap();
        let disk = Arc::new(DiskManager::new(&settings, BufferPool::default()));
        let torrent = disk.add_torrent(Arc::new(info), Arc::new(InMemoryPieceWriter::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let cm = ConnectionManager::new(
            &settings,
            connector,
            INFO_HASH,
            Id20::new([2; 20]),
            tx,
            disk.clone(),
            torrent.clone(),
            Arc::new(Limits::new(LimitsConfig::default())),
        );
        (cm, rx, torrent, disk)
    }

    #[tokio::test]
    async fn test_connect_outcomes() {
        let connector = Arc::new(MemoryConnector::new());
        let _remote = connector.add_peer(addr(1), handshake(INFO_HASH));
        let _wrong = connector.add_peer(addr(2), handshake(Id20::new([3; 20])));
        let (cm, mut rx, _, _) = setup(connector);

        cm.connect_to_peer(addr(1));
        assert!(matches!(
            rx.recv().await,
            Some(TorrentEvent::PeerConnected { addr: a, .. }) if a == addr(1)
        ));
        cm.connect_to_peer(addr(2));
        assert!(matches!(
            rx.recv().await,
            Some(TorrentEvent::ConnectFailed { error: Error::WrongInfoHash, .. })
        ));
        cm.connect_to_peer(addr(3));
        assert!(matches!(
            rx.recv().await,
            Some(TorrentEvent::ConnectFailed { error: Error::Anyhow(_), .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_pending_connects() {
        let connector = Arc::new(MemoryConnector::new());
        connector.add_unresponsive(addr(1));
        connector.add_unresponsive(addr(2));
        let (cm, mut rx, _, _) = setup(connector);
        cm.connect_to_peer(addr(1));
        cm.connect_to_peer(addr(2));
        assert_eq!(cm.pending_connects(), 2);
        cm.cancel_pending_connects();
        assert_eq!(cm.pending_connects(), 0);
        // Cancelled attempts report nothing, not even the connect timeout.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pumps_forward_and_upload() {
        let connector = Arc::new(MemoryConnector::new());
        let (mut remote_reader, mut remote_writer) = connector.add_peer(addr(1), handshake(INFO_HASH));
        let (cm, mut rx, torrent, disk) = setup(connector);
        disk.write(&torrent, BlockRequest::new(1, 0, 16384), Bytes::from(vec![7u8; 16384]))
            .await
            .unwrap();

        cm.connect_to_peer(addr(1));
        let Some(TorrentEvent::PeerConnected { connected, .. }) = rx.recv().await else {
            panic!("expected connection");
        };
        cm.connect_finished(addr(1));
        let peer = ConnectedPeer::new(PeerHandle(0), addr(1), connected.handshake.peer_id, 2);
        cm.start_peer(&peer, connected.reader, connected.writer);

        remote_writer.write_message(&Message::Interested).await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(TorrentEvent::PeerMessage { peer: PeerHandle(0), message: Message::Interested })
        ));

        peer.outgoing.push(Message::Unchoke);
        peer.outgoing.push_upload(BlockRequest::new(1, 0, 16384));
        assert_eq!(remote_reader.read_message().await.unwrap(), Message::Unchoke);
        let Message::Piece(p) = remote_reader.read_message().await.unwrap() else {
            panic!("expected piece");
        };
        assert_eq!(p.data.len(), 16384);
        assert_eq!(p.data[0], 7);
        assert_eq!(peer.monitor.bytes_uploaded(), 16384);

        drop(remote_writer);
        assert!(matches!(
            rx.recv().await,
            Some(TorrentEvent::PeerDisconnected { peer: PeerHandle(0), reason: Some(_) })
        ));
    }
}
