//! An in-process wire. Used by tests and by embedders that bridge peers
//! from elsewhere.

use std::{collections::HashMap, net::SocketAddr};

use async_trait::async_trait;
use parking_lot::Mutex;
use piecework_core::Id20;
use tokio::sync::mpsc;

use crate::wire::{Handshake, Message};

use super::{Connected, PeerConnector, PeerWireReader, PeerWireWriter};

pub struct MemoryReader(mpsc::UnboundedReceiver<Message>);
pub struct MemoryWriter(mpsc::UnboundedSender<Message>);

#[async_trait]
impl PeerWireReader for MemoryReader {
    async fn read_message(&mut self) -> anyhow::Result<Message> {
        self.0
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("remote closed the connection"))
    }
}

#[async_trait]
impl PeerWireWriter for MemoryWriter {
    async fn write_message(&mut self, msg: &Message) -> anyhow::Result<()> {
        self.0
            .send(msg.clone())
            .map_err(|_| anyhow::anyhow!("remote closed the connection"))
    }
}

impl MemoryReader {
    pub fn try_read(&mut self) -> Option<Message> {
        self.0.try_recv().ok()
    }
}

/// Two connected ends: whatever one end writes the other reads.
pub fn wire_pair() -> ((MemoryReader, MemoryWriter), (MemoryReader, MemoryWriter)) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    ((MemoryReader(a_rx), MemoryWriter(b_tx)), (MemoryReader(b_rx), MemoryWriter(a_tx)))
}

enum Listener {
    Accepting {
        handshake: Handshake,
        ends: (MemoryReader, MemoryWriter),
    },
    Unresponsive,
}

/// Connects to peers registered up front. Unknown addresses refuse.
#[derive(Default)]
pub struct MemoryConnector {
    listeners: Mutex<HashMap<SocketAddr, Listener>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer that will answer with `handshake`. Returns the
    /// remote's ends of the wire.
    pub fn add_peer(&self, addr: SocketAddr, handshake: Handshake) -> (MemoryReader, MemoryWriter) {
        let (local, remote) = wire_pair();
        self.listeners.lock().insert(
            addr,
            Listener::Accepting {
                handshake,
                ends: local,
            },
        );
        remote
    }

    /// Registers a peer whose connect attempts never finish.
    pub fn add_unresponsive(&self, addr: SocketAddr) {
        self.listeners.lock().insert(addr, Listener::Unresponsive);
    }
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn connect(&self, addr: SocketAddr, _info_hash: Id20, _our_id: Id20) -> anyhow::Result<Connected> {
        let listener = self.listeners.lock().remove(&addr);
        match listener {
            Some(Listener::Accepting { handshake, ends }) => Ok(Connected {
                handshake,
                reader: Box::new(ends.0),
                writer: Box::new(ends.1),
            }),
            Some(Listener::Unresponsive) => {
                self.listeners.lock().insert(addr, Listener::Unresponsive);
                futures::future::pending().await
            }
            None => anyhow::bail!("connection to {addr} refused"),
        }
    }
}
