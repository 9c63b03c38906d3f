pub mod outgoing;
pub mod peer;

use std::{collections::BTreeMap, net::SocketAddr};

use piecework_core::Id20;

pub use outgoing::{Outgoing, OutgoingQueue};
pub use peer::{ConnectedPeer, ReviewState, TransferMonitor};

/// Stable identifier of a connection. Never reused within a torrent, so a
/// stale handle can't alias a newer peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle(pub u64);

impl std::fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Owner of every live peer of one torrent. Everything else (picker block
/// records, choke lists) refers to peers by handle.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: BTreeMap<PeerHandle, ConnectedPeer>,
    next_handle: u64,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_handle(&mut self) -> PeerHandle {
        let h = PeerHandle(self.next_handle);
        self.next_handle += 1;
        h
    }

    pub fn add(&mut self, addr: SocketAddr, peer_id: Id20, piece_count: usize) -> PeerHandle {
        let handle = self.allocate_handle();
        self.peers
            .insert(handle, ConnectedPeer::new(handle, addr, peer_id, piece_count));
        handle
    }

    pub fn insert(&mut self, peer: ConnectedPeer) {
        self.peers.insert(peer.handle, peer);
    }

    pub fn get(&self, handle: PeerHandle) -> Option<&ConnectedPeer> {
        self.peers.get(&handle)
    }

    pub fn get_mut(&mut self, handle: PeerHandle) -> Option<&mut ConnectedPeer> {
        self.peers.get_mut(&handle)
    }

    pub fn remove(&mut self, handle: PeerHandle) -> Option<ConnectedPeer> {
        self.peers.remove(&handle)
    }

    pub fn contains(&self, handle: PeerHandle) -> bool {
        self.peers.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Iterates in connection order.
    pub fn iter(&self) -> impl Iterator<Item = &ConnectedPeer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnectedPeer> {
        self.peers.values_mut()
    }

    pub fn handles(&self) -> Vec<PeerHandle> {
        self.peers.keys().copied().collect()
    }

    pub fn interested_count(&self) -> usize {
        self.iter().filter(|p| p.is_interested).count()
    }

    pub fn unchoked_count(&self) -> usize {
        self.iter().filter(|p| !p.am_choking).count()
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<PeerHandle> {
        self.iter().find(|p| p.addr == addr).map(|p| p.handle)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = ConnectedPeer> + '_ {
        std::mem::take(&mut self.peers).into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_not_reused() {
        let mut t = PeerTable::new();
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let a = t.add(addr, Id20::default(), 4);
        t.remove(a);
        let b = t.add(addr, Id20::default(), 4);
        assert_ne!(a, b);
        assert!(t.get(a).is_none());
        assert_eq!(t.find_by_addr(addr), Some(b));
    }
}
