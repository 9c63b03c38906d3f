//! Typed peer messages exchanged between the engine and the wire layer.
//! Framing, encryption and handshake bytes live in the wire layer itself.

use bytes::Bytes;
use piecework_core::Id20;

/// A block request as it travels on the wire: `(piece, begin, length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    pub const fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }
}

impl std::fmt::Display for BlockRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}+{}", self.piece, self.offset, self.length)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct PieceMessage {
    pub piece: u32,
    pub offset: u32,
    pub data: Bytes,
}

impl PieceMessage {
    pub fn request(&self) -> BlockRequest {
        BlockRequest::new(self.piece, self.offset, self.data.len() as u32)
    }
}

impl std::fmt::Debug for PieceMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Piece({})", self.request())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: Id20,
    pub peer_id: Id20,
    pub supports_fast_peer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request(BlockRequest),
    Piece(PieceMessage),
    Cancel(BlockRequest),
    // BEP 6
    HaveAll,
    HaveNone,
    Suggest(u32),
    Reject(BlockRequest),
    AllowedFast(u32),
}

impl Message {
    /// Control messages that may jump ahead of queued data.
    pub fn is_priority(&self) -> bool {
        matches!(self, Message::Choke | Message::Unchoke | Message::Cancel(_))
    }
}
