use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use bytes::Bytes;
use piecework_core::Id20;
use rand::{RngCore, SeedableRng};
use sha1w::ISha1;
use tracing::trace;

use crate::{
    connection::{PeerWireReader, PeerWireWriter, memory::MemoryReader, memory::MemoryWriter},
    torrent_info::{PieceHashes, TorrentInfo},
    wire::{Handshake, Message, PieceMessage},
};

pub fn setup_test_logging() {
    if std::env::var("RUST_LOG").is_err() {
        unsafe { std::env::set_var("RUST_LOG", "debug,piecework=trace") };
    }
    let _ = tracing_subscriber::fmt::try_init();
}

pub fn random_data(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::SmallRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

/// A single-file torrent over random content, with v1 piece hashes.
pub fn torrent_with_data(piece_length: u32, len: usize, seed: u64) -> (Arc<TorrentInfo>, Arc<Vec<u8>>) {
    let data = random_data(len, seed);
    let hashes = data
        .chunks(piece_length as usize)
        .map(|piece| {
            let mut h = sha1w::Sha1::new();
            h.update(piece);
            Id20::new(h.finish())
        })
        .collect();
    let info = TorrentInfo::new(
        Id20::new([7; 20]),
        "test",
        piece_length,
        [(PathBuf::from("data.bin"), len as u64)],
        PieceHashes {
            v1: Some(hashes),
            v2: None,
        },
    )
    .unwrap();
    (Arc::new(info), Arc::new(data))
}

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

pub fn handshake(info_hash: Id20, supports_fast_peer: bool) -> Handshake {
    Handshake {
        info_hash,
        peer_id: Id20::new([9; 20]),
        supports_fast_peer,
    }
}

/// Plays a seeder on the remote end of a memory wire: announces every
/// piece, unchokes, and answers every request from `data`.
pub async fn serve_seeder(
    mut reader: MemoryReader,
    mut writer: MemoryWriter,
    data: Arc<Vec<u8>>,
    piece_length: u32,
) -> anyhow::Result<()> {
    writer.write_message(&Message::HaveAll).await?;
    writer.write_message(&Message::Unchoke).await?;
    loop {
        let message = reader.read_message().await?;
        let Message::Request(r) = message else {
            continue;
        };
        trace!(request = %r, "seeder serving");
        let start = r.piece as usize * piece_length as usize + r.offset as usize;
        let end = start + r.length as usize;
        writer
            .write_message(&Message::Piece(PieceMessage {
                piece: r.piece,
                offset: r.offset,
                data: Bytes::copy_from_slice(&data[start..end]),
            }))
            .await?;
    }
}
