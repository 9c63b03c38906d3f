use std::path::PathBuf;

use piecework_core::{
    Id20, Id32,
    lengths::{Lengths, ValidPieceIndex},
};
use serde::{Deserialize, Serialize};

/// Download priority of a file. Higher values are fetched first.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    DoNotDownload,
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
    Immediate,
}

/// One file of the torrent, in torrent byte order.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub relative_path: PathBuf,
    pub length: u64,
    pub offset_in_torrent: u64,
    pub start_piece: u32,
    /// Inclusive.
    pub end_piece: u32,
}

impl FileInfo {
    pub fn piece_range(&self) -> std::ops::RangeInclusive<u32> {
        self.start_piece..=self.end_piece
    }
}

/// Expected piece hashes. Hybrid torrents carry both.
#[derive(Debug, Clone, Default)]
pub struct PieceHashes {
    pub v1: Option<Vec<Id20>>,
    pub v2: Option<Vec<Id32>>,
}

/// Hash computed for a piece by the disk layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PieceHash {
    pub v1: Option<Id20>,
    pub v2: Option<Id32>,
}

/// Read-only torrent metadata needed by the engine core.
#[derive(Debug)]
pub struct TorrentInfo {
    pub info_hash: Id20,
    pub name: String,
    pub lengths: Lengths,
    pub files: Vec<FileInfo>,
    pub hashes: PieceHashes,
}

impl TorrentInfo {
    pub fn new(
        info_hash: Id20,
        name: impl Into<String>,
        piece_length: u32,
        files: impl IntoIterator<Item = (PathBuf, u64)>,
        hashes: PieceHashes,
    ) -> crate::Result<Self> {
        let mut offset = 0u64;
        let mut raw = Vec::new();
        for (relative_path, length) in files {
            raw.push((relative_path, length, offset));
            offset += length;
        }
        let lengths = Lengths::new(offset, piece_length)?;
        let files = raw
            .into_iter()
            .map(|(relative_path, length, offset_in_torrent)| {
                let pieces = lengths.pieces_for_byte_range(offset_in_torrent, length);
                FileInfo {
                    relative_path,
                    length,
                    offset_in_torrent,
                    start_piece: *pieces.start(),
                    end_piece: *pieces.end(),
                }
            })
            .collect();
        Ok(Self {
            info_hash,
            name: name.into(),
            lengths,
            files,
            hashes,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.lengths.total_pieces() as usize
    }

    pub fn piece_length(&self, index: ValidPieceIndex) -> u32 {
        self.lengths.piece_length(index)
    }

    pub fn has_v1_hashes(&self) -> bool {
        self.hashes.v1.is_some()
    }

    pub fn has_v2_hashes(&self) -> bool {
        self.hashes.v2.is_some()
    }

    /// Checks every hash kind the torrent carries. A kind the torrent has
    /// but the computed hash lacks is a failure.
    pub fn verify_piece(&self, index: ValidPieceIndex, hash: &PieceHash) -> bool {
        let idx = index.get() as usize;
        if !self.has_v1_hashes() && !self.has_v2_hashes() {
            return false;
        }
        if let Some(v1) = &self.hashes.v1 {
            if v1.get(idx).copied() != hash.v1 || hash.v1.is_none() {
                return false;
            }
        }
        if let Some(v2) = &self.hashes.v2 {
            if v2.get(idx).copied() != hash.v2 || hash.v2.is_none() {
                return false;
            }
        }
        true
    }

    /// Files overlapping the given inclusive piece range.
    pub fn files_for_pieces(
        &self,
        start: u32,
        end: u32,
    ) -> impl Iterator<Item = (usize, &FileInfo)> + '_ {
        self.files
            .iter()
            .enumerate()
            .filter(move |(_, f)| f.length > 0 && f.start_piece <= end && f.end_piece >= start)
    }
}
