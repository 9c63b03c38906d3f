use crate::{
    constants::BLOCK_SIZE,
    error::{Error, Result},
};

const fn is_power_of_two(x: u64) -> bool {
    (x != 0) && ((x & (x - 1)) == 0)
}

pub const fn ceil_div_u64(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}

pub const fn last_element_size_u64(total: u64, element_size: u64) -> u64 {
    let rem = total % element_size;
    if rem == 0 {
        return element_size;
    }
    rem
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceInfo {
    pub piece_index: ValidPieceIndex,
    pub len: u32,
}

/// Position of one block inside the torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub piece_index: ValidPieceIndex,
    pub block_index: u32,
    pub absolute_index: u32,
    pub size: u32,
    pub offset: u32,
}

/// Piece and block arithmetic for one torrent. Every piece has the same
/// length except possibly the last one, and every block inside a piece is
/// `block_length` long except possibly the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lengths {
    block_length: u32,
    total_length: u64,
    piece_length: u32,
    last_piece_id: u32,
    last_piece_length: u32,
    max_blocks_per_piece: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidPieceIndex(u32);

impl std::fmt::Display for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl ValidPieceIndex {
    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl Lengths {
    pub fn new(total_length: u64, piece_length: u32) -> Result<Self> {
        Self::with_block_length(total_length, piece_length, BLOCK_SIZE)
    }

    pub fn with_block_length(total_length: u64, piece_length: u32, block_length: u32) -> Result<Self> {
        if !is_power_of_two(block_length as u64) {
            return Err(Error::BlockLengthNotPowerOfTwo(block_length));
        }
        if block_length > piece_length {
            return Err(Error::BlockLongerThanPiece {
                block_length,
                piece_length,
            });
        }
        if total_length == 0 {
            return Err(Error::ZeroLength);
        }
        let total_pieces = ceil_div_u64(total_length, piece_length as u64) as u32;
        Ok(Self {
            block_length,
            piece_length,
            total_length,
            max_blocks_per_piece: ceil_div_u64(piece_length as u64, block_length as u64) as u32,
            last_piece_id: total_pieces - 1,
            last_piece_length: last_element_size_u64(total_length, piece_length as u64) as u32,
        })
    }

    pub const fn piece_bitfield_bytes(&self) -> usize {
        ceil_div_u64(self.total_pieces() as u64, 8) as usize
    }
    pub const fn total_length(&self) -> u64 {
        self.total_length
    }
    pub const fn validate_piece_index(&self, index: u32) -> Option<ValidPieceIndex> {
        if index > self.last_piece_id {
            return None;
        }
        Some(ValidPieceIndex(index))
    }
    pub fn try_validate_piece_index(&self, index: u32) -> Result<ValidPieceIndex> {
        self.validate_piece_index(index)
            .ok_or(Error::InvalidPieceIndex(index))
    }
    pub const fn default_piece_length(&self) -> u32 {
        self.piece_length
    }
    pub const fn default_block_length(&self) -> u32 {
        self.block_length
    }
    pub const fn default_max_blocks_per_piece(&self) -> u32 {
        self.max_blocks_per_piece
    }
    pub const fn total_blocks(&self) -> u32 {
        // Blocks never straddle pieces, so only the last piece can be short.
        self.last_piece_id * self.max_blocks_per_piece
            + ceil_div_u64(self.last_piece_length as u64, self.block_length as u64) as u32
    }
    pub const fn last_piece_id(&self) -> ValidPieceIndex {
        ValidPieceIndex(self.last_piece_id)
    }
    pub const fn total_pieces(&self) -> u32 {
        self.last_piece_id + 1
    }
    pub const fn piece_length(&self, index: ValidPieceIndex) -> u32 {
        if index.0 == self.last_piece_id {
            return self.last_piece_length;
        }
        self.piece_length
    }
    pub const fn piece_offset(&self, index: ValidPieceIndex) -> u64 {
        index.0 as u64 * self.piece_length as u64
    }
    pub const fn block_absolute_offset(&self, block: &BlockInfo) -> u64 {
        self.piece_offset(block.piece_index) + block.offset as u64
    }

    /// Pieces overlapping the byte range `[offset, offset + len)`.
    pub fn pieces_for_byte_range(&self, offset: u64, len: u64) -> std::ops::RangeInclusive<u32> {
        let first = (offset / self.piece_length as u64) as u32;
        let last = if len == 0 {
            first
        } else {
            ((offset + len - 1) / self.piece_length as u64) as u32
        };
        first.min(self.last_piece_id)..=last.min(self.last_piece_id)
    }

    pub fn iter_piece_infos(&self) -> impl Iterator<Item = PieceInfo> + use<> {
        let last_id = self.last_piece_id;
        let last_len = self.last_piece_length;
        let pl = self.piece_length;
        (0..self.total_pieces()).map(move |idx| PieceInfo {
            piece_index: ValidPieceIndex(idx),
            len: if idx == last_id { last_len } else { pl },
        })
    }

    pub fn iter_block_infos(&self, index: ValidPieceIndex) -> impl Iterator<Item = BlockInfo> + use<> {
        let mut remaining = self.piece_length(index);
        let block_size = self.block_length;
        let absolute_offset = index.0 * self.max_blocks_per_piece;
        (0u32..).scan(0, move |offset, idx| {
            if remaining == 0 {
                return None;
            }
            let s = std::cmp::min(remaining, block_size);
            let result = BlockInfo {
                piece_index: index,
                block_index: idx,
                absolute_index: absolute_offset + idx,
                size: s,
                offset: *offset,
            };
            *offset += s;
            remaining -= s;
            Some(result)
        })
    }

    /// Validates an incoming `(piece, begin, length)` triple against the
    /// block grid. Anything not aligned to a whole block is rejected.
    pub fn block_info_from_received_data(
        &self,
        piece_index: ValidPieceIndex,
        begin: u32,
        block_size: u32,
    ) -> Option<BlockInfo> {
        let index = begin / self.block_length;
        let expected_block_size = self.block_size(piece_index, index)?;
        let offset = self.block_offset_in_piece(piece_index, index)?;
        if offset != begin {
            return None;
        }
        if expected_block_size != block_size {
            return None;
        }
        let absolute_index = self.max_blocks_per_piece * piece_index.get() + index;
        Some(BlockInfo {
            piece_index,
            block_index: index,
            size: block_size,
            offset,
            absolute_index,
        })
    }

    pub fn block_info_from_received_piece(
        &self,
        index: u32,
        begin: u32,
        block_len: u32,
    ) -> Option<BlockInfo> {
        self.block_info_from_received_data(self.validate_piece_index(index)?, begin, block_len)
    }

    pub const fn block_range(&self, index: ValidPieceIndex) -> std::ops::Range<usize> {
        let start = index.0 * self.max_blocks_per_piece;
        let end = start + self.blocks_per_piece(index);
        start as usize..end as usize
    }
    pub const fn blocks_per_piece(&self, index: ValidPieceIndex) -> u32 {
        if index.0 == self.last_piece_id {
            return self.last_piece_length.div_ceil(self.block_length);
        }
        self.max_blocks_per_piece
    }
    pub const fn block_offset_in_piece(
        &self,
        piece_index: ValidPieceIndex,
        block_index: u32,
    ) -> Option<u32> {
        if block_index >= self.blocks_per_piece(piece_index) {
            return None;
        }
        Some(block_index * self.block_length)
    }
    pub fn block_size(&self, piece_index: ValidPieceIndex, block_index: u32) -> Option<u32> {
        let blocks_per_piece = self.blocks_per_piece(piece_index);
        let pl = self.piece_length(piece_index);
        if block_index >= blocks_per_piece {
            return None;
        }
        let offset = block_index * self.block_length;
        Some(std::cmp::min(self.block_length, pl - offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_lengths() -> Lengths {
        Lengths::new(1174243328, 262144).unwrap()
    }

    #[test]
    fn test_total_pieces() {
        let l = make_lengths();
        assert_eq!(l.total_pieces(), 4480);
        let l = Lengths::new(4148166656, 2097152).unwrap();
        assert_eq!(l.total_pieces(), 1978);
    }

    #[test]
    fn test_piece_length() {
        let l = make_lengths();
        let p = l.validate_piece_index(4479).unwrap();

        assert_eq!(l.piece_length(l.validate_piece_index(0).unwrap()), 262144);
        assert_eq!(l.piece_length(p), 100352);
        assert!(l.validate_piece_index(4480).is_none());
    }

    #[test]
    fn test_blocks_in_piece() {
        let l = make_lengths();
        let p = l.validate_piece_index(4479).unwrap();

        assert_eq!(l.blocks_per_piece(l.validate_piece_index(0).unwrap()), 16);
        assert_eq!(l.blocks_per_piece(p), 7);
        assert_eq!(l.total_blocks(), 4479 * 16 + 7);
    }

    #[test]
    fn test_block_size() {
        let l = make_lengths();
        let p = l.validate_piece_index(4479).unwrap();

        assert_eq!(l.block_size(p, 0), Some(16384));
        assert_eq!(l.block_size(p, 6), Some(2048));
        assert_eq!(l.block_size(p, 7), None);
    }

    #[test]
    fn test_block_infos() {
        let l = make_lengths();
        let p = l.validate_piece_index(4479).unwrap();

        let mut it = l.iter_block_infos(p);
        let first = it.next().unwrap();
        let last = it.last().unwrap();

        assert_eq!(
            first,
            BlockInfo {
                piece_index: p,
                block_index: 0,
                absolute_index: 71664,
                size: 16384,
                offset: 0,
            }
        );

        assert_eq!(
            last,
            BlockInfo {
                piece_index: p,
                block_index: 6,
                absolute_index: 71670,
                size: 2048,
                offset: 98304,
            }
        );
    }

    #[test]
    fn test_received_data_must_be_block_aligned() {
        let l = Lengths::new(65536, 32768).unwrap();
        assert!(l.block_info_from_received_piece(0, 0, 16384).is_some());
        assert!(l.block_info_from_received_piece(0, 16384, 16384).is_some());
        assert!(l.block_info_from_received_piece(0, 100, 16384).is_none());
        assert!(l.block_info_from_received_piece(0, 0, 1000).is_none());
        assert!(l.block_info_from_received_piece(2, 0, 16384).is_none());
    }

    #[test]
    fn test_pieces_for_byte_range() {
        let l = Lengths::new(65536, 16384).unwrap();
        assert_eq!(l.pieces_for_byte_range(0, 16384), 0..=0);
        assert_eq!(l.pieces_for_byte_range(16000, 1000), 0..=1);
        assert_eq!(l.pieces_for_byte_range(60000, 100000), 3..=3);
    }

    #[test]
    fn test_invalid_lengths() {
        assert!(matches!(Lengths::new(0, 16384), Err(Error::ZeroLength)));
        assert!(matches!(
            Lengths::with_block_length(100, 16384, 1000),
            Err(Error::BlockLengthNotPowerOfTwo(1000))
        ));
        assert!(matches!(
            Lengths::new(100, 8192),
            Err(Error::BlockLongerThanPiece { .. })
        ));
    }
}
