#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("torrent with 0 length is useless")]
    ZeroLength,
    #[error("block length {0} is not a power of 2")]
    BlockLengthNotPowerOfTwo(u32),
    #[error("block length {block_length} should be <= piece length {piece_length}")]
    BlockLongerThanPiece { block_length: u32, piece_length: u32 },
    #[error("invalid piece index {0}")]
    InvalidPieceIndex(u32),
    #[error("bitfield of {len} bits needs {expected} bytes, got {actual}")]
    BitfieldLength {
        len: usize,
        expected: usize,
        actual: usize,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
