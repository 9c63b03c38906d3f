/// Size of a block, the unit of network request/response.
pub const BLOCK_SIZE: u32 = 16384;

/// Remaining unreceived blocks below which the endgame picker takes over.
pub const ENDGAME_THRESHOLD_BLOCKS: usize = 256;
