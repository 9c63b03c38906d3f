//! SHA-256 piece hashing for BitTorrent v2 (BEP 52).
//!
//! v2 pieces are verified as the root of a binary merkle tree over the
//! SHA-256 hashes of their 16 KiB blocks. The incremental hasher collects
//! leaf hashes as sequential writes arrive and reduces them with
//! [`piece_root`] once the piece is complete.

use crate::Id32;

/// Leaf size of the v2 merkle tree.
pub const MERKLE_BLOCK_SIZE: u32 = 16384;

/// Padding leaves beyond the end of the data are all-zero bytes, not SHA-256 of zeros.
pub fn zero_hash() -> Id32 {
    Id32::new([0u8; 32])
}

pub fn hash_block(data: &[u8]) -> Id32 {
    use sha1w::ISha256;
    let mut h = sha1w::Sha256::new();
    h.update(data);
    Id32::new(h.finish())
}

/// SHA-256(left || right).
pub fn hash_pair(left: &Id32, right: &Id32) -> Id32 {
    use sha1w::ISha256;
    let mut h = sha1w::Sha256::new();
    h.update(&left.0);
    h.update(&right.0);
    Id32::new(h.finish())
}

/// Root of the subtree over `block_hashes` padded with [`zero_hash`] up to
/// `leaf_count` leaves. Returns `None` when there are more hashes than leaves
/// or `leaf_count` is not a power of two.
pub fn piece_root(block_hashes: &[Id32], leaf_count: u32) -> Option<Id32> {
    let leaves = leaf_count as usize;
    if !leaves.is_power_of_two() || block_hashes.len() > leaves {
        return None;
    }

    let mut layer: Vec<Id32> = Vec::with_capacity(leaves);
    layer.extend_from_slice(block_hashes);
    layer.resize(leaves, zero_hash());

    while layer.len() > 1 {
        layer = layer
            .chunks_exact(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
    }
    layer.first().copied()
}

pub fn verify_piece(block_hashes: &[Id32], expected: &Id32, leaf_count: u32) -> bool {
    piece_root(block_hashes, leaf_count).is_some_and(|root| root == *expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_pair_order_matters() {
        let a = hash_block(b"left");
        let b = hash_block(b"right");
        assert_eq!(hash_pair(&a, &b), hash_pair(&a, &b));
        assert_ne!(hash_pair(&a, &b), hash_pair(&b, &a));
        assert_ne!(a, zero_hash());
    }

    #[test]
    fn test_single_leaf_root_is_leaf() {
        let data = vec![0xABu8; MERKLE_BLOCK_SIZE as usize];
        let h = hash_block(&data);
        assert_eq!(piece_root(&[h], 1), Some(h));
        assert!(!verify_piece(&[zero_hash()], &h, 1));
    }

    #[test]
    fn test_partial_piece_is_zero_padded() {
        let h1 = hash_block(b"block1");
        let h2 = hash_block(b"block2");
        let h3 = hash_block(b"block3");
        let z = zero_hash();

        let root = hash_pair(&hash_pair(&h1, &h2), &hash_pair(&h3, &z));
        assert!(verify_piece(&[h1, h2, h3], &root, 4));
        assert!(verify_piece(&[h1, h2, h3, z], &root, 4));
        assert!(!verify_piece(&[h2, h1, h3], &root, 4));
    }

    #[test]
    fn test_rejects_bad_leaf_count() {
        let h = hash_block(b"x");
        assert_eq!(piece_root(&[h, h, h], 2), None);
        assert_eq!(piece_root(&[h], 3), None);
    }
}
