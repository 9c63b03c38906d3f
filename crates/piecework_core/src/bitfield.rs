use bitvec::{order::Msb0, slice::BitSlice, vec::BitVec};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

type Bits = BitVec<u8, Msb0>;

/// Fixed-length bit vector, one bit per piece, in wire (MSB-first) order.
///
/// The number of set bits is cached, so `true_count`, `all_true` and
/// `all_false` are O(1).
#[derive(Clone, PartialEq, Eq, Default)]
pub struct BitField {
    bits: Bits,
    true_count: usize,
}

impl std::fmt::Debug for BitField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BitField({}/{} ", self.true_count, self.len())?;
        for bit in self.bits.iter().by_vals().take(64) {
            f.write_str(if bit { "1" } else { "0" })?;
        }
        if self.len() > 64 {
            f.write_str("..")?;
        }
        f.write_str(")")
    }
}

impl BitField {
    pub fn new(len: usize) -> Self {
        Self {
            bits: Bits::repeat(false, len),
            true_count: 0,
        }
    }

    pub fn new_all_true(len: usize) -> Self {
        let mut b = Self::new(len);
        b.set_all(true);
        b
    }

    /// Builds a bitfield from wire bytes. Trailing padding bits are ignored.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self> {
        let expected = len.div_ceil(8);
        if bytes.len() != expected {
            return Err(Error::BitfieldLength {
                len,
                expected,
                actual: bytes.len(),
            });
        }
        let mut bits = Bits::from_slice(bytes);
        bits.truncate(len);
        bits.set_uninitialized(false);
        let true_count = bits.count_ones();
        Ok(Self { bits, true_count })
    }

    pub fn from_indices(len: usize, indices: impl IntoIterator<Item = usize>) -> Self {
        let mut b = Self::new(len);
        for idx in indices {
            b.set(idx, true);
        }
        b
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn get(&self, index: usize) -> bool {
        self.bits.get(index).is_some_and(|b| *b)
    }

    /// Sets the bit and returns its previous value. Out of range indices are ignored.
    pub fn set(&mut self, index: usize, value: bool) -> bool {
        let Some(mut bit) = self.bits.get_mut(index) else {
            return false;
        };
        let prev = *bit;
        if prev != value {
            *bit = value;
            if value {
                self.true_count += 1;
            } else {
                self.true_count -= 1;
            }
        }
        prev
    }

    pub fn set_all(&mut self, value: bool) {
        self.bits.fill(value);
        self.bits.set_uninitialized(false);
        self.true_count = if value { self.len() } else { 0 };
    }

    /// Sets every bit in `start..=end`, clamped to the bitfield length.
    pub fn set_range(&mut self, start: usize, end: usize, value: bool) {
        if start >= self.len() || start > end {
            return;
        }
        let end = end.min(self.len() - 1);
        self.bits[start..=end].fill(value);
        self.true_count = self.bits.count_ones();
    }

    pub fn true_count(&self) -> usize {
        self.true_count
    }

    pub fn false_count(&self) -> usize {
        self.len() - self.true_count
    }

    pub fn all_true(&self) -> bool {
        self.true_count == self.len()
    }

    pub fn all_false(&self) -> bool {
        self.true_count == 0
    }

    /// First set bit in the inclusive range `start..=end`.
    pub fn first_true(&self, start: usize, end: usize) -> Option<usize> {
        let slice = self.clamped(start, end)?;
        slice.first_one().map(|idx| idx + start)
    }

    /// First unset bit in the inclusive range `start..=end`.
    pub fn first_false(&self, start: usize, end: usize) -> Option<usize> {
        let slice = self.clamped(start, end)?;
        slice.first_zero().map(|idx| idx + start)
    }

    /// Number of set bits in the inclusive range `start..=end`.
    pub fn count_range(&self, start: usize, end: usize) -> usize {
        self.clamped(start, end).map_or(0, |s| s.count_ones())
    }

    fn clamped(&self, start: usize, end: usize) -> Option<&BitSlice<u8, Msb0>> {
        if start >= self.len() || start > end {
            return None;
        }
        let end = end.min(self.len() - 1);
        Some(&self.bits[start..=end])
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    pub fn iter_zeros(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_zeros()
    }

    /// In-place `self AND other`.
    pub fn and(&mut self, other: &BitField) -> &mut Self {
        self.zip_bytes(other, |a, b| a & b)
    }

    /// In-place `self OR other`.
    pub fn or(&mut self, other: &BitField) -> &mut Self {
        self.zip_bytes(other, |a, b| a | b)
    }

    /// In-place `self AND NOT other`.
    pub fn nand(&mut self, other: &BitField) -> &mut Self {
        self.zip_bytes(other, |a, b| a & !b)
    }

    /// In-place bitwise NOT.
    pub fn not(&mut self) -> &mut Self {
        for byte in self.bits.as_raw_mut_slice() {
            *byte = !*byte;
        }
        self.bits.set_uninitialized(false);
        self.true_count = self.len() - self.true_count;
        self
    }

    fn zip_bytes(&mut self, other: &BitField, op: impl Fn(u8, u8) -> u8) -> &mut Self {
        debug_assert_eq!(self.len(), other.len());
        let other = other.bits.as_raw_slice();
        for (idx, byte) in self.bits.as_raw_mut_slice().iter_mut().enumerate() {
            *byte = op(*byte, other.get(idx).copied().unwrap_or(0));
        }
        self.bits.set_uninitialized(false);
        self.true_count = self.bits.count_ones();
        self
    }

    /// Wire representation, padding bits cleared.
    pub fn as_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }

    pub fn as_bitslice(&self) -> &BitSlice<u8, Msb0> {
        self.bits.as_bitslice()
    }
}

#[derive(Serialize, Deserialize)]
struct SerializedBitField {
    len: usize,
    bits: String,
}

impl Serialize for BitField {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        SerializedBitField {
            len: self.len(),
            bits: hex::encode(self.as_bytes()),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BitField {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;
        let s = SerializedBitField::deserialize(deserializer)?;
        let bytes = hex::decode(&s.bits).map_err(D::Error::custom)?;
        BitField::from_bytes(&bytes, s.len).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_true_count_tracks_sets() {
        let mut b = BitField::new(10);
        assert!(b.all_false());
        assert!(!b.set(3, true));
        assert!(b.set(3, true));
        b.set(9, true);
        assert_eq!(b.true_count(), 2);
        b.set(3, false);
        assert_eq!(b.true_count(), 1);
        b.set(100, true);
        assert_eq!(b.true_count(), 1);
        b.set_all(true);
        assert!(b.all_true());
        assert_eq!(b.as_bytes(), &[0xff, 0xc0]);
    }

    #[test]
    fn test_first_true_false() {
        let b = BitField::from_indices(20, [5, 6, 15]);
        assert_eq!(b.first_true(0, 19), Some(5));
        assert_eq!(b.first_true(7, 19), Some(15));
        assert_eq!(b.first_true(7, 14), None);
        assert_eq!(b.first_true(16, 100), None);
        assert_eq!(b.first_false(5, 19), Some(7));
        assert_eq!(b.count_range(0, 6), 2);
    }

    #[test]
    fn test_bitwise_ops() {
        let a = BitField::from_indices(12, [0, 1, 2, 10]);
        let b = BitField::from_indices(12, [1, 10, 11]);

        let mut and = a.clone();
        and.and(&b);
        assert_eq!(and.iter_ones().collect::<Vec<_>>(), vec![1, 10]);

        let mut or = a.clone();
        or.or(&b);
        assert_eq!(or.true_count(), 5);

        let mut nand = a.clone();
        nand.nand(&b);
        assert_eq!(nand.iter_ones().collect::<Vec<_>>(), vec![0, 2]);

        let mut not = a.clone();
        not.not();
        assert_eq!(not.true_count(), 8);
        assert!(!not.get(0));
        assert_eq!(not.as_bytes()[1] & 0x0f, 0);
    }

    #[test]
    fn test_from_bytes_masks_padding() {
        let b = BitField::from_bytes(&[0b1000_0000, 0xff], 10).unwrap();
        assert_eq!(b.true_count(), 3);
        assert_eq!(b.as_bytes(), &[0b1000_0000, 0b1100_0000]);
        assert!(BitField::from_bytes(&[0], 10).is_err());
    }

    #[test]
    fn test_serde() {
        let b = BitField::from_indices(13, [0, 7, 12]);
        let s = serde_json::to_string(&b).unwrap();
        let back: BitField = serde_json::from_str(&s).unwrap();
        assert_eq!(b, back);
        assert_eq!(back.true_count(), 3);
    }
}
