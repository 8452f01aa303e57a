//! Live float constant maps.
use std::ops::Range;

use bitvec::array::BitArray;
use bitvec::order::Lsb0;

/// A set of the float constant slots (0..256) a shader stage reads.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstantMap(BitArray<[u64; 4], Lsb0>);

impl Default for ConstantMap {
    fn default() -> Self {
        Self(BitArray::new([0; 4]))
    }
}

impl std::fmt::Debug for ConstantMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl ConstantMap {
    pub fn from_words(words: [u64; 4]) -> Self {
        Self(BitArray::new(words))
    }

    #[inline(always)]
    pub fn include(&mut self, slot: u8) {
        self.0.set(slot as usize, true);
    }

    #[inline(always)]
    pub fn contains(&self, slot: u8) -> bool {
        self.0[slot as usize]
    }

    #[inline(always)]
    pub fn clear(&mut self) {
        self.0.fill(false);
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.0.not_any()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.0.count_ones()
    }

    #[inline(always)]
    pub fn words(&self) -> &[u64; 4] {
        &self.0.data
    }

    /// Slots in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.iter_ones().map(|slot| slot as u8)
    }

    /// Whether any slot in `slots` is live. Costs at most one mask test per 64-bit word, no
    /// matter how long the range is.
    #[inline]
    pub fn intersects(&self, slots: Range<u32>) -> bool {
        let start = slots.start.min(256);
        let end = slots.end.min(256);
        if start >= end {
            return false;
        }

        let first = (start / 64) as usize;
        let last = ((end - 1) / 64) as usize;
        let words = self.words();

        (first..=last).any(|word| {
            let lo = if word == first { start % 64 } else { 0 };
            let hi = if word == last { (end - 1) % 64 } else { 63 };
            let mask = (u64::MAX >> (63 - hi)) & (u64::MAX << lo);
            words[word] & mask != 0
        })
    }
}
