//! Shadow register file.
use std::ops::{Index, IndexMut, Range};

use crate::reg::{REGISTER_COUNT, Reg, Register};

/// The translator's mirror of the guest GPU register bank.
pub struct RegisterFile {
    values: Box<[u32]>,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            values: vec![0; REGISTER_COUNT].into_boxed_slice(),
        }
    }
}

impl std::fmt::Debug for RegisterFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterFile").finish_non_exhaustive()
    }
}

impl RegisterFile {
    #[inline(always)]
    pub fn get(&self, reg: Reg) -> u32 {
        self.values[reg.index() as usize]
    }

    #[inline(always)]
    pub fn set(&mut self, reg: Reg, value: u32) {
        self.values[reg.index() as usize] = value;
    }

    #[inline(always)]
    pub fn float(&self, reg: Reg) -> f32 {
        f32::from_bits(self.get(reg))
    }

    /// Reads a register through its typed view.
    #[inline(always)]
    pub fn view<R: Register>(&self) -> R {
        R::from_value(self.get(R::REG))
    }

    /// Reads `reg` through the view of another register sharing its layout.
    #[inline(always)]
    pub fn view_at<R: Register>(&self, reg: Reg) -> R {
        R::from_value(self.get(reg))
    }

    #[inline(always)]
    pub fn range(&self, range: Range<u32>) -> &[u32] {
        &self.values[range.start as usize..range.end as usize]
    }

    #[inline(always)]
    pub(crate) fn range_mut(&mut self, range: Range<u32>) -> &mut [u32] {
        &mut self.values[range.start as usize..range.end as usize]
    }
}

impl Index<u32> for RegisterFile {
    type Output = u32;

    #[inline(always)]
    fn index(&self, index: u32) -> &Self::Output {
        &self.values[index as usize]
    }
}

impl IndexMut<u32> for RegisterFile {
    #[inline(always)]
    fn index_mut(&mut self, index: u32) -> &mut Self::Output {
        &mut self.values[index as usize]
    }
}
