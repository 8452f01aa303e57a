//! Fetch constants and memory export streams.
use bitos::bitos;
use bitos::integer::{UnsignedInt, u6, u24, u30};

use crate::primitive::Endian;
use crate::reg::{FETCH_CONSTANTS, FLOAT_CONSTANTS};
use crate::regfile::RegisterFile;

#[bitos(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchConstantType {
    #[default]
    InvalidTexture = 0,
    InvalidVertex  = 1,
    Texture        = 2,
    Vertex         = 3,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VertexFetchWord0 {
    #[bits(0..2)]
    pub ty: FetchConstantType,
    /// Address, in dwords.
    #[bits(2..32)]
    pub address: u30,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VertexFetchWord1 {
    #[bits(0..2)]
    pub endian: Endian,
    /// Size, in dwords.
    #[bits(2..26)]
    pub size: u24,
}

/// A 2-dword vertex fetch constant. There are 96 of them, three per fetch constant slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexFetch {
    pub ty: FetchConstantType,
    pub endian: Endian,
    /// Guest address, in bytes.
    pub address: u32,
    /// Size, in bytes.
    pub size: u32,
}

impl VertexFetch {
    pub fn read(regs: &RegisterFile, index: u8) -> Self {
        debug_assert!(index < 96);

        let base = FETCH_CONSTANTS.start + u32::from(index) * 2;
        let word0 = VertexFetchWord0::from_bits(regs[base]);
        let word1 = VertexFetchWord1::from_bits(regs[base + 1]);

        Self {
            ty: word0.ty(),
            endian: word1.endian(),
            address: word0.address().value() << 2,
            size: word1.size().value() << 2,
        }
    }
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemexportWord0 {
    /// Base address, in dwords.
    #[bits(0..30)]
    pub base_address: u30,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemexportWord2 {
    #[bits(0..2)]
    pub endianness: Endian,
    #[bits(8..14)]
    pub format: u6,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemexportWord3 {
    #[bits(0..24)]
    pub index_count: u24,
}

/// A memory export stream descriptor, stored in a float constant slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemexportStream {
    /// Base address, in dwords.
    pub base_dwords: u32,
    pub endianness: Endian,
    /// Raw color format of the exported elements.
    pub format: u8,
    pub index_count: u32,
}

impl MemexportStream {
    /// Reads the stream descriptor held by `slot` of the float constants (0..512).
    pub fn read(regs: &RegisterFile, slot: u32) -> Self {
        debug_assert!(slot < 512);

        let base = FLOAT_CONSTANTS.start + slot * 4;
        let word0 = MemexportWord0::from_bits(regs[base]);
        let word2 = MemexportWord2::from_bits(regs[base + 2]);
        let word3 = MemexportWord3::from_bits(regs[base + 3]);

        Self {
            base_dwords: word0.base_address().value(),
            endianness: word2.endianness(),
            format: word2.format().value(),
            index_count: word3.index_count().value(),
        }
    }

    /// Size of a single exported element, in dwords. `None` if the format can't be exported.
    pub fn element_dwords(&self) -> Option<u32> {
        Some(match self.format {
            // 8_8_8_8, 2_10_10_10, 10_11_11, 11_11_10, 16_16, 16_16_FLOAT, 32_FLOAT
            6 | 7 | 16 | 17 | 25 | 31 | 36 => 1,
            // 16_16_16_16, 16_16_16_16_FLOAT, 32_32_FLOAT
            26 | 32 | 37 => 2,
            // 32_32_32_32_FLOAT
            38 => 4,
            _ => return None,
        })
    }

    /// Size of the whole stream, in dwords.
    pub fn size_dwords(&self) -> Option<u32> {
        self.element_dwords().map(|dwords| dwords * self.index_count)
    }
}

/// A range of guest memory written by memory export, in dwords.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemexportRange {
    pub base_dwords: u32,
    pub size_dwords: u32,
}

impl MemexportRange {
    pub fn address(&self) -> u32 {
        self.base_dwords << 2
    }

    pub fn length(&self) -> u32 {
        self.size_dwords << 2
    }
}

/// Adds a stream to a list of exported ranges. Streams sharing a base address are merged into
/// the larger of the two.
pub fn add_memexport_range(ranges: &mut Vec<MemexportRange>, range: MemexportRange) {
    match ranges
        .iter_mut()
        .find(|existing| existing.base_dwords == range.base_dwords)
    {
        Some(existing) => existing.size_dwords = existing.size_dwords.max(range.size_dwords),
        None => ranges.push(range),
    }
}
