//! Guest GPU register map.
//!
//! The register file is a flat array of 64Ki dwords. Most of it is plain state that is only
//! read when a draw is translated, but a few index ranges (shader constants) and a handful of
//! scalar registers need to be tracked or have immediate side effects when written.
use std::ops::Range;

use bitos::integer::{UnsignedInt, u2, u3, u6, u10, u11, u14, u15};
use bitos::bitos;
use static_assertions::const_assert_eq;
use strum::FromRepr;

use crate::primitive::{Endian, IndexFormat, MajorMode, PrimitiveType, TessellationMode};

/// Number of dwords in the register file.
pub const REGISTER_COUNT: usize = 0x10000;

/// ALU (float) constants. Slots 0..256 belong to the vertex stage, 256..512 to the pixel stage,
/// four dwords each.
pub const FLOAT_CONSTANTS: Range<u32> = 0x4000..0x4800;
/// Fetch constants: 32 slots of 6 dwords. A slot holds either one texture fetch constant or
/// three 2-dword vertex fetch constants.
pub const FETCH_CONSTANTS: Range<u32> = 0x4800..0x48C0;
/// Boolean constants, 256 bits packed in 8 dwords.
pub const BOOL_CONSTANTS: Range<u32> = 0x4900..0x4908;
/// Loop constants, one dword each.
pub const LOOP_CONSTANTS: Range<u32> = 0x4908..0x4928;
/// Boolean and loop constants, uploaded together.
pub const BOOL_LOOP_CONSTANTS: Range<u32> = BOOL_CONSTANTS.start..LOOP_CONSTANTS.end;

/// Scratch registers mirrored to guest memory.
pub const SCRATCH_REGISTERS: Range<u32> = 0x0578..0x0580;
/// Gamma ramp (display controller LUT) registers.
pub const GAMMA_REGISTERS: Range<u32> = 0x1923..0x192A;

/// Number of float constant slots per stage.
pub const FLOAT_CONSTANTS_PER_STAGE: u32 = 256;
/// Number of 6-dword fetch constant slots.
pub const FETCH_SLOTS: u32 = 32;
/// Dwords per fetch constant slot.
pub const FETCH_SLOT_DWORDS: u32 = 6;

const_assert_eq!(
    FETCH_CONSTANTS.end - FETCH_CONSTANTS.start,
    FETCH_SLOTS * FETCH_SLOT_DWORDS
);
const_assert_eq!(
    FLOAT_CONSTANTS.end - FLOAT_CONSTANTS.start,
    FLOAT_CONSTANTS_PER_STAGE * 2 * 4
);

/// A named guest GPU register.
#[rustfmt::skip]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr)]
#[repr(u16)]
pub enum Reg {
    ScratchUmsk             = 0x01DC,
    ScratchAddr             = 0x01DD,

    ScratchReg0             = 0x0578,
    ScratchReg1             = 0x0579,
    ScratchReg2             = 0x057A,
    ScratchReg3             = 0x057B,
    ScratchReg4             = 0x057C,
    ScratchReg5             = 0x057D,
    ScratchReg6             = 0x057E,
    ScratchReg7             = 0x057F,

    CoherSizeHost           = 0x0A2F,
    CoherBaseHost           = 0x0A30,
    CoherStatusHost         = 0x0A31,

    DcLutRwMode             = 0x1923,
    DcLutRwIndex            = 0x1924,
    DcLutSeqColor           = 0x1925,
    DcLutPwlData            = 0x1926,
    DcLut30Color            = 0x1927,
    DcLutLutaControl        = 0x1928,
    DcLutWriteEnMask        = 0x1929,

    RbSurfaceInfo           = 0x2000,
    RbColorInfo             = 0x2001,
    RbDepthInfo             = 0x2002,
    RbColor1Info            = 0x2003,
    RbColor2Info            = 0x2004,
    RbColor3Info            = 0x2005,

    PaScWindowOffset        = 0x2080,
    PaScWindowScissorTl     = 0x2081,
    PaScWindowScissorBr     = 0x2082,

    VgtMaxVtxIndx           = 0x2100,
    VgtMinVtxIndx           = 0x2101,
    VgtIndxOffset           = 0x2102,
    VgtMultiPrimIbResetIndx = 0x2103,
    RbColorMask             = 0x2104,
    RbBlendRed              = 0x2105,
    RbBlendGreen            = 0x2106,
    RbBlendBlue             = 0x2107,
    RbBlendAlpha            = 0x2108,
    RbStencilRefMaskBf      = 0x210C,
    RbStencilRefMask        = 0x210D,
    RbAlphaRef              = 0x210E,
    PaClVportXScale         = 0x210F,
    PaClVportXOffset        = 0x2110,
    PaClVportYScale         = 0x2111,
    PaClVportYOffset        = 0x2112,
    PaClVportZScale         = 0x2113,
    PaClVportZOffset        = 0x2114,

    SqProgramCntl           = 0x2180,

    VgtDrawInitiator        = 0x21FC,

    RbDepthControl          = 0x2200,
    RbBlendControl0         = 0x2201,
    RbColorControl          = 0x2202,
    PaClClipCntl            = 0x2204,
    PaSuScModeCntl          = 0x2205,
    PaClVteCntl             = 0x2206,
    RbModeControl           = 0x2208,

    PaSuPointSize           = 0x2280,
    PaSuPointMinMax         = 0x2281,

    VgtHosCntl              = 0x2316,
    RbCopyControl           = 0x2318,
    RbCopyDestBase          = 0x2319,
    RbCopyDestPitch         = 0x231A,
    RbCopyDestInfo          = 0x231B,

    PaSuPolyOffsetFrontScale  = 0x2380,
    PaSuPolyOffsetFrontOffset = 0x2381,
    PaSuPolyOffsetBackScale   = 0x2382,
    PaSuPolyOffsetBackOffset  = 0x2383,
}

impl Reg {
    #[inline(always)]
    pub const fn index(self) -> u32 {
        self as u16 as u32
    }

    /// Whether writing this register has an immediate side effect beyond updating the shadow.
    pub fn is_special(self) -> bool {
        matches!(
            self,
            Self::ScratchReg0
                | Self::ScratchReg1
                | Self::ScratchReg2
                | Self::ScratchReg3
                | Self::ScratchReg4
                | Self::ScratchReg5
                | Self::ScratchReg6
                | Self::ScratchReg7
                | Self::CoherStatusHost
                | Self::DcLutRwIndex
                | Self::DcLutSeqColor
                | Self::DcLutPwlData
                | Self::DcLut30Color
        )
    }

    /// The `RB_COLOR*_INFO` register of the given render target.
    pub fn color_info(rt: usize) -> Self {
        [
            Self::RbColorInfo,
            Self::RbColor1Info,
            Self::RbColor2Info,
            Self::RbColor3Info,
        ][rt]
    }
}

/// Whether any register in `range` has a write side effect.
#[inline(always)]
pub fn overlaps_special(range: &Range<u32>) -> bool {
    let overlaps = |other: Range<u32>| range.start < other.end && other.start < range.end;
    overlaps(SCRATCH_REGISTERS)
        || overlaps(GAMMA_REGISTERS)
        || range.contains(&Reg::CoherStatusHost.index())
}

/// A typed view of a single register.
pub trait Register: Copy {
    const REG: Reg;

    fn from_value(value: u32) -> Self;
}

macro_rules! register {
    ($($ty:ident => $reg:ident),* $(,)?) => {
        $(
            impl Register for $ty {
                const REG: Reg = Reg::$reg;

                #[inline(always)]
                fn from_value(value: u32) -> Self {
                    Self::from_bits(value)
                }
            }
        )*
    };
}

register! {
    VgtDrawInitiator => VgtDrawInitiator,
    VgtHosCntl => VgtHosCntl,
    RbModeControl => RbModeControl,
    RbSurfaceInfo => RbSurfaceInfo,
    RbColorInfo => RbColorInfo,
    RbDepthInfo => RbDepthInfo,
    RbColorControl => RbColorControl,
    RbDepthControl => RbDepthControl,
    RbStencilRefMask => RbStencilRefMask,
    PaSuScModeCntl => PaSuScModeCntl,
    PaClVteCntl => PaClVteCntl,
    PaScWindowOffset => PaScWindowOffset,
    PaScWindowScissorTl => PaScWindowScissorTl,
    PaScWindowScissorBr => PaScWindowScissorBr,
    PaSuPointSize => PaSuPointSize,
    PaSuPointMinMax => PaSuPointMinMax,
    CoherStatusHost => CoherStatusHost,
    DcLutRwIndex => DcLutRwIndex,
    DcLutPwlData => DcLutPwlData,
    DcLut30Color => DcLut30Color,
    RbCopyControl => RbCopyControl,
}

#[bitos(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceSelect {
    #[default]
    Dma          = 0,
    Immediate    = 1,
    AutoIndex    = 2,
    Reserved     = 3,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VgtDrawInitiator {
    #[bits(0..6)]
    pub prim_type: Option<PrimitiveType>,
    #[bits(6..8)]
    pub source_select: SourceSelect,
    #[bits(8..10)]
    pub major_mode: MajorMode,
    #[bits(11)]
    pub index_size: IndexFormat,
    #[bits(12)]
    pub not_eop: bool,
    #[bits(16..32)]
    pub num_indices: u16,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VgtHosCntl {
    #[bits(0..2)]
    pub tess_mode: Option<TessellationMode>,
}

/// How the render backend uses EDRAM for the current packet.
#[bitos(3)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModeControl {
    #[default]
    Ignore     = 0,
    Unused1    = 1,
    Unused2    = 2,
    Unused3    = 3,
    ColorDepth = 4,
    Depth      = 5,
    Copy       = 6,
    Unused7    = 7,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RbModeControl {
    #[bits(0..3)]
    pub edram_mode: ModeControl,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RbSurfaceInfo {
    /// Surface pitch, in pixels.
    #[bits(0..14)]
    pub surface_pitch: u14,
    /// Log2 of the sample count.
    #[bits(16..18)]
    pub msaa_samples: u2,
    #[bits(18..32)]
    pub hiz_pitch: u14,
}

/// Guest color render target formats.
#[bitos(4)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorRenderTargetFormat {
    K8888          = 0,
    K8888Gamma     = 1,
    K2101010       = 2,
    K2101010Float  = 3,
    K1616          = 4,
    K16161616      = 5,
    K1616Float     = 6,
    K16161616Float = 7,
    K2101010As10   = 10,
    K2101010FloatAs16 = 11,
    K32Float       = 14,
    K3232Float     = 15,
}

impl ColorRenderTargetFormat {
    /// Whether a pixel of this format occupies two dwords.
    pub fn is_64bpp(self) -> bool {
        matches!(
            self,
            Self::K16161616 | Self::K16161616Float | Self::K3232Float
        )
    }

    /// Bit width of each of the (up to) four components, in RGBA order.
    pub fn component_bits(self) -> [u32; 4] {
        match self {
            Self::K8888 | Self::K8888Gamma => [8, 8, 8, 8],
            Self::K2101010
            | Self::K2101010Float
            | Self::K2101010As10
            | Self::K2101010FloatAs16 => [10, 10, 10, 2],
            Self::K1616 | Self::K1616Float => [16, 16, 0, 0],
            Self::K16161616 | Self::K16161616Float => [16, 16, 16, 16],
            Self::K32Float => [32, 0, 0, 0],
            Self::K3232Float => [32, 32, 0, 0],
        }
    }
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RbColorInfo {
    /// Base, in EDRAM tiles.
    #[bits(0..11)]
    pub color_base: u11,
    #[bits(16..20)]
    pub color_format: Option<ColorRenderTargetFormat>,
    #[bits(20..26)]
    pub color_exp_bias: u6,
}

impl RbColorInfo {
    /// The signed color exponent bias.
    pub fn exp_bias(self) -> i32 {
        (i32::from(self.color_exp_bias().value()) << 26) >> 26
    }
}

#[bitos(1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DepthRenderTargetFormat {
    #[default]
    D24S8      = 0,
    D24FS8     = 1,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RbDepthInfo {
    /// Base, in EDRAM tiles.
    #[bits(0..11)]
    pub depth_base: u11,
    #[bits(16)]
    pub depth_format: DepthRenderTargetFormat,
}

#[bitos(3)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareFunction {
    #[default]
    Never        = 0,
    Less         = 1,
    Equal        = 2,
    LessEqual    = 3,
    Greater      = 4,
    NotEqual     = 5,
    GreaterEqual = 6,
    Always       = 7,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RbColorControl {
    #[bits(0..3)]
    pub alpha_func: CompareFunction,
    #[bits(3)]
    pub alpha_test_enable: bool,
    #[bits(4)]
    pub alpha_to_mask_enable: bool,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RbDepthControl {
    #[bits(0)]
    pub stencil_enable: bool,
    #[bits(1)]
    pub z_enable: bool,
    #[bits(2)]
    pub z_write_enable: bool,
    #[bits(4..7)]
    pub zfunc: CompareFunction,
    #[bits(7)]
    pub backface_enable: bool,
    #[bits(8..11)]
    pub stencilfunc: CompareFunction,
    #[bits(11..14)]
    pub stencilfail: u3,
    #[bits(14..17)]
    pub stencilzpass: u3,
    #[bits(17..20)]
    pub stencilzfail: u3,
    #[bits(20..23)]
    pub stencilfunc_bf: CompareFunction,
    #[bits(23..26)]
    pub stencilfail_bf: u3,
    #[bits(26..29)]
    pub stencilzpass_bf: u3,
    #[bits(29..32)]
    pub stencilzfail_bf: u3,
}

/// Also the layout of `RB_STENCILREFMASK_BF`.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RbStencilRefMask {
    #[bits(0..8)]
    pub stencilref: u8,
    #[bits(8..16)]
    pub stencilmask: u8,
    #[bits(16..24)]
    pub stencilwritemask: u8,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PaSuScModeCntl {
    #[bits(0)]
    pub cull_front: bool,
    #[bits(1)]
    pub cull_back: bool,
    #[bits(2)]
    pub face: bool,
    #[bits(3..5)]
    pub poly_mode: u2,
    #[bits(11)]
    pub poly_offset_front_enable: bool,
    #[bits(12)]
    pub poly_offset_back_enable: bool,
    #[bits(13)]
    pub poly_offset_para_enable: bool,
    #[bits(15)]
    pub msaa_enable: bool,
    #[bits(16)]
    pub vtx_window_offset_enable: bool,
    #[bits(19)]
    pub provoking_vtx_last: bool,
    #[bits(21)]
    pub multi_prim_ib_ena: bool,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PaClVteCntl {
    #[bits(0)]
    pub vport_x_scale_ena: bool,
    #[bits(1)]
    pub vport_x_offset_ena: bool,
    #[bits(2)]
    pub vport_y_scale_ena: bool,
    #[bits(3)]
    pub vport_y_offset_ena: bool,
    #[bits(4)]
    pub vport_z_scale_ena: bool,
    #[bits(5)]
    pub vport_z_offset_ena: bool,
    #[bits(8)]
    pub vtx_xy_fmt: bool,
    #[bits(9)]
    pub vtx_z_fmt: bool,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PaScWindowOffset {
    #[bits(0..15)]
    pub window_x_offset: u15,
    #[bits(16..31)]
    pub window_y_offset: u15,
}

impl PaScWindowOffset {
    /// The offsets as signed 15-bit values.
    pub fn offsets(self) -> (i32, i32) {
        let extend = |v: u15| (i32::from(v.value()) << 17) >> 17;
        (extend(self.window_x_offset()), extend(self.window_y_offset()))
    }
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PaScWindowScissorTl {
    #[bits(0..14)]
    pub tl_x: u14,
    #[bits(16..30)]
    pub tl_y: u14,
    #[bits(31)]
    pub window_offset_disable: bool,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PaScWindowScissorBr {
    #[bits(0..14)]
    pub br_x: u14,
    #[bits(16..30)]
    pub br_y: u14,
}

/// Point sprite size, 12.4 fixed point radius.
#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PaSuPointSize {
    #[bits(0..16)]
    pub height: u16,
    #[bits(16..32)]
    pub width: u16,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PaSuPointMinMax {
    #[bits(0..16)]
    pub min_size: u16,
    #[bits(16..32)]
    pub max_size: u16,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoherStatusHost {
    #[bits(0..8)]
    pub matching_contexts: u8,
    #[bits(31)]
    pub status: bool,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DcLutRwIndex {
    #[bits(0..8)]
    pub rw_index: u8,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DcLutPwlData {
    #[bits(0..16)]
    pub base: u16,
    #[bits(16..32)]
    pub delta: u16,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DcLut30Color {
    #[bits(0..10)]
    pub blue: u10,
    #[bits(10..20)]
    pub green: u10,
    #[bits(20..30)]
    pub red: u10,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RbCopyControl {
    /// Render target to copy from, 4 is depth.
    #[bits(0..3)]
    pub copy_src_select: u3,
    #[bits(4..7)]
    pub copy_sample_select: u3,
    #[bits(8)]
    pub color_clear_enable: bool,
    #[bits(9)]
    pub depth_clear_enable: bool,
    #[bits(20..22)]
    pub copy_command: u2,
}
