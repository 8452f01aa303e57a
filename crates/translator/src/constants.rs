//! Per-draw system constants.
use bitos::bitos;
use bitos::integer::UnsignedInt;
use glam::{Vec2, Vec3};
use static_assertions::const_assert_eq;
use xenos::RegisterFile;
use xenos::primitive::Endian;
use xenos::reg::{
    ColorRenderTargetFormat, CompareFunction, DepthRenderTargetFormat, PaSuPointMinMax,
    PaSuPointSize, PaSuScModeCntl, RbColorControl, RbColorInfo, RbDepthInfo, RbSurfaceInfo, Reg,
};
use zerocopy::{Immutable, IntoBytes};

use crate::modules::RenderTargets;
use crate::state::ViewportInfo;

/// Dwords per EDRAM tile.
const EDRAM_TILE_DWORDS: u32 = 80 * 16;
/// Width of an EDRAM tile, in 32bpp samples.
const EDRAM_TILE_WIDTH: u32 = 80;

#[bitos(32)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SystemFlags {
    /// Whether the shared memory is bound through its writable view.
    #[bits(0)]
    pub shared_memory_is_uav: bool,
    #[bits(1)]
    pub primitive_polygonal: bool,
    #[bits(2)]
    pub depth_float24: bool,
    #[bits(3)]
    pub edram_rov: bool,
    #[bits(4..7)]
    pub alpha_test: CompareFunction,
    #[bits(8..12)]
    pub color_rt_gamma: [bool; 4],
    #[bits(12..16)]
    pub color_rt_64bpp: [bool; 4],
}

/// Uniforms the translated shaders need besides the guest constants.
#[derive(Debug, Clone, Copy, PartialEq, Immutable, IntoBytes, Default)]
#[repr(C)]
pub struct SystemConstants {
    pub flags: SystemFlags,
    pub vertex_index_endian: u32,
    pub vertex_base_index: u32,
    pub alpha_test_reference: f32,

    pub ndc_scale: Vec3,
    pub vertex_index_min: u32,

    pub ndc_offset: Vec3,
    pub vertex_index_max: u32,

    pub point_size: Vec2,
    pub point_size_min_max: Vec2,

    pub point_screen_to_ndc: Vec2,
    /// Scale and offset.
    pub poly_offset_front: Vec2,

    pub poly_offset_back: Vec2,
    /// Front and back `RB_STENCILREFMASK`.
    pub stencil_ref_mask: [u32; 2],

    pub color_exp_bias: [f32; 4],

    /// Bits of each render target's pixels that must be preserved, two dwords per target.
    pub keep_mask: [u32; 8],

    // edram
    pub edram_pitch_tiles: u32,
    pub edram_depth_base_dwords: u32,
    pub _pad0: u32,
    pub _pad1: u32,
    pub edram_rt_base_dwords: [u32; 4],
    pub edram_rt_format: [u32; 4],
    pub edram_blend_factor: [f32; 4],
}

const_assert_eq!(size_of::<SystemConstants>() % 16, 0);

/// Draw state the system constants depend on, besides registers.
#[derive(Debug, Clone, Copy)]
pub struct SystemInputs<'a> {
    pub viewport: &'a ViewportInfo,
    pub render_targets: &'a RenderTargets,
    pub primitive_polygonal: bool,
    pub shared_memory_is_uav: bool,
    pub index_endian: Endian,
    /// Color write mask, four bits per render target.
    pub color_mask: u32,
    pub edram_rov: bool,
}

/// Bits of a pixel which a color write mask leaves untouched.
fn keep_mask(bits: [u32; 4], write_mask: u32) -> u64 {
    let mut keep = 0;
    let mut offset = 0;

    for (component, bits) in bits.into_iter().enumerate() {
        if bits == 0 {
            continue;
        }

        if write_mask & (1 << component) == 0 {
            keep |= ((1u64 << bits) - 1) << offset;
        }

        offset += bits;
    }

    keep
}

impl SystemConstants {
    pub fn compute(regs: &RegisterFile, inputs: &SystemInputs) -> Self {
        let mut flags = SystemFlags::default()
            .with_shared_memory_is_uav(inputs.shared_memory_is_uav)
            .with_primitive_polygonal(inputs.primitive_polygonal)
            .with_edram_rov(inputs.edram_rov);

        let depth = regs.view::<RbDepthInfo>();
        flags.set_depth_float24(depth.depth_format() == DepthRenderTargetFormat::D24FS8);

        let color_control = regs.view::<RbColorControl>();
        let alpha_test = if color_control.alpha_test_enable() {
            color_control.alpha_func()
        } else {
            CompareFunction::Always
        };
        flags.set_alpha_test(alpha_test);

        let viewport = inputs.viewport;
        let point_size = regs.view::<PaSuPointSize>();
        let point_min_max = regs.view::<PaSuPointMinMax>();
        // 12.4 fixed point radii
        let diameter = |value: u16| f32::from(value) * 0.125;

        let screen_to_ndc = |size: f32| if size > 0.0 { 2.0 / size } else { 0.0 };

        let mut constants = Self {
            vertex_index_endian: inputs.index_endian as u32,
            vertex_base_index: regs.get(Reg::VgtIndxOffset),
            alpha_test_reference: regs.float(Reg::RbAlphaRef),
            ndc_scale: viewport.ndc_scale,
            vertex_index_min: regs.get(Reg::VgtMinVtxIndx),
            ndc_offset: viewport.ndc_offset,
            vertex_index_max: regs.get(Reg::VgtMaxVtxIndx),
            point_size: Vec2::new(diameter(point_size.width()), diameter(point_size.height())),
            point_size_min_max: Vec2::new(
                diameter(point_min_max.min_size()),
                diameter(point_min_max.max_size()),
            ),
            point_screen_to_ndc: Vec2::new(
                screen_to_ndc(viewport.viewport.width),
                screen_to_ndc(viewport.viewport.height),
            ),
            stencil_ref_mask: [
                regs.get(Reg::RbStencilRefMask),
                regs.get(Reg::RbStencilRefMaskBf),
            ],
            ..Default::default()
        };

        if inputs.primitive_polygonal {
            let mode = regs.view::<PaSuScModeCntl>();
            if mode.poly_offset_front_enable() {
                constants.poly_offset_front = Vec2::new(
                    regs.float(Reg::PaSuPolyOffsetFrontScale),
                    regs.float(Reg::PaSuPolyOffsetFrontOffset),
                );
            }

            if mode.poly_offset_back_enable() {
                constants.poly_offset_back = Vec2::new(
                    regs.float(Reg::PaSuPolyOffsetBackScale),
                    regs.float(Reg::PaSuPolyOffsetBackOffset),
                );
            }
        }

        let mut gamma = [false; 4];
        let mut wide = [false; 4];
        for (rt, format) in inputs.render_targets.color.iter().enumerate() {
            let Some(format) = *format else {
                continue;
            };

            let info = regs.view_at::<RbColorInfo>(Reg::color_info(rt));
            constants.color_exp_bias[rt] = (info.exp_bias() as f32).exp2();

            gamma[rt] = format == ColorRenderTargetFormat::K8888Gamma;
            wide[rt] = format.is_64bpp();

            let keep = keep_mask(format.component_bits(), inputs.color_mask >> (rt * 4));
            constants.keep_mask[rt * 2] = keep as u32;
            constants.keep_mask[rt * 2 + 1] = (keep >> 32) as u32;

            if inputs.edram_rov {
                constants.edram_rt_base_dwords[rt] =
                    u32::from(info.color_base().value()) * EDRAM_TILE_DWORDS;
                constants.edram_rt_format[rt] = format as u32;
            }
        }
        flags.set_color_rt_gamma(gamma);
        flags.set_color_rt_64bpp(wide);

        if inputs.edram_rov {
            let surface = regs.view::<RbSurfaceInfo>();
            let samples_x = if surface.msaa_samples().value() >= 2 { 2 } else { 1 };
            constants.edram_pitch_tiles =
                (surface.surface_pitch().value() as u32 * samples_x).div_ceil(EDRAM_TILE_WIDTH);
            constants.edram_depth_base_dwords =
                u32::from(depth.depth_base().value()) * EDRAM_TILE_DWORDS;
            constants.edram_blend_factor = crate::state::blend_factor(regs);
        }

        constants.flags = flags;
        constants
    }

    /// Replaces the constants with `new`, returning whether anything changed.
    pub fn update(&mut self, new: &Self) -> bool {
        let changed = self
            .as_bytes()
            .iter()
            .zip(new.as_bytes())
            .fold(0, |acc, (a, b)| acc | (a ^ b));

        *self = *new;
        changed != 0
    }
}
