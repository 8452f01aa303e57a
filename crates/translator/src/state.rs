//! Fixed function state: viewport, scissor, blend factor and stencil reference.
use bitos::integer::UnsignedInt;
use glam::Vec3;
use xenos::RegisterFile;
use xenos::reg::{
    PaClVteCntl, PaScWindowOffset, PaScWindowScissorBr, PaScWindowScissorTl, PaSuScModeCntl,
    RbDepthControl, RbStencilRefMask, Reg,
};

use crate::host::{Command, CommandList, Rect, Viewport};

/// Size of the guest's largest render target, in pixels, along either axis.
pub const MAX_VIEWPORT_SIZE: f32 = 8192.0;

/// Host viewport of a draw, and how vertex shader output maps into it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportInfo {
    pub viewport: Viewport,
    pub ndc_scale: Vec3,
    pub ndc_offset: Vec3,
}

/// Start, size, NDC scale and NDC offset of an XY axis.
fn viewport_axis(scale: Option<f32>, offset: Option<f32>, window: f32) -> (f32, f32, f32, f32) {
    let offset = offset.unwrap_or(0.0) + window;
    match scale {
        Some(scale) if scale != 0.0 => {
            let half = scale.abs();
            (offset - half, half * 2.0, scale.signum(), 0.0)
        }
        // vertices are already in pixels
        _ => (
            0.0,
            MAX_VIEWPORT_SIZE,
            2.0 / MAX_VIEWPORT_SIZE,
            offset * 2.0 / MAX_VIEWPORT_SIZE - 1.0,
        ),
    }
}

pub fn viewport_info(regs: &RegisterFile) -> ViewportInfo {
    let vte = regs.view::<PaClVteCntl>();
    let mode = regs.view::<PaSuScModeCntl>();

    let (window_x, window_y) = if mode.vtx_window_offset_enable() {
        regs.view::<PaScWindowOffset>().offsets()
    } else {
        (0, 0)
    };

    let enabled = |enabled: bool, reg: Reg| enabled.then(|| regs.float(reg));
    let (x, width, scale_x, offset_x) = viewport_axis(
        enabled(vte.vport_x_scale_ena(), Reg::PaClVportXScale),
        enabled(vte.vport_x_offset_ena(), Reg::PaClVportXOffset),
        window_x as f32,
    );
    let (y, height, scale_y, offset_y) = viewport_axis(
        enabled(vte.vport_y_scale_ena(), Reg::PaClVportYScale),
        enabled(vte.vport_y_offset_ena(), Reg::PaClVportYOffset),
        window_y as f32,
    );

    let z_scale = enabled(vte.vport_z_scale_ena(), Reg::PaClVportZScale);
    let z_offset = enabled(vte.vport_z_offset_ena(), Reg::PaClVportZOffset).unwrap_or(0.0);
    let (min_depth, max_depth, scale_z, offset_z) = match z_scale {
        Some(scale) if scale < 0.0 => (z_offset + scale, z_offset, -1.0, 1.0),
        Some(scale) => (z_offset, z_offset + scale, 1.0, 0.0),
        None => (0.0, 1.0, 1.0, 0.0),
    };

    ViewportInfo {
        viewport: Viewport {
            x,
            y,
            width,
            height,
            min_depth: min_depth.clamp(0.0, 1.0),
            max_depth: max_depth.clamp(0.0, 1.0),
        },
        ndc_scale: Vec3::new(scale_x, scale_y, scale_z),
        ndc_offset: Vec3::new(offset_x, offset_y, offset_z),
    }
}

pub fn scissor(regs: &RegisterFile) -> Rect {
    let tl = regs.view::<PaScWindowScissorTl>();
    let br = regs.view::<PaScWindowScissorBr>();

    let mut rect = Rect {
        left: tl.tl_x().value() as i32,
        top: tl.tl_y().value() as i32,
        right: br.br_x().value() as i32,
        bottom: br.br_y().value() as i32,
    };

    if !tl.window_offset_disable() {
        let (x, y) = regs.view::<PaScWindowOffset>().offsets();
        rect.left += x;
        rect.right += x;
        rect.top += y;
        rect.bottom += y;
    }

    rect.left = rect.left.max(0);
    rect.top = rect.top.max(0);
    rect.right = rect.right.max(rect.left);
    rect.bottom = rect.bottom.max(rect.top);
    rect
}

pub fn blend_factor(regs: &RegisterFile) -> [f32; 4] {
    [
        regs.float(Reg::RbBlendRed),
        regs.float(Reg::RbBlendGreen),
        regs.float(Reg::RbBlendBlue),
        regs.float(Reg::RbBlendAlpha),
    ]
}

/// Last fixed function state set in the open submission.
#[derive(Debug, Default)]
pub struct FixedFunction {
    viewport: Option<Viewport>,
    scissor: Option<Rect>,
    blend_factor: Option<[f32; 4]>,
    stencil_ref: Option<u32>,
}

impl FixedFunction {
    /// Forgets everything. A new command list starts with undefined state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn set_viewport(&mut self, commands: &mut CommandList, viewport: Viewport) -> bool {
        if self.viewport == Some(viewport) {
            return false;
        }

        self.viewport = Some(viewport);
        commands.push(Command::SetViewport(viewport));
        true
    }

    pub fn set_scissor(&mut self, commands: &mut CommandList, scissor: Rect) -> bool {
        if self.scissor == Some(scissor) {
            return false;
        }

        self.scissor = Some(scissor);
        commands.push(Command::SetScissor(scissor));
        true
    }

    pub fn set_blend_factor(&mut self, commands: &mut CommandList, factor: [f32; 4]) -> bool {
        // bitwise, so that NaNs don't keep the command coming
        if self
            .blend_factor
            .is_some_and(|current| current.map(f32::to_bits) == factor.map(f32::to_bits))
        {
            return false;
        }

        self.blend_factor = Some(factor);
        commands.push(Command::SetBlendFactor(factor));
        true
    }

    pub fn set_stencil_ref(&mut self, commands: &mut CommandList, reference: u32) -> bool {
        if self.stencil_ref == Some(reference) {
            return false;
        }

        self.stencil_ref = Some(reference);
        commands.push(Command::SetStencilRef(reference));
        true
    }

    /// Sets all of the fixed function state of a draw.
    pub fn update(&mut self, commands: &mut CommandList, regs: &RegisterFile, viewport: Viewport) {
        self.set_viewport(commands, viewport);
        self.set_scissor(commands, scissor(regs));
        self.set_blend_factor(commands, blend_factor(regs));

        if regs.view::<RbDepthControl>().stencil_enable() {
            let reference = regs.view::<RbStencilRefMask>().stencilref();
            self.set_stencil_ref(commands, u32::from(reference));
        }
    }
}
