//! Collaborator interfaces.
//!
//! Shader translation, primitive processing, shared memory management, texture decoding and
//! render target management live outside of the command processor. It only talks to them
//! through the traits in this module.
use std::sync::Arc;

use xenos::RegisterFile;
use xenos::primitive::{Endian, IndexBufferInfo, IndexFormat, PrimitiveType, TessellationMode};
use xenos::reg::{ColorRenderTargetFormat, DepthRenderTargetFormat};
use xenos::shader::{SamplerBinding, Shader, ShaderStage, TextureBinding};

use crate::barrier::Barriers;
use crate::host::{
    Command, Device, GpuAddress, HostError, Pipeline, Resource, ResourceState, RootLayout, View,
};
use crate::readback::ScratchBuffer;
use crate::submission::Submissions;

/// Everything a collaborator needs to record work into the open submission.
pub struct Recorder<'a> {
    pub device: &'a mut dyn Device,
    pub submissions: &'a mut Submissions,
    pub barriers: &'a mut Barriers,
    pub scratch: &'a mut ScratchBuffer,
}

impl Recorder<'_> {
    #[inline(always)]
    pub fn push(&mut self, command: Command) {
        self.submissions.commands().push(command);
    }

    /// Index of the submission being recorded.
    #[inline(always)]
    pub fn submission(&self) -> u64 {
        self.submissions.current()
    }

    #[inline(always)]
    pub fn frame(&self) -> u64 {
        self.submissions.frame_current()
    }

    /// Records the pending barriers. Must be called before any command depending on them.
    pub fn flush_barriers(&mut self) -> bool {
        self.barriers.submit(self.submissions.commands())
    }

    /// See [`ScratchBuffer::acquire`].
    pub fn acquire_scratch(
        &mut self,
        size: u64,
        state: ResourceState,
    ) -> Result<Resource, HostError> {
        self.scratch
            .acquire(self.device, self.submissions, self.barriers, size, state)
    }

    pub fn release_scratch(&mut self, state: ResourceState) {
        self.scratch.release(self.barriers, state);
    }
}

/// Render target formats bound for a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderTargets {
    pub color: [Option<ColorRenderTargetFormat>; 4],
    pub depth: Option<DepthRenderTargetFormat>,
}

/// The pipeline state of a draw, as seen by the pipeline cache.
pub struct PipelineRequest<'a> {
    pub regs: &'a RegisterFile,
    pub vertex: &'a Shader,
    pub pixel: Option<&'a Shader>,
    pub primitive: PrimitiveType,
    pub tessellation: Option<TessellationMode>,
    /// Color write mask, four bits per render target.
    pub color_mask: u32,
    pub render_targets: &'a RenderTargets,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineBinding {
    pub pipeline: Pipeline,
    pub layout: RootLayout,
}

/// Shader translation and pipeline creation.
pub trait PipelineModule {
    /// Translates (or fetches from the cache) the shader at `guest_address`.
    fn load_shader(&mut self, stage: ShaderStage, guest_address: u32, ucode: &[u32])
    -> Arc<Shader>;

    /// Obtains a pipeline for the given state. `None` aborts the draw.
    fn configure(&mut self, request: &PipelineRequest) -> Option<PipelineBinding>;
}

/// The draw as the guest described it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawInputs {
    pub primitive: PrimitiveType,
    pub index_count: u32,
    /// `None` for auto-indexed draws.
    pub index_buffer: Option<IndexBufferInfo>,
    pub major_mode_explicit: bool,
}

/// Where the indices of a processed draw come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSource {
    /// Not indexed.
    None,
    /// Indices read directly from guest memory.
    Guest {
        address: u32,
        size: u32,
        format: IndexFormat,
    },
    /// Indices converted by the primitive processor into one of its buffers.
    HostConverted {
        address: GpuAddress,
        size: u32,
        format: IndexFormat,
    },
    /// One of the primitive processor's constant index buffers.
    HostBuiltin {
        address: GpuAddress,
        size: u32,
        format: IndexFormat,
    },
}

/// Result of primitive processing, valid for a single draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimitiveResult {
    /// Primitive type to draw on the host, after any conversion.
    pub host_primitive: PrimitiveType,
    pub tessellation: Option<TessellationMode>,
    /// Number of vertices or indices to draw.
    pub count: u32,
    pub index_source: IndexSource,
    /// Endianness of indices the vertex shader fetches itself.
    pub index_endian: Endian,
}

/// Guest primitive to host primitive conversion.
pub trait PrimitiveModule {
    fn process(
        &mut self,
        rec: &mut Recorder,
        regs: &RegisterFile,
        inputs: &DrawInputs,
    ) -> Option<PrimitiveResult>;

    fn begin_submission(&mut self) {}

    fn begin_frame(&mut self) {}

    fn end_frame(&mut self) {}

    fn submission_completed(&mut self, completed: u64) {
        let _ = completed;
    }
}

/// The host buffer mirroring guest memory.
pub trait MemoryModule {
    fn buffer(&self) -> Resource;

    /// Makes `[address, address + length)` up to date in the buffer. `false` aborts the draw.
    fn request_range(&mut self, rec: &mut Recorder, address: u32, length: u32) -> bool;

    /// The GPU wrote to `[address, address + length)`, host copies of it are stale.
    fn range_written_by_gpu(&mut self, address: u32, length: u32, is_resolve: bool);

    /// Writes guest memory directly from the CPU side.
    fn write_guest(&mut self, address: u32, data: &[u8]);

    /// The guest flushed `[base, base + size)` for the GPU.
    fn make_coherent(&mut self, base: u32, size: u32) {
        let _ = (base, size);
    }

    fn use_for_reading(&mut self, barriers: &mut Barriers) {
        barriers.transition(self.buffer(), ResourceState::ShaderAndIndexRead);
    }

    /// Consecutive writes need an ordering barrier between them.
    fn use_for_writing(&mut self, barriers: &mut Barriers) {
        let buffer = self.buffer();
        if !barriers.transition(buffer, ResourceState::UnorderedAccess) {
            barriers.push_uav(Some(buffer));
        }
    }

    fn use_as_copy_source(&mut self, barriers: &mut Barriers) {
        barriers.transition(self.buffer(), ResourceState::CopySource);
    }
}

/// A texture as bound to a shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureView {
    /// Identifies the view, equal keys mean equal views.
    pub key: u64,
    pub view: View,
}

/// Texture loading and sampler state.
pub trait TextureModule {
    fn fetch_constant_written(&mut self, slot: u8) {
        let _ = slot;
    }

    /// Loads every texture used by the bound shaders and moves them to a shader readable state.
    /// Masks have one bit per fetch constant slot.
    fn request_textures(
        &mut self,
        rec: &mut Recorder,
        regs: &RegisterFile,
        vertex_mask: u32,
        pixel_mask: u32,
    );

    fn view(&mut self, regs: &RegisterFile, binding: &TextureBinding) -> TextureView;

    /// Packed sampler parameters for `binding`.
    fn sampler(&mut self, regs: &RegisterFile, binding: &SamplerBinding) -> u64;

    fn begin_frame(&mut self) {}

    fn end_frame(&mut self) {}

    fn submission_completed(&mut self, completed: u64) {
        let _ = completed;
    }
}

/// Guest memory written by a resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub address: u32,
    pub length: u32,
}

/// EDRAM emulation.
pub trait RenderTargetModule {
    /// Binds the render targets for a draw. `None` aborts the draw.
    fn update(
        &mut self,
        rec: &mut Recorder,
        regs: &RegisterFile,
        rasterization_done: bool,
        color_mask: u32,
    ) -> Option<RenderTargets>;

    /// Resolves EDRAM into guest memory through the memory module's buffer. `None` if the
    /// resolve failed, `Some` with an empty range if nothing was written.
    fn resolve(
        &mut self,
        rec: &mut Recorder,
        regs: &RegisterFile,
        memory: &mut dyn MemoryModule,
    ) -> Option<Resolved>;
}

/// Collaborators of the command processor.
pub struct Modules {
    pub pipeline: Box<dyn PipelineModule>,
    pub primitive: Box<dyn PrimitiveModule>,
    pub memory: Box<dyn MemoryModule>,
    pub texture: Box<dyn TextureModule>,
    pub render_target: Box<dyn RenderTargetModule>,
}
