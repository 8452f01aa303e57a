//! Draw and copy packet translation.
use easyerr::{Error, ResultExt};
use xenos::fetch::{
    FetchConstantType, MemexportRange, MemexportStream, VertexFetch, add_memexport_range,
};
use xenos::primitive::{IndexBufferInfo, PrimitiveType};
use xenos::reg::{ModeControl, PaSuScModeCntl, RbModeControl, Reg};
use xenos::{Group, Shader, ShaderStage};

use crate::binding::{BindError, BindRequest};
use crate::constants::{SystemConstants, SystemInputs};
use crate::host::{Command, Device, HostError};
use crate::modules::{DrawInputs, IndexSource, PipelineRequest};
use crate::processor::{BoundIndexBuffer, CommandProcessor, recorder};
use crate::readback::PendingReadback;
use crate::state;
use crate::submission::SubmitError;
use crate::topology::host_topology;

#[derive(Debug, Error)]
pub enum DrawError {
    #[error("graphics device lost")]
    DeviceLost,
    #[error("no vertex shader bound")]
    NoVertexShader,
    #[error("primitive processing failed")]
    Primitive,
    #[error("no pipeline available for the draw")]
    Pipeline,
    #[error("render targets could not be bound")]
    RenderTargets,
    #[error("vertex fetch constant {index} has type {ty:?}")]
    InvalidFetchConstant { index: u8, ty: FetchConstantType },
    #[error("vertex buffer at {address:08X} ({size} bytes) is unavailable")]
    VertexBuffer { address: u32, size: u32 },
    #[error("index buffer at {address:08X} ({size} bytes) is unavailable")]
    IndexBuffer { address: u32, size: u32 },
    #[error("memory export stream in constant {slot} has unsupported format {format}")]
    MemexportFormat { slot: u32, format: u8 },
    #[error("memory export range at {address:08X} ({length} bytes) is unavailable")]
    MemexportRange { address: u32, length: u32 },
    #[error("primitive type {primitive:?} has no host topology")]
    Topology { primitive: PrimitiveType },
    #[error("resolve failed")]
    Resolve,
    #[error(transparent)]
    Binding { source: BindError },
    #[error(transparent)]
    Submission { source: SubmitError },
    #[error(transparent)]
    Host { source: HostError },
}

impl DrawError {
    /// Whether the error means the device is gone, as opposed to a single skipped draw.
    pub fn is_device_lost(&self) -> bool {
        match self {
            Self::DeviceLost => true,
            Self::Binding {
                source:
                    BindError::Host {
                        source: HostError::DeviceLost,
                    },
            } => true,
            Self::Submission { source } => matches!(source, SubmitError::DeviceLost),
            Self::Host { source } => *source == HostError::DeviceLost,
            _ => false,
        }
    }
}

/// What happened to a draw packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawOutcome {
    Drawn,
    /// Nothing can be rasterized and there are no memory exports.
    Culled,
    /// Primitive processing produced nothing to draw.
    Empty,
    /// The packet was a resolve.
    Copied,
}

/// Color write mask of the render targets the pixel shader writes.
fn color_mask(mask: u32, pixel: Option<&Shader>) -> u32 {
    let written = u32::from(pixel.map_or(0, |shader| shader.info.color_targets_written));

    let mut result = 0;
    for rt in 0..4 {
        if written & (1 << rt) != 0 {
            result |= mask & (0xF << (rt * 4));
        }
    }

    result
}

/// Guest memory ranges written by the memory exports of the given shaders.
fn memexport_ranges(
    regs: &xenos::RegisterFile,
    shaders: [Option<&Shader>; 2],
) -> Result<Vec<MemexportRange>, DrawError> {
    let mut ranges = Vec::new();

    for shader in shaders.into_iter().flatten() {
        for &slot in &shader.info.memexport_streams {
            let stream = MemexportStream::read(regs, slot);
            let Some(size_dwords) = stream.size_dwords() else {
                return Err(DrawError::MemexportFormat {
                    slot,
                    format: stream.format,
                });
            };

            if size_dwords == 0 {
                continue;
            }

            add_memexport_range(
                &mut ranges,
                MemexportRange {
                    base_dwords: stream.base_dwords,
                    size_dwords,
                },
            );
        }
    }

    Ok(ranges)
}

impl<D: Device> CommandProcessor<D> {
    /// Translates a draw packet. A failed draw is skipped, unless the device was lost, in which
    /// case every later call fails too.
    pub fn issue_draw(
        &mut self,
        primitive: PrimitiveType,
        index_count: u32,
        index_buffer: Option<IndexBufferInfo>,
        major_mode_explicit: bool,
    ) -> Result<DrawOutcome, DrawError> {
        let inputs = DrawInputs {
            primitive,
            index_count,
            index_buffer,
            major_mode_explicit,
        };

        let result = self.draw(&inputs);
        self.handle_failure(result)
    }

    /// Translates a copy packet, resolving EDRAM into guest memory.
    pub fn issue_copy(&mut self) -> Result<DrawOutcome, DrawError> {
        let result = self.copy();
        self.handle_failure(result)
    }

    fn handle_failure(
        &mut self,
        result: Result<DrawOutcome, DrawError>,
    ) -> Result<DrawOutcome, DrawError> {
        if let Err(err) = &result {
            if err.is_device_lost() {
                self.submissions.lose();
            } else {
                tracing::warn!("skipping draw: {err}");
            }
        }

        result
    }

    fn draw(&mut self, inputs: &DrawInputs) -> Result<DrawOutcome, DrawError> {
        if self.submissions.is_lost() {
            return Err(DrawError::DeviceLost);
        }

        let edram_mode = self.shadow.regs().view::<RbModeControl>().edram_mode();
        if edram_mode == ModeControl::Copy {
            return self.copy();
        }

        let vertex = self.shaders[ShaderStage::Vertex as usize]
            .clone()
            .ok_or(DrawError::NoVertexShader)?;
        let pixel = match edram_mode {
            // depth only
            ModeControl::Depth => None,
            _ => self.shaders[ShaderStage::Pixel as usize].clone(),
        };
        let shaders = [Some(&*vertex), pixel.as_deref()];

        let memexport = shaders
            .iter()
            .flatten()
            .any(|shader| shader.info.is_memexport());

        let polygonal = inputs.primitive.is_polygonal();
        let mode = self.shadow.regs().view::<PaSuScModeCntl>();
        let rasterization_done = matches!(edram_mode, ModeControl::ColorDepth | ModeControl::Depth)
            && !(polygonal && mode.cull_front() && mode.cull_back());

        if !rasterization_done && !memexport {
            return Ok(DrawOutcome::Culled);
        }

        self.begin_submission(true).context(DrawCtx::Submission)?;

        // primitive processing
        let mut rec = recorder!(self);
        let processed = self
            .modules
            .primitive
            .process(&mut rec, self.shadow.regs(), inputs)
            .ok_or(DrawError::Primitive)?;

        if processed.count == 0 {
            return Ok(DrawOutcome::Empty);
        }

        let topology = host_topology(processed.host_primitive, processed.tessellation).ok_or(
            DrawError::Topology {
                primitive: processed.host_primitive,
            },
        )?;

        let memexport_ranges = memexport_ranges(self.shadow.regs(), shaders)?;

        // pipeline
        let color_mask = color_mask(self.shadow.regs().get(Reg::RbColorMask), pixel.as_deref());
        let render_targets = self
            .modules
            .render_target
            .update(&mut rec, self.shadow.regs(), rasterization_done, color_mask)
            .ok_or(DrawError::RenderTargets)?;

        let binding = self
            .modules
            .pipeline
            .configure(&PipelineRequest {
                regs: self.shadow.regs(),
                vertex: &vertex,
                pixel: pixel.as_deref(),
                primitive: processed.host_primitive,
                tessellation: processed.tessellation,
                color_mask,
                render_targets: &render_targets,
            })
            .ok_or(DrawError::Pipeline)?;

        if self.pipeline != Some(binding.pipeline) {
            self.pipeline = Some(binding.pipeline);
            rec.push(Command::SetPipeline(binding.pipeline));
        }

        // fixed function state and system constants
        let viewport = state::viewport_info(self.shadow.regs());
        self.fixed_function
            .update(rec.submissions.commands(), self.shadow.regs(), viewport.viewport);

        let system = SystemConstants::compute(
            self.shadow.regs(),
            &SystemInputs {
                viewport: &viewport,
                render_targets: &render_targets,
                primitive_polygonal: polygonal,
                shared_memory_is_uav: memexport,
                index_endian: processed.index_endian,
                color_mask,
                edram_rov: self.config.edram_rov,
            },
        );

        if self.system.update(&system) {
            self.shadow.invalidate(Group::System);
        }

        // guest memory
        for &index in &vertex.info.vertex_fetches {
            let fetch = VertexFetch::read(self.shadow.regs(), index);
            match fetch.ty {
                FetchConstantType::Vertex => (),
                FetchConstantType::InvalidVertex if self.config.allow_invalid_fetch_constants => {
                    tracing::debug!(index, "vertex fetch constant is invalid, assuming vertex");
                }
                ty => return Err(DrawError::InvalidFetchConstant { index, ty }),
            }

            if !self
                .modules
                .memory
                .request_range(&mut rec, fetch.address, fetch.size)
            {
                return Err(DrawError::VertexBuffer {
                    address: fetch.address,
                    size: fetch.size,
                });
            }
        }

        for range in &memexport_ranges {
            if !self
                .modules
                .memory
                .request_range(&mut rec, range.address(), range.length())
            {
                return Err(DrawError::MemexportRange {
                    address: range.address(),
                    length: range.length(),
                });
            }
        }

        let index_buffer: Option<BoundIndexBuffer> = match processed.index_source {
            IndexSource::None => None,
            IndexSource::Guest {
                address,
                size,
                format,
            } => {
                if !self.modules.memory.request_range(&mut rec, address, size) {
                    return Err(DrawError::IndexBuffer { address, size });
                }

                let base = rec.device.gpu_address(self.modules.memory.buffer());
                Some((base.offset(u64::from(address)), size, format.into()))
            }
            IndexSource::HostConverted {
                address,
                size,
                format,
            }
            | IndexSource::HostBuiltin {
                address,
                size,
                format,
            } => Some((address, size, format.into())),
        };

        if memexport {
            self.modules.memory.use_for_writing(rec.barriers);
        } else {
            self.modules.memory.use_for_reading(rec.barriers);
        }

        self.modules.texture.request_textures(
            &mut rec,
            self.shadow.regs(),
            vertex.info.texture_mask(),
            pixel.as_ref().map_or(0, |shader| shader.info.texture_mask()),
        );

        // bindings
        for (stage, shader) in [ShaderStage::Vertex, ShaderStage::Pixel].into_iter().zip(shaders) {
            let hash = shader.map(|shader| shader.hash);
            if self.drawn_shaders[stage as usize] != hash {
                self.drawn_shaders[stage as usize] = hash;
                self.shadow.invalidate(Group::descriptors(stage));
            }
        }

        self.bindings
            .update(
                &mut rec,
                &mut self.shadow,
                &mut *self.modules.texture,
                &BindRequest {
                    vertex: &vertex,
                    pixel: pixel.as_deref(),
                    layout: binding.layout,
                    shared_memory_writable: memexport,
                    system: &self.system,
                },
            )
            .context(DrawCtx::Binding)?;

        // draw
        if self.topology != Some(topology) {
            self.topology = Some(topology);
            rec.push(Command::SetTopology(topology));
        }

        if let Some(bound) = index_buffer
            && self.index_buffer != Some(bound)
        {
            self.index_buffer = Some(bound);
            let (address, size, format) = bound;
            rec.push(Command::SetIndexBuffer {
                address,
                size,
                format,
            });
        }

        rec.flush_barriers();
        rec.push(match index_buffer {
            Some(_) => Command::DrawIndexed {
                index_count: processed.count,
            },
            None => Command::Draw {
                vertex_count: processed.count,
            },
        });

        if memexport_ranges.is_empty() {
            return Ok(DrawOutcome::Drawn);
        }

        for range in &memexport_ranges {
            self.modules
                .memory
                .range_written_by_gpu(range.address(), range.length(), false);
        }

        if self.config.readback_memexport {
            let ranges: Vec<_> = memexport_ranges
                .iter()
                .map(|range| (range.address(), range.length()))
                .collect();

            let pending = PendingReadback::record(
                &mut rec,
                &mut self.readback,
                &mut *self.modules.memory,
                &ranges,
            )
            .context(DrawCtx::Host)?;

            self.await_all_queue_operations()
                .context(DrawCtx::Submission)?;
            pending.complete(&mut self.device, &mut *self.modules.memory);
        }

        Ok(DrawOutcome::Drawn)
    }

    fn copy(&mut self) -> Result<DrawOutcome, DrawError> {
        if self.submissions.is_lost() {
            return Err(DrawError::DeviceLost);
        }

        self.begin_submission(true).context(DrawCtx::Submission)?;

        let mut rec = recorder!(self);
        let resolved = self
            .modules
            .render_target
            .resolve(&mut rec, self.shadow.regs(), &mut *self.modules.memory)
            .ok_or(DrawError::Resolve)?;

        // resolves may bind their own pipelines
        self.pipeline = None;
        self.topology = None;

        if resolved.length == 0 {
            return Ok(DrawOutcome::Copied);
        }

        self.modules
            .memory
            .range_written_by_gpu(resolved.address, resolved.length, true);

        if self.config.readback_resolve {
            let pending = PendingReadback::record(
                &mut rec,
                &mut self.readback,
                &mut *self.modules.memory,
                &[(resolved.address, resolved.length)],
            )
            .context(DrawCtx::Host)?;

            self.await_all_queue_operations()
                .context(DrawCtx::Submission)?;
            pending.complete(&mut self.device, &mut *self.modules.memory);
        }

        Ok(DrawOutcome::Copied)
    }
}
