//! Constant buffer and descriptor binding.
//!
//! Constant buffers are the same in both regimes: they are uploaded through the [`UploadPool`]
//! when their group is dirty and bound as root constant buffers. Descriptors (the shared memory
//! view, textures and samplers) are handled by a [`Regime`], chosen once when the command
//! processor is created.
pub mod index;
pub mod table;

use easyerr::{Error, ResultExt};
use xenos::reg::{BOOL_LOOP_CONSTANTS, FETCH_CONSTANTS, FLOAT_CONSTANTS, FLOAT_CONSTANTS_PER_STAGE};
use xenos::{ConstantMap, Group, RegisterFile, Shader, ShaderStage, Shadow};
use zerocopy::IntoBytes;

use crate::Config;
use crate::constants::SystemConstants;
use crate::host::{Command, Device, GpuAddress, HostError, RootLayout};
use crate::modules::{Recorder, TextureModule};
use crate::upload::{CONSTANT_ALIGNMENT, UploadPool};

#[derive(Debug, Error)]
pub enum BindError {
    #[error("out of descriptors")]
    Exhausted,
    #[error(transparent)]
    Host { source: HostError },
}

/// Root parameters common to both regimes.
pub mod root {
    use xenos::ShaderStage;

    pub const FETCH: u32 = 0;
    pub const FLOAT_VERTEX: u32 = 1;
    pub const FLOAT_PIXEL: u32 = 2;
    pub const SYSTEM: u32 = 3;
    pub const BOOL_LOOP: u32 = 4;
    /// First parameter owned by the binding regime.
    pub const REGIME: u32 = 5;

    pub fn float(stage: ShaderStage) -> u32 {
        match stage {
            ShaderStage::Vertex => FLOAT_VERTEX,
            ShaderStage::Pixel => FLOAT_PIXEL,
        }
    }

    #[inline(always)]
    pub const fn bit(parameter: u32) -> u32 {
        1 << parameter
    }
}

/// What a regime needs to bring the descriptors of a draw up to date.
pub struct DescriptorRequest<'a> {
    pub regs: &'a RegisterFile,
    pub textures: &'a mut dyn TextureModule,
    pub uploads: &'a mut UploadPool,
    /// Vertex and pixel shaders, indexed by stage.
    pub shaders: [Option<&'a Shader>; 2],
    /// Whether the descriptors of each stage were invalidated.
    pub dirty: [bool; 2],
    pub shared_memory_writable: bool,
    pub shared_memory_dirty: bool,
    /// Root parameters set in the current command list with the current layout, one bit per
    /// parameter.
    pub up_to_date: &'a mut u32,
}

/// A descriptor binding strategy.
pub trait Regime {
    /// Binds the regime's heaps in a new command list, if it has any yet.
    fn begin_submission(&mut self, rec: &mut Recorder);

    /// Writes the descriptors used by a draw and sets the root parameters referencing them.
    fn update(&mut self, rec: &mut Recorder, request: DescriptorRequest) -> Result<(), BindError>;

    /// Descriptors released during `completed` or earlier can be reused.
    fn submission_completed(&mut self, completed: u64) {
        let _ = completed;
    }

    /// Descriptors written during `completed_frame` or earlier can be overwritten.
    fn reclaim(&mut self, completed_frame: u64) {
        let _ = completed_frame;
    }
}

/// The bindings a draw needs.
pub struct BindRequest<'a> {
    pub vertex: &'a Shader,
    pub pixel: Option<&'a Shader>,
    pub layout: RootLayout,
    pub shared_memory_writable: bool,
    pub system: &'a SystemConstants,
}

/// Packs the live float constants of a stage, in slot order.
fn pack_float_constants(regs: &RegisterFile, stage: ShaderStage, map: &ConstantMap) -> Vec<u32> {
    let base = FLOAT_CONSTANTS.start + stage as u32 * FLOAT_CONSTANTS_PER_STAGE * 4;

    let mut packed = Vec::with_capacity(map.len().max(1) * 4);
    for slot in map.iter() {
        let start = base + u32::from(slot) * 4;
        packed.extend_from_slice(regs.range(start..start + 4));
    }

    // empty constant buffers can't be bound
    if packed.is_empty() {
        packed.resize(4, 0);
    }

    packed
}

pub struct Bindings {
    regime: Box<dyn Regime>,
    bindless: bool,
    uploads: UploadPool,

    // root
    layout: Option<RootLayout>,
    up_to_date: u32,
    /// Addresses of the common constant buffers, indexed by root parameter.
    buffers: [Option<GpuAddress>; root::REGIME as usize],

    shared_memory_writable: bool,
}

impl Bindings {
    pub fn new(device: &mut dyn Device, config: &Config) -> Result<Self, HostError> {
        let bindless = config.bindless && device.supports_bindless();
        let regime: Box<dyn Regime> = if bindless {
            tracing::info!("binding descriptors by index");
            Box::new(index::IndexRegime::new(
                device,
                config.view_heap_size,
                config.sampler_heap_size,
            )?)
        } else {
            tracing::info!("binding descriptors through per-draw tables");
            Box::new(table::TableRegime::new(
                config.table_view_page_size,
                config.table_sampler_page_size,
            ))
        };

        Ok(Self {
            regime,
            bindless,
            uploads: UploadPool::new(config.upload_page_size),

            layout: None,
            up_to_date: 0,
            buffers: [None; root::REGIME as usize],

            shared_memory_writable: false,
        })
    }

    pub fn is_bindless(&self) -> bool {
        self.bindless
    }

    /// A new command list starts with no root layout and no bindings.
    pub fn begin_submission(&mut self, rec: &mut Recorder) {
        self.layout = None;
        self.up_to_date = 0;
        self.regime.begin_submission(rec);
    }

    pub fn submission_completed(&mut self, completed: u64) {
        self.regime.submission_completed(completed);
    }

    /// Makes memory used by `completed_frame` and earlier frames writable again.
    pub fn reclaim(&mut self, completed_frame: u64) {
        self.uploads.reclaim(completed_frame);
        self.regime.reclaim(completed_frame);
    }

    fn upload(
        &mut self,
        rec: &mut Recorder,
        parameter: u32,
        data: &[u8],
    ) -> Result<(), BindError> {
        let frame = rec.frame();
        let address = self
            .uploads
            .upload(rec.device, frame, data, CONSTANT_ALIGNMENT)
            .context(BindCtx::Host)?;

        self.buffers[parameter as usize] = Some(address);
        self.up_to_date &= !root::bit(parameter);
        Ok(())
    }

    /// Brings every constant buffer and descriptor used by a draw up to date and binds them.
    pub fn update(
        &mut self,
        rec: &mut Recorder,
        shadow: &mut Shadow,
        textures: &mut dyn TextureModule,
        request: &BindRequest,
    ) -> Result<(), BindError> {
        if self.layout != Some(request.layout) {
            self.layout = Some(request.layout);
            self.up_to_date = 0;
            rec.push(Command::SetRootLayout(request.layout));
        }

        if self.shared_memory_writable != request.shared_memory_writable {
            self.shared_memory_writable = request.shared_memory_writable;
            shadow.invalidate(Group::SharedMemory);
        }

        let empty = ConstantMap::default();
        shadow.set_float_constants(ShaderStage::Vertex, &request.vertex.info.float_constants);
        shadow.set_float_constants(
            ShaderStage::Pixel,
            request
                .pixel
                .map_or(&empty, |shader| &shader.info.float_constants),
        );

        // groups are only marked clean once their data is on the host, so a failed draw
        // leaves them dirty for the next one
        for stage in [ShaderStage::Vertex, ShaderStage::Pixel] {
            if shadow.is_dirty(Group::float(stage)) {
                let packed =
                    pack_float_constants(shadow.regs(), stage, shadow.float_constants(stage));
                self.upload(rec, root::float(stage), packed.as_bytes())?;
                shadow.take_dirty(Group::float(stage));
            }
        }

        if shadow.is_dirty(Group::Fetch) {
            let fetch = shadow.regs().range(FETCH_CONSTANTS);
            self.upload(rec, root::FETCH, fetch.as_bytes())?;
            shadow.take_dirty(Group::Fetch);
        }

        if shadow.is_dirty(Group::BoolLoop) {
            let bool_loop = shadow.regs().range(BOOL_LOOP_CONSTANTS);
            self.upload(rec, root::BOOL_LOOP, bool_loop.as_bytes())?;
            shadow.take_dirty(Group::BoolLoop);
        }

        if shadow.is_dirty(Group::System) {
            self.upload(rec, root::SYSTEM, request.system.as_bytes())?;
            shadow.take_dirty(Group::System);
        }

        let dirty = [
            shadow.take_dirty(Group::DescriptorsVertex),
            shadow.take_dirty(Group::DescriptorsPixel),
        ];
        let shared_memory_dirty = shadow.take_dirty(Group::SharedMemory);

        let result = self.regime.update(
            rec,
            DescriptorRequest {
                regs: shadow.regs(),
                textures,
                uploads: &mut self.uploads,
                shaders: [Some(request.vertex), request.pixel],
                dirty,
                shared_memory_writable: request.shared_memory_writable,
                shared_memory_dirty,
                up_to_date: &mut self.up_to_date,
            },
        );

        if result.is_err() {
            // the regime may have written part of the tables, rebuild all of them next time
            shadow.invalidate(Group::DescriptorsVertex);
            shadow.invalidate(Group::DescriptorsPixel);
            shadow.invalidate(Group::SharedMemory);
        }
        result?;

        for (parameter, address) in self.buffers.iter().enumerate() {
            let parameter = parameter as u32;
            if self.up_to_date & root::bit(parameter) != 0 {
                continue;
            }

            let Some(address) = *address else {
                continue;
            };

            rec.push(Command::SetRootConstantBuffer { parameter, address });
            self.up_to_date |= root::bit(parameter);
        }

        Ok(())
    }
}
