//! The command processor.
//!
//! Owns the shadow register file and every host-side pool, and drives the submission/frame
//! lifecycle. Draw and copy translation lives in [`crate::draw`].
use std::sync::Arc;
use std::time::Duration;

use xenos::gamma::{GammaRamp, GammaRampKind};
use xenos::{Handler, RegisterFile, Shader, ShaderStage, Shadow};

use crate::Config;
use crate::barrier::Barriers;
use crate::binding::Bindings;
use crate::constants::SystemConstants;
use crate::host::{Device, GpuAddress, HostError, IndexFormat, Pipeline, Topology};
use crate::modules::{MemoryModule, Modules, TextureModule};
use crate::readback::{ReadbackBuffer, ScratchBuffer};
use crate::state::FixedFunction;
use crate::submission::{SubmitError, Submissions};

/// Builds a [`Recorder`](crate::modules::Recorder) out of the processor's fields, leaving the
/// others free to borrow.
macro_rules! recorder {
    ($this:ident) => {
        $crate::modules::Recorder {
            device: &mut $this.device,
            submissions: &mut $this.submissions,
            barriers: &mut $this.barriers,
            scratch: &mut $this.scratch,
        }
    };
}

pub(crate) use recorder;

/// Forwards the side effects of register writes to the collaborators.
struct Effects<'a> {
    memory: &'a mut dyn MemoryModule,
    texture: &'a mut dyn TextureModule,
    gamma_dirty: &'a mut bool,
}

impl Handler for Effects<'_> {
    fn fetch_constant_written(&mut self, slot: u8) {
        self.texture.fetch_constant_written(slot);
    }

    fn scratch_written(&mut self, address: u32, value: u32) {
        self.memory.write_guest(address, &value.to_be_bytes());
    }

    fn coherency_requested(&mut self, base: u32, size: u32) {
        self.memory.make_coherent(base, size);
    }

    fn gamma_ramp_written(&mut self, kind: GammaRampKind) {
        tracing::trace!(?kind, "gamma ramp written");
        *self.gamma_dirty = true;
    }
}

/// Index buffer bound in the current command list.
pub(crate) type BoundIndexBuffer = (GpuAddress, u32, IndexFormat);

pub struct CommandProcessor<D> {
    pub(crate) config: Config,
    pub(crate) device: D,
    pub(crate) modules: Modules,

    pub(crate) shadow: Shadow,
    pub(crate) submissions: Submissions,
    pub(crate) barriers: Barriers,
    pub(crate) bindings: Bindings,
    pub(crate) readback: ReadbackBuffer,
    pub(crate) scratch: ScratchBuffer,

    // draw state
    pub(crate) shaders: [Option<Arc<Shader>>; 2],
    /// Hashes of the shaders of the last draw, indexed by stage.
    pub(crate) drawn_shaders: [Option<u64>; 2],
    pub(crate) system: SystemConstants,
    pub(crate) fixed_function: FixedFunction,
    pub(crate) pipeline: Option<Pipeline>,
    pub(crate) topology: Option<Topology>,
    pub(crate) index_buffer: Option<BoundIndexBuffer>,

    gamma_dirty: bool,
}

impl<D: Device> CommandProcessor<D> {
    pub fn new(config: Config, mut device: D, modules: Modules) -> Result<Self, HostError> {
        let config = config.sanitized();
        let bindings = Bindings::new(&mut device, &config)?;
        let submissions = Submissions::new(
            config.queue_frames,
            Duration::from_millis(config.fence_timeout_ms),
        );

        Ok(Self {
            config,
            device,
            modules,

            shadow: Shadow::new(),
            submissions,
            barriers: Barriers::default(),
            bindings,
            readback: ReadbackBuffer::default(),
            scratch: ScratchBuffer::default(),

            shaders: [None, None],
            drawn_shaders: [None, None],
            system: SystemConstants::default(),
            fixed_function: FixedFunction::default(),
            pipeline: None,
            topology: None,
            index_buffer: None,

            gamma_dirty: true,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn regs(&self) -> &RegisterFile {
        self.shadow.regs()
    }

    pub fn shadow(&self) -> &Shadow {
        &self.shadow
    }

    pub fn is_bindless(&self) -> bool {
        self.bindings.is_bindless()
    }

    pub fn is_device_lost(&self) -> bool {
        self.submissions.is_lost()
    }

    /// Index of the submission being recorded, or of the next one.
    pub fn submission_current(&self) -> u64 {
        self.submissions.current()
    }

    pub fn submission_completed(&self) -> u64 {
        self.submissions.completed()
    }

    pub fn frame_current(&self) -> u64 {
        self.submissions.frame_current()
    }

    #[inline]
    pub fn write_register(&mut self, index: u32, value: u32) {
        let mut effects = Effects {
            memory: &mut *self.modules.memory,
            texture: &mut *self.modules.texture,
            gamma_dirty: &mut self.gamma_dirty,
        };

        self.shadow.write_register(index, value, &mut effects);
    }

    #[inline]
    pub fn write_registers(&mut self, start: u32, values: &[u32]) {
        let mut effects = Effects {
            memory: &mut *self.modules.memory,
            texture: &mut *self.modules.texture,
            gamma_dirty: &mut self.gamma_dirty,
        };

        self.shadow.write_registers(start, values, &mut effects);
    }

    /// Loads a shader and makes it the active one of its stage.
    pub fn load_shader(&mut self, stage: ShaderStage, guest_address: u32, ucode: &[u32]) {
        let shader = self.modules.pipeline.load_shader(stage, guest_address, ucode);
        debug_assert_eq!(shader.stage, stage);

        self.shaders[stage as usize] = Some(shader);
    }

    pub fn active_shader(&self, stage: ShaderStage) -> Option<&Arc<Shader>> {
        self.shaders[stage as usize].as_ref()
    }

    /// Returns the gamma ramp if it changed since the last call.
    pub fn take_gamma_ramp(&mut self) -> Option<&GammaRamp> {
        std::mem::take(&mut self.gamma_dirty).then(|| self.shadow.gamma())
    }

    /// Opens a submission if none is open. Guest commands also open a frame, waiting for the
    /// GPU to be at most `queue_frames` frames behind first.
    pub(crate) fn begin_submission(&mut self, is_guest_command: bool) -> Result<(), SubmitError> {
        if self.submissions.is_lost() {
            return Err(SubmitError::DeviceLost);
        }

        if self.device.is_lost() {
            return Err(self.submissions.lose());
        }

        if is_guest_command && !self.submissions.is_frame_open() {
            let target = self.submissions.frame_wait_target();
            self.poll(target)?;

            self.submissions.open_frame();
            tracing::trace!(
                frame = self.submissions.frame_current(),
                completed = self.submissions.frame_completed(),
                "opened frame"
            );

            // pooled memory of completed frames might be overwritten from now on
            self.shadow.invalidate_all();
            self.shadow.reset_float_constants();
            self.drawn_shaders = [None, None];

            self.modules.primitive.begin_frame();
            self.modules.texture.begin_frame();
        }

        if !self.submissions.is_open() {
            self.submissions.open_submission();

            self.fixed_function.reset();
            self.pipeline = None;
            self.topology = None;
            self.index_buffer = None;

            let mut rec = recorder!(self);
            self.bindings.begin_submission(&mut rec);
            self.modules.primitive.begin_submission();
        }

        Ok(())
    }

    /// Hands the open submission to the GPU. On swap, also closes the open frame.
    ///
    /// If this fails, the submission stays open and the call can be retried.
    pub(crate) fn end_submission(&mut self, is_swap: bool) -> Result<(), SubmitError> {
        if self.submissions.is_lost() {
            return Err(SubmitError::DeviceLost);
        }

        if self.submissions.is_open() {
            self.barriers.submit(self.submissions.commands());
            self.submissions.ensure_allocator(&mut self.device)?;
            self.submissions.submit(&mut self.device)?;
        }

        if is_swap && self.submissions.is_frame_open() {
            self.submissions.close_frame();
            self.modules.primitive.end_frame();
            self.modules.texture.end_frame();

            self.bindings.reclaim(self.submissions.frame_completed());
        }

        self.poll(0)?;
        Ok(())
    }

    /// Polls the fence, waiting for `await_submission`, and reclaims what completed
    /// submissions were holding.
    fn poll(&mut self, await_submission: u64) -> Result<(), SubmitError> {
        if !self.submissions.poll(&mut self.device, await_submission)? {
            return Ok(());
        }

        let completed = self.submissions.completed();
        self.bindings.submission_completed(completed);
        self.modules.primitive.submission_completed(completed);
        self.modules.texture.submission_completed(completed);

        Ok(())
    }

    /// Waits for `await_submission` to complete, submitting it first if it's the open one.
    pub fn check_submission_fence(&mut self, await_submission: u64) -> Result<(), SubmitError> {
        if self.submissions.is_lost() {
            return Err(SubmitError::DeviceLost);
        }

        if await_submission >= self.submissions.current() && self.submissions.is_open() {
            self.end_submission(false)?;
        }

        let await_submission = await_submission.min(self.submissions.current() - 1);
        self.poll(await_submission)
    }

    /// Submits the open submission and waits for the GPU to finish everything.
    pub fn await_all_queue_operations(&mut self) -> Result<(), SubmitError> {
        self.check_submission_fence(self.submissions.current())
    }

    /// Ends the frame.
    pub fn swap(&mut self) -> Result<(), SubmitError> {
        self.begin_submission(true)?;
        self.end_submission(true)
    }
}
