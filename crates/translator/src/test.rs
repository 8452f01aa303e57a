//! Fake host device and collaborators, and end to end tests of the command processor.
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use xenos::fetch::FetchConstantType;
use xenos::primitive::{Endian, PrimitiveType};
use xenos::reg::{FETCH_CONSTANTS, FETCH_SLOT_DWORDS, FLOAT_CONSTANTS, Reg};
use xenos::shader::{SamplerBinding, TextureDimension};
use xenos::{Group, RegisterFile, Shader, ShaderInfo, ShaderStage};

use crate::binding::BindError;
use crate::host::{
    Barrier, BufferKind, Command, CommandAllocator, Descriptor, Device, GpuAddress, Heap,
    HeapKind, HostError, Resource, ResourceState, View,
};
use crate::modules::{
    DrawInputs, IndexSource, MemoryModule, PipelineBinding, PipelineModule, PipelineRequest,
    PrimitiveModule, PrimitiveResult, Recorder, RenderTargetModule, RenderTargets, Resolved,
    TextureModule, TextureView,
};
use crate::{CommandProcessor, Config, DrawError, DrawOutcome, Modules};

/// A device that executes nothing but buffer copies. Buffers are sparse and grow on write.
pub struct FakeDevice {
    /// Whether waiting on the fence completes it. Otherwise, waits time out and the device is
    /// considered hung.
    pub auto_complete: bool,
    pub lost: bool,
    pub bindless: bool,
    /// Number of command allocator creations that fail before they start succeeding again.
    pub fail_allocators: u32,
    /// Number of buffer creations that fail before they start succeeding again.
    pub fail_buffers: u32,
    /// Whether signalling the fence fails. The commands are still executed.
    pub fail_signal: bool,
    pub allocators_created: u32,
    pub signaled: u64,
    pub released: Vec<Resource>,
    pub heaps: Vec<(Heap, HeapKind, u32)>,
    pub heaps_released: Vec<Heap>,
    pub executed: Vec<Vec<Command>>,
    pub waits: Vec<u64>,

    completed: u64,
    next_resource: u32,
    next_heap: u32,
    buffers: FxHashMap<Resource, Vec<u8>>,
    descriptors: FxHashMap<Descriptor, View>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self {
            auto_complete: true,
            lost: false,
            bindless: true,
            fail_allocators: 0,
            fail_buffers: 0,
            fail_signal: false,
            allocators_created: 0,
            signaled: 0,
            released: Vec::new(),
            heaps: Vec::new(),
            heaps_released: Vec::new(),
            executed: Vec::new(),
            waits: Vec::new(),

            completed: 0,
            next_resource: 1,
            next_heap: 1,
            buffers: FxHashMap::default(),
            descriptors: FxHashMap::default(),
        }
    }

    /// Makes the GPU reach `value`.
    pub fn complete(&mut self, value: u64) {
        self.completed = self.completed.max(value);
    }

    /// Reads back data written through [`Device::write_buffer`] at `address`.
    pub fn read_upload(&self, address: GpuAddress, len: usize) -> Vec<u8> {
        let buffer = Resource((address.0 >> 32) as u32);
        let mut data = vec![0; len];
        self.read(buffer, address.0 & 0xFFFF_FFFF, &mut data);
        data
    }

    pub fn descriptor(&self, heap: Heap, index: u32) -> Option<View> {
        self.descriptors.get(&Descriptor { heap, index }).copied()
    }

    fn read(&self, buffer: Resource, offset: u64, out: &mut [u8]) {
        out.fill(0);
        let Some(data) = self.buffers.get(&buffer) else {
            return;
        };

        let offset = offset as usize;
        if offset < data.len() {
            let len = out.len().min(data.len() - offset);
            out[..len].copy_from_slice(&data[offset..offset + len]);
        }
    }

    fn write(&mut self, buffer: Resource, offset: u64, data: &[u8]) {
        let storage = self.buffers.entry(buffer).or_default();
        let offset = offset as usize;
        if storage.len() < offset + data.len() {
            storage.resize(offset + data.len(), 0);
        }

        storage[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl Device for FakeDevice {
    fn is_lost(&self) -> bool {
        self.lost
    }

    fn supports_bindless(&self) -> bool {
        self.bindless
    }

    fn create_command_allocator(&mut self) -> Result<CommandAllocator, HostError> {
        if self.fail_allocators > 0 {
            self.fail_allocators -= 1;
            return Err(HostError::OutOfMemory);
        }

        self.allocators_created += 1;
        Ok(CommandAllocator(self.allocators_created))
    }

    fn execute(&mut self, _: CommandAllocator, commands: &[Command]) -> Result<(), HostError> {
        if self.lost {
            return Err(HostError::DeviceLost);
        }

        for command in commands {
            if let &Command::CopyBuffer {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } = command
            {
                let mut data = vec![0; size as usize];
                self.read(src, src_offset, &mut data);
                self.write(dst, dst_offset, &data);
            }
        }

        self.executed.push(commands.to_vec());
        Ok(())
    }

    fn signal(&mut self, value: u64) -> Result<(), HostError> {
        if self.lost {
            return Err(HostError::DeviceLost);
        }

        if self.fail_signal {
            return Err(HostError::OutOfMemory);
        }

        self.signaled = value;
        Ok(())
    }

    fn completed_value(&self) -> u64 {
        self.completed
    }

    fn wait(&mut self, value: u64, _: Duration) -> Result<(), HostError> {
        if self.lost {
            return Err(HostError::DeviceLost);
        }

        if !self.auto_complete {
            // a fence that never completes is a hung device
            self.lost = true;
            return Err(HostError::Timeout);
        }

        self.waits.push(value);
        self.complete(value);
        Ok(())
    }

    fn create_buffer(&mut self, _: BufferKind, _: u64) -> Result<Resource, HostError> {
        if self.fail_buffers > 0 {
            self.fail_buffers -= 1;
            return Err(HostError::OutOfMemory);
        }

        self.next_resource += 1;
        Ok(Resource(self.next_resource - 1))
    }

    fn gpu_address(&self, buffer: Resource) -> GpuAddress {
        GpuAddress(u64::from(buffer.0) << 32)
    }

    fn write_buffer(&mut self, buffer: Resource, offset: u64, data: &[u8]) {
        self.write(buffer, offset, data);
    }

    fn read_buffer(&mut self, buffer: Resource, offset: u64, out: &mut [u8]) {
        self.read(buffer, offset, out);
    }

    fn create_heap(&mut self, kind: HeapKind, capacity: u32) -> Result<Heap, HostError> {
        let heap = Heap(self.next_heap);
        self.next_heap += 1;
        self.heaps.push((heap, kind, capacity));
        Ok(heap)
    }

    fn write_descriptor(&mut self, descriptor: Descriptor, view: &View) {
        let capacity = self
            .heaps
            .iter()
            .find(|(heap, ..)| *heap == descriptor.heap)
            .map(|&(_, _, capacity)| capacity)
            .expect("descriptor written to an unknown heap");
        assert!(descriptor.index < capacity, "descriptor out of heap bounds");

        self.descriptors.insert(descriptor, *view);
    }

    fn release(&mut self, resource: Resource) {
        self.buffers.remove(&resource);
        self.released.push(resource);
    }

    fn release_heap(&mut self, heap: Heap) {
        self.heaps_released.push(heap);
    }
}

/// What the fake collaborators were asked to do.
#[derive(Debug, Default)]
pub struct Log {
    pub requested: Vec<(u32, u32)>,
    pub written_by_gpu: Vec<(u32, u32, bool)>,
    pub coherent: Vec<(u32, u32)>,
    pub fetch_written: Vec<u8>,
    /// Data the next resolve writes, and where.
    pub resolve: Option<(u32, Vec<u8>)>,
    guest: Vec<u8>,
}

impl Log {
    pub fn guest(&self, address: u32, len: usize) -> Vec<u8> {
        let start = (address as usize).min(self.guest.len());
        let end = (address as usize + len).min(self.guest.len());
        let mut data = self.guest[start..end].to_vec();
        data.resize(len, 0);
        data
    }
}

type Shaders = Rc<RefCell<FxHashMap<u32, Arc<Shader>>>>;

struct FakePipeline {
    shaders: Shaders,
}

impl PipelineModule for FakePipeline {
    fn load_shader(&mut self, _: ShaderStage, guest_address: u32, _: &[u32]) -> Arc<Shader> {
        self.shaders.borrow()[&guest_address].clone()
    }

    fn configure(&mut self, _: &PipelineRequest) -> Option<PipelineBinding> {
        Some(PipelineBinding {
            pipeline: crate::host::Pipeline(1),
            layout: crate::host::RootLayout(1),
        })
    }
}

struct FakePrimitive;

impl PrimitiveModule for FakePrimitive {
    fn process(
        &mut self,
        _: &mut Recorder,
        _: &RegisterFile,
        inputs: &DrawInputs,
    ) -> Option<PrimitiveResult> {
        let index_source = match inputs.index_buffer {
            Some(info) => IndexSource::Guest {
                address: info.guest_base,
                size: info.length(),
                format: info.format,
            },
            None => IndexSource::None,
        };

        Some(PrimitiveResult {
            host_primitive: inputs.primitive,
            tessellation: None,
            count: inputs.index_count,
            index_source,
            index_endian: inputs
                .index_buffer
                .map_or(Endian::None, |info| info.endianness),
        })
    }
}

struct FakeMemory {
    buffer: Resource,
    log: Rc<RefCell<Log>>,
}

impl MemoryModule for FakeMemory {
    fn buffer(&self) -> Resource {
        self.buffer
    }

    fn request_range(&mut self, _: &mut Recorder, address: u32, length: u32) -> bool {
        self.log.borrow_mut().requested.push((address, length));
        true
    }

    fn range_written_by_gpu(&mut self, address: u32, length: u32, is_resolve: bool) {
        self.log
            .borrow_mut()
            .written_by_gpu
            .push((address, length, is_resolve));
    }

    fn write_guest(&mut self, address: u32, data: &[u8]) {
        let guest = &mut self.log.borrow_mut().guest;
        let start = address as usize;
        if guest.len() < start + data.len() {
            guest.resize(start + data.len(), 0);
        }

        guest[start..start + data.len()].copy_from_slice(data);
    }

    fn make_coherent(&mut self, base: u32, size: u32) {
        self.log.borrow_mut().coherent.push((base, size));
    }
}

struct FakeTexture {
    log: Rc<RefCell<Log>>,
}

impl TextureModule for FakeTexture {
    fn fetch_constant_written(&mut self, slot: u8) {
        self.log.borrow_mut().fetch_written.push(slot);
    }

    fn request_textures(&mut self, _: &mut Recorder, _: &RegisterFile, _: u32, _: u32) {}

    fn view(&mut self, _: &RegisterFile, binding: &xenos::shader::TextureBinding) -> TextureView {
        TextureView {
            key: u64::from(binding.fetch_constant) + 1,
            view: View::Texture {
                resource: Resource(0x100 + u32::from(binding.fetch_constant)),
                dimension: binding.dimension,
            },
        }
    }

    fn sampler(&mut self, regs: &RegisterFile, binding: &SamplerBinding) -> u64 {
        let slot = u32::from(binding.fetch_constant);
        (u64::from(slot) << 32) | u64::from(regs[FETCH_CONSTANTS.start + slot * FETCH_SLOT_DWORDS])
    }
}

struct FakeRenderTarget {
    log: Rc<RefCell<Log>>,
}

impl RenderTargetModule for FakeRenderTarget {
    fn update(
        &mut self,
        _: &mut Recorder,
        _: &RegisterFile,
        _: bool,
        _: u32,
    ) -> Option<RenderTargets> {
        Some(RenderTargets::default())
    }

    fn resolve(
        &mut self,
        rec: &mut Recorder,
        _: &RegisterFile,
        memory: &mut dyn MemoryModule,
    ) -> Option<Resolved> {
        let Some((address, data)) = self.log.borrow_mut().resolve.take() else {
            return Some(Resolved {
                address: 0,
                length: 0,
            });
        };

        rec.device
            .write_buffer(memory.buffer(), u64::from(address), &data);

        Some(Resolved {
            address,
            length: data.len() as u32,
        })
    }
}

// RB_MODE_CONTROL edram modes
const COLOR_DEPTH: u32 = 4;
const COPY: u32 = 6;

/// A command processor wired to fakes.
pub struct Harness {
    pub cp: CommandProcessor<FakeDevice>,
    pub log: Rc<RefCell<Log>>,
    shaders: Shaders,
    next_shader: u32,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        Self::with_device(config, FakeDevice::new())
    }

    pub fn with_device(config: Config, mut device: FakeDevice) -> Self {
        let log = Rc::new(RefCell::new(Log::default()));
        let shaders = Shaders::default();

        let memory = device.create_buffer(BufferKind::Default, 1 << 29).unwrap();
        let modules = Modules {
            pipeline: Box::new(FakePipeline {
                shaders: shaders.clone(),
            }),
            primitive: Box::new(FakePrimitive),
            memory: Box::new(FakeMemory {
                buffer: memory,
                log: log.clone(),
            }),
            texture: Box::new(FakeTexture { log: log.clone() }),
            render_target: Box::new(FakeRenderTarget { log: log.clone() }),
        };

        let mut cp = CommandProcessor::new(config, device, modules).unwrap();
        cp.write_register(Reg::RbModeControl.index(), COLOR_DEPTH);

        Self {
            cp,
            log,
            shaders,
            next_shader: 0,
        }
    }

    /// Makes a shader with the given info the active one of its stage.
    pub fn bind_shader(&mut self, stage: ShaderStage, info: ShaderInfo) -> Arc<Shader> {
        self.next_shader += 0x100;
        let address = self.next_shader;
        let shader = Arc::new(Shader {
            stage,
            guest_address: address,
            hash: u64::from(address) * 0x9E37_79B9,
            info,
        });

        self.shaders.borrow_mut().insert(address, shader.clone());
        self.cp.load_shader(stage, address, &[]);
        shader
    }

    pub fn draw(&mut self, count: u32) -> Result<DrawOutcome, DrawError> {
        self.cp
            .issue_draw(PrimitiveType::TriangleList, count, None, false)
    }

    /// Commands recorded in the open submission.
    pub fn pending(&mut self) -> &[Command] {
        self.cp.submissions.commands().commands()
    }

    pub fn set_float(&mut self, slot: u32, value: f32) {
        for dword in 0..4 {
            self.cp
                .write_register(FLOAT_CONSTANTS.start + slot * 4 + dword, value.to_bits());
        }
    }

    /// Writes a memory export stream descriptor of 32_32_32_32_FLOAT elements into a float
    /// constant slot.
    pub fn set_memexport_stream(&mut self, slot: u32, address: u32, elements: u32) {
        let base = FLOAT_CONSTANTS.start + slot * 4;
        self.cp.write_register(base, address >> 2);
        self.cp.write_register(base + 2, 38 << 8);
        self.cp.write_register(base + 3, elements);
    }
}

fn render(commands: &[Command]) -> String {
    commands
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

fn root_constant_buffers(commands: &[Command], parameter: u32) -> Vec<GpuAddress> {
    commands
        .iter()
        .filter_map(|command| match *command {
            Command::SetRootConstantBuffer {
                parameter: p,
                address,
            } if p == parameter => Some(address),
            _ => None,
        })
        .collect()
}

fn root_tables(commands: &[Command], parameter: u32) -> Vec<Descriptor> {
    commands
        .iter()
        .filter_map(|command| match *command {
            Command::SetRootTable {
                parameter: p,
                descriptor,
            } if p == parameter => Some(descriptor),
            _ => None,
        })
        .collect()
}

/// State transitions of `resource` in the order they were recorded.
fn transitions(commands: &[Command], resource: Resource) -> Vec<(ResourceState, ResourceState)> {
    commands
        .iter()
        .filter_map(|command| match command {
            Command::Barriers(barriers) => Some(barriers),
            _ => None,
        })
        .flatten()
        .filter_map(|barrier| match *barrier {
            Barrier::Transition {
                resource: r,
                before,
                after,
            } if r == resource => Some((before, after)),
            _ => None,
        })
        .collect()
}

fn float_map(slots: &[u8]) -> xenos::ConstantMap {
    let mut map = xenos::ConstantMap::default();
    for &slot in slots {
        map.include(slot);
    }

    map
}

#[test]
fn first_draw_command_stream() {
    let mut h = Harness::new(Config::default());
    h.bind_shader(
        ShaderStage::Vertex,
        ShaderInfo {
            float_constants: float_map(&[0]),
            ..Default::default()
        },
    );

    assert_eq!(h.draw(3).unwrap(), DrawOutcome::Drawn);
    insta::assert_snapshot!(render(h.pending()), @r"
    heaps view=Some(1) sampler=Some(2)
    pipeline 1
    viewport 0 0 8192x8192 [0, 1]
    scissor 0 0 0 0
    blend factor [0.0, 0.0, 0.0, 0.0]
    root layout 1
    root[6] = cbv 0x200000700
    root[7] = table 1:0
    root[8] = table 2:0
    root[0] = cbv 0x200000200
    root[1] = cbv 0x200000000
    root[2] = cbv 0x200000100
    root[3] = cbv 0x200000600
    root[4] = cbv 0x200000500
    topology TriangleList
    barriers [transition #1 Common -> ShaderAndIndexRead]
    draw 3
    ");
}

#[test]
fn redundant_state_is_not_recorded_twice() {
    let mut h = Harness::new(Config::default());
    h.bind_shader(ShaderStage::Vertex, ShaderInfo::default());

    h.draw(3).unwrap();
    let first = h.pending().len();
    h.draw(6).unwrap();

    assert_eq!(&h.pending()[first..], &[Command::Draw { vertex_count: 6 }]);
}

#[test]
fn float_constants_follow_register_writes() {
    let mut h = Harness::new(Config::default());
    h.bind_shader(
        ShaderStage::Vertex,
        ShaderInfo {
            float_constants: float_map(&[3]),
            ..Default::default()
        },
    );

    h.set_float(3, 1.0);
    h.draw(3).unwrap();
    assert!(!h.cp.shadow().is_dirty(Group::FloatVertex));

    // not read by the shader
    h.set_float(4, 5.0);
    assert!(!h.cp.shadow().is_dirty(Group::FloatVertex));

    h.set_float(3, 2.0);
    assert!(h.cp.shadow().is_dirty(Group::FloatVertex));
    h.draw(3).unwrap();

    let commands = h.pending().to_vec();
    let buffers = root_constant_buffers(&commands, 1);
    assert_eq!(buffers.len(), 2);
    assert_eq!(
        h.cp.device().read_upload(buffers[0], 16),
        1.0f32.to_ne_bytes().repeat(4)
    );
    assert_eq!(
        h.cp.device().read_upload(buffers[1], 16),
        2.0f32.to_ne_bytes().repeat(4)
    );

    // fetch constants didn't change in between
    assert_eq!(root_constant_buffers(&commands, 0).len(), 1);
}

#[test]
fn new_frames_upload_everything_again() {
    let mut h = Harness::new(Config::default());
    h.bind_shader(ShaderStage::Vertex, ShaderInfo::default());

    h.draw(3).unwrap();
    h.cp.swap().unwrap();
    h.draw(3).unwrap();

    let commands = h.pending().to_vec();
    for parameter in 0..5 {
        assert_eq!(root_constant_buffers(&commands, parameter).len(), 1);
    }
}

#[test]
fn frames_are_queued_at_most_queue_frames_deep() {
    let mut h = Harness::new(Config {
        queue_frames: 2,
        ..Default::default()
    });

    for frame in 1..=6u64 {
        h.cp.swap().unwrap();
        assert_eq!(h.cp.device().completed_value(), frame.saturating_sub(2));
        assert_eq!(h.cp.frame_current(), frame + 1);
    }

    assert_eq!(h.cp.device().waits, [1, 2, 3, 4]);
    assert_eq!(h.cp.submission_current(), 7);
}

#[test]
fn fence_check_submits_the_open_submission() {
    let mut h = Harness::new(Config::default());
    h.bind_shader(ShaderStage::Vertex, ShaderInfo::default());

    h.draw(3).unwrap();
    assert_eq!(h.cp.submission_current(), 1);

    h.cp.check_submission_fence(1).unwrap();
    assert_eq!(h.cp.submission_completed(), 1);
    assert_eq!(h.cp.device().executed.len(), 1);
    assert!(
        h.cp.device().executed[0].contains(&Command::Draw { vertex_count: 3 })
    );

    // the frame is still open, the next draw goes into a new submission of the same frame
    h.draw(3).unwrap();
    assert_eq!(h.cp.frame_current(), 1);
    assert!(matches!(h.pending()[0], Command::SetDescriptorHeaps { .. }));
}

#[test]
fn memexport_makes_shared_memory_writable() {
    let mut h = Harness::new(Config {
        bindless: false,
        ..Default::default()
    });
    assert!(!h.cp.is_bindless());

    h.set_memexport_stream(20, 0x1000, 4);
    h.bind_shader(
        ShaderStage::Pixel,
        ShaderInfo {
            memexport_streams: vec![20],
            color_targets_written: 1,
            ..Default::default()
        },
    );
    h.bind_shader(ShaderStage::Vertex, ShaderInfo::default());

    h.draw(3).unwrap();
    let tables = root_tables(h.pending(), 5);
    assert_eq!(tables.len(), 1);
    assert_eq!(
        h.cp.device().descriptor(tables[0].heap, tables[0].index),
        Some(View::SharedMemory { writable: true })
    );
    assert_eq!(h.log.borrow().written_by_gpu, [(0x1000, 64, false)]);
    assert!(h.log.borrow().requested.contains(&(0x1000, 64)));

    // a draw without memory export reads shared memory through a read-only view again
    h.bind_shader(ShaderStage::Pixel, ShaderInfo::default());
    h.draw(3).unwrap();

    let tables = root_tables(h.pending(), 5);
    assert_eq!(tables.len(), 2);
    assert_eq!(
        h.cp.device().descriptor(tables[1].heap, tables[1].index),
        Some(View::SharedMemory { writable: false })
    );
    assert_eq!(h.log.borrow().written_by_gpu.len(), 1);
}

#[test]
fn memexport_readback_reaches_guest_memory() {
    let mut h = Harness::new(Config {
        readback_memexport: true,
        ..Default::default()
    });

    h.set_memexport_stream(0, 0x3000, 1);
    h.bind_shader(
        ShaderStage::Vertex,
        ShaderInfo {
            memexport_streams: vec![0],
            ..Default::default()
        },
    );

    // what the shader would have exported
    let exported: Vec<u8> = (1..=16).collect();
    h.cp.device_mut().write_buffer(Resource(1), 0x3000, &exported);

    assert_eq!(h.draw(3).unwrap(), DrawOutcome::Drawn);
    assert_eq!(h.log.borrow().guest(0x3000, 16), exported);
    assert_eq!(h.cp.submission_completed(), 1);
}

#[test]
fn culled_draws_still_export_memory() {
    let mut h = Harness::new(Config::default());
    h.bind_shader(ShaderStage::Vertex, ShaderInfo::default());

    // cull both faces
    h.cp.write_register(Reg::PaSuScModeCntl.index(), 0b11);
    assert_eq!(h.draw(3).unwrap(), DrawOutcome::Culled);
    assert!(!h.cp.submissions.is_open());

    // lines have no faces to cull
    assert_eq!(
        h.cp.issue_draw(PrimitiveType::LineList, 2, None, false).unwrap(),
        DrawOutcome::Drawn
    );

    h.set_memexport_stream(8, 0x2000, 2);
    h.bind_shader(
        ShaderStage::Vertex,
        ShaderInfo {
            memexport_streams: vec![8],
            ..Default::default()
        },
    );

    assert_eq!(h.draw(3).unwrap(), DrawOutcome::Drawn);
    assert_eq!(h.log.borrow().written_by_gpu, [(0x2000, 32, false)]);
}

#[test]
fn empty_draws_record_nothing() {
    let mut h = Harness::new(Config::default());
    h.bind_shader(ShaderStage::Vertex, ShaderInfo::default());

    assert_eq!(h.draw(0).unwrap(), DrawOutcome::Empty);
    assert!(!h.pending().iter().any(|c| matches!(c, Command::Draw { .. })));
}

#[test]
fn draws_need_a_vertex_shader() {
    let mut h = Harness::new(Config::default());
    assert!(matches!(h.draw(3), Err(DrawError::NoVertexShader)));
}

fn invalid_vertex_fetch(config: Config) -> (Harness, Result<DrawOutcome, DrawError>) {
    let mut h = Harness::new(config);
    h.bind_shader(
        ShaderStage::Vertex,
        ShaderInfo {
            vertex_fetches: vec![0],
            ..Default::default()
        },
    );

    // address 0x100, 64 bytes
    h.cp.write_register(FETCH_CONSTANTS.start, 0x100 | FetchConstantType::InvalidVertex as u32);
    h.cp.write_register(FETCH_CONSTANTS.start + 1, 64);

    let result = h.draw(3);
    (h, result)
}

#[test]
fn invalid_fetch_constants_are_tolerated_when_permissive() {
    let (h, result) = invalid_vertex_fetch(Config::default());
    assert_eq!(result.unwrap(), DrawOutcome::Drawn);
    assert!(h.log.borrow().requested.contains(&(0x100, 64)));
}

#[test]
fn invalid_fetch_constants_fail_when_strict() {
    let (mut h, result) = invalid_vertex_fetch(Config {
        allow_invalid_fetch_constants: false,
        ..Default::default()
    });

    assert!(matches!(
        result,
        Err(DrawError::InvalidFetchConstant {
            index: 0,
            ty: FetchConstantType::InvalidVertex
        })
    ));
    assert!(!h.pending().iter().any(|c| matches!(c, Command::Draw { .. })));
    assert!(!h.cp.is_device_lost());

    // texture fetch constants are never vertex buffers
    h.cp.write_register(FETCH_CONSTANTS.start, 0x100 | FetchConstantType::Texture as u32);
    assert!(matches!(
        h.draw(3),
        Err(DrawError::InvalidFetchConstant {
            ty: FetchConstantType::Texture,
            ..
        })
    ));
}

#[test]
fn guest_index_buffers_are_bound_once() {
    let mut h = Harness::new(Config::default());
    h.bind_shader(ShaderStage::Vertex, ShaderInfo::default());

    let info = xenos::primitive::IndexBufferInfo {
        guest_base: 0x8000,
        endianness: Endian::K8In16,
        format: xenos::primitive::IndexFormat::Int16,
        count: 6,
    };

    for _ in 0..2 {
        h.cp.issue_draw(PrimitiveType::TriangleList, 6, Some(info), false)
            .unwrap();
    }

    let bound: Vec<_> = h
        .pending()
        .iter()
        .filter(|c| matches!(c, Command::SetIndexBuffer { .. }))
        .cloned()
        .collect();
    assert_eq!(
        bound,
        [Command::SetIndexBuffer {
            address: GpuAddress((1 << 32) + 0x8000),
            size: 12,
            format: crate::host::IndexFormat::U16,
        }]
    );
    assert_eq!(
        h.pending().last(),
        Some(&Command::DrawIndexed { index_count: 6 })
    );
    assert!(h.log.borrow().requested.contains(&(0x8000, 12)));
}

#[test]
fn sampler_heap_overflow_switches_heaps() {
    let mut h = Harness::new(Config {
        sampler_heap_size: 4,
        ..Default::default()
    });

    let samplers = (0..2)
        .map(|fetch_constant| SamplerBinding {
            fetch_constant,
            filter_override: 0,
        })
        .collect();
    h.bind_shader(ShaderStage::Vertex, ShaderInfo::default());
    h.bind_shader(
        ShaderStage::Pixel,
        ShaderInfo {
            samplers,
            color_targets_written: 1,
            ..Default::default()
        },
    );

    let set_samplers = |h: &mut Harness, value: u32| {
        for slot in 0..2 {
            h.cp
                .write_register(FETCH_CONSTANTS.start + slot * FETCH_SLOT_DWORDS, value);
        }
    };

    set_samplers(&mut h, 0);
    h.draw(3).unwrap();
    set_samplers(&mut h, 7);
    h.draw(3).unwrap();

    // the heap is full now
    set_samplers(&mut h, 9);
    h.draw(3).unwrap();

    let (old, new) = (Heap(2), Heap(3));
    assert!(h.pending().contains(&Command::SetDescriptorHeaps {
        view: Some(Heap(1)),
        sampler: Some(new),
    }));
    assert_eq!(root_tables(h.pending(), 8).last().map(|d| d.heap), Some(new));
    assert_eq!(h.cp.device().descriptor(new, 0), Some(View::Sampler(9)));
    assert_eq!(h.cp.device().descriptor(new, 1), Some(View::Sampler((1 << 32) | 9)));

    // samplers assigned in the old heap are assigned again in the new one
    set_samplers(&mut h, 7);
    h.draw(3).unwrap();
    assert_eq!(h.cp.device().descriptor(new, 2), Some(View::Sampler(7)));
    assert_eq!(h.cp.device().descriptor(new, 3), Some(View::Sampler((1 << 32) | 7)));

    // the old heap is released once the GPU is done with it
    assert!(h.cp.device().heaps_released.is_empty());
    h.cp.await_all_queue_operations().unwrap();
    assert_eq!(h.cp.device().heaps_released, [old]);
}

#[test]
fn texture_descriptors_are_bound_by_index() {
    let mut h = Harness::new(Config::default());
    h.bind_shader(ShaderStage::Vertex, ShaderInfo::default());
    h.bind_shader(
        ShaderStage::Pixel,
        ShaderInfo {
            textures: vec![xenos::shader::TextureBinding {
                fetch_constant: 3,
                dimension: TextureDimension::D2,
                signed: false,
            }],
            color_targets_written: 1,
            ..Default::default()
        },
    );

    h.draw(3).unwrap();

    // the pixel stage's index buffer holds the slot of its only texture
    let commands = h.pending().to_vec();
    let indices = root_constant_buffers(&commands, 5);
    assert_eq!(indices.len(), 1);

    let slot = u32::from_ne_bytes(h.cp.device().read_upload(indices[0], 4).try_into().unwrap());
    assert_eq!(
        h.cp.device().descriptor(Heap(1), slot),
        Some(View::Texture {
            resource: Resource(0x103),
            dimension: TextureDimension::D2,
        })
    );
}

#[test]
fn resolve_readback_reaches_guest_memory() {
    let mut h = Harness::new(Config {
        readback_resolve: true,
        ..Default::default()
    });

    let resolved: Vec<u8> = (0..32).map(|i| i * 3).collect();
    h.log.borrow_mut().resolve = Some((0x2000, resolved.clone()));

    h.cp.write_register(Reg::RbModeControl.index(), COPY);
    assert_eq!(h.draw(3).unwrap(), DrawOutcome::Copied);

    assert_eq!(h.log.borrow().written_by_gpu, [(0x2000, 32, true)]);
    assert_eq!(h.log.borrow().guest(0x2000, 32), resolved);
    assert_eq!(h.cp.submission_completed(), 1);

    // empty resolves write nothing
    assert_eq!(h.cp.issue_copy().unwrap(), DrawOutcome::Copied);
    assert_eq!(h.log.borrow().written_by_gpu.len(), 1);
}

#[test]
fn scratch_registers_are_written_to_guest_memory() {
    let mut h = Harness::new(Config::default());

    h.cp.write_register(Reg::ScratchUmsk.index(), 0b10);
    h.cp.write_register(Reg::ScratchAddr.index(), 0x100);

    // masked out
    h.cp.write_register(Reg::ScratchReg0.index(), 0xAAAA_AAAA);
    h.cp.write_register(Reg::ScratchReg1.index(), 0x1122_3344);

    let log = h.log.borrow();
    assert_eq!(log.guest(0x100, 4), [0; 4]);
    assert_eq!(log.guest(0x104, 4), [0x11, 0x22, 0x33, 0x44]);
}

#[test]
fn coherency_requests_reach_shared_memory() {
    let mut h = Harness::new(Config::default());

    h.cp.write_register(Reg::CoherBaseHost.index(), 0x4000);
    h.cp.write_register(Reg::CoherSizeHost.index(), 0x800);
    h.cp.write_register(Reg::CoherStatusHost.index(), 0x0300_0000);
    assert_eq!(h.log.borrow().coherent, [(0x4000, 0x800)]);

    h.cp.write_register(Reg::CoherSizeHost.index(), 0x100);
    h.cp.write_register(Reg::CoherStatusHost.index(), 0);
    assert_eq!(h.log.borrow().coherent, [(0x4000, 0x800), (0x4000, 0x100)]);
    assert_eq!(h.cp.shadow().regs().get(Reg::CoherStatusHost) >> 31, 0);
}

#[test]
fn fetch_constant_writes_are_forwarded() {
    let mut h = Harness::new(Config::default());

    h.cp.write_registers(FETCH_CONSTANTS.start + 5, &[0; 8]);
    assert_eq!(h.log.borrow().fetch_written, [0, 1, 2]);
    assert!(h.cp.shadow().is_dirty(Group::Fetch));
}

#[test]
fn device_loss_stops_everything() {
    let mut h = Harness::new(Config::default());
    h.bind_shader(ShaderStage::Vertex, ShaderInfo::default());
    h.draw(3).unwrap();

    h.cp.device_mut().lost = true;
    let err = h.cp.swap().unwrap_err();
    assert!(matches!(err, crate::submission::SubmitError::DeviceLost));
    assert!(h.cp.is_device_lost());

    let err = h.draw(3).unwrap_err();
    assert!(err.is_device_lost());
    assert!(h.cp.issue_copy().unwrap_err().is_device_lost());
}

#[test]
fn hung_gpu_is_device_loss() {
    let mut device = FakeDevice::new();
    device.auto_complete = false;

    let mut h = Harness::with_device(Config::default(), device);
    h.bind_shader(ShaderStage::Vertex, ShaderInfo::default());
    h.draw(3).unwrap();

    assert!(h.cp.await_all_queue_operations().is_err());
    assert!(h.cp.is_device_lost());
}

#[test]
fn gamma_ramp_changes_are_reported_once() {
    let mut h = Harness::new(Config::default());
    assert!(h.cp.take_gamma_ramp().is_some());
    assert!(h.cp.take_gamma_ramp().is_none());
}

#[test]
fn failed_uploads_are_retried_by_the_next_draw() {
    let mut h = Harness::new(Config {
        upload_page_size: Config::MIN_UPLOAD_PAGE_SIZE,
        ..Default::default()
    });
    let slots: Vec<u8> = (0..=255).collect();
    h.bind_shader(
        ShaderStage::Vertex,
        ShaderInfo {
            float_constants: float_map(&slots),
            ..Default::default()
        },
    );

    h.set_float(3, 1.0);
    h.draw(3).unwrap();

    // every draw uploads a full float constant buffer until the page runs out and the next one
    // can't be created
    h.cp.device_mut().fail_buffers = 1;
    let mut value = 1.0f32;
    let err = loop {
        value += 1.0;
        h.set_float(3, value);
        match h.draw(3) {
            Ok(_) => assert!(value < 64.0, "the upload page never filled up"),
            Err(err) => break err,
        }
    };

    assert!(matches!(
        err,
        DrawError::Binding {
            source: BindError::Host {
                source: HostError::OutOfMemory
            }
        }
    ));
    assert!(!err.is_device_lost());
    assert!(h.cp.shadow().is_dirty(Group::FloatVertex));

    h.draw(3).unwrap();
    assert!(!h.cp.shadow().is_dirty(Group::FloatVertex));

    let buffers = root_constant_buffers(h.pending(), 1);
    let latest = *buffers.last().unwrap();
    assert_eq!(
        h.cp.device().read_upload(latest.offset(3 * 16), 16),
        value.to_ne_bytes().repeat(4)
    );
}

#[test]
fn exhausted_descriptors_stay_dirty() {
    let mut h = Harness::new(Config {
        sampler_heap_size: 1,
        ..Default::default()
    });

    let samplers = (0..2)
        .map(|fetch_constant| SamplerBinding {
            fetch_constant,
            filter_override: 0,
        })
        .collect();
    h.bind_shader(ShaderStage::Vertex, ShaderInfo::default());
    h.bind_shader(
        ShaderStage::Pixel,
        ShaderInfo {
            samplers,
            color_targets_written: 1,
            ..Default::default()
        },
    );

    // two samplers never fit in a heap of one
    assert!(matches!(
        h.draw(3),
        Err(DrawError::Binding {
            source: BindError::Exhausted
        })
    ));
    assert!(h.cp.shadow().is_dirty(Group::DescriptorsVertex));
    assert!(h.cp.shadow().is_dirty(Group::DescriptorsPixel));
    assert!(root_constant_buffers(h.pending(), 5).is_empty());

    h.bind_shader(
        ShaderStage::Pixel,
        ShaderInfo {
            samplers: vec![SamplerBinding {
                fetch_constant: 0,
                filter_override: 0,
            }],
            color_targets_written: 1,
            ..Default::default()
        },
    );
    h.draw(3).unwrap();
    assert!(!h.cp.shadow().is_dirty(Group::DescriptorsPixel));
    assert_eq!(root_constant_buffers(h.pending(), 5).len(), 1);
}

#[test]
fn allocator_failure_at_swap_can_be_retried() {
    let mut h = Harness::new(Config::default());
    h.bind_shader(ShaderStage::Vertex, ShaderInfo::default());
    h.draw(3).unwrap();

    h.cp.device_mut().fail_allocators = 1;
    assert!(matches!(
        h.cp.swap(),
        Err(crate::submission::SubmitError::Host {
            source: HostError::OutOfMemory
        })
    ));
    assert!(!h.cp.is_device_lost());
    assert!(h.cp.submissions.is_open());
    assert!(h.cp.submissions.is_frame_open());
    assert!(h.cp.device().executed.is_empty());

    h.cp.swap().unwrap();
    assert!(!h.cp.submissions.is_open());
    assert_eq!(h.cp.submissions.frame_current(), 2);

    let executed = &h.cp.device().executed;
    assert_eq!(executed.len(), 1);
    assert!(executed[0].contains(&Command::Draw { vertex_count: 3 }));
}

#[test]
fn memexport_barriers_in_the_index_regime() {
    let mut h = Harness::new(Config::default());
    assert!(h.cp.is_bindless());
    let memory = Resource(1);

    h.set_memexport_stream(8, 0x2000, 2);
    h.bind_shader(
        ShaderStage::Vertex,
        ShaderInfo {
            memexport_streams: vec![8],
            ..Default::default()
        },
    );

    h.draw(3).unwrap();
    assert_eq!(h.cp.barriers.state(memory), ResourceState::UnorderedAccess);

    h.bind_shader(ShaderStage::Vertex, ShaderInfo::default());
    h.draw(3).unwrap();
    assert_eq!(h.cp.barriers.state(memory), ResourceState::ShaderAndIndexRead);

    assert_eq!(
        transitions(h.pending(), memory),
        [
            (ResourceState::Common, ResourceState::UnorderedAccess),
            (
                ResourceState::UnorderedAccess,
                ResourceState::ShaderAndIndexRead
            ),
        ]
    );

    // each transition lands before the draw that needs it
    let commands = h.pending();
    let draws: Vec<_> = commands
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, Command::Draw { .. }))
        .map(|(i, _)| i)
        .collect();
    let barriers: Vec<_> = commands
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, Command::Barriers(_)))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(draws.len(), 2);
    assert_eq!(barriers.len(), 2);
    assert!(barriers[0] < draws[0] && draws[0] < barriers[1] && barriers[1] < draws[1]);
}

#[test]
fn undersized_config_is_raised_to_its_minimums() {
    for bindless in [true, false] {
        let mut h = Harness::new(Config {
            bindless,
            queue_frames: 0,
            upload_page_size: 256,
            view_heap_size: 4,
            sampler_heap_size: 0,
            table_view_page_size: 0,
            table_sampler_page_size: 0,
            ..Default::default()
        });

        let config = h.cp.config();
        assert_eq!(config.queue_frames, 1);
        assert_eq!(config.upload_page_size, Config::MIN_UPLOAD_PAGE_SIZE);
        assert_eq!(config.view_heap_size, Config::MIN_VIEW_HEAP_SIZE);
        assert_eq!(config.sampler_heap_size, Config::MIN_SAMPLER_HEAP_SIZE);
        assert_eq!(config.table_view_page_size, Config::MIN_VIEW_HEAP_SIZE);
        assert_eq!(config.table_sampler_page_size, Config::MIN_SAMPLER_HEAP_SIZE);

        let slots: Vec<u8> = (0..=255).collect();
        h.bind_shader(
            ShaderStage::Vertex,
            ShaderInfo {
                float_constants: float_map(&slots),
                ..Default::default()
            },
        );
        h.bind_shader(
            ShaderStage::Pixel,
            ShaderInfo {
                samplers: vec![SamplerBinding {
                    fetch_constant: 0,
                    filter_override: 0,
                }],
                color_targets_written: 1,
                ..Default::default()
            },
        );

        h.draw(3).unwrap();
        h.cp.swap().unwrap();
        h.draw(3).unwrap();
        h.cp.swap().unwrap();
    }
}
