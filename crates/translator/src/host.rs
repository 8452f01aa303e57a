//! Host graphics API boundary.
//!
//! The translator records into a deferred [`CommandList`] and hands it to a [`Device`] when a
//! submission ends. Everything the translator needs from the host goes through this module, so
//! any explicit graphics API can sit behind it.
use std::fmt;
use std::time::Duration;

use easyerr::Error;
use xenos::shader::TextureDimension;

/// An error reported by the host device.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HostError {
    #[error("host device was removed")]
    DeviceLost,
    #[error("host allocation failed")]
    OutOfMemory,
    #[error("timed out waiting for the GPU")]
    Timeout,
}

macro_rules! handle {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u32);
        )*
    };
}

handle! {
    /// A buffer or texture.
    Resource,
    Pipeline,
    RootLayout,
    /// A descriptor heap.
    Heap,
    /// A command recording buffer.
    CommandAllocator,
}

/// GPU virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuAddress(pub u64);

impl GpuAddress {
    pub fn offset(self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// Buffer and texture views.
    View,
    Sampler,
}

/// A descriptor slot inside a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub heap: Heap,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// CPU-writable, GPU-readable.
    Upload,
    /// GPU-writable, CPU-readable.
    Readback,
    /// GPU-only.
    Default,
}

/// What a descriptor points to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum View {
    SharedMemory { writable: bool },
    Texture {
        resource: Resource,
        dimension: TextureDimension,
    },
    NullTexture(TextureDimension),
    /// Packed sampler parameters.
    Sampler(u64),
}

/// Host resource usage states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    VertexAndConstantBuffer,
    IndexBuffer,
    RenderTarget,
    UnorderedAccess,
    DepthWrite,
    DepthRead,
    /// Readable by every shader stage.
    ShaderResource,
    /// Readable by shaders and as an index buffer.
    ShaderAndIndexRead,
    CopySource,
    CopyDest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    Transition {
        resource: Resource,
        before: ResourceState,
        after: ResourceState,
    },
    Aliasing {
        before: Option<Resource>,
        after: Option<Resource>,
    },
    /// Orders unordered access writes before later accesses. `None` covers every resource.
    Uav(Option<Resource>),
}

impl fmt::Display for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transition {
                resource,
                before,
                after,
            } => write!(f, "transition #{} {before:?} -> {after:?}", resource.0),
            Self::Aliasing { before, after } => {
                write!(f, "aliasing {:?} -> {:?}", before.map(|r| r.0), after.map(|r| r.0))
            }
            Self::Uav(Some(resource)) => write!(f, "uav #{}", resource.0),
            Self::Uav(None) => write!(f, "uav *"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
    LineListAdjacency,
    /// Patch list with the given number of control points.
    PatchList(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

impl From<xenos::primitive::IndexFormat> for IndexFormat {
    fn from(value: xenos::primitive::IndexFormat) -> Self {
        match value {
            xenos::primitive::IndexFormat::Int16 => Self::U16,
            xenos::primitive::IndexFormat::Int32 => Self::U32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// A recorded host command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetDescriptorHeaps {
        view: Option<Heap>,
        sampler: Option<Heap>,
    },
    SetRootLayout(RootLayout),
    SetPipeline(Pipeline),
    SetRootConstantBuffer {
        parameter: u32,
        address: GpuAddress,
    },
    SetRootTable {
        parameter: u32,
        descriptor: Descriptor,
    },
    SetViewport(Viewport),
    SetScissor(Rect),
    SetBlendFactor([f32; 4]),
    SetStencilRef(u32),
    SetTopology(Topology),
    SetIndexBuffer {
        address: GpuAddress,
        size: u32,
        format: IndexFormat,
    },
    Barriers(Vec<Barrier>),
    Draw {
        vertex_count: u32,
    },
    DrawIndexed {
        index_count: u32,
    },
    CopyBuffer {
        dst: Resource,
        dst_offset: u64,
        src: Resource,
        src_offset: u64,
        size: u64,
    },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetDescriptorHeaps { view, sampler } => write!(
                f,
                "heaps view={:?} sampler={:?}",
                view.map(|h| h.0),
                sampler.map(|h| h.0)
            ),
            Self::SetRootLayout(layout) => write!(f, "root layout {}", layout.0),
            Self::SetPipeline(pipeline) => write!(f, "pipeline {}", pipeline.0),
            Self::SetRootConstantBuffer { parameter, address } => {
                write!(f, "root[{parameter}] = cbv {:#x}", address.0)
            }
            Self::SetRootTable {
                parameter,
                descriptor,
            } => write!(
                f,
                "root[{parameter}] = table {}:{}",
                descriptor.heap.0, descriptor.index
            ),
            Self::SetViewport(v) => write!(
                f,
                "viewport {} {} {}x{} [{}, {}]",
                v.x, v.y, v.width, v.height, v.min_depth, v.max_depth
            ),
            Self::SetScissor(r) => {
                write!(f, "scissor {} {} {} {}", r.left, r.top, r.right, r.bottom)
            }
            Self::SetBlendFactor(c) => write!(f, "blend factor {c:?}"),
            Self::SetStencilRef(value) => write!(f, "stencil ref {value}"),
            Self::SetTopology(topology) => write!(f, "topology {topology:?}"),
            Self::SetIndexBuffer {
                address,
                size,
                format,
            } => write!(f, "index buffer {:#x} +{size} {format:?}", address.0),
            Self::Barriers(barriers) => {
                write!(f, "barriers [")?;
                for (i, barrier) in barriers.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{barrier}")?;
                }
                write!(f, "]")
            }
            Self::Draw { vertex_count } => write!(f, "draw {vertex_count}"),
            Self::DrawIndexed { index_count } => write!(f, "draw indexed {index_count}"),
            Self::CopyBuffer {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => write!(
                f,
                "copy #{}+{src_offset} -> #{}+{dst_offset} ({size} bytes)",
                src.0, dst.0
            ),
        }
    }
}

/// Commands recorded for one submission, replayed on the host when the submission ends.
#[derive(Debug, Default)]
pub struct CommandList {
    commands: Vec<Command>,
}

impl CommandList {
    #[inline(always)]
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }
}

/// An explicit host graphics device with a single, strictly ordered queue.
pub trait Device {
    /// Whether the device has been removed. Once lost, it never comes back.
    fn is_lost(&self) -> bool;

    /// Whether descriptors can be indexed from one large heap in shaders.
    fn supports_bindless(&self) -> bool;

    fn create_command_allocator(&mut self) -> Result<CommandAllocator, HostError>;

    /// Records `commands` using `allocator` and queues them for execution.
    fn execute(
        &mut self,
        allocator: CommandAllocator,
        commands: &[Command],
    ) -> Result<(), HostError>;

    /// Queues a signal of the submission fence to `value`.
    fn signal(&mut self, value: u64) -> Result<(), HostError>;

    /// Last fence value the GPU has reached.
    fn completed_value(&self) -> u64;

    /// Blocks until the fence reaches `value` or `timeout` elapses.
    fn wait(&mut self, value: u64, timeout: Duration) -> Result<(), HostError>;

    fn create_buffer(&mut self, kind: BufferKind, size: u64) -> Result<Resource, HostError>;

    fn gpu_address(&self, buffer: Resource) -> GpuAddress;

    /// Writes to a mapped upload buffer.
    fn write_buffer(&mut self, buffer: Resource, offset: u64, data: &[u8]);

    /// Reads from a mapped readback buffer.
    fn read_buffer(&mut self, buffer: Resource, offset: u64, out: &mut [u8]);

    fn create_heap(&mut self, kind: HeapKind, capacity: u32) -> Result<Heap, HostError>;

    fn write_descriptor(&mut self, descriptor: Descriptor, view: &View);

    fn release(&mut self, resource: Resource);

    fn release_heap(&mut self, heap: Heap);
}
