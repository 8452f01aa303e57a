//! Guest primitive and index buffer descriptions.
use bitos::bitos;

/// Guest primitive types.
#[bitos(6)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    None          = 0x00,
    PointList     = 0x01,
    LineList      = 0x02,
    LineStrip     = 0x03,
    TriangleList  = 0x04,
    TriangleFan   = 0x05,
    TriangleStrip = 0x06,
    TriangleWithWFlags = 0x07,
    RectangleList = 0x08,
    LineLoop      = 0x0C,
    QuadList      = 0x0D,
    QuadStrip     = 0x0E,
    Polygon       = 0x0F,
    LinePatch     = 0x10,
    TrianglePatch = 0x11,
    QuadPatch     = 0x12,
}

impl PrimitiveType {
    /// Whether the primitive produces faces, and therefore is subject to face culling and
    /// polygon offset.
    pub fn is_polygonal(self) -> bool {
        !matches!(
            self,
            Self::None | Self::PointList | Self::LineList | Self::LineStrip | Self::LineLoop
                | Self::LinePatch
        )
    }

    /// Whether the primitive is a tessellation patch.
    pub fn is_patch(self) -> bool {
        matches!(self, Self::LinePatch | Self::TrianglePatch | Self::QuadPatch)
    }
}

/// Size of a guest index.
#[bitos(1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndexFormat {
    #[default]
    Int16 = 0,
    Int32 = 1,
}

impl IndexFormat {
    pub fn size(self) -> u32 {
        match self {
            Self::Int16 => 2,
            Self::Int32 => 4,
        }
    }
}

/// Byte swapping mode of guest data.
#[bitos(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Endian {
    #[default]
    None     = 0,
    K8In16   = 1,
    K8In32   = 2,
    K16In32  = 3,
}

#[bitos(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MajorMode {
    #[default]
    Implicit = 0,
    Explicit = 1,
    Reserved2 = 2,
    Reserved3 = 3,
}

#[bitos(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TessellationMode {
    Discrete   = 0,
    Continuous = 1,
    Adaptive   = 2,
}

/// An index buffer in guest memory, as described by a draw packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBufferInfo {
    /// Guest physical address of the first index.
    pub guest_base: u32,
    pub endianness: Endian,
    pub format: IndexFormat,
    /// Number of indices.
    pub count: u32,
}

impl IndexBufferInfo {
    /// Size of the index data, in bytes.
    pub fn length(&self) -> u32 {
        self.count * self.format.size()
    }
}
