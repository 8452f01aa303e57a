//! Translated shader descriptions.
//!
//! Microcode translation happens elsewhere; the command processor only needs to know which
//! constants, fetch constants and exports a shader uses.
use crate::constants::ConstantMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

/// Dimension of a texture binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D1,
    D2,
    D3,
    Cube,
}

/// A texture read by a shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureBinding {
    /// Fetch constant slot, 0..32.
    pub fetch_constant: u8,
    pub dimension: TextureDimension,
    pub signed: bool,
}

/// A sampler used by a shader. Filter overrides come from the fetch instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerBinding {
    /// Fetch constant slot, 0..32.
    pub fetch_constant: u8,
    pub filter_override: u8,
}

/// What the command processor needs to know about a translated shader.
#[derive(Debug, Clone, Default)]
pub struct ShaderInfo {
    /// Float constant slots (of this stage) the shader reads.
    pub float_constants: ConstantMap,
    /// Vertex fetch constants (0..96) read by the shader.
    pub vertex_fetches: Vec<u8>,
    pub textures: Vec<TextureBinding>,
    pub samplers: Vec<SamplerBinding>,
    /// Float constant slots (0..512) holding memory export stream descriptors.
    pub memexport_streams: Vec<u32>,
    /// Color render targets written, one bit per target.
    pub color_targets_written: u8,
}

impl ShaderInfo {
    /// Whether the shader writes to guest memory directly.
    pub fn is_memexport(&self) -> bool {
        !self.memexport_streams.is_empty()
    }

    /// Fetch constant slots used by texture bindings, one bit per slot.
    pub fn texture_mask(&self) -> u32 {
        self.textures
            .iter()
            .fold(0, |mask, binding| mask | (1 << binding.fetch_constant))
    }
}

/// A loaded shader.
#[derive(Debug, Clone)]
pub struct Shader {
    pub stage: ShaderStage,
    pub guest_address: u32,
    /// Hash of the microcode.
    pub hash: u64,
    pub info: ShaderInfo,
}
