//! Guest GPU model of the Xbox 360 "Xenos".
//!
//! This crate knows nothing about the host: it holds the shadow register file, tracks which
//! host-side constant buffers are out of date and describes draws in guest terms.
pub mod constants;
pub mod fetch;
pub mod gamma;
pub mod primitive;
pub mod reg;
pub mod regfile;
pub mod shader;
pub mod shadow;

pub use constants::ConstantMap;
pub use regfile::RegisterFile;
pub use shader::{Shader, ShaderInfo, ShaderStage};
pub use shadow::{Dirty, Group, Handler, NopHandler, Shadow};
