//! Host side of the Xenos command processor.
//!
//! Translates the guest register stream and draw packets into commands for an explicit host
//! graphics API, see [`host::Device`].
pub mod barrier;
pub mod binding;
pub mod constants;
pub mod draw;
pub mod host;
pub mod modules;
pub mod processor;
pub mod readback;
pub mod state;
pub mod submission;
pub mod topology;
pub mod upload;

#[cfg(test)]
mod test;

use serde::{Deserialize, Serialize};

#[rustfmt::skip]
pub use crate::{
    draw::{DrawError, DrawOutcome},
    modules::Modules,
    processor::CommandProcessor,
};

/// Command processor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of frames the CPU may record ahead of the GPU.
    pub queue_frames: u32,
    /// Whether to use the bindless (index) binding regime when the host supports it.
    pub bindless: bool,
    /// Whether draws reading vertex fetch constants marked as invalid are allowed to go ahead.
    pub allow_invalid_fetch_constants: bool,
    /// Whether memory export results are copied back to guest memory right after the draw.
    pub readback_memexport: bool,
    /// Whether resolve results are copied back to guest memory right after the copy.
    pub readback_resolve: bool,
    /// Whether blending is emulated in the pixel shader through rasterizer ordered views.
    pub edram_rov: bool,
    /// How long to wait on the submission fence before checking for device loss.
    pub fence_timeout_ms: u64,

    // pools
    pub upload_page_size: u32,
    pub view_heap_size: u32,
    pub sampler_heap_size: u32,
    pub table_view_page_size: u32,
    pub table_sampler_page_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_frames: 3,
            bindless: true,
            allow_invalid_fetch_constants: true,
            readback_memexport: false,
            readback_resolve: false,
            edram_rov: false,
            fence_timeout_ms: 5000,

            upload_page_size: 2 * 1024 * 1024,
            view_heap_size: 262_144,
            sampler_heap_size: 2000,
            table_view_page_size: 65_536,
            table_sampler_page_size: 2048,
        }
    }
}

impl Config {
    /// Smallest upload page. A page must hold the largest constant buffer of a draw, a full
    /// float constant buffer of 256 slots.
    pub const MIN_UPLOAD_PAGE_SIZE: u32 = 64 * 1024;
    /// Smallest view heap or view table page: the fixed descriptors of the index regime, one
    /// texture slot and a spare for when it is evicted.
    pub const MIN_VIEW_HEAP_SIZE: u32 = 8;
    /// Smallest sampler heap or sampler table page. Draws needing more descriptors than a heap
    /// holds fail with [`binding::BindError::Exhausted`] instead.
    pub const MIN_SAMPLER_HEAP_SIZE: u32 = 1;

    /// Raises values the processor can't work with to their minimum, warning about each one.
    pub fn sanitized(mut self) -> Self {
        fn at_least(name: &str, value: &mut u32, min: u32) {
            if *value < min {
                tracing::warn!("config {name} of {value} is too small, using {min}");
                *value = min;
            }
        }

        at_least("queue_frames", &mut self.queue_frames, 1);
        at_least(
            "upload_page_size",
            &mut self.upload_page_size,
            Self::MIN_UPLOAD_PAGE_SIZE,
        );
        at_least(
            "view_heap_size",
            &mut self.view_heap_size,
            Self::MIN_VIEW_HEAP_SIZE,
        );
        at_least(
            "sampler_heap_size",
            &mut self.sampler_heap_size,
            Self::MIN_SAMPLER_HEAP_SIZE,
        );
        at_least(
            "table_view_page_size",
            &mut self.table_view_page_size,
            Self::MIN_VIEW_HEAP_SIZE,
        );
        at_least(
            "table_sampler_page_size",
            &mut self.table_sampler_page_size,
            Self::MIN_SAMPLER_HEAP_SIZE,
        );

        self
    }
}
