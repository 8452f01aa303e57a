//! Bindless regime: every descriptor has a stable slot in one large heap, and shaders receive
//! the slots they use through a small constant buffer per stage.
use std::collections::VecDeque;

use easyerr::ResultExt;
use rustc_hash::{FxBuildHasher, FxHashMap};
use schnellru::{ByLength, LruMap};
use xenos::ShaderStage;
use xenos::shader::TextureDimension;
use zerocopy::IntoBytes;

use super::{BindCtx, BindError, DescriptorRequest, Regime, root};
use crate::host::{Command, Descriptor, Device, GpuAddress, Heap, HeapKind, HostError, View};
use crate::modules::{Recorder, TextureView};
use crate::upload::CONSTANT_ALIGNMENT;

// view heap layout
const SHARED_MEMORY_SRV: u32 = 0;
const SHARED_MEMORY_UAV: u32 = 1;
const NULL_TEXTURES: u32 = 2;
const FIRST_TEXTURE: u32 = NULL_TEXTURES + 4;

// root parameters
const PIXEL_INDICES: u32 = root::REGIME;
const VERTEX_INDICES: u32 = root::REGIME + 1;
const VIEW_HEAP: u32 = root::REGIME + 2;
const SAMPLER_HEAP: u32 = root::REGIME + 3;

fn indices_parameter(stage: ShaderStage) -> u32 {
    match stage {
        ShaderStage::Vertex => VERTEX_INDICES,
        ShaderStage::Pixel => PIXEL_INDICES,
    }
}

/// The descriptor indices last uploaded for a stage.
#[derive(Debug, Default)]
struct StageIndices {
    /// Hash of the shader they were uploaded for.
    shader: Option<u64>,
    indices: Vec<u32>,
    address: Option<GpuAddress>,
}

pub struct IndexRegime {
    view_heap: Heap,
    view_capacity: u32,
    sampler_heap: Heap,
    sampler_capacity: u32,

    // textures
    textures: LruMap<u64, u32, ByLength, FxBuildHasher>,
    texture_limit: usize,
    next_texture: u32,
    free_textures: Vec<u32>,
    /// Slots evicted from the cache, with the submission that could last reference them.
    pending_textures: VecDeque<(u64, u32)>,

    // samplers
    samplers: FxHashMap<u64, u32>,
    next_sampler: u32,

    stages: [StageIndices; 2],
}

impl IndexRegime {
    pub fn new(
        device: &mut dyn Device,
        view_capacity: u32,
        sampler_capacity: u32,
    ) -> Result<Self, HostError> {
        assert!(view_capacity > FIRST_TEXTURE, "view heap is too small");
        assert!(sampler_capacity > 0);

        let view_heap = device.create_heap(HeapKind::View, view_capacity)?;
        let sampler_heap = device.create_heap(HeapKind::Sampler, sampler_capacity)?;

        let fixed = [
            (SHARED_MEMORY_SRV, View::SharedMemory { writable: false }),
            (SHARED_MEMORY_UAV, View::SharedMemory { writable: true }),
            (NULL_TEXTURES, View::NullTexture(TextureDimension::D1)),
            (NULL_TEXTURES + 1, View::NullTexture(TextureDimension::D2)),
            (NULL_TEXTURES + 2, View::NullTexture(TextureDimension::D3)),
            (NULL_TEXTURES + 3, View::NullTexture(TextureDimension::Cube)),
        ];

        for (index, view) in fixed {
            device.write_descriptor(
                Descriptor {
                    heap: view_heap,
                    index,
                },
                &view,
            );
        }

        // half of the texture slots are kept for evicted slots waiting for their submission
        let texture_limit = ((view_capacity - FIRST_TEXTURE) / 2).max(1) as usize;

        Ok(Self {
            view_heap,
            view_capacity,
            sampler_heap,
            sampler_capacity,

            textures: LruMap::with_hasher(ByLength::new(texture_limit as u32), FxBuildHasher),
            texture_limit,
            next_texture: FIRST_TEXTURE,
            free_textures: Vec::new(),
            pending_textures: VecDeque::new(),

            samplers: FxHashMap::default(),
            next_sampler: 0,

            stages: Default::default(),
        })
    }

    fn texture_slot(
        &mut self,
        device: &mut dyn Device,
        submission: u64,
        view: &TextureView,
    ) -> Result<u32, BindError> {
        if let View::NullTexture(dimension) = view.view {
            return Ok(NULL_TEXTURES + dimension as u32);
        }

        if let Some(slot) = self.textures.get(&view.key) {
            return Ok(*slot);
        }

        if self.textures.len() >= self.texture_limit
            && let Some((_, slot)) = self.textures.pop_oldest()
        {
            self.pending_textures.push_back((submission, slot));
        }

        let slot = match self.free_textures.pop() {
            Some(slot) => slot,
            None if self.next_texture < self.view_capacity => {
                self.next_texture += 1;
                self.next_texture - 1
            }
            None => {
                tracing::warn!("out of texture descriptor slots");
                return Err(BindError::Exhausted);
            }
        };

        device.write_descriptor(
            Descriptor {
                heap: self.view_heap,
                index: slot,
            },
            &view.view,
        );

        self.textures.insert(view.key, slot);
        Ok(slot)
    }

    /// Sampler slots of each stage, or `None` if the heap is full.
    fn sampler_slots(
        &mut self,
        device: &mut dyn Device,
        samplers: &[Vec<u64>; 2],
    ) -> Option<[Vec<u32>; 2]> {
        let mut slots: [Vec<u32>; 2] = Default::default();

        for (stage, keys) in samplers.iter().enumerate() {
            for &key in keys {
                let slot = match self.samplers.get(&key) {
                    Some(&slot) => slot,
                    None if self.next_sampler < self.sampler_capacity => {
                        let slot = self.next_sampler;
                        self.next_sampler += 1;

                        device.write_descriptor(
                            Descriptor {
                                heap: self.sampler_heap,
                                index: slot,
                            },
                            &View::Sampler(key),
                        );

                        self.samplers.insert(key, slot);
                        slot
                    }
                    None => return None,
                };

                slots[stage].push(slot);
            }
        }

        Some(slots)
    }

    /// Switches to a new sampler heap. Every sampler slot assigned so far belongs to the old
    /// heap, which is released once the open submission completes.
    fn overflow(&mut self, rec: &mut Recorder, up_to_date: &mut u32) -> Result<(), BindError> {
        let heap = rec
            .device
            .create_heap(HeapKind::Sampler, self.sampler_capacity)
            .context(BindCtx::Host)?;

        tracing::debug!(
            old = self.sampler_heap.0,
            new = heap.0,
            samplers = self.samplers.len(),
            "sampler heap overflow"
        );

        rec.submissions.retire_heap(self.sampler_heap);
        self.sampler_heap = heap;
        self.samplers.clear();
        self.next_sampler = 0;

        for stage in &mut self.stages {
            stage.shader = None;
        }

        rec.push(Command::SetDescriptorHeaps {
            view: Some(self.view_heap),
            sampler: Some(self.sampler_heap),
        });
        *up_to_date &= !(root::bit(VIEW_HEAP) | root::bit(SAMPLER_HEAP));

        Ok(())
    }
}

impl Regime for IndexRegime {
    fn begin_submission(&mut self, rec: &mut Recorder) {
        rec.push(Command::SetDescriptorHeaps {
            view: Some(self.view_heap),
            sampler: Some(self.sampler_heap),
        });
    }

    fn update(&mut self, rec: &mut Recorder, request: DescriptorRequest) -> Result<(), BindError> {
        let DescriptorRequest {
            regs,
            textures,
            uploads,
            shaders,
            dirty,
            up_to_date,
            ..
        } = request;

        let mut views: [Vec<TextureView>; 2] = Default::default();
        let mut samplers: [Vec<u64>; 2] = Default::default();
        for (stage, shader) in shaders.iter().enumerate() {
            let Some(shader) = shader else {
                continue;
            };

            views[stage] = shader
                .info
                .textures
                .iter()
                .map(|binding| textures.view(regs, binding))
                .collect();

            samplers[stage] = shader
                .info
                .samplers
                .iter()
                .map(|binding| textures.sampler(regs, binding))
                .collect();
        }

        let sampler_slots = match self.sampler_slots(rec.device, &samplers) {
            Some(slots) => slots,
            None => {
                self.overflow(rec, up_to_date)?;
                self.sampler_slots(rec.device, &samplers).ok_or_else(|| {
                    tracing::warn!("draw uses more samplers than fit in a heap");
                    BindError::Exhausted
                })?
            }
        };

        let submission = rec.submission();
        let frame = rec.frame();
        for stage in [ShaderStage::Vertex, ShaderStage::Pixel] {
            let index = stage as usize;
            let Some(shader) = shaders[index] else {
                continue;
            };

            let mut indices = Vec::with_capacity(views[index].len() + sampler_slots[index].len());
            for view in &views[index] {
                indices.push(self.texture_slot(rec.device, submission, view)?);
            }
            indices.extend_from_slice(&sampler_slots[index]);

            let current = &mut self.stages[index];
            if !dirty[index]
                && current.shader == Some(shader.hash)
                && current.indices == indices
                && current.address.is_some()
            {
                continue;
            }

            let mut data = indices.clone();
            data.resize(data.len().next_multiple_of(4).max(4), 0);
            let address = uploads
                .upload(rec.device, frame, data.as_bytes(), CONSTANT_ALIGNMENT)
                .context(BindCtx::Host)?;

            current.shader = Some(shader.hash);
            current.indices = indices;
            current.address = Some(address);
            *up_to_date &= !root::bit(indices_parameter(stage));
        }

        for stage in [ShaderStage::Vertex, ShaderStage::Pixel] {
            let parameter = indices_parameter(stage);
            if *up_to_date & root::bit(parameter) != 0 {
                continue;
            }

            if let Some(address) = self.stages[stage as usize].address {
                rec.push(Command::SetRootConstantBuffer { parameter, address });
                *up_to_date |= root::bit(parameter);
            }
        }

        for (parameter, heap) in [(VIEW_HEAP, self.view_heap), (SAMPLER_HEAP, self.sampler_heap)]
        {
            if *up_to_date & root::bit(parameter) == 0 {
                rec.push(Command::SetRootTable {
                    parameter,
                    descriptor: Descriptor { heap, index: 0 },
                });
                *up_to_date |= root::bit(parameter);
            }
        }

        Ok(())
    }

    fn submission_completed(&mut self, completed: u64) {
        while let Some(&(submission, slot)) = self.pending_textures.front() {
            if submission > completed {
                break;
            }

            self.pending_textures.pop_front();
            self.free_textures.push(slot);
        }
    }
}
