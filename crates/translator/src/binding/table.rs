//! Descriptor table regime: each draw that changes its textures or samplers gets fresh copies
//! of its descriptor tables, suballocated from paged descriptor heaps.
use std::collections::VecDeque;

use easyerr::ResultExt;
use twox_hash::XxHash3_64;
use xenos::{Shader, ShaderStage};
use zerocopy::IntoBytes;

use super::{BindCtx, BindError, DescriptorRequest, Regime, root};
use crate::host::{Command, Descriptor, Device, Heap, HeapKind, View};
use crate::modules::Recorder;

/// Root parameter of the shared memory table. Texture and sampler tables follow it, in the
/// order pixel textures, pixel samplers, vertex textures, vertex samplers, skipping empty ones.
const SHARED_MEMORY: u32 = root::REGIME;

#[derive(Debug)]
struct Page {
    heap: Heap,
    /// Frame that last used this page.
    frame: u64,
}

/// A contiguous range of descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub descriptor: Descriptor,
    /// Identifies the page the range was allocated from.
    pub page: u64,
    /// Whether every table has to be rewritten, because the range comes from a different page
    /// than the previous tables.
    pub full: bool,
}

/// Paged ring of descriptor heaps.
pub struct DescriptorPool {
    kind: HeapKind,
    page_size: u32,

    current: Option<(Page, u32)>,
    /// Incremented every time the current page changes.
    generation: u64,
    submitted: VecDeque<Page>,
    available: Vec<Page>,
}

impl DescriptorPool {
    pub fn new(kind: HeapKind, page_size: u32) -> Self {
        Self {
            kind,
            page_size,

            current: None,
            generation: 0,
            submitted: VecDeque::new(),
            available: Vec::new(),
        }
    }

    pub fn current_heap(&self) -> Option<Heap> {
        self.current.as_ref().map(|(page, _)| page.heap)
    }

    /// Allocates `partial` descriptors if the tables previously written to page `previous` can
    /// be kept, otherwise `full` descriptors.
    pub fn request(
        &mut self,
        device: &mut dyn Device,
        frame: u64,
        previous: Option<u64>,
        partial: u32,
        full: u32,
    ) -> Result<Allocation, BindError> {
        debug_assert!(partial <= full);
        if full > self.page_size {
            tracing::warn!(full, page_size = self.page_size, "descriptor tables don't fit in a page");
            return Err(BindError::Exhausted);
        }

        if let Some((page, used)) = &mut self.current {
            let same_page = previous == Some(self.generation);
            let (count, full) = if same_page && *used + partial <= self.page_size {
                (partial, false)
            } else {
                (full, true)
            };

            if *used + count <= self.page_size {
                let index = *used;
                *used += count;
                page.frame = frame;

                return Ok(Allocation {
                    descriptor: Descriptor {
                        heap: page.heap,
                        index,
                    },
                    page: self.generation,
                    full,
                });
            }
        }

        if let Some((page, _)) = self.current.take() {
            self.submitted.push_back(page);
        }

        let mut page = match self.available.pop() {
            Some(page) => page,
            None => {
                let heap = device
                    .create_heap(self.kind, self.page_size)
                    .context(BindCtx::Host)?;
                tracing::debug!(heap = heap.0, kind = ?self.kind, "created a descriptor page");

                Page { heap, frame: 0 }
            }
        };

        page.frame = frame;
        let heap = page.heap;
        self.current = Some((page, full));
        self.generation += 1;

        Ok(Allocation {
            descriptor: Descriptor { heap, index: 0 },
            page: self.generation,
            full: true,
        })
    }

    /// Makes full pages last used by `completed_frame` or earlier writable again.
    pub fn reclaim(&mut self, completed_frame: u64) {
        while let Some(page) = self.submitted.front() {
            if page.frame > completed_frame {
                break;
            }

            if let Some(page) = self.submitted.pop_front() {
                self.available.push(page);
            }
        }
    }

    pub fn page_count(&self) -> usize {
        usize::from(self.current.is_some()) + self.submitted.len() + self.available.len()
    }
}

/// A descriptor table written for the current page.
#[derive(Debug, Clone, Copy, Default)]
struct Table {
    /// Hash of what was written.
    key: Option<u64>,
    descriptor: Option<Descriptor>,
}

/// Root parameters of the texture and sampler tables of a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct TableLayout {
    textures: [Option<u32>; 2],
    samplers: [Option<u32>; 2],
}

impl TableLayout {
    fn new(shaders: &[Option<&Shader>; 2]) -> Self {
        let mut layout = Self::default();
        let mut next = SHARED_MEMORY + 1;

        for stage in [ShaderStage::Pixel, ShaderStage::Vertex] {
            let Some(shader) = shaders[stage as usize] else {
                continue;
            };

            if !shader.info.textures.is_empty() {
                layout.textures[stage as usize] = Some(next);
                next += 1;
            }

            if !shader.info.samplers.is_empty() {
                layout.samplers[stage as usize] = Some(next);
                next += 1;
            }
        }

        layout
    }
}

fn content_key(keys: &[u64]) -> u64 {
    XxHash3_64::oneshot(keys.as_bytes())
}

/// Descriptors of one kind to be written for a draw.
struct Pending<T> {
    parameter: u32,
    key: u64,
    contents: Vec<T>,
}

/// Descriptor counts for a partial and a full update of `tables`, or `None` if none of them is
/// stale. Stale tables are marked so they get written.
fn stale_counts<T>(
    tables: &mut [&mut Table],
    pending: &[Pending<T>],
    dirty: &[bool],
) -> Option<(u32, u32)> {
    let mut partial = 0;
    let mut full = 0;

    for ((table, pending), &dirty) in tables.iter_mut().zip(pending).zip(dirty) {
        let count = pending.contents.len() as u32;
        full += count;

        if dirty || table.key != Some(pending.key) || table.descriptor.is_none() {
            table.key = None;
            partial += count;
        }
    }

    (partial > 0).then_some((partial, full))
}

/// Writes the tables in `pending` that are stale (or all of them, if the allocation is a full
/// one) and returns the root parameters that changed.
fn write_tables(
    device: &mut dyn Device,
    allocation: Allocation,
    tables: &mut [&mut Table],
    pending: &[Pending<View>],
) -> u32 {
    let mut index = allocation.descriptor.index;
    let mut changed = 0;

    for (table, pending) in tables.iter_mut().zip(pending) {
        if !allocation.full && table.key == Some(pending.key) {
            continue;
        }

        let base = Descriptor {
            heap: allocation.descriptor.heap,
            index,
        };

        for (offset, view) in pending.contents.iter().enumerate() {
            device.write_descriptor(
                Descriptor {
                    heap: base.heap,
                    index: base.index + offset as u32,
                },
                view,
            );
        }

        index += pending.contents.len() as u32;
        table.key = Some(pending.key);
        table.descriptor = Some(base);
        changed |= root::bit(pending.parameter);
    }

    changed
}

pub struct TableRegime {
    views: DescriptorPool,
    samplers: DescriptorPool,
    /// Heaps bound in the current command list.
    bound_heaps: Option<(Option<Heap>, Option<Heap>)>,

    // tables
    view_page: Option<u64>,
    sampler_page: Option<u64>,
    shared_memory: Table,
    /// Indexed by stage.
    textures: [Table; 2],
    sampler_tables: [Table; 2],
}

impl TableRegime {
    pub fn new(view_page_size: u32, sampler_page_size: u32) -> Self {
        Self {
            views: DescriptorPool::new(HeapKind::View, view_page_size),
            samplers: DescriptorPool::new(HeapKind::Sampler, sampler_page_size),
            bound_heaps: None,

            view_page: None,
            sampler_page: None,
            shared_memory: Table::default(),
            textures: [Table::default(); 2],
            sampler_tables: [Table::default(); 2],
        }
    }
}

impl Regime for TableRegime {
    fn begin_submission(&mut self, _: &mut Recorder) {
        // heaps are bound lazily, once a draw needs them
        self.bound_heaps = None;
    }

    fn update(&mut self, rec: &mut Recorder, request: DescriptorRequest) -> Result<(), BindError> {
        let DescriptorRequest {
            regs,
            textures,
            shaders,
            dirty,
            shared_memory_writable,
            shared_memory_dirty,
            up_to_date,
            ..
        } = request;

        let layout = TableLayout::new(&shaders);
        let frame = rec.frame();

        // views
        let shared_memory = Pending {
            parameter: SHARED_MEMORY,
            key: u64::from(shared_memory_writable),
            contents: vec![View::SharedMemory {
                writable: shared_memory_writable,
            }],
        };

        let mut view_tables = vec![shared_memory];
        let mut sampler_tables = Vec::new();
        let mut view_dirty = vec![shared_memory_dirty];
        let mut sampler_dirty = Vec::new();

        for stage in [ShaderStage::Pixel, ShaderStage::Vertex] {
            let index = stage as usize;
            let Some(shader) = shaders[index] else {
                continue;
            };

            if let Some(parameter) = layout.textures[index] {
                let bound: Vec<_> = shader
                    .info
                    .textures
                    .iter()
                    .map(|binding| textures.view(regs, binding))
                    .collect();
                let keys: Vec<u64> = bound.iter().map(|view| view.key).collect();

                view_tables.push(Pending {
                    parameter,
                    key: content_key(&keys),
                    contents: bound.into_iter().map(|view| view.view).collect(),
                });
                view_dirty.push(dirty[index]);
            }

            if let Some(parameter) = layout.samplers[index] {
                let keys: Vec<u64> = shader
                    .info
                    .samplers
                    .iter()
                    .map(|binding| textures.sampler(regs, binding))
                    .collect();

                sampler_tables.push(Pending {
                    parameter,
                    key: content_key(&keys),
                    contents: keys.into_iter().map(View::Sampler).collect(),
                });
                sampler_dirty.push(dirty[index]);
            }
        }

        let mut changed = 0;

        // tables in the same order as the pending lists
        let [vertex, pixel] = &mut self.textures;
        let mut tables: Vec<&mut Table> = vec![&mut self.shared_memory];
        if layout.textures[ShaderStage::Pixel as usize].is_some() {
            tables.push(pixel);
        }
        if layout.textures[ShaderStage::Vertex as usize].is_some() {
            tables.push(vertex);
        }

        if let Some((partial, full)) = stale_counts(&mut tables, &view_tables, &view_dirty) {
            let allocation = self
                .views
                .request(rec.device, frame, self.view_page, partial, full)?;
            self.view_page = Some(allocation.page);
            changed |= write_tables(rec.device, allocation, &mut tables, &view_tables);
        }

        let [vertex, pixel] = &mut self.sampler_tables;
        let mut tables: Vec<&mut Table> = Vec::with_capacity(2);
        if layout.samplers[ShaderStage::Pixel as usize].is_some() {
            tables.push(pixel);
        }
        if layout.samplers[ShaderStage::Vertex as usize].is_some() {
            tables.push(vertex);
        }

        if let Some((partial, full)) = stale_counts(&mut tables, &sampler_tables, &sampler_dirty)
        {
            let allocation =
                self.samplers
                    .request(rec.device, frame, self.sampler_page, partial, full)?;
            self.sampler_page = Some(allocation.page);
            changed |= write_tables(rec.device, allocation, &mut tables, &sampler_tables);
        }

        *up_to_date &= !changed;

        let heaps = (self.views.current_heap(), self.samplers.current_heap());
        if self.bound_heaps != Some(heaps) {
            self.bound_heaps = Some(heaps);
            rec.push(Command::SetDescriptorHeaps {
                view: heaps.0,
                sampler: heaps.1,
            });

            // tables are relative to the bound heaps
            *up_to_date &= (1 << root::REGIME) - 1;
        }

        let mut bind = |parameter: u32, table: &Table| {
            if *up_to_date & root::bit(parameter) != 0 {
                return;
            }

            if let Some(descriptor) = table.descriptor {
                rec.push(Command::SetRootTable {
                    parameter,
                    descriptor,
                });
                *up_to_date |= root::bit(parameter);
            }
        };

        bind(SHARED_MEMORY, &self.shared_memory);
        for stage in [ShaderStage::Pixel, ShaderStage::Vertex] {
            let index = stage as usize;
            if let Some(parameter) = layout.textures[index] {
                bind(parameter, &self.textures[index]);
            }

            if let Some(parameter) = layout.samplers[index] {
                bind(parameter, &self.sampler_tables[index]);
            }
        }

        Ok(())
    }

    fn reclaim(&mut self, completed_frame: u64) {
        self.views.reclaim(completed_frame);
        self.samplers.reclaim(completed_frame);
    }
}
