//! Register shadow and dirty tracking.
//!
//! Every guest register write lands here first. Writes to the constant ranges invalidate the
//! host constant buffers built from them, and writes to a few special registers are forwarded
//! to a [`Handler`] because they have side effects outside of the register file.
use std::ops::Range;

use strum::{EnumCount, EnumIter, IntoEnumIterator};

use crate::constants::ConstantMap;
use crate::gamma::{GammaRamp, GammaRampKind};
use crate::reg::{
    self, BOOL_LOOP_CONSTANTS, CoherStatusHost, FETCH_CONSTANTS, FETCH_SLOT_DWORDS,
    FLOAT_CONSTANTS, FLOAT_CONSTANTS_PER_STAGE, Reg, SCRATCH_REGISTERS,
};
use crate::regfile::RegisterFile;
use crate::shader::ShaderStage;

/// A logical group of constants uploaded to the host as one buffer (or descriptor set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter)]
#[repr(u8)]
pub enum Group {
    System,
    FloatVertex,
    FloatPixel,
    BoolLoop,
    Fetch,
    DescriptorsVertex,
    DescriptorsPixel,
    /// The view of the shared memory buffer (read-only or writable).
    SharedMemory,
}

impl Group {
    pub fn float(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => Self::FloatVertex,
            ShaderStage::Pixel => Self::FloatPixel,
        }
    }

    pub fn descriptors(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => Self::DescriptorsVertex,
            ShaderStage::Pixel => Self::DescriptorsPixel,
        }
    }
}

/// A set of groups whose host copy is out of date.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Dirty(u16);

impl Dirty {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self((1 << Group::COUNT) - 1);

    #[inline(always)]
    pub fn insert(&mut self, group: Group) {
        self.0 |= 1 << group as u8;
    }

    #[inline(always)]
    pub fn remove(&mut self, group: Group) {
        self.0 &= !(1 << group as u8);
    }

    #[inline(always)]
    pub fn contains(self, group: Group) -> bool {
        self.0 & (1 << group as u8) != 0
    }

    #[inline(always)]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Debug for Dirty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set()
            .entries(Group::iter().filter(|group| self.contains(*group)))
            .finish()
    }
}

/// Receives the side effects of register writes.
pub trait Handler {
    /// A fetch constant slot (0..32) was written.
    fn fetch_constant_written(&mut self, slot: u8) {
        let _ = slot;
    }

    /// A scratch register enabled in `SCRATCH_UMSK` was written and must be mirrored to guest
    /// memory at `address`.
    fn scratch_written(&mut self, address: u32, value: u32) {
        let _ = (address, value);
    }

    /// The guest asked for `[base, base + size)` to be made coherent.
    fn coherency_requested(&mut self, base: u32, size: u32) {
        let _ = (base, size);
    }

    fn gamma_ramp_written(&mut self, kind: GammaRampKind) {
        let _ = kind;
    }
}

/// A [`Handler`] that ignores every side effect.
pub struct NopHandler;

impl Handler for NopHandler {}

#[inline(always)]
fn intersect(a: &Range<u32>, b: &Range<u32>) -> Range<u32> {
    a.start.max(b.start)..a.end.min(b.end)
}

/// The shadow register file and the dirty state of everything derived from it.
pub struct Shadow {
    regs: RegisterFile,
    dirty: Dirty,
    /// Live float constants of the bound vertex and pixel shaders.
    float_maps: [ConstantMap; 2],
    gamma: GammaRamp,
}

impl Default for Shadow {
    fn default() -> Self {
        Self::new()
    }
}

impl Shadow {
    pub fn new() -> Self {
        Self {
            regs: RegisterFile::default(),
            dirty: Dirty::ALL,
            float_maps: [ConstantMap::default(); 2],
            gamma: GammaRamp::default(),
        }
    }

    #[inline(always)]
    pub fn regs(&self) -> &RegisterFile {
        &self.regs
    }

    pub fn gamma(&self) -> &GammaRamp {
        &self.gamma
    }

    #[inline(always)]
    pub fn dirty(&self) -> Dirty {
        self.dirty
    }

    #[inline(always)]
    pub fn is_dirty(&self, group: Group) -> bool {
        self.dirty.contains(group)
    }

    #[inline(always)]
    pub fn invalidate(&mut self, group: Group) {
        self.dirty.insert(group);
    }

    pub fn invalidate_all(&mut self) {
        self.dirty = Dirty::ALL;
    }

    /// Marks `group` as up to date, returning whether it was dirty.
    #[inline(always)]
    pub fn take_dirty(&mut self, group: Group) -> bool {
        let dirty = self.dirty.contains(group);
        self.dirty.remove(group);
        dirty
    }

    pub fn float_constants(&self, stage: ShaderStage) -> &ConstantMap {
        &self.float_maps[stage as usize]
    }

    /// Sets the live float constants of the shader bound to `stage`. The float constant buffer
    /// of that stage is packed according to this map, so a different map invalidates it.
    pub fn set_float_constants(&mut self, stage: ShaderStage, map: &ConstantMap) {
        let current = &mut self.float_maps[stage as usize];
        if current != map {
            *current = *map;
            self.dirty.insert(Group::float(stage));
        }
    }

    /// Forgets the live float constants of both stages.
    pub fn reset_float_constants(&mut self) {
        self.float_maps = [ConstantMap::default(); 2];
        self.dirty.insert(Group::FloatVertex);
        self.dirty.insert(Group::FloatPixel);
    }

    /// Float constant `slots` (0..512) were written.
    #[inline(always)]
    fn float_constants_written(&mut self, slots: Range<u32>) {
        const STAGE: u32 = FLOAT_CONSTANTS_PER_STAGE;

        if slots.start < STAGE && self.float_maps[0].intersects(slots.start..slots.end.min(STAGE))
        {
            self.dirty.insert(Group::FloatVertex);
        }

        if slots.end > STAGE
            && self.float_maps[1].intersects(slots.start.max(STAGE) - STAGE..slots.end - STAGE)
        {
            self.dirty.insert(Group::FloatPixel);
        }
    }

    /// Writes a single register.
    #[inline]
    pub fn write_register(&mut self, index: u32, value: u32, handler: &mut impl Handler) {
        self.regs[index] = value;

        if index >= FLOAT_CONSTANTS.start {
            if index < FLOAT_CONSTANTS.end {
                let slot = (index - FLOAT_CONSTANTS.start) >> 2;
                self.float_constants_written(slot..slot + 1);
            } else if index < FETCH_CONSTANTS.end {
                self.dirty.insert(Group::Fetch);
                let slot = (index - FETCH_CONSTANTS.start) / FETCH_SLOT_DWORDS;
                handler.fetch_constant_written(slot as u8);
            } else if BOOL_LOOP_CONSTANTS.contains(&index) {
                self.dirty.insert(Group::BoolLoop);
            }
        } else if let Some(reg) = Reg::from_repr(index as u16)
            && reg.is_special()
        {
            self.write_special(reg, value, handler);
        }
    }

    /// Writes a contiguous run of registers starting at `start`. Equivalent to writing them one
    /// by one, but each constant range is tested once for the whole run.
    pub fn write_registers(&mut self, start: u32, values: &[u32], handler: &mut impl Handler) {
        let range = start..start + values.len() as u32;
        if range.is_empty() {
            return;
        }

        // side effects must happen in order, with the registers before them already written
        if reg::overlaps_special(&range) {
            for (index, &value) in (start..).zip(values) {
                self.write_register(index, value, handler);
            }

            return;
        }

        self.regs.range_mut(range.clone()).copy_from_slice(values);

        let float = intersect(&range, &FLOAT_CONSTANTS);
        if !float.is_empty() {
            let first = (float.start - FLOAT_CONSTANTS.start) >> 2;
            let last = (float.end - 1 - FLOAT_CONSTANTS.start) >> 2;
            self.float_constants_written(first..last + 1);
        }

        let fetch = intersect(&range, &FETCH_CONSTANTS);
        if !fetch.is_empty() {
            self.dirty.insert(Group::Fetch);

            let first = (fetch.start - FETCH_CONSTANTS.start) / FETCH_SLOT_DWORDS;
            let last = (fetch.end - 1 - FETCH_CONSTANTS.start) / FETCH_SLOT_DWORDS;
            for slot in first..=last {
                handler.fetch_constant_written(slot as u8);
            }
        }

        if !intersect(&range, &BOOL_LOOP_CONSTANTS).is_empty() {
            self.dirty.insert(Group::BoolLoop);
        }
    }

    fn write_special(&mut self, reg: Reg, value: u32, handler: &mut impl Handler) {
        match reg {
            _ if SCRATCH_REGISTERS.contains(&reg.index()) => {
                let n = reg.index() - SCRATCH_REGISTERS.start;
                if self.regs.get(Reg::ScratchUmsk) & (1 << n) != 0 {
                    let address = self.regs.get(Reg::ScratchAddr).wrapping_add(n * 4);
                    handler.scratch_written(address, value);
                }
            }
            Reg::CoherStatusHost => {
                // every write is a request, whatever the guest put in the status bit
                let status = self.regs.view::<CoherStatusHost>().with_status(true);
                self.regs.set(Reg::CoherStatusHost, status.to_bits());

                let base = self.regs.get(Reg::CoherBaseHost);
                let size = self.regs.get(Reg::CoherSizeHost);
                tracing::debug!(
                    "making {base:08X} -> {:08X} ({size} bytes) coherent",
                    base.wrapping_add(size)
                );

                handler.coherency_requested(base, size);
                self.regs
                    .set(Reg::CoherStatusHost, status.with_status(false).to_bits());
            }
            _ => {
                if let Some(kind) = self.gamma.write(&mut self.regs, reg) {
                    handler.gamma_ramp_written(kind);
                }
            }
        }
    }
}
